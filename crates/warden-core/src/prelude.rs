//! Convenient re-exports for downstream crates.

pub use crate::clock::{Clock, ManualClock, SystemClock};
pub use crate::config::GovernorConfig;
pub use crate::error::{Error, Result};
pub use crate::event::{EventKind, EventSink, GovernorEvent, NoopSink};
pub use crate::id::{ConnectionId, LeaseId, Owner, ResourceKey, TenantId, ThreadId, UserId};
pub use crate::quota::{QuotaUpdate, TenantPolicy, TenantQuota};
pub use crate::transport::Transport;
pub use crate::types::{ResourceAmounts, ResourceKind, ResourceRequest, Violation};
