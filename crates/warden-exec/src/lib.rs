#![forbid(unsafe_code)]
//! warden-exec: admission, reclamation, and the governor facade.
//!
//! [`Governor`] wires the ledger, the quota registry and the enforcement
//! board together and is the only type callers need. [`GovernorRuntime`]
//! runs the periodic reclaimer and enforcement tick on tokio.
//!
//! Lock order everywhere in this crate: ledger account, then holder table,
//! then registry or enforcement board.

pub mod admission;
pub mod connections;
pub mod governor;
pub mod guard;
pub mod holder;
pub mod leases;
pub mod metrics;
pub mod reclaim;
pub mod runtime;
pub mod status;

pub use admission::Availability;
pub use connections::{ConnectionHandle, ConnectionInfo};
pub use governor::{Allocation, Governor, GovernorBuilder};
pub use guard::{AllocationGuard, ConnectionGuard};
pub use holder::HolderState;
pub use leases::LeaseInfo;
pub use metrics::{ChannelSink, TracingSink};
pub use reclaim::SweepReport;
pub use runtime::GovernorRuntime;
pub use status::TenantStatus;
