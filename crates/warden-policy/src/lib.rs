#![forbid(unsafe_code)]
//! warden-policy: who may use how much, and what happens when they don't stop.
//!
//! Responsibilities:
//! - `registry`: one [`TenantRecord`] (quota + policy) per tenant, created
//!   with floor-clamped defaults and changed only by explicit updates.
//! - `enforcement`: the `NORMAL → WARNING → BLOCKED` state machine that runs
//!   on a timer, reads usage from the ledger and writes only the
//!   [`EnforcementBoard`]. It never calls the admission path.
//!
//! **No async** here. The exec crate owns the timers.

pub mod enforcement;
pub mod registry;

pub use enforcement::{
    overages, EnforcementBoard, EnforcementEngine, EnforcementLevel, EnforcementState,
    Transition,
};
pub use registry::{QuotaRegistry, TenantRecord};
