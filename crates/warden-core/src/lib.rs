#![forbid(unsafe_code)]
//! warden-core: shared vocabulary for the Warden admission governor.
//!
//! Everything the ledger, policy and exec crates agree on lives here:
//! strongly-typed identifiers, the closed set of resource kinds, tenant
//! quotas, the governor configuration, and the seams to the outside world
//! (`Clock`, `Transport`, `EventSink`).
//!
//! **No locking, no async, no I/O** here. The stateful pieces live in
//! `warden-ledger`, `warden-policy` and `warden-exec`.

pub mod clock;
pub mod config;
pub mod error;
pub mod event;
pub mod id;
pub mod prelude;
pub mod quota;
pub mod transport;
pub mod types;

pub use error::{Error, Result};
