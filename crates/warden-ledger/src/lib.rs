#![forbid(unsafe_code)]
//! warden-ledger: per-owner resource counters.
//!
//! The ledger is pure bookkeeping: it never checks a quota and never rejects
//! an increment. What it guarantees is that everything done inside
//! [`Ledger::transact`] for one owner happens in that owner's critical
//! section, so a check-then-increment performed there cannot over-admit.
//!
//! Locks are sharded by [`Owner`](warden_core::id::Owner); unrelated tenants
//! and users never contend. No async or I/O lives here.

pub mod error;
pub mod ledger;
pub mod tracking;

pub use error::{Error, Result};
pub use ledger::{Account, Ledger, UsageSnapshot};
pub use tracking::{LedgerStats, StatsSnapshot};
