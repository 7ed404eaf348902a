//! Lifecycle state shared by connection handles and leases.
//!
//! A holder starts `Active` and leaves it exactly once. Whoever wins the
//! compare-and-swap out of `Active` owns the ledger decrement; everyone else
//! sees `false` and does nothing.

use std::sync::atomic::{AtomicU8, Ordering};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HolderState {
    Active,
    /// Taken back by the reclaimer.
    Reclaimed,
    /// Released by its owner.
    Removed,
}

impl HolderState {
    fn to_u8(self) -> u8 {
        match self {
            HolderState::Active => 0,
            HolderState::Reclaimed => 1,
            HolderState::Removed => 2,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => HolderState::Active,
            1 => HolderState::Reclaimed,
            _ => HolderState::Removed,
        }
    }
}

#[derive(Debug)]
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub(crate) fn active() -> Self {
        Self(AtomicU8::new(HolderState::Active.to_u8()))
    }

    pub(crate) fn get(&self) -> HolderState {
        HolderState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn is_active(&self) -> bool {
        self.get() == HolderState::Active
    }

    /// One-way `Active → to`. Returns `true` for the single winner.
    pub(crate) fn retire(&self, to: HolderState) -> bool {
        debug_assert_ne!(to, HolderState::Active);
        self.0
            .compare_exchange(
                HolderState::Active.to_u8(),
                to.to_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}
