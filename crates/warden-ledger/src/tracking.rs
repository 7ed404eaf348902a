//! Lightweight ledger counters.
//!
//! Keep this optional and cheap. Downstream can wire to OpenTelemetry/Prom if desired.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use serde::Serialize;

#[derive(Default)]
pub struct LedgerStats {
    increments: AtomicU64,
    decrements: AtomicU64,
    clamped_decrements: AtomicU64,
    quarantines: AtomicU64,
    live_accounts: AtomicUsize,
    peak_accounts: AtomicUsize,
}

/// Point-in-time copy of [`LedgerStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub increments: u64,
    pub decrements: u64,
    pub clamped_decrements: u64,
    pub quarantines: u64,
    pub live_accounts: usize,
    pub peak_accounts: usize,
}

impl LedgerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_ops(&self, increments: u64, decrements: u64, clamped: u64) {
        if increments > 0 {
            self.increments.fetch_add(increments, Ordering::Relaxed);
        }
        if decrements > 0 {
            self.decrements.fetch_add(decrements, Ordering::Relaxed);
        }
        if clamped > 0 {
            self.clamped_decrements.fetch_add(clamped, Ordering::Relaxed);
            #[cfg(feature = "tracing")]
            tracing::debug!(clamped, "ledger decrement clamped at zero");
        }
    }

    pub(crate) fn record_quarantine(&self) {
        self.quarantines.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn account_opened(&self) {
        let live = self.live_accounts.fetch_add(1, Ordering::AcqRel) + 1;
        self.record_live(live);
    }

    pub(crate) fn account_closed(&self) {
        self.live_accounts.fetch_sub(1, Ordering::AcqRel);
    }

    /// Record a new live-account count; updates peak if higher.
    fn record_live(&self, live: usize) {
        let mut cur = self.peak_accounts.load(Ordering::Relaxed);
        while live > cur {
            match self.peak_accounts.compare_exchange(
                cur,
                live,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => cur = observed,
            }
        }
        #[cfg(feature = "tracing")]
        tracing::trace!(
            live,
            peak = self.peak_accounts.load(Ordering::Relaxed),
            "ledger accounts"
        );
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            increments: self.increments.load(Ordering::Relaxed),
            decrements: self.decrements.load(Ordering::Relaxed),
            clamped_decrements: self.clamped_decrements.load(Ordering::Relaxed),
            quarantines: self.quarantines.load(Ordering::Relaxed),
            live_accounts: self.live_accounts.load(Ordering::Relaxed),
            peak_accounts: self.peak_accounts.load(Ordering::Relaxed),
        }
    }
}
