//! The resource ledger: one account per owner, one lock per account.
//!
//! Callers that need check-then-act semantics do both steps inside a single
//! [`Ledger::transact`] closure. Splitting them across two calls is the race
//! that over-admits.
//!
//! Closures passed to the ledger must not call back into the same ledger.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::Serialize;

use warden_core::clock::Clock;
use warden_core::id::{Owner, ResourceKey};
use warden_core::types::{ResourceAmounts, ResourceKind};

use crate::error::{Error, Result};
use crate::tracking::{LedgerStats, StatsSnapshot};

/// Mutable view of one owner's counters, only reachable inside its critical section.
#[derive(Debug)]
pub struct Account {
    owner: Owner,
    usage: ResourceAmounts,
    last_updated_ms: u64,
    ops: PendingOps,
}

#[derive(Debug, Default)]
struct PendingOps {
    increments: u64,
    decrements: u64,
    clamped: u64,
    dirty: bool,
}

impl Account {
    fn new(owner: Owner, usage: ResourceAmounts, now_ms: u64) -> Self {
        Self {
            owner,
            usage,
            last_updated_ms: now_ms,
            ops: PendingOps::default(),
        }
    }

    pub fn owner(&self) -> &Owner {
        &self.owner
    }

    pub fn usage(&self) -> &ResourceAmounts {
        &self.usage
    }

    pub fn get(&self, kind: ResourceKind) -> f64 {
        self.usage.get(kind)
    }

    pub fn last_updated_ms(&self) -> u64 {
        self.last_updated_ms
    }

    /// Never rejects; quota checks are the caller's job.
    pub fn increment(&mut self, kind: ResourceKind, amount: f64) -> f64 {
        self.ops.increments += 1;
        self.ops.dirty = true;
        self.usage.add(kind, amount)
    }

    /// Clamps at zero.
    pub fn decrement(&mut self, kind: ResourceKind, amount: f64) -> f64 {
        let (total, clamped) = self.usage.sub_clamped(kind, amount);
        self.ops.decrements += 1;
        self.ops.dirty = true;
        if clamped {
            self.ops.clamped += 1;
        }
        total
    }

    pub fn apply(&mut self, amounts: &ResourceAmounts) {
        for (kind, amount) in amounts.iter() {
            self.increment(kind, amount);
        }
    }

    pub fn release(&mut self, amounts: &ResourceAmounts) {
        for (kind, amount) in amounts.iter() {
            self.decrement(kind, amount);
        }
    }
}

/// Copy of an owner's usage taken inside its critical section.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageSnapshot {
    pub owner: Owner,
    pub usage: ResourceAmounts,
    pub last_updated_ms: u64,
}

impl UsageSnapshot {
    fn empty(owner: Owner) -> Self {
        Self {
            owner,
            usage: ResourceAmounts::new(),
            last_updated_ms: 0,
        }
    }
}

struct Slot {
    account: Mutex<Account>,
    quarantined: AtomicBool,
    /// Set once the slot has been removed from the map; holders of a stale
    /// `Arc` must look the owner up again.
    detached: AtomicBool,
}

impl Slot {
    fn new(owner: Owner, usage: ResourceAmounts, now_ms: u64) -> Self {
        Self {
            account: Mutex::new(Account::new(owner, usage, now_ms)),
            quarantined: AtomicBool::new(false),
            detached: AtomicBool::new(false),
        }
    }
}

pub struct Ledger {
    accounts: RwLock<HashMap<Owner, Arc<Slot>>>,
    clock: Arc<dyn Clock>,
    stats: LedgerStats,
}

impl Ledger {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            accounts: RwLock::new(HashMap::new()),
            clock,
            stats: LedgerStats::new(),
        }
    }

    /// Run `f` inside `owner`'s critical section, creating the account lazily.
    pub fn transact<R>(&self, owner: &Owner, f: impl FnOnce(&mut Account) -> R) -> Result<R> {
        let slot = self.slot(owner);
        if slot.quarantined.load(Ordering::Acquire) {
            return Err(Error::Quarantined {
                owner: owner.clone(),
            });
        }
        let mut account = match slot.account.lock() {
            Ok(guard) => guard,
            Err(_) => {
                return Err(self.quarantine(
                    &slot,
                    Error::Poisoned {
                        owner: owner.clone(),
                    },
                ))
            }
        };
        if slot.detached.load(Ordering::Acquire) {
            // Removed or replaced while we waited; retry against the live slot.
            drop(account);
            return self.transact(owner, f);
        }
        if slot.quarantined.load(Ordering::Acquire) {
            return Err(Error::Quarantined {
                owner: owner.clone(),
            });
        }

        let out = f(&mut account);
        self.settle(&mut account);

        if !account.usage.is_finite() {
            drop(account);
            return Err(self.quarantine(
                &slot,
                Error::NonFinite {
                    owner: owner.clone(),
                },
            ));
        }
        Ok(out)
    }

    pub fn increment(&self, owner: &Owner, kind: ResourceKind, amount: f64) -> Result<f64> {
        self.transact(owner, |account| account.increment(kind, amount))
    }

    pub fn decrement(&self, owner: &Owner, kind: ResourceKind, amount: f64) -> Result<f64> {
        self.transact(owner, |account| account.decrement(kind, amount))
    }

    /// Usage for `owner`. Unknown owners read as empty and are not created.
    pub fn snapshot(&self, owner: &Owner) -> Result<UsageSnapshot> {
        let slot = match self.read_map().get(owner) {
            Some(slot) => Arc::clone(slot),
            None => return Ok(UsageSnapshot::empty(owner.clone())),
        };
        if slot.quarantined.load(Ordering::Acquire) {
            return Err(Error::Quarantined {
                owner: owner.clone(),
            });
        }
        let account = match slot.account.lock() {
            Ok(guard) => guard,
            Err(_) => {
                return Err(self.quarantine(
                    &slot,
                    Error::Poisoned {
                        owner: owner.clone(),
                    },
                ))
            }
        };
        Ok(UsageSnapshot {
            owner: owner.clone(),
            usage: account.usage.clone(),
            last_updated_ms: account.last_updated_ms,
        })
    }

    /// One counter. Unknown owners read as zero.
    pub fn counter(&self, key: &ResourceKey) -> Result<f64> {
        self.snapshot(&key.owner)
            .map(|snapshot| snapshot.usage.get(key.resource))
    }

    /// Detach `owner`'s account and run `f` inside its final critical section.
    ///
    /// The map stays write-locked while `f` runs so no new account for the
    /// owner can appear until the cascade has finished. Quarantined accounts
    /// are removed too.
    pub fn remove<R>(&self, owner: &Owner, f: impl FnOnce(Option<&mut Account>) -> R) -> R {
        let mut map = self.write_map();
        match map.remove(owner) {
            Some(slot) => {
                let mut account = slot
                    .account
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                slot.detached.store(true, Ordering::Release);
                self.stats.account_closed();
                f(Some(&mut account))
            }
            None => f(None),
        }
    }

    pub fn is_quarantined(&self, owner: &Owner) -> bool {
        self.read_map()
            .get(owner)
            .is_some_and(|slot| slot.quarantined.load(Ordering::Acquire))
    }

    /// Replace a quarantined account with a fresh one holding `rebuilt`.
    /// Returns `false` if the owner was not quarantined.
    pub fn lift_quarantine(&self, owner: &Owner, rebuilt: ResourceAmounts) -> bool {
        let mut map = self.write_map();
        let quarantined = map
            .get(owner)
            .is_some_and(|slot| slot.quarantined.load(Ordering::Acquire));
        if !quarantined {
            return false;
        }
        let fresh = Arc::new(Slot::new(owner.clone(), rebuilt, self.clock.now_ms()));
        if let Some(old) = map.insert(owner.clone(), fresh) {
            old.detached.store(true, Ordering::Release);
        }

        #[cfg(feature = "tracing")]
        tracing::warn!(%owner, "ledger quarantine lifted");
        true
    }

    pub fn owners(&self) -> Vec<Owner> {
        self.read_map().keys().cloned().collect()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    // --- helpers ---

    fn slot(&self, owner: &Owner) -> Arc<Slot> {
        if let Some(slot) = self.read_map().get(owner) {
            return Arc::clone(slot);
        }
        let mut map = self.write_map();
        let slot = map.entry(owner.clone()).or_insert_with(|| {
            self.stats.account_opened();
            Arc::new(Slot::new(
                owner.clone(),
                ResourceAmounts::new(),
                self.clock.now_ms(),
            ))
        });
        Arc::clone(slot)
    }

    fn settle(&self, account: &mut Account) {
        let ops = std::mem::take(&mut account.ops);
        if ops.dirty {
            account.last_updated_ms = self.clock.now_ms();
        }
        self.stats
            .record_ops(ops.increments, ops.decrements, ops.clamped);
    }

    fn quarantine(&self, slot: &Slot, err: Error) -> Error {
        if !slot.quarantined.swap(true, Ordering::AcqRel) {
            self.stats.record_quarantine();
            #[cfg(feature = "tracing")]
            tracing::error!(owner = %err.owner(), error = %err, "ledger account quarantined");
        }
        err
    }

    // The map only holds `Arc`s; a panic while it is locked cannot leave it
    // half-updated, so poisoning is ignored here.
    fn read_map(&self) -> RwLockReadGuard<'_, HashMap<Owner, Arc<Slot>>> {
        self.accounts.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_map(&self) -> RwLockWriteGuard<'_, HashMap<Owner, Arc<Slot>>> {
        self.accounts.write().unwrap_or_else(PoisonError::into_inner)
    }
}
