//! Zombie reclamation and the single holder-retirement path.
//!
//! Explicit release, deallocation and both sweep triggers all retire holders
//! through [`Reclaimer::release_holder`] (or [`Reclaimer::retire_in`] when
//! the caller already holds the owner's critical section). Inside that
//! section the holder's one-way state swap decides who decrements the
//! ledger, so a handle is never released twice.
//!
//! Sweeps collect candidates under the table read lock, drop it, then retire
//! candidates one owner at a time. A sweep never holds more than one
//! owner's lock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;

use warden_core::clock::Clock;
use warden_core::error::Result;
use warden_core::event::{EventKind, EventSink, GovernorEvent};
use warden_core::id::Owner;
use warden_core::types::{ResourceAmounts, AMOUNT_EPSILON};
use warden_ledger::{Account, Ledger};

use crate::connections::{ConnectionHandle, ConnectionTable};
use crate::holder::{HolderState, StateCell};
use crate::leases::{Lease, LeaseTable};
use crate::metrics::escalate;

/// Something that holds amounts in an owner's ledger account.
pub(crate) trait Holder {
    fn owner(&self) -> Owner;
    fn cell(&self) -> &StateCell;
    /// Amounts to give back on retirement. Leaves the holder empty.
    fn take_held(&self) -> ResourceAmounts;
    /// Remove from the holder's index table.
    fn unindex(&self, reclaimer: &Reclaimer);
    /// Still eligible for reclamation at `now_ms`.
    fn is_stale(&self, now_ms: u64, heartbeat_timeout_ms: u64) -> bool;
}

impl Holder for Arc<ConnectionHandle> {
    fn owner(&self) -> Owner {
        ConnectionHandle::owner(self)
    }

    fn cell(&self) -> &StateCell {
        self.state_cell()
    }

    fn take_held(&self) -> ResourceAmounts {
        self.held()
    }

    fn unindex(&self, reclaimer: &Reclaimer) {
        reclaimer.connections.forget(self);
    }

    fn is_stale(&self, now_ms: u64, heartbeat_timeout_ms: u64) -> bool {
        self.is_zombie(now_ms, heartbeat_timeout_ms)
    }
}

impl Holder for Arc<Lease> {
    fn owner(&self) -> Owner {
        Lease::owner(self)
    }

    fn cell(&self) -> &StateCell {
        self.state_cell()
    }

    fn take_held(&self) -> ResourceAmounts {
        std::mem::take(&mut *self.held_mut())
    }

    fn unindex(&self, reclaimer: &Reclaimer) {
        reclaimer.leases.forget(&self.lease_id());
    }

    fn is_stale(&self, now_ms: u64, _heartbeat_timeout_ms: u64) -> bool {
        self.is_expired(now_ms)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Zombie candidates looked at.
    pub examined: usize,
    pub reclaimed_connections: usize,
    pub reclaimed_leases: usize,
    /// Candidates whose owner could not be locked (quarantined ledger account).
    pub failures: usize,
    /// The deadline passed before every candidate was handled.
    pub timed_out: bool,
}

impl SweepReport {
    pub fn reclaimed(&self) -> usize {
        self.reclaimed_connections + self.reclaimed_leases
    }
}

pub struct Reclaimer {
    ledger: Arc<Ledger>,
    connections: Arc<ConnectionTable>,
    leases: Arc<LeaseTable>,
    sink: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
    heartbeat_timeout_ms: u64,
    sweeps: AtomicU64,
    failures: AtomicU64,
}

impl Reclaimer {
    pub fn new(
        ledger: Arc<Ledger>,
        connections: Arc<ConnectionTable>,
        leases: Arc<LeaseTable>,
        sink: Arc<dyn EventSink>,
        clock: Arc<dyn Clock>,
        heartbeat_timeout_ms: u64,
    ) -> Self {
        Self {
            ledger,
            connections,
            leases,
            sink,
            clock,
            heartbeat_timeout_ms,
            sweeps: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    pub fn connections(&self) -> &Arc<ConnectionTable> {
        &self.connections
    }

    pub fn leases(&self) -> &Arc<LeaseTable> {
        &self.leases
    }

    /// Total sweeps run and total per-candidate failures since start.
    pub fn counters(&self) -> (u64, u64) {
        (
            self.sweeps.load(Ordering::Relaxed),
            self.failures.load(Ordering::Relaxed),
        )
    }

    /// Retire `holder` in its owner's critical section.
    ///
    /// Returns `Ok(false)` if it had already left `Active`. A reclamation
    /// re-checks staleness under the lock, so a heartbeat or renewal that
    /// landed after the sweep picked the holder wins.
    pub(crate) fn release_holder<H: Holder>(&self, holder: &H, to: HolderState) -> Result<bool> {
        let owner = holder.owner();
        let released = self
            .ledger
            .transact(&owner, |account| {
                if to == HolderState::Reclaimed
                    && !holder.is_stale(self.clock.now_ms(), self.heartbeat_timeout_ms)
                {
                    return None;
                }
                self.retire_in(account, holder, to)
            })
            .map_err(|e| escalate(&*self.sink, self.clock.now_ms(), e))?;

        match released {
            Some(held) => {
                let kind = match to {
                    HolderState::Reclaimed => EventKind::Reclaimed,
                    _ => EventKind::Released,
                };
                self.emit_each(kind, &owner, &held);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Retirement step for callers already inside `account`'s critical
    /// section. Returns what was given back, or `None` if another caller won.
    pub(crate) fn retire_in<H: Holder>(
        &self,
        account: &mut Account,
        holder: &H,
        to: HolderState,
    ) -> Option<ResourceAmounts> {
        if !holder.cell().retire(to) {
            return None;
        }
        let held = holder.take_held();
        account.release(&held);
        holder.unindex(self);
        Some(held)
    }

    /// Full sweep over every owner. Run by the background task and by
    /// `Governor::reclaim_now`.
    pub fn sweep(&self, deadline: Option<Instant>) -> SweepReport {
        let now = self.clock.now_ms();
        let timeout = self.heartbeat_timeout_ms;
        let connections = self
            .connections
            .select(|h| h.is_active() && h.is_zombie(now, timeout));
        let leases = self.leases.select(|l| l.is_active() && l.is_expired(now));

        let mut report = SweepReport::default();
        for handle in &connections {
            if past(deadline) {
                report.timed_out = true;
                break;
            }
            report.examined += 1;
            if let Some(true) = self.reclaim_one(handle, &mut report) {
                report.reclaimed_connections += 1;
            }
        }
        for lease in &leases {
            if report.timed_out || past(deadline) {
                report.timed_out = true;
                break;
            }
            report.examined += 1;
            if let Some(true) = self.reclaim_one(lease, &mut report) {
                report.reclaimed_leases += 1;
            }
        }

        self.finish(&report, "periodic");
        report
    }

    /// Owner-scoped sweep run from inside an admission. Stops as soon as the
    /// reclaimed amounts cover `needed`, or at `deadline`.
    pub(crate) fn sweep_owner(
        &self,
        owner: &Owner,
        needed: &ResourceAmounts,
        deadline: Instant,
    ) -> SweepReport {
        let now = self.clock.now_ms();
        let mut remaining = needed.clone();
        let mut report = SweepReport::default();

        match owner {
            Owner::User(user_id) => {
                let timeout = self.heartbeat_timeout_ms;
                let candidates = self.connections.select(|h| {
                    h.is_active() && h.user_id() == user_id && h.is_zombie(now, timeout)
                });
                for handle in &candidates {
                    if remaining.is_empty() {
                        break;
                    }
                    if past(Some(deadline)) {
                        report.timed_out = true;
                        break;
                    }
                    report.examined += 1;
                    if let Some(true) = self.reclaim_one(handle, &mut report) {
                        report.reclaimed_connections += 1;
                        subtract(&mut remaining, &handle.held());
                    }
                }
            }
            Owner::Tenant(tenant_id) => {
                let candidates = self.leases.select(|l| {
                    l.is_active() && l.tenant_id() == tenant_id && l.is_expired(now)
                });
                for lease in &candidates {
                    if remaining.is_empty() {
                        break;
                    }
                    if past(Some(deadline)) {
                        report.timed_out = true;
                        break;
                    }
                    let held = lease.held();
                    if !overlaps(&held, &remaining) {
                        continue;
                    }
                    report.examined += 1;
                    if let Some(true) = self.reclaim_one(lease, &mut report) {
                        report.reclaimed_leases += 1;
                        subtract(&mut remaining, &held);
                    }
                }
            }
        }

        self.finish(&report, "on-demand");
        report
    }

    fn reclaim_one<H: Holder>(&self, holder: &H, report: &mut SweepReport) -> Option<bool> {
        match self.release_holder(holder, HolderState::Reclaimed) {
            Ok(done) => Some(done),
            Err(_err) => {
                report.failures += 1;
                #[cfg(feature = "tracing")]
                tracing::error!(
                    owner = %holder.owner(),
                    error = %_err,
                    "reclaim failed; continuing sweep"
                );
                None
            }
        }
    }

    fn finish(&self, report: &SweepReport, _trigger: &'static str) {
        #[cfg(feature = "tracing")]
        if report.reclaimed() > 0 || report.failures > 0 || report.timed_out {
            tracing::info!(
                trigger = _trigger,
                examined = report.examined,
                connections = report.reclaimed_connections,
                leases = report.reclaimed_leases,
                failures = report.failures,
                timed_out = report.timed_out,
                "reclaim sweep"
            );
        }
        self.sweeps.fetch_add(1, Ordering::Relaxed);
        self.failures
            .fetch_add(report.failures as u64, Ordering::Relaxed);
    }

    pub(crate) fn emit_each(&self, kind: EventKind, owner: &Owner, amounts: &ResourceAmounts) {
        let now = self.clock.now_ms();
        for (resource, amount) in amounts.iter() {
            if amount > AMOUNT_EPSILON {
                self.sink
                    .emit(GovernorEvent::new(kind, owner.clone(), Some(resource), now));
            }
        }
    }
}

fn past(deadline: Option<Instant>) -> bool {
    deadline.is_some_and(|d| Instant::now() >= d)
}

fn subtract(remaining: &mut ResourceAmounts, held: &ResourceAmounts) {
    for (kind, amount) in held.iter() {
        remaining.sub_clamped(kind, amount);
    }
}

fn overlaps(held: &ResourceAmounts, needed: &ResourceAmounts) -> bool {
    needed
        .iter()
        .any(|(kind, amount)| amount > AMOUNT_EPSILON && held.get(kind) > AMOUNT_EPSILON)
}
