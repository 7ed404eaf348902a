//! Admission control: check-then-increment in one critical section.
//!
//! For an owner K and request R:
//! 1. A blocked tenant is rejected before anything is read or written.
//! 2. Inside K's critical section, `usage + R` is compared against K's limits.
//!    If nothing is violated, the ledger is incremented and the caller's
//!    commit step runs in the same section. A failing commit step reverts
//!    the increment before the section ends.
//! 3. Otherwise an owner-scoped sweep is run outside the section (bounded by
//!    the on-demand timeout), followed by exactly one more attempt. If that
//!    still violates, every violated resource is reported.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;

use warden_core::clock::Clock;
use warden_core::error::{Error, Result};
use warden_core::event::{EventKind, EventSink, GovernorEvent};
use warden_core::id::{Owner, TenantId};
use warden_core::quota::TenantQuota;
use warden_core::types::{ResourceAmounts, ResourceKind, ResourceRequest, Violation};
use warden_ledger::{Account, Ledger};
use warden_policy::{EnforcementBoard, QuotaRegistry};

use crate::metrics::escalate;
use crate::reclaim::Reclaimer;

/// Limits in force for one owner.
enum Limits {
    /// Users are only bounded on connections.
    PerUser(f64),
    Tenant(TenantQuota),
}

impl Limits {
    fn limit(&self, kind: ResourceKind) -> f64 {
        match self {
            Limits::PerUser(cap) if kind == ResourceKind::Connections => *cap,
            Limits::PerUser(_) => f64::INFINITY,
            Limits::Tenant(quota) => quota.limit(kind),
        }
    }
}

enum Attempt<T> {
    Admitted(T),
    Over(Vec<Violation>),
}

/// Result of a read-only availability check.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Availability {
    pub allowed: bool,
    pub violations: Vec<Violation>,
    pub blocked: bool,
}

impl Availability {
    /// Human-readable violation messages, e.g. "CPU quota exceeded: 2.5 > 2.0".
    pub fn messages(&self) -> Vec<String> {
        self.violations.iter().map(ToString::to_string).collect()
    }
}

pub struct AdmissionController {
    ledger: Arc<Ledger>,
    registry: Arc<QuotaRegistry>,
    board: Arc<EnforcementBoard>,
    reclaimer: Arc<Reclaimer>,
    sink: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
    max_connections_per_user: usize,
    sweep_timeout: Duration,
}

impl AdmissionController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ledger: Arc<Ledger>,
        registry: Arc<QuotaRegistry>,
        board: Arc<EnforcementBoard>,
        reclaimer: Arc<Reclaimer>,
        sink: Arc<dyn EventSink>,
        clock: Arc<dyn Clock>,
        max_connections_per_user: usize,
        sweep_timeout: Duration,
    ) -> Self {
        Self {
            ledger,
            registry,
            board,
            reclaimer,
            sink,
            clock,
            max_connections_per_user,
            sweep_timeout,
        }
    }

    /// Admit `request` for `owner` and run `commit` in the same critical
    /// section. `commit` may run twice if the first attempt had to reclaim,
    /// but it only ever runs on an attempt that was admitted.
    pub fn admit<T>(
        &self,
        owner: &Owner,
        request: &ResourceRequest,
        mut commit: impl FnMut(&mut Account) -> Result<T>,
    ) -> Result<T> {
        if let Some(tenant_id) = owner.as_tenant() {
            self.ensure_not_blocked(tenant_id)?;
        }

        let violations = match self.attempt(owner, request, &mut commit)? {
            Attempt::Admitted(out) => {
                self.emit_for_request(EventKind::Admitted, owner, request);
                return Ok(out);
            }
            Attempt::Over(violations) => violations,
        };

        let needed = shortfall(&violations);
        let deadline = Instant::now() + self.sweep_timeout;
        let _report = self.reclaimer.sweep_owner(owner, &needed, deadline);

        #[cfg(feature = "tracing")]
        tracing::debug!(
            %owner,
            reclaimed = _report.reclaimed(),
            timed_out = _report.timed_out,
            "on-demand sweep before re-check"
        );

        match self.attempt(owner, request, &mut commit)? {
            Attempt::Admitted(out) => {
                self.emit_for_request(EventKind::Admitted, owner, request);
                Ok(out)
            }
            Attempt::Over(violations) => {
                let now = self.clock.now_ms();
                for v in &violations {
                    self.sink.emit(GovernorEvent::new(
                        EventKind::Rejected,
                        owner.clone(),
                        Some(v.resource),
                        now,
                    ));
                }
                #[cfg(feature = "tracing")]
                tracing::debug!(%owner, violations = violations.len(), "admission rejected");

                Err(Error::QuotaExceeded {
                    key: owner.to_string(),
                    violations,
                })
            }
        }
    }

    /// Read-only evaluation for a tenant: no mutation, no reclamation.
    pub fn check(&self, tenant_id: &TenantId, request: &ResourceRequest) -> Result<Availability> {
        let quota = self.registry.quota(tenant_id).ok_or_else(|| Error::NotFound {
            what: "tenant",
            id: tenant_id.to_string(),
        })?;
        let blocked = self.board.blocked_reasons(tenant_id).is_some();
        let snapshot = self
            .ledger
            .snapshot(&Owner::Tenant(tenant_id.clone()))
            .map_err(|e| escalate(&*self.sink, self.clock.now_ms(), e))?;
        let violations = Violation::collect(&snapshot.usage, request, |k| quota.limit(k));
        Ok(Availability {
            allowed: !blocked && violations.is_empty(),
            violations,
            blocked,
        })
    }

    /// Advisory delay for admissions of a throttled tenant.
    pub fn throttle_for(&self, tenant_id: &TenantId, delay: Duration) -> Option<Duration> {
        self.board.is_throttled(tenant_id).then_some(delay)
    }

    fn ensure_not_blocked(&self, tenant_id: &TenantId) -> Result<()> {
        match self.board.blocked_reasons(tenant_id) {
            None => Ok(()),
            Some(reasons) => {
                self.sink.emit(GovernorEvent::new(
                    EventKind::Rejected,
                    Owner::Tenant(tenant_id.clone()),
                    None,
                    self.clock.now_ms(),
                ));
                Err(Error::TenantBlocked {
                    tenant: tenant_id.to_string(),
                    reasons,
                })
            }
        }
    }

    fn attempt<T>(
        &self,
        owner: &Owner,
        request: &ResourceRequest,
        commit: &mut impl FnMut(&mut Account) -> Result<T>,
    ) -> Result<Attempt<T>> {
        self.ledger
            .transact(owner, |account| {
                let limits = self.limits(owner)?;
                let violations = Violation::collect(account.usage(), request, |k| limits.limit(k));
                if !violations.is_empty() {
                    return Ok(Attempt::Over(violations));
                }
                account.apply(request.amounts());
                match commit(account) {
                    Ok(out) => Ok(Attempt::Admitted(out)),
                    Err(err) => {
                        account.release(request.amounts());
                        Err(err)
                    }
                }
            })
            .map_err(|e| escalate(&*self.sink, self.clock.now_ms(), e))?
    }

    fn limits(&self, owner: &Owner) -> Result<Limits> {
        match owner {
            Owner::User(_) => Ok(Limits::PerUser(self.max_connections_per_user as f64)),
            Owner::Tenant(tenant_id) => self
                .registry
                .quota(tenant_id)
                .map(Limits::Tenant)
                .ok_or_else(|| Error::NotFound {
                    what: "tenant",
                    id: tenant_id.to_string(),
                }),
        }
    }

    fn emit_for_request(&self, kind: EventKind, owner: &Owner, request: &ResourceRequest) {
        self.reclaimer.emit_each(kind, owner, request.amounts());
    }
}

/// How much each violated resource is over its limit.
fn shortfall(violations: &[Violation]) -> ResourceAmounts {
    violations
        .iter()
        .map(|v| (v.resource, (v.projected() - v.limit).max(0.0)))
        .collect()
}
