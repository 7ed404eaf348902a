//! Persistent-overage enforcement.
//!
//! The admission path stops a single request from going over quota. This
//! module deals with the tenants that are *already* over, which happens when
//! an administrator lowers a quota below current usage. Each tick compares
//! usage against quota and moves the tenant through
//! `NORMAL → WARNING → BLOCKED`:
//!
//! - over limit, strict policy: `BLOCKED` with the violation messages as reasons
//! - over limit, lenient policy: `WARNING` with the throttle flag set
//! - back under limit: `WARNING` relaxes to `NORMAL`
//!
//! `BLOCKED` is sticky. Only [`EnforcementEngine::unblock`] clears it.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};

use warden_core::clock::Clock;
use warden_core::error::{Error, Result};
use warden_core::id::{Owner, TenantId};
use warden_core::quota::TenantQuota;
use warden_core::types::{ResourceAmounts, ResourceKind, Violation, AMOUNT_EPSILON};
use warden_ledger::Ledger;

use crate::registry::QuotaRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EnforcementLevel {
    Normal,
    Warning,
    Blocked,
}

impl EnforcementLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            EnforcementLevel::Normal => "NORMAL",
            EnforcementLevel::Warning => "WARNING",
            EnforcementLevel::Blocked => "BLOCKED",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnforcementState {
    pub tenant_id: TenantId,
    pub level: EnforcementLevel,
    pub blocked: bool,
    pub throttled: bool,
    pub reasons: Vec<String>,
    pub updated_at_ms: u64,
}

impl EnforcementState {
    pub fn normal(tenant_id: TenantId, now_ms: u64) -> Self {
        Self {
            tenant_id,
            level: EnforcementLevel::Normal,
            blocked: false,
            throttled: false,
            reasons: Vec::new(),
            updated_at_ms: now_ms,
        }
    }

    fn warning(tenant_id: TenantId, reasons: Vec<String>, now_ms: u64) -> Self {
        Self {
            tenant_id,
            level: EnforcementLevel::Warning,
            blocked: false,
            throttled: true,
            reasons,
            updated_at_ms: now_ms,
        }
    }

    fn blocked(tenant_id: TenantId, reasons: Vec<String>, now_ms: u64) -> Self {
        Self {
            tenant_id,
            level: EnforcementLevel::Blocked,
            blocked: true,
            throttled: false,
            reasons,
            updated_at_ms: now_ms,
        }
    }
}

/// One level change made by a tick or an unblock.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Transition {
    pub tenant_id: TenantId,
    pub from: EnforcementLevel,
    pub to: EnforcementLevel,
    pub reasons: Vec<String>,
}

/// Current enforcement state per tenant. Absent means `NORMAL`.
#[derive(Default)]
pub struct EnforcementBoard {
    states: RwLock<HashMap<TenantId, EnforcementState>>,
}

impl EnforcementBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, tenant_id: &TenantId) -> Option<EnforcementState> {
        self.read().get(tenant_id).cloned()
    }

    pub fn level(&self, tenant_id: &TenantId) -> EnforcementLevel {
        self.read()
            .get(tenant_id)
            .map_or(EnforcementLevel::Normal, |s| s.level)
    }

    /// Block reasons if the tenant is blocked.
    pub fn blocked_reasons(&self, tenant_id: &TenantId) -> Option<Vec<String>> {
        self.read()
            .get(tenant_id)
            .filter(|s| s.blocked)
            .map(|s| s.reasons.clone())
    }

    pub fn is_throttled(&self, tenant_id: &TenantId) -> bool {
        self.read().get(tenant_id).is_some_and(|s| s.throttled)
    }

    pub fn remove(&self, tenant_id: &TenantId) -> Option<EnforcementState> {
        self.write().remove(tenant_id)
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<TenantId, EnforcementState>> {
        self.states.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<TenantId, EnforcementState>> {
        self.states.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Resources where `usage` already exceeds `quota`.
pub fn overages(usage: &ResourceAmounts, quota: &TenantQuota) -> Vec<Violation> {
    ResourceKind::ALL
        .iter()
        .filter_map(|&resource| {
            let current = usage.get(resource);
            let limit = quota.limit(resource);
            (current > limit + AMOUNT_EPSILON).then_some(Violation {
                resource,
                requested: 0.0,
                current,
                limit,
            })
        })
        .collect()
}

pub struct EnforcementEngine {
    registry: Arc<QuotaRegistry>,
    ledger: Arc<Ledger>,
    board: Arc<EnforcementBoard>,
    clock: Arc<dyn Clock>,
}

impl EnforcementEngine {
    pub fn new(
        registry: Arc<QuotaRegistry>,
        ledger: Arc<Ledger>,
        board: Arc<EnforcementBoard>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            registry,
            ledger,
            board,
            clock,
        }
    }

    pub fn board(&self) -> &Arc<EnforcementBoard> {
        &self.board
    }

    /// One tick over every registered tenant.
    ///
    /// A tenant whose ledger account is quarantined is skipped; its usage
    /// cannot be trusted until the quarantine is lifted.
    pub fn evaluate(&self) -> Vec<Transition> {
        let mut transitions = Vec::new();
        for tenant_id in self.registry.tenants() {
            match self.evaluate_tenant(&tenant_id) {
                Ok(Some(t)) => transitions.push(t),
                Ok(None) => {}
                Err(_err) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(
                        tenant = %tenant_id,
                        error = %_err,
                        "enforcement skipped tenant"
                    );
                }
            }
        }
        transitions
    }

    pub fn evaluate_tenant(&self, tenant_id: &TenantId) -> Result<Option<Transition>> {
        let record = self.registry.record(tenant_id).ok_or_else(|| Error::NotFound {
            what: "tenant",
            id: tenant_id.to_string(),
        })?;
        let snapshot = self.ledger.snapshot(&Owner::Tenant(tenant_id.clone()))?;
        let reasons: Vec<String> = overages(&snapshot.usage, &record.quota)
            .iter()
            .map(ToString::to_string)
            .collect();
        let now = self.clock.now_ms();

        let mut states = self.board.write();
        let from = states
            .get(tenant_id)
            .map_or(EnforcementLevel::Normal, |s| s.level);

        let next = match (from, reasons.is_empty()) {
            (EnforcementLevel::Blocked, _) => None,
            (_, false) if record.policy.strict_quota_enforcement => Some(EnforcementState::blocked(
                tenant_id.clone(),
                reasons,
                now,
            )),
            (_, false) => Some(EnforcementState::warning(tenant_id.clone(), reasons, now)),
            (EnforcementLevel::Warning, true) => {
                Some(EnforcementState::normal(tenant_id.clone(), now))
            }
            (EnforcementLevel::Normal, true) => None,
        };

        let Some(next) = next else {
            return Ok(None);
        };
        let to = next.level;
        let reasons = next.reasons.clone();
        states.insert(tenant_id.clone(), next);
        drop(states);

        if from == to {
            // Still warning; reasons refreshed.
            return Ok(None);
        }

        #[cfg(feature = "tracing")]
        match to {
            EnforcementLevel::Blocked => {
                tracing::warn!(tenant = %tenant_id, ?reasons, "tenant blocked")
            }
            EnforcementLevel::Warning => {
                tracing::warn!(tenant = %tenant_id, ?reasons, "tenant throttled")
            }
            EnforcementLevel::Normal => {
                tracing::info!(tenant = %tenant_id, "tenant back to normal")
            }
        }

        Ok(Some(Transition {
            tenant_id: tenant_id.clone(),
            from,
            to,
            reasons,
        }))
    }

    /// Clear a block. Returns the transition if the tenant was blocked.
    pub fn unblock(&self, tenant_id: &TenantId) -> Result<Option<Transition>> {
        if !self.registry.contains(tenant_id) {
            return Err(Error::NotFound {
                what: "tenant",
                id: tenant_id.to_string(),
            });
        }
        let mut states = self.board.write();
        let from = states
            .get(tenant_id)
            .map_or(EnforcementLevel::Normal, |s| s.level);
        if from != EnforcementLevel::Blocked {
            return Ok(None);
        }
        states.insert(
            tenant_id.clone(),
            EnforcementState::normal(tenant_id.clone(), self.clock.now_ms()),
        );

        #[cfg(feature = "tracing")]
        tracing::info!(tenant = %tenant_id, "tenant unblocked");

        Ok(Some(Transition {
            tenant_id: tenant_id.clone(),
            from,
            to: EnforcementLevel::Normal,
            reasons: Vec::new(),
        }))
    }
}
