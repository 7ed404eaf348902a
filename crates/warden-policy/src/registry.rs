//! Tenant quota registry.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::Serialize;

use warden_core::error::{Error, Result};
use warden_core::id::TenantId;
use warden_core::quota::{QuotaUpdate, TenantPolicy, TenantQuota};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TenantRecord {
    pub quota: TenantQuota,
    pub policy: TenantPolicy,
}

#[derive(Default)]
pub struct QuotaRegistry {
    tenants: RwLock<HashMap<TenantId, TenantRecord>>,
}

impl QuotaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tenant. Re-registration is rejected rather than silently
    /// overwriting a quota someone else may just have changed.
    pub fn register(
        &self,
        tenant_id: TenantId,
        quota: Option<TenantQuota>,
        policy: TenantPolicy,
    ) -> Result<TenantQuota> {
        let mut tenants = self.write();
        if tenants.contains_key(&tenant_id) {
            return Err(Error::AlreadyRegistered {
                what: "tenant",
                id: tenant_id.to_string(),
            });
        }
        let mut quota = quota.unwrap_or_else(|| TenantQuota::default_for(tenant_id.clone()));
        quota.tenant_id = tenant_id.clone();
        quota.ensure_finite()?;
        let quota = quota.clamp_to_floors();

        #[cfg(feature = "tracing")]
        tracing::info!(
            tenant = %tenant_id,
            strict = policy.strict_quota_enforcement,
            "tenant registered"
        );

        tenants.insert(
            tenant_id,
            TenantRecord {
                quota: quota.clone(),
                policy,
            },
        );
        Ok(quota)
    }

    /// Merge the supplied fields into the tenant's quota.
    pub fn update(&self, tenant_id: &TenantId, update: &QuotaUpdate) -> Result<TenantQuota> {
        update.ensure_finite()?;
        let mut tenants = self.write();
        let record = tenants.get_mut(tenant_id).ok_or_else(|| not_found(tenant_id))?;
        record.quota = record.quota.clone().merged(update);

        #[cfg(feature = "tracing")]
        tracing::info!(tenant = %tenant_id, ?update, "tenant quota updated");

        Ok(record.quota.clone())
    }

    pub fn set_policy(&self, tenant_id: &TenantId, policy: TenantPolicy) -> Result<()> {
        let mut tenants = self.write();
        let record = tenants.get_mut(tenant_id).ok_or_else(|| not_found(tenant_id))?;
        record.policy = policy;
        Ok(())
    }

    /// Remove the tenant's record. Usage and enforcement state are removed by
    /// the caller in the same ledger critical section.
    pub fn unregister(&self, tenant_id: &TenantId) -> Result<TenantRecord> {
        self.write()
            .remove(tenant_id)
            .ok_or_else(|| not_found(tenant_id))
    }

    pub fn record(&self, tenant_id: &TenantId) -> Option<TenantRecord> {
        self.read().get(tenant_id).cloned()
    }

    pub fn quota(&self, tenant_id: &TenantId) -> Option<TenantQuota> {
        self.read().get(tenant_id).map(|r| r.quota.clone())
    }

    pub fn policy(&self, tenant_id: &TenantId) -> Option<TenantPolicy> {
        self.read().get(tenant_id).map(|r| r.policy)
    }

    pub fn contains(&self, tenant_id: &TenantId) -> bool {
        self.read().contains_key(tenant_id)
    }

    pub fn tenants(&self) -> Vec<TenantId> {
        let mut ids: Vec<TenantId> = self.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<TenantId, TenantRecord>> {
        self.tenants.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<TenantId, TenantRecord>> {
        self.tenants.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn not_found(tenant_id: &TenantId) -> Error {
    Error::NotFound {
        what: "tenant",
        id: tenant_id.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_core::quota::{MIN_CPU_CORES, MIN_MEMORY_MB};

    #[test]
    fn test_register_applies_floors_and_rejects_duplicates() {
        let registry = QuotaRegistry::new();
        let tenant = TenantId::from("acme");
        let mut quota = TenantQuota::default_for(tenant.clone());
        quota.cpu_cores = 0.0;
        quota.memory_mb = 0.0;

        let stored = registry
            .register(tenant.clone(), Some(quota), TenantPolicy::default())
            .unwrap();
        assert_eq!(stored.cpu_cores, MIN_CPU_CORES);
        assert_eq!(stored.memory_mb, MIN_MEMORY_MB);

        let err = registry
            .register(tenant.clone(), None, TenantPolicy::strict())
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyRegistered { .. }));
        // The original record survives.
        assert_eq!(registry.policy(&tenant), Some(TenantPolicy::default()));
    }

    #[test]
    fn test_update_merges_only_supplied_fields() {
        let registry = QuotaRegistry::new();
        let tenant = TenantId::from("acme");
        registry
            .register(tenant.clone(), None, TenantPolicy::default())
            .unwrap();

        let updated = registry
            .update(&tenant, &QuotaUpdate::cpu_cores(4.0))
            .unwrap();
        assert_eq!(updated.cpu_cores, 4.0);
        assert_eq!(updated.memory_mb, 4096.0);

        let err = registry
            .update(&TenantId::from("nobody"), &QuotaUpdate::default())
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[test]
    fn test_non_finite_limits_are_rejected() {
        let registry = QuotaRegistry::new();
        let tenant = TenantId::from("acme");
        let mut quota = TenantQuota::default_for(tenant.clone());
        quota.cpu_cores = f64::INFINITY;

        let err = registry
            .register(tenant.clone(), Some(quota), TenantPolicy::default())
            .unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidAmount { ref resource, .. } if resource == "cpu_cores"
        ));
        assert!(!registry.contains(&tenant));

        registry
            .register(tenant.clone(), None, TenantPolicy::default())
            .unwrap();
        let update = QuotaUpdate {
            memory_mb: Some(f64::NAN),
            ..QuotaUpdate::default()
        };
        let err = registry.update(&tenant, &update).unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidAmount { ref resource, .. } if resource == "memory_mb"
        ));
        assert_eq!(registry.quota(&tenant).unwrap().memory_mb, 4096.0);
    }

    #[test]
    fn test_quota_from_json_keeps_registration_id() {
        let registry = QuotaRegistry::new();
        let quota: TenantQuota = serde_json::from_value(serde_json::json!({
            "tenant_id": "someone-else",
            "cpu_cores": 1.0,
            "memory_mb": 512.0,
            "storage_gb": 5.0,
            "network_mbps": 10.0,
            "max_concurrent_requests": 2,
            "max_connections": 3
        }))
        .unwrap();
        let stored = registry
            .register(TenantId::from("acme"), Some(quota), TenantPolicy::default())
            .unwrap();
        assert_eq!(stored.tenant_id.as_str(), "acme");
        assert_eq!(stored.max_concurrent_requests, 2);
    }
}
