//! Read-only views returned by the governor.

use std::collections::BTreeMap;

use serde::Serialize;

use warden_core::id::TenantId;
use warden_core::quota::{TenantPolicy, TenantQuota};
use warden_core::types::{ResourceAmounts, ResourceKind};
use warden_policy::EnforcementLevel;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TenantStatus {
    pub tenant_id: TenantId,
    pub quota: TenantQuota,
    pub usage: ResourceAmounts,
    /// Percent of each limit in use, rounded to two decimals.
    pub utilization: BTreeMap<ResourceKind, f64>,
    pub policy: TenantPolicy,
    pub enforcement: EnforcementLevel,
    pub throttled: bool,
    pub blocked: bool,
    pub reasons: Vec<String>,
    pub active_leases: usize,
    pub last_updated_ms: u64,
}

impl TenantStatus {
    pub fn utilization_of(&self, kind: ResourceKind) -> f64 {
        self.utilization.get(&kind).copied().unwrap_or(0.0)
    }
}

pub fn utilization(usage: &ResourceAmounts, quota: &TenantQuota) -> BTreeMap<ResourceKind, f64> {
    ResourceKind::ALL
        .iter()
        .map(|&kind| {
            let limit = quota.limit(kind);
            let pct = if limit > 0.0 {
                usage.get(kind) / limit * 100.0
            } else {
                0.0
            };
            (kind, (pct * 100.0).round() / 100.0)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_utilization_percentages() {
        let mut quota = TenantQuota::default_for(TenantId::from("acme"));
        quota.cpu_cores = 4.0;
        let usage: ResourceAmounts = [
            (ResourceKind::CpuCores, 1.0),
            (ResourceKind::MemoryMb, 1024.0),
            (ResourceKind::ConcurrentRequests, 1.0),
        ]
        .into_iter()
        .collect();

        let u = utilization(&usage, &quota);
        assert_eq!(u[&ResourceKind::CpuCores], 25.0);
        assert_eq!(u[&ResourceKind::MemoryMb], 25.0);
        assert_eq!(u[&ResourceKind::ConcurrentRequests], 1.0);
        assert_eq!(u[&ResourceKind::StorageGb], 0.0);
        assert_eq!(u.len(), ResourceKind::ALL.len());

        let json = serde_json::to_value(&u).unwrap();
        assert_eq!(json["cpu_cores"], 25.0);
        assert_eq!(json["connections"], 0.0);
    }
}
