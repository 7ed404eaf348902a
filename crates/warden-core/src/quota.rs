//! Tenant quota records and partial updates.
//!
//! Floors are applied whenever a quota is created or updated so a tenant can
//! never be configured into a zero-quota lockout.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::id::TenantId;
use crate::types::ResourceKind;

pub const MIN_CPU_CORES: f64 = 0.1;
pub const MIN_MEMORY_MB: f64 = 128.0;
pub const MIN_STORAGE_GB: f64 = 1.0;
pub const MIN_NETWORK_MBPS: f64 = 1.0;
pub const MIN_CONCURRENT_REQUESTS: u64 = 1;
pub const MIN_CONNECTIONS: u64 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TenantQuota {
    pub tenant_id: TenantId,
    pub cpu_cores: f64,
    pub memory_mb: f64,
    pub storage_gb: f64,
    pub network_mbps: f64,
    pub max_concurrent_requests: u64,
    pub max_connections: u64,
}

impl TenantQuota {
    /// Default limits for a freshly registered tenant.
    pub fn default_for(tenant_id: TenantId) -> Self {
        Self {
            tenant_id,
            cpu_cores: 2.0,
            memory_mb: 4096.0,
            storage_gb: 10.0,
            network_mbps: 100.0,
            max_concurrent_requests: 100,
            max_connections: 50,
        }
    }

    pub fn limit(&self, kind: ResourceKind) -> f64 {
        match kind {
            ResourceKind::CpuCores => self.cpu_cores,
            ResourceKind::MemoryMb => self.memory_mb,
            ResourceKind::StorageGb => self.storage_gb,
            ResourceKind::NetworkMbps => self.network_mbps,
            ResourceKind::ConcurrentRequests => self.max_concurrent_requests as f64,
            ResourceKind::Connections => self.max_connections as f64,
        }
    }

    /// Reject infinite or NaN limits. Floors cannot repair those, and an
    /// unbounded limit lets usage itself overflow to infinity.
    pub fn ensure_finite(&self) -> Result<()> {
        for kind in FRACTIONAL {
            check_finite(kind, Some(self.limit(kind)))?;
        }
        Ok(())
    }

    /// Raise any limit below its floor. NaN limits fall back to the floor too.
    pub fn clamp_to_floors(mut self) -> Self {
        self.cpu_cores = floor_f64(self.cpu_cores, MIN_CPU_CORES);
        self.memory_mb = floor_f64(self.memory_mb, MIN_MEMORY_MB);
        self.storage_gb = floor_f64(self.storage_gb, MIN_STORAGE_GB);
        self.network_mbps = floor_f64(self.network_mbps, MIN_NETWORK_MBPS);
        self.max_concurrent_requests = self.max_concurrent_requests.max(MIN_CONCURRENT_REQUESTS);
        self.max_connections = self.max_connections.max(MIN_CONNECTIONS);
        self
    }

    /// Merge only the supplied fields, then re-apply floors.
    pub fn merged(mut self, update: &QuotaUpdate) -> Self {
        if let Some(v) = update.cpu_cores {
            self.cpu_cores = v;
        }
        if let Some(v) = update.memory_mb {
            self.memory_mb = v;
        }
        if let Some(v) = update.storage_gb {
            self.storage_gb = v;
        }
        if let Some(v) = update.network_mbps {
            self.network_mbps = v;
        }
        if let Some(v) = update.max_concurrent_requests {
            self.max_concurrent_requests = v;
        }
        if let Some(v) = update.max_connections {
            self.max_connections = v;
        }
        self.clamp_to_floors()
    }
}

const FRACTIONAL: [ResourceKind; 4] = [
    ResourceKind::CpuCores,
    ResourceKind::MemoryMb,
    ResourceKind::StorageGb,
    ResourceKind::NetworkMbps,
];

fn check_finite(kind: ResourceKind, value: Option<f64>) -> Result<()> {
    match value {
        Some(amount) if !amount.is_finite() => Err(Error::InvalidAmount {
            resource: kind.as_str().to_string(),
            amount,
        }),
        _ => Ok(()),
    }
}

fn floor_f64(value: f64, floor: f64) -> f64 {
    if value.is_nan() || value < floor {
        floor
    } else {
        value
    }
}

/// Partial quota update. Absent fields are left untouched; unknown fields
/// are rejected when decoding.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QuotaUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_cores: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_gb: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_mbps: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrent_requests: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_connections: Option<u64>,
}

impl QuotaUpdate {
    pub fn cpu_cores(v: f64) -> Self {
        Self {
            cpu_cores: Some(v),
            ..Self::default()
        }
    }

    /// Same check as [`TenantQuota::ensure_finite`] for the supplied fields.
    pub fn ensure_finite(&self) -> Result<()> {
        check_finite(ResourceKind::CpuCores, self.cpu_cores)?;
        check_finite(ResourceKind::MemoryMb, self.memory_mb)?;
        check_finite(ResourceKind::StorageGb, self.storage_gb)?;
        check_finite(ResourceKind::NetworkMbps, self.network_mbps)
    }
}

/// How the enforcement engine treats a tenant that runs over quota.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantPolicy {
    /// Over-quota tenants are blocked (instead of warned and throttled).
    pub strict_quota_enforcement: bool,
}

impl TenantPolicy {
    pub fn strict() -> Self {
        Self {
            strict_quota_enforcement: true,
        }
    }

    pub fn lenient() -> Self {
        Self {
            strict_quota_enforcement: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_floors_applied() {
        let mut q = TenantQuota::default_for("t".into());
        q.cpu_cores = 0.0;
        q.memory_mb = 1.0;
        q.max_concurrent_requests = 0;
        let q = q.clamp_to_floors();
        assert_eq!(q.cpu_cores, MIN_CPU_CORES);
        assert_eq!(q.memory_mb, MIN_MEMORY_MB);
        assert_eq!(q.max_concurrent_requests, 1);
    }

    #[test]
    fn test_update_rejects_unknown_fields() {
        let ok: QuotaUpdate = serde_json::from_str(r#"{"cpu_cores": 4}"#).unwrap();
        assert_eq!(ok, QuotaUpdate::cpu_cores(4.0));
        assert!(serde_json::from_str::<QuotaUpdate>(r#"{"gpus": 4}"#).is_err());
    }
}
