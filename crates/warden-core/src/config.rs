//! Governor configuration that downstream crates can serialize/deserialize.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernorConfig {
    /// Hard cap on simultaneously ACTIVE connections per user.
    pub max_connections_per_user: usize,

    /// Period of the background reclamation sweep.
    pub reclaim_interval_ms: u64,

    /// Expected heartbeat period of a healthy connection.
    pub heartbeat_interval_ms: u64,

    /// A connection silent for longer than this is a zombie.
    pub heartbeat_timeout_ms: u64,

    /// Upper bound on the reclamation sweep run from inside an admission.
    pub on_demand_sweep_timeout_ms: u64,

    /// Lifetime of a tenant allocation before the reclaimer may take it back.
    pub lease_ttl_ms: u64,

    /// Period of the enforcement engine tick.
    pub enforcement_interval_ms: u64,

    /// Advisory delay handed to admissions of a throttled tenant.
    pub throttle_delay_ms: u64,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            max_connections_per_user: 5,
            reclaim_interval_ms: 60_000,
            heartbeat_interval_ms: 30_000,
            heartbeat_timeout_ms: 90_000, // 3 missed heartbeats
            on_demand_sweep_timeout_ms: 200,
            lease_ttl_ms: 300_000,
            enforcement_interval_ms: 30_000,
            throttle_delay_ms: 250,
        }
    }
}

impl GovernorConfig {
    /// Create a config from environment variables, falling back to defaults.
    ///
    /// Environment variables:
    /// - `WARDEN_MAX_CONNECTIONS_PER_USER`
    /// - `WARDEN_RECLAIM_INTERVAL_MS`
    /// - `WARDEN_HEARTBEAT_INTERVAL_MS`
    /// - `WARDEN_HEARTBEAT_TIMEOUT_MS`
    /// - `WARDEN_SWEEP_TIMEOUT_MS`
    /// - `WARDEN_LEASE_TTL_MS`
    /// - `WARDEN_ENFORCEMENT_INTERVAL_MS`
    /// - `WARDEN_THROTTLE_DELAY_MS`
    ///
    /// Unparseable values are ignored.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`GovernorConfig::from_env`] with an injectable variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();

        if let Some(v) = parse_var(&lookup, "WARDEN_MAX_CONNECTIONS_PER_USER") {
            cfg.max_connections_per_user = v as usize;
        }
        if let Some(v) = parse_var(&lookup, "WARDEN_RECLAIM_INTERVAL_MS") {
            cfg.reclaim_interval_ms = v;
        }
        if let Some(v) = parse_var(&lookup, "WARDEN_HEARTBEAT_INTERVAL_MS") {
            cfg.heartbeat_interval_ms = v;
        }
        if let Some(v) = parse_var(&lookup, "WARDEN_HEARTBEAT_TIMEOUT_MS") {
            cfg.heartbeat_timeout_ms = v;
        }
        if let Some(v) = parse_var(&lookup, "WARDEN_SWEEP_TIMEOUT_MS") {
            cfg.on_demand_sweep_timeout_ms = v;
        }
        if let Some(v) = parse_var(&lookup, "WARDEN_LEASE_TTL_MS") {
            cfg.lease_ttl_ms = v;
        }
        if let Some(v) = parse_var(&lookup, "WARDEN_ENFORCEMENT_INTERVAL_MS") {
            cfg.enforcement_interval_ms = v;
        }
        if let Some(v) = parse_var(&lookup, "WARDEN_THROTTLE_DELAY_MS") {
            cfg.throttle_delay_ms = v;
        }

        cfg
    }

    /// Reject settings that would make the governor misbehave.
    pub fn validate(&self) -> Result<()> {
        if self.max_connections_per_user == 0 {
            return Err(Error::Config(
                "max_connections_per_user must be at least 1".into(),
            ));
        }
        for (name, value) in [
            ("reclaim_interval_ms", self.reclaim_interval_ms),
            ("heartbeat_interval_ms", self.heartbeat_interval_ms),
            ("enforcement_interval_ms", self.enforcement_interval_ms),
            ("lease_ttl_ms", self.lease_ttl_ms),
        ] {
            if value == 0 {
                return Err(Error::Config(format!("{name} must be non-zero")));
            }
        }
        if self.heartbeat_timeout_ms < self.heartbeat_interval_ms {
            return Err(Error::Config(format!(
                "heartbeat_timeout_ms ({}) is shorter than heartbeat_interval_ms ({})",
                self.heartbeat_timeout_ms, self.heartbeat_interval_ms
            )));
        }
        Ok(())
    }

    pub fn reclaim_interval(&self) -> Duration {
        Duration::from_millis(self.reclaim_interval_ms)
    }

    pub fn enforcement_interval(&self) -> Duration {
        Duration::from_millis(self.enforcement_interval_ms)
    }

    pub fn on_demand_sweep_timeout(&self) -> Duration {
        Duration::from_millis(self.on_demand_sweep_timeout_ms)
    }

    pub fn throttle_delay(&self) -> Duration {
        Duration::from_millis(self.throttle_delay_ms)
    }
}

fn parse_var(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<u64> {
    lookup(name).and_then(|s| s.trim().parse::<u64>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_lookup_overrides_defaults() {
        let vars: HashMap<&str, &str> = [
            ("WARDEN_MAX_CONNECTIONS_PER_USER", "3"),
            ("WARDEN_HEARTBEAT_TIMEOUT_MS", "not-a-number"),
            ("WARDEN_LEASE_TTL_MS", " 1000 "),
        ]
        .into_iter()
        .collect();
        let cfg = GovernorConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(cfg.max_connections_per_user, 3);
        assert_eq!(cfg.heartbeat_timeout_ms, 90_000);
        assert_eq!(cfg.lease_ttl_ms, 1000);
        cfg.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_short_heartbeat_timeout() {
        let cfg = GovernorConfig {
            heartbeat_timeout_ms: 10,
            ..GovernorConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(Error::Config(_))));
    }
}
