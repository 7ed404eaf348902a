//! Resource kinds, amount maps, validated requests, and quota violations.
//!
//! The set of resource kinds is closed. A request naming anything else is
//! rejected when it is built, so a typo in a caller can never turn into a
//! silently-ignored limit.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Tolerance used when comparing or clamping fractional amounts.
pub const AMOUNT_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    CpuCores,
    MemoryMb,
    StorageGb,
    NetworkMbps,
    ConcurrentRequests,
    Connections,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 6] = [
        ResourceKind::CpuCores,
        ResourceKind::MemoryMb,
        ResourceKind::StorageGb,
        ResourceKind::NetworkMbps,
        ResourceKind::ConcurrentRequests,
        ResourceKind::Connections,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ResourceKind::CpuCores => "cpu_cores",
            ResourceKind::MemoryMb => "memory_mb",
            ResourceKind::StorageGb => "storage_gb",
            ResourceKind::NetworkMbps => "network_mbps",
            ResourceKind::ConcurrentRequests => "concurrent_requests",
            ResourceKind::Connections => "connections",
        }
    }

    /// Human label used in violation messages.
    pub fn label(self) -> &'static str {
        match self {
            ResourceKind::CpuCores => "CPU",
            ResourceKind::MemoryMb => "Memory",
            ResourceKind::StorageGb => "Storage",
            ResourceKind::NetworkMbps => "Network bandwidth",
            ResourceKind::ConcurrentRequests => "Concurrent requests",
            ResourceKind::Connections => "Connection",
        }
    }

    /// Integral kinds only accept whole amounts.
    pub fn is_integral(self) -> bool {
        matches!(
            self,
            ResourceKind::MemoryMb | ResourceKind::ConcurrentRequests | ResourceKind::Connections
        )
    }

    /// Render an amount the way operators expect to read it
    /// (`3` for counters, `2.5` / `2.0` for fractional kinds).
    pub fn format_amount(self, amount: f64) -> String {
        if self.is_integral() {
            return format!("{:.0}", amount);
        }
        let rounded = (amount * 1000.0).round() / 1000.0;
        if rounded.fract() == 0.0 {
            format!("{:.1}", rounded)
        } else {
            format!("{}", rounded)
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        ResourceKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| Error::UnknownResource(s.to_string()))
    }
}

/// Per-kind amounts. Missing kinds read as zero.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceAmounts(BTreeMap<ResourceKind, f64>);

impl ResourceAmounts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, kind: ResourceKind) -> f64 {
        self.0.get(&kind).copied().unwrap_or(0.0)
    }

    pub fn set(&mut self, kind: ResourceKind, amount: f64) {
        self.0.insert(kind, amount);
    }

    /// Add `amount` to `kind`, returning the new total.
    pub fn add(&mut self, kind: ResourceKind, amount: f64) -> f64 {
        let slot = self.0.entry(kind).or_insert(0.0);
        *slot += amount;
        *slot
    }

    /// Subtract `amount` from `kind`, clamping at zero.
    /// Returns `(new_total, clamped)`.
    pub fn sub_clamped(&mut self, kind: ResourceKind, amount: f64) -> (f64, bool) {
        let slot = self.0.entry(kind).or_insert(0.0);
        let next = *slot - amount;
        let clamped = next < -AMOUNT_EPSILON;
        *slot = if next < AMOUNT_EPSILON { 0.0 } else { next };
        (*slot, clamped)
    }

    pub fn iter(&self) -> impl Iterator<Item = (ResourceKind, f64)> + '_ {
        self.0.iter().map(|(k, v)| (*k, *v))
    }

    pub fn is_empty(&self) -> bool {
        self.0.values().all(|v| v.abs() < AMOUNT_EPSILON)
    }

    pub fn is_finite(&self) -> bool {
        self.0.values().all(|v| v.is_finite())
    }
}

impl FromIterator<(ResourceKind, f64)> for ResourceAmounts {
    fn from_iter<I: IntoIterator<Item = (ResourceKind, f64)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// A validated admission request: every amount is finite and non-negative,
/// and integral kinds carry whole numbers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "BTreeMap<String, f64>", into = "BTreeMap<String, f64>")]
pub struct ResourceRequest(ResourceAmounts);

impl ResourceRequest {
    /// Build from typed pairs. Repeated kinds are summed.
    pub fn new(items: impl IntoIterator<Item = (ResourceKind, f64)>) -> Result<Self> {
        let mut amounts = ResourceAmounts::new();
        for (kind, amount) in items {
            if !amount.is_finite() || amount < 0.0 {
                return Err(Error::InvalidAmount {
                    resource: kind.to_string(),
                    amount,
                });
            }
            if kind.is_integral() && amount.fract() != 0.0 {
                return Err(Error::InvalidAmount {
                    resource: kind.to_string(),
                    amount,
                });
            }
            amounts.add(kind, amount);
        }
        Ok(Self(amounts))
    }

    /// A single-kind request.
    pub fn one(kind: ResourceKind, amount: f64) -> Result<Self> {
        Self::new([(kind, amount)])
    }

    /// Build from string-keyed input (e.g. a decoded JSON body).
    /// Unknown resource names are an error, not a no-op.
    pub fn try_from_named<'a>(items: impl IntoIterator<Item = (&'a str, f64)>) -> Result<Self> {
        let typed = items
            .into_iter()
            .map(|(name, amount)| Ok((name.parse::<ResourceKind>()?, amount)))
            .collect::<Result<Vec<_>>>()?;
        Self::new(typed)
    }

    pub fn amounts(&self) -> &ResourceAmounts {
        &self.0
    }

    pub fn get(&self, kind: ResourceKind) -> f64 {
        self.0.get(kind)
    }

    pub fn iter(&self) -> impl Iterator<Item = (ResourceKind, f64)> + '_ {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl TryFrom<BTreeMap<String, f64>> for ResourceRequest {
    type Error = Error;

    fn try_from(map: BTreeMap<String, f64>) -> Result<Self> {
        Self::try_from_named(map.iter().map(|(k, v)| (k.as_str(), *v)))
    }
}

impl From<ResourceRequest> for BTreeMap<String, f64> {
    fn from(req: ResourceRequest) -> Self {
        req.iter().map(|(k, v)| (k.to_string(), v)).collect()
    }
}

/// One resource that a request would push over its limit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    pub resource: ResourceKind,
    pub requested: f64,
    pub current: f64,
    pub limit: f64,
}

impl Violation {
    pub fn projected(&self) -> f64 {
        self.current + self.requested
    }

    /// Headroom left before the request, never negative.
    pub fn available(&self) -> f64 {
        (self.limit - self.current).max(0.0)
    }

    /// Compare `current + requested` against `limit` for every kind in the request.
    pub fn collect(
        usage: &ResourceAmounts,
        request: &ResourceRequest,
        limit_of: impl Fn(ResourceKind) -> f64,
    ) -> Vec<Violation> {
        request
            .iter()
            .filter_map(|(resource, requested)| {
                let current = usage.get(resource);
                let limit = limit_of(resource);
                (current + requested > limit + AMOUNT_EPSILON).then_some(Violation {
                    resource,
                    requested,
                    current,
                    limit,
                })
            })
            .collect()
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} quota exceeded: {} > {}",
            self.resource.label(),
            self.resource.format_amount(self.projected()),
            self.resource.format_amount(self.limit)
        )
    }
}
