//! Strongly-typed identifiers used across the governor.
//!
//! Downstream crates should *not* pass raw strings around for tenants, users
//! or connections; mixing a user id into a tenant slot is exactly the kind of
//! bookkeeping bug that leaks capacity.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::ResourceKind;

macro_rules! new_id {
    ($name:ident) => {
        #[derive(
            Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Ord, PartialOrd,
        )]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(v: impl Into<String>) -> Self {
                Self(v.into())
            }
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(v: &str) -> Self {
                Self(v.to_string())
            }
        }

        impl From<String> for $name {
            fn from(v: String) -> Self {
                Self(v)
            }
        }
    };
}

new_id!(TenantId);
new_id!(UserId);
new_id!(ConnectionId);
new_id!(ThreadId);

/// Identity of a tenant allocation lease. Generated by the governor, never by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Ord, PartialOrd)]
#[serde(transparent)]
pub struct LeaseId(uuid::Uuid);

impl LeaseId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4())
    }
    pub const fn get(self) -> uuid::Uuid {
        self.0
    }
}

impl fmt::Display for LeaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lease-{}", self.0)
    }
}

/// The holder of a ledger account. The ledger shards its locks by owner.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Ord, PartialOrd)]
#[serde(tag = "scope", content = "id", rename_all = "snake_case")]
pub enum Owner {
    Tenant(TenantId),
    User(UserId),
}

impl Owner {
    pub fn tenant(id: impl Into<TenantId>) -> Self {
        Owner::Tenant(id.into())
    }

    pub fn user(id: impl Into<UserId>) -> Self {
        Owner::User(id.into())
    }

    /// The tenant id, if this owner is a tenant.
    pub fn as_tenant(&self) -> Option<&TenantId> {
        match self {
            Owner::Tenant(t) => Some(t),
            Owner::User(_) => None,
        }
    }
}

impl fmt::Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Owner::Tenant(t) => write!(f, "tenant:{t}"),
            Owner::User(u) => write!(f, "user:{u}"),
        }
    }
}

/// (owner, resource) pair naming one bounded counter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceKey {
    pub owner: Owner,
    pub resource: ResourceKind,
}

impl ResourceKey {
    pub fn new(owner: Owner, resource: ResourceKind) -> Self {
        Self { owner, resource }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.resource)
    }
}
