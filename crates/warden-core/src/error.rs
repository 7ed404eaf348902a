use thiserror::Error;

use crate::types::Violation;

/// Canonical result for the governor.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Recoverable: the caller should back off or surface the message.
    #[error("{key}: {}", join_violations(.violations))]
    QuotaExceeded {
        key: String,
        violations: Vec<Violation>,
    },

    /// Recoverable: the tenant is blocked until an administrator unblocks it.
    #[error("tenant '{tenant}' is blocked: {}", join_reasons(.reasons))]
    TenantBlocked { tenant: String, reasons: Vec<String> },

    #[error("{what} '{id}' not found")]
    NotFound { what: &'static str, id: String },

    #[error("{what} '{id}' is already registered")]
    AlreadyRegistered { what: &'static str, id: String },

    #[error("unknown resource type '{0}'")]
    UnknownResource(String),

    #[error("invalid amount {amount} for resource '{resource}'")]
    InvalidAmount { resource: String, amount: f64 },

    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Fatal: ledger bookkeeping is broken for `key`. The key is quarantined.
    #[error("internal consistency violation on '{key}': {detail}")]
    InternalConsistency { key: String, detail: String },
}

impl Error {
    /// Expected outcomes a caller can recover from by backing off.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::QuotaExceeded { .. } | Error::TenantBlocked { .. })
    }

    pub fn violations(&self) -> &[Violation] {
        match self {
            Error::QuotaExceeded { violations, .. } => violations,
            _ => &[],
        }
    }
}

fn join_violations(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

fn join_reasons(reasons: &[String]) -> String {
    if reasons.is_empty() {
        "no reason recorded".to_string()
    } else {
        reasons.join("; ")
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Config(e.to_string())
    }
}
