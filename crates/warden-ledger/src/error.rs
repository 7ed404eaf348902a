use thiserror::Error;

use warden_core::id::Owner;

/// Result type local to warden-ledger.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("ledger account for '{owner}' is quarantined")]
    Quarantined { owner: Owner },

    #[error("ledger lock for '{owner}' was poisoned by a panic inside a critical section")]
    Poisoned { owner: Owner },

    #[error("non-finite counter for '{owner}' after update")]
    NonFinite { owner: Owner },
}

impl Error {
    pub fn owner(&self) -> &Owner {
        match self {
            Error::Quarantined { owner }
            | Error::Poisoned { owner }
            | Error::NonFinite { owner } => owner,
        }
    }
}

/// Every ledger failure is a bookkeeping bug, never a user condition.
impl From<Error> for warden_core::Error {
    fn from(e: Error) -> Self {
        warden_core::Error::InternalConsistency {
            key: e.owner().to_string(),
            detail: e.to_string(),
        }
    }
}
