use thiserror::Error;

use crate::models::{TimeWindow, Transaction};

/// Credential vault failures. `NotConfigured` and `Locked` are distinct so
/// callers can tell "never set up" from "set up but undecryptable".
#[derive(Debug, Error)]
pub enum VaultError {
    #[error("no credential stored; run setup first")]
    NotConfigured,
    #[error("stored credential cannot be decrypted with the configured secret")]
    Locked,
    #[error("vault file is corrupt: {0}")]
    Corrupt(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum ProviderError {
    /// The provider rejected the setup token or the stored credential.
    /// Never retried; the remedy is re-running setup.
    #[error("credential rejected by provider: {0}")]
    InvalidToken(String),
    /// The provider rejected the request itself. Never retried.
    #[error("provider rejected the request: {0}")]
    InvalidRequest(String),
    /// Transient network or server failure. Retryable with backoff.
    #[error("provider unavailable: {0}")]
    Unavailable(String),
    /// Some sub-windows of a ranged fetch succeeded before one failed.
    /// Carries everything retrieved so the caller can commit it and retry
    /// only the gap.
    #[error("fetch incomplete, {unfetched} not retrieved")]
    Partial {
        fetched: Vec<Transaction>,
        unfetched: TimeWindow,
    },
}

impl ProviderError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProviderError::Unavailable(_))
    }
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("account not found: {0}")]
    AccountNotFound(String),
    #[error("{0}")]
    Backend(String),
}

/// Root error type for the bankfeed crates.
#[derive(Debug, Error)]
pub enum Error {
    #[error("vault: {0}")]
    Vault(#[from] VaultError),
    #[error("provider: {0}")]
    Provider(#[from] ProviderError),
    #[error("storage: {0}")]
    Storage(#[from] StorageError),
    #[error("configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;
