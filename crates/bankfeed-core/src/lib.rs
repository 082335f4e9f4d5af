//! Core types and traits for bankfeed providers and storage backends.
//!
//! This crate defines the ledger data model plus the `Provider`,
//! `LedgerStore` and `CredentialVault` seams, enabling pluggable
//! implementations in separate crates.

pub mod error;
pub mod models;
pub mod provider;
pub mod storage;
pub mod vault;

// Re-export key types at crate root for convenience
pub use error::{Error, ProviderError, Result, StorageError, VaultError};
pub use models::{AccessCredential, Account, TimeWindow, Transaction};
pub use provider::Provider;
pub use storage::LedgerStore;
pub use vault::CredentialVault;
