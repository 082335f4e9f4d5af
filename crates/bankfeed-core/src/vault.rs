use crate::error::VaultError;
use crate::models::AccessCredential;

/// Holds the provider credential across process restarts, encrypted at rest.
/// No implementation of this trait performs network access.
pub trait CredentialVault: Send + Sync {
    /// Persist the credential, replacing any existing one.
    fn store(&self, credential: &AccessCredential) -> Result<(), VaultError>;

    /// The stored credential, `VaultError::NotConfigured` when none exists,
    /// `VaultError::Locked` when one exists but cannot be decrypted.
    fn load(&self) -> Result<AccessCredential, VaultError>;

    /// Atomically replace the stored credential. A crash mid-rotation leaves
    /// either the old or the new value readable, never a torn write.
    fn rotate(&self, new: &AccessCredential) -> Result<(), VaultError>;
}
