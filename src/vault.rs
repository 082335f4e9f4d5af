//! Encrypted file vault for the provider credential.
//!
//! The credential is stored as a ChaCha20-Poly1305-sealed JSON envelope. The
//! encryption key is derived from the operator secret and never written
//! anywhere; replacement goes through a temp file and an atomic rename.

use std::fs;
use std::path::PathBuf;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Key, Nonce,
};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use bankfeed_core::{AccessCredential, CredentialVault, VaultError};

const CURRENT_VERSION: u32 = 1;
const NONCE_LEN: usize = 12;

pub struct FileVault {
    path: PathBuf,
    key: [u8; 32],
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    version: u32,
    nonce: String,
    ciphertext: String,
}

impl FileVault {
    pub fn new(path: impl Into<PathBuf>, operator_secret: &str) -> Self {
        Self {
            path: path.into(),
            key: derive_key(operator_secret),
        }
    }
}

fn derive_key(secret: &str) -> [u8; 32] {
    let digest = Sha256::digest(secret.as_bytes());
    let mut key = [0u8; 32];
    key.copy_from_slice(&digest);
    key
}

impl CredentialVault for FileVault {
    fn store(&self, credential: &AccessCredential) -> Result<(), VaultError> {
        let plaintext = serde_json::to_vec(credential)
            .map_err(|e| VaultError::Corrupt(e.to_string()))?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.key));
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_ref())
            .map_err(|_| VaultError::Corrupt("encryption failed".to_string()))?;

        let envelope = Envelope {
            version: CURRENT_VERSION,
            nonce: BASE64.encode(nonce_bytes),
            ciphertext: BASE64.encode(ciphertext),
        };
        let json = serde_json::to_string_pretty(&envelope)
            .map_err(|e| VaultError::Corrupt(e.to_string()))?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        // Write-to-temp-then-rename: a crash leaves either the old or the
        // new credential intact, never a partial write.
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.path)?;
        tracing::debug!(path = %self.path.display(), "credential written");
        Ok(())
    }

    fn load(&self) -> Result<AccessCredential, VaultError> {
        let raw = match fs::read(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(VaultError::NotConfigured)
            }
            Err(e) => return Err(VaultError::Io(e)),
        };

        let envelope: Envelope =
            serde_json::from_slice(&raw).map_err(|e| VaultError::Corrupt(e.to_string()))?;
        let nonce_bytes = BASE64
            .decode(envelope.nonce)
            .map_err(|e| VaultError::Corrupt(format!("bad nonce: {e}")))?;
        if nonce_bytes.len() != NONCE_LEN {
            return Err(VaultError::Corrupt("bad nonce length".to_string()));
        }
        let cipher_bytes = BASE64
            .decode(envelope.ciphertext)
            .map_err(|e| VaultError::Corrupt(format!("bad ciphertext: {e}")))?;

        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.key));
        let nonce = Nonce::from_slice(&nonce_bytes);
        // AEAD failure means the key does not match this envelope: locked,
        // not corrupt.
        let plaintext = cipher
            .decrypt(nonce, cipher_bytes.as_ref())
            .map_err(|_| VaultError::Locked)?;

        serde_json::from_slice(&plaintext).map_err(|e| VaultError::Corrupt(e.to_string()))
    }

    fn rotate(&self, new: &AccessCredential) -> Result<(), VaultError> {
        self.store(new)
    }
}
