//! ALFA Data Vault - Master Key Management
//!
//! A random data encryption key (DEK) encrypts everything; the password only
//! ever encrypts the DEK. The wrapped DEK lives in a single file at the vault
//! root:
//!
//! ```text
//! master.key = base64( salt(16) || iv(12) || AES-GCM(DEK) || tag(16) )
//! ```
//!
//! Changing the password rewrites that one file and nothing else.

use std::sync::Arc;

use crate::config::KdfConfig;
use crate::crypto::{decrypt, encrypt, CipherKey, EncryptedBlob, MasterKey, KEY_LEN};
use crate::error::{VaultError, VaultResult};
use crate::storage::StorageBackend;

/// Well-known location of the wrapped key, relative to the vault root
pub const WRAPPED_KEY_FILE: &str = "master.key";

/// The DEK encrypted under a password-derived key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrappedMasterKey(EncryptedBlob);

impl WrappedMasterKey {
    /// Parse stored text
    pub fn from_text(text: &str) -> Self {
        Self(EncryptedBlob::from_text(text))
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

/// How the session obtained its key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bootstrap {
    /// No wrapped key existed; a new DEK was generated and persisted
    FirstRun,
    /// An existing wrapped key was opened
    Unlocked,
}

/// Generate a fresh DEK
pub fn generate_master_key() -> MasterKey {
    MasterKey::generate()
}

/// Encrypt the raw DEK bytes under a key derived from `password`
pub fn wrap(dek: &MasterKey, password: &str, iterations: u32) -> VaultResult<WrappedMasterKey> {
    let blob = encrypt(dek.expose(), CipherKey::Password { password, iterations })?;
    Ok(WrappedMasterKey(blob))
}

/// Recover the DEK. Any authentication failure means a wrong password.
pub fn unwrap(wrapped: &WrappedMasterKey, password: &str, iterations: u32) -> VaultResult<MasterKey> {
    let raw = decrypt(&wrapped.0, CipherKey::Password { password, iterations })?;
    if raw.len() != KEY_LEN {
        return Err(VaultError::Format(format!(
            "wrapped key holds {} bytes, expected {}",
            raw.len(),
            KEY_LEN
        )));
    }
    MasterKey::from_slice(&raw)
}

/// Owns the wrapped-key file
pub struct MasterKeyManager {
    backend: Arc<dyn StorageBackend>,
    iterations: u32,
}

impl MasterKeyManager {
    pub fn new(backend: Arc<dyn StorageBackend>, kdf: &KdfConfig) -> Self {
        Self {
            backend,
            iterations: kdf.kek_iterations,
        }
    }

    /// Check if a wrapped key has been persisted
    pub async fn exists(&self) -> VaultResult<bool> {
        self.backend.exists(WRAPPED_KEY_FILE).await
    }

    /// Read the wrapped key file
    pub async fn read_wrapped(&self) -> VaultResult<WrappedMasterKey> {
        let text = self.backend.read_to_string(WRAPPED_KEY_FILE).await?;
        Ok(WrappedMasterKey::from_text(&text))
    }

    async fn write_wrapped(&self, wrapped: &WrappedMasterKey) -> VaultResult<()> {
        self.backend.write(WRAPPED_KEY_FILE, wrapped.as_str().as_bytes()).await
    }

    /// Open the DEK, creating it on first run
    pub async fn bootstrap(&self, password: &str) -> VaultResult<(MasterKey, Bootstrap)> {
        if self.exists().await? {
            let dek = self.unlock(password).await?;
            return Ok((dek, Bootstrap::Unlocked));
        }

        log::info!("No wrapped master key found, generating a new one");
        let dek = generate_master_key();
        let wrapped = wrap(&dek, password, self.iterations)?;
        self.write_wrapped(&wrapped).await?;

        Ok((dek, Bootstrap::FirstRun))
    }

    /// Unwrap the persisted DEK
    pub async fn unlock(&self, password: &str) -> VaultResult<MasterKey> {
        let wrapped = self.read_wrapped().await?;
        unwrap(&wrapped, password, self.iterations)
    }

    /// Re-wrap the same DEK under a new password.
    ///
    /// The old password is checked by unwrapping before anything is written;
    /// a wrong old password leaves the file untouched.
    pub async fn change_password(&self, old_password: &str, new_password: &str) -> VaultResult<()> {
        let dek = self.unlock(old_password).await?;
        let rewrapped = wrap(&dek, new_password, self.iterations)?;
        self.write_wrapped(&rewrapped).await?;

        log::info!("Master key re-wrapped under new password");
        Ok(())
    }
}
