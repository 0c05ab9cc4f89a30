//! ALFA Data Vault - Error Types

use thiserror::Error;

/// Result type for vault operations
pub type VaultResult<T> = Result<T, VaultError>;

/// Vault error types
#[derive(Error, Debug)]
pub enum VaultError {
    // ═══════════════════════════════════════════════════════════════
    // CRYPTO ERRORS
    // ═══════════════════════════════════════════════════════════════

    /// Malformed base64 or a buffer too short to hold salt, IV and tag.
    #[error("Malformed encrypted data: {0}")]
    Format(String),

    /// Wrong key, wrong password or tampered ciphertext. The cases cannot
    /// be told apart.
    #[error("Authentication failed - wrong password or corrupted data")]
    Authentication,

    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("Key derivation failed: {0}")]
    KeyDerivationFailed(String),

    // ═══════════════════════════════════════════════════════════════
    // VAULT ERRORS
    // ═══════════════════════════════════════════════════════════════

    #[error("Vault is locked")]
    VaultLocked,

    #[error("Too many failed attempts - vault locked")]
    TooManyAttempts,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ═══════════════════════════════════════════════════════════════
    // FILE ERRORS
    // ═══════════════════════════════════════════════════════════════

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Invalid data URL: {0}")]
    InvalidDataUrl(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // ═══════════════════════════════════════════════════════════════
    // SCHEMA / BACKUP ERRORS
    // ═══════════════════════════════════════════════════════════════

    #[error("Migration of '{collection}' to v{version} failed: {reason}")]
    Migration {
        collection: String,
        version: u32,
        reason: String,
    },

    #[error("Collection '{collection}' is stored at schema v{stored_version}, this build writes up to v{supported_version}")]
    NewerSchema {
        collection: String,
        stored_version: u32,
        supported_version: u32,
    },

    #[error("Backup of '{collection}' uses schema v{backup_version}, this build supports up to v{supported_version}")]
    IncompatibleBackup {
        collection: String,
        backup_version: u32,
        supported_version: u32,
    },

    #[error("Invalid backup archive: {0}")]
    InvalidBackup(String),

    // ═══════════════════════════════════════════════════════════════
    // THUMBNAIL ERRORS
    // ═══════════════════════════════════════════════════════════════

    #[error("Thumbnail generation failed: {0}")]
    ThumbnailFailed(String),

    #[error("Image processing error: {0}")]
    ImageError(String),

    // ═══════════════════════════════════════════════════════════════
    // SERIALIZATION ERRORS
    // ═══════════════════════════════════════════════════════════════

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl VaultError {
    /// Check if this is a security-critical error
    pub fn is_security_critical(&self) -> bool {
        matches!(
            self,
            VaultError::Authentication | VaultError::TooManyAttempts
        )
    }

    /// Check if vault should lock after this error
    pub fn requires_lockdown(&self) -> bool {
        matches!(self, VaultError::TooManyAttempts)
    }

    /// Check if this error is recoverable by regenerating derived data
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            VaultError::ThumbnailFailed(_) | VaultError::ImageError(_)
        )
    }
}

impl From<serde_json::Error> for VaultError {
    fn from(e: serde_json::Error) -> Self {
        VaultError::SerializationError(e.to_string())
    }
}

impl From<image::ImageError> for VaultError {
    fn from(e: image::ImageError) -> Self {
        VaultError::ImageError(e.to_string())
    }
}

impl From<base64::DecodeError> for VaultError {
    fn from(e: base64::DecodeError) -> Self {
        VaultError::Format(e.to_string())
    }
}
