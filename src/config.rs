//! ALFA Data Vault - Configuration
//!
//! Loaded once at startup from a JSON file; every field has a default so a
//! missing file or a partial file is valid.

use std::path::{Path, PathBuf};
use serde::{Deserialize, Serialize};

use crate::error::{VaultError, VaultResult};
use crate::thumbs::DEFAULT_MAX_EDGE;

/// Minimum PBKDF2 cost accepted for the key-encryption key without a warning.
pub const MIN_KEK_ITERATIONS: u32 = 100_000;

/// Which storage backend the session should use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Files under `data_dir`
    Local,
    /// Process memory only
    Memory,
}

/// PBKDF2-HMAC-SHA256 cost parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KdfConfig {
    /// Iterations for the key that wraps the master key (once per unlock).
    ///
    /// The wrapped key file does not record this count, so it is fixed for the
    /// life of an installation. Changing it makes every unlock fail as if the
    /// password were wrong.
    pub kek_iterations: u32,
    /// Iterations for legacy password-direct data encryption
    pub legacy_iterations: u32,
}

impl Default for KdfConfig {
    fn default() -> Self {
        Self {
            kek_iterations: MIN_KEK_ITERATIONS,
            legacy_iterations: 10_000,
        }
    }
}

/// Vault configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    /// Root of the on-disk layout
    pub data_dir: PathBuf,
    /// Storage backend
    pub backend: BackendKind,
    /// Key derivation cost
    pub kdf: KdfConfig,
    /// Longest thumbnail edge in pixels, at most 200
    pub thumbnail_max_edge: u32,
    /// Failed unlocks before lockdown
    pub max_unlock_attempts: u8,
    /// Where decrypted copies for the OS viewer are written
    pub external_view_dir: Option<PathBuf>,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./alfa_data"),
            backend: BackendKind::Local,
            kdf: KdfConfig::default(),
            thumbnail_max_edge: DEFAULT_MAX_EDGE,
            max_unlock_attempts: 3,
            external_view_dir: None,
        }
    }
}

impl VaultConfig {
    /// Default configuration rooted at `data_dir`
    pub fn with_data_dir<P: AsRef<Path>>(data_dir: P) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
            ..Default::default()
        }
    }

    /// Load configuration from a JSON file, falling back to defaults if absent
    pub fn load<P: AsRef<Path>>(path: P) -> VaultResult<Self> {
        let path = path.as_ref();

        if !path.exists() {
            log::debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let data = std::fs::read(path)?;
        let config: VaultConfig = serde_json::from_slice(&data)
            .map_err(|e| VaultError::InvalidConfig(format!("{}: {}", path.display(), e)))?;
        config.validate()?;

        Ok(config)
    }

    /// Reject values that would make the vault unusable
    pub fn validate(&self) -> VaultResult<()> {
        if self.kdf.kek_iterations == 0 || self.kdf.legacy_iterations == 0 {
            return Err(VaultError::InvalidConfig("iteration counts must be positive".into()));
        }
        if self.max_unlock_attempts == 0 {
            return Err(VaultError::InvalidConfig("max_unlock_attempts must be positive".into()));
        }
        if self.thumbnail_max_edge == 0 || self.thumbnail_max_edge > DEFAULT_MAX_EDGE {
            return Err(VaultError::InvalidConfig(format!(
                "thumbnail_max_edge must be between 1 and {}",
                DEFAULT_MAX_EDGE
            )));
        }
        if self.kdf.kek_iterations < MIN_KEK_ITERATIONS {
            log::warn!(
                "KEK iterations {} below recommended minimum {}",
                self.kdf.kek_iterations,
                MIN_KEK_ITERATIONS
            );
        }
        Ok(())
    }

    /// Directory for decrypted viewer copies
    pub fn view_dir(&self) -> PathBuf {
        self.external_view_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("alfa_data_vault_view"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempdir().unwrap();
        let config = VaultConfig::load(dir.path().join("absent.json")).unwrap();

        assert_eq!(config.kdf.kek_iterations, MIN_KEK_ITERATIONS);
        assert_eq!(config.thumbnail_max_edge, 200);
        assert_eq!(config.backend, BackendKind::Local);
    }

    #[test]
    fn test_partial_file_merges_with_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"backend":"memory","kdf":{"kek_iterations":200000}}"#).unwrap();

        let config = VaultConfig::load(&path).unwrap();
        assert_eq!(config.backend, BackendKind::Memory);
        assert_eq!(config.kdf.kek_iterations, 200_000);
        assert_eq!(config.kdf.legacy_iterations, 10_000);
        assert_eq!(config.max_unlock_attempts, 3);
    }

    #[test]
    fn test_zero_attempts_rejected() {
        let config = VaultConfig {
            max_unlock_attempts: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(VaultError::InvalidConfig(_))));
    }

    #[test]
    fn test_thumbnail_edge_bounded() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"thumbnail_max_edge":1024}"#).unwrap();
        assert!(matches!(VaultConfig::load(&path), Err(VaultError::InvalidConfig(_))));

        let small = VaultConfig {
            thumbnail_max_edge: 64,
            ..Default::default()
        };
        small.validate().unwrap();
        let zero = VaultConfig {
            thumbnail_max_edge: 0,
            ..Default::default()
        };
        assert!(zero.validate().is_err());
    }
}
