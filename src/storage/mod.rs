//! ALFA Data Vault - Storage Backends
//!
//! Everything above this module talks to a [`StorageBackend`] with paths
//! relative to the vault root, `/`-separated. The concrete backend is picked
//! once per session by [`open_backend`].

pub mod local;
pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::config::{BackendKind, VaultConfig};
use crate::error::{VaultError, VaultResult};

pub use local::LocalFs;
pub use memory::MemoryBackend;

/// One directory entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub is_dir: bool,
}

/// File size and modification time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMeta {
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
}

/// Capability interface over the vault's on-disk layout
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Read a whole file. Absent files are `NotFound`.
    async fn read(&self, path: &str) -> VaultResult<Vec<u8>>;

    /// Replace a file's contents atomically, creating parent directories.
    async fn write(&self, path: &str, data: &[u8]) -> VaultResult<()>;

    /// Check if a file or directory exists
    async fn exists(&self, path: &str) -> VaultResult<bool>;

    /// Create a directory and its parents
    async fn mkdir(&self, path: &str) -> VaultResult<()>;

    /// Remove a file. Removing an absent file succeeds.
    async fn remove(&self, path: &str) -> VaultResult<()>;

    /// List a directory. A missing directory lists as empty.
    async fn list(&self, path: &str) -> VaultResult<Vec<DirEntry>>;

    /// File metadata, `None` when the file does not exist
    async fn metadata(&self, path: &str) -> VaultResult<Option<FileMeta>>;

    /// Read a file as UTF-8 text
    async fn read_to_string(&self, path: &str) -> VaultResult<String> {
        let data = self.read(path).await?;
        String::from_utf8(data).map_err(|_| VaultError::Format(format!("{} is not UTF-8 text", path)))
    }
}

/// Build the backend selected by the configuration
pub fn open_backend(config: &VaultConfig) -> Arc<dyn StorageBackend> {
    match config.backend {
        BackendKind::Local => {
            log::debug!("Using local storage at {}", config.data_dir.display());
            Arc::new(LocalFs::new(&config.data_dir))
        }
        BackendKind::Memory => {
            log::debug!("Using in-memory storage");
            Arc::new(MemoryBackend::new())
        }
    }
}

/// Join two relative path segments
pub fn join(base: &str, name: &str) -> String {
    let base = base.trim_end_matches('/');
    if base.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", base, name)
    }
}

/// Last segment of a `/` or `\` separated path
pub fn file_name(path: &str) -> &str {
    path.rsplit(is_separator).next().unwrap_or(path)
}

fn is_separator(c: char) -> bool {
    c == '/' || c == '\\'
}

/// Reject paths that could escape the vault root
pub fn validate_path(path: &str) -> VaultResult<()> {
    if path.starts_with('/') || path.starts_with('\\') || path.contains(':') {
        return Err(VaultError::InvalidPath(path.to_string()));
    }
    if path.split(is_separator).any(|seg| seg == "..") {
        return Err(VaultError::InvalidPath(path.to_string()));
    }
    Ok(())
}
