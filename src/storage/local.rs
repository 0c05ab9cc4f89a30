//! ALFA Data Vault - Local Filesystem Backend
//!
//! Atomic writes and overwrite-before-delete on the real filesystem.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;

use super::{validate_path, DirEntry, FileMeta, StorageBackend};
use crate::error::{VaultError, VaultResult};

/// Largest zero buffer used when overwriting a file before removal
const WIPE_CHUNK: usize = 1024 * 1024;

/// Local filesystem storage rooted at the vault data directory
pub struct LocalFs {
    /// Root directory
    root: PathBuf,
}

impl LocalFs {
    /// Create new LocalFs with root directory
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    /// Root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Get full path for a relative file
    fn full_path(&self, relative: &str) -> VaultResult<PathBuf> {
        validate_path(relative)?;
        let mut path = self.root.clone();
        for segment in relative.split('/').filter(|s| !s.is_empty()) {
            path.push(segment);
        }
        Ok(path)
    }
}

/// Overwrite a file with zeros, then remove it
pub async fn wipe_file(path: &Path) -> std::io::Result<()> {
    let size = match fs::metadata(path).await {
        Ok(meta) => meta.len() as usize,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };

    if size > 0 {
        if let Ok(mut file) = OpenOptions::new().write(true).open(path).await {
            let zeros = vec![0u8; size.min(WIPE_CHUNK)];
            let mut remaining = size;
            while remaining > 0 {
                let to_write = remaining.min(zeros.len());
                if file.write_all(&zeros[..to_write]).await.is_err() {
                    break;
                }
                remaining -= to_write;
            }
            let _ = file.sync_all().await;
        }
    }

    match fs::remove_file(path).await {
        Err(e) if e.kind() != ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

#[async_trait]
impl StorageBackend for LocalFs {
    async fn read(&self, path: &str) -> VaultResult<Vec<u8>> {
        let full = self.full_path(path)?;
        match fs::read(&full).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(VaultError::NotFound(path.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, path: &str, data: &[u8]) -> VaultResult<()> {
        let full = self.full_path(path)?;

        // Ensure parent directory exists
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).await?;
        }

        // Write to temp file first, then rename over the target
        let mut temp_name = full.file_name().unwrap_or_default().to_os_string();
        temp_name.push(".tmp");
        let temp_path = full.with_file_name(temp_name);

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)
            .await?;

        file.write_all(data).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&temp_path, &full).await?;

        Ok(())
    }

    async fn exists(&self, path: &str) -> VaultResult<bool> {
        let full = self.full_path(path)?;
        Ok(fs::try_exists(&full).await?)
    }

    async fn mkdir(&self, path: &str) -> VaultResult<()> {
        let full = self.full_path(path)?;
        fs::create_dir_all(&full).await?;
        Ok(())
    }

    async fn remove(&self, path: &str) -> VaultResult<()> {
        let full = self.full_path(path)?;
        wipe_file(&full).await?;
        Ok(())
    }

    async fn list(&self, path: &str) -> VaultResult<Vec<DirEntry>> {
        let full = self.full_path(path)?;
        let mut entries = match fs::read_dir(&full).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut out = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                let is_dir = entry.file_type().await?.is_dir();
                out.push(DirEntry {
                    name: name.to_string(),
                    is_dir,
                });
            }
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));

        Ok(out)
    }

    async fn metadata(&self, path: &str) -> VaultResult<Option<FileMeta>> {
        let full = self.full_path(path)?;
        match fs::metadata(&full).await {
            Ok(meta) => Ok(Some(FileMeta {
                size: meta.len(),
                modified: meta.modified().ok().map(DateTime::<Utc>::from),
            })),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
