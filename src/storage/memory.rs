//! In-memory storage backend
//!
//! Not persistent. Used for ephemeral sessions and unit tests.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use super::{validate_path, DirEntry, FileMeta, StorageBackend};
use crate::error::{VaultError, VaultResult};

struct MemFile {
    data: Vec<u8>,
    modified: DateTime<Utc>,
}

#[derive(Default)]
struct MemState {
    files: BTreeMap<String, MemFile>,
    dirs: BTreeSet<String>,
}

/// In-memory storage
#[derive(Default)]
pub struct MemoryBackend {
    state: RwLock<MemState>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored files
    pub fn len(&self) -> usize {
        self.state.read().files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn normalize(path: &str) -> VaultResult<String> {
    validate_path(path)?;
    Ok(path
        .split(&['/', '\\'][..])
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("/"))
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn read(&self, path: &str) -> VaultResult<Vec<u8>> {
        let key = normalize(path)?;
        self.state
            .read()
            .files
            .get(&key)
            .map(|f| f.data.clone())
            .ok_or_else(|| VaultError::NotFound(path.to_string()))
    }

    async fn write(&self, path: &str, data: &[u8]) -> VaultResult<()> {
        let key = normalize(path)?;
        let mut state = self.state.write();

        // Register parent directories
        let mut parent = String::new();
        let segments: Vec<&str> = key.split('/').collect();
        for segment in &segments[..segments.len().saturating_sub(1)] {
            parent = super::join(&parent, segment);
            state.dirs.insert(parent.clone());
        }

        state.files.insert(
            key,
            MemFile {
                data: data.to_vec(),
                modified: Utc::now(),
            },
        );
        Ok(())
    }

    async fn exists(&self, path: &str) -> VaultResult<bool> {
        let key = normalize(path)?;
        let state = self.state.read();
        Ok(key.is_empty() || state.files.contains_key(&key) || state.dirs.contains(&key))
    }

    async fn mkdir(&self, path: &str) -> VaultResult<()> {
        let key = normalize(path)?;
        let mut state = self.state.write();
        let mut current = String::new();
        for segment in key.split('/').filter(|s| !s.is_empty()) {
            current = super::join(&current, segment);
            state.dirs.insert(current.clone());
        }
        Ok(())
    }

    async fn remove(&self, path: &str) -> VaultResult<()> {
        let key = normalize(path)?;
        self.state.write().files.remove(&key);
        Ok(())
    }

    async fn list(&self, path: &str) -> VaultResult<Vec<DirEntry>> {
        let key = normalize(path)?;
        let prefix = if key.is_empty() { String::new() } else { format!("{}/", key) };
        let state = self.state.read();

        let mut entries: BTreeMap<String, bool> = BTreeMap::new();
        let names = state
            .files
            .keys()
            .map(|k| (k, false))
            .chain(state.dirs.iter().map(|d| (d, true)));

        for (full, is_dir) in names {
            if let Some(rest) = full.strip_prefix(&prefix) {
                if rest.is_empty() {
                    continue;
                }
                match rest.split_once('/') {
                    Some((child, _)) => {
                        entries.insert(child.to_string(), true);
                    }
                    None => {
                        let entry = entries.entry(rest.to_string()).or_insert(is_dir);
                        *entry |= is_dir;
                    }
                }
            }
        }

        Ok(entries
            .into_iter()
            .map(|(name, is_dir)| DirEntry { name, is_dir })
            .collect())
    }

    async fn metadata(&self, path: &str) -> VaultResult<Option<FileMeta>> {
        let key = normalize(path)?;
        Ok(self.state.read().files.get(&key).map(|f| FileMeta {
            size: f.data.len() as u64,
            modified: Some(f.modified),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_roundtrip() {
        let storage = MemoryBackend::new();

        storage.write("documents/pets/a.encrypted", b"abc").await.unwrap();
        assert_eq!(storage.read("documents/pets/a.encrypted").await.unwrap(), b"abc");
        assert!(storage.exists("documents/pets").await.unwrap());
        assert_eq!(storage.len(), 1);

        storage.remove("documents/pets/a.encrypted").await.unwrap();
        assert!(storage.is_empty());
        assert!(matches!(
            storage.read("documents/pets/a.encrypted").await,
            Err(VaultError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_memory_list() {
        let storage = MemoryBackend::new();
        storage.write("pets.encrypted.json", b"1").await.unwrap();
        storage.write("documents/pets/a.encrypted", b"2").await.unwrap();
        storage.mkdir("documents/vet").await.unwrap();

        let root = storage.list("").await.unwrap();
        assert_eq!(
            root,
            vec![
                DirEntry { name: "documents".into(), is_dir: true },
                DirEntry { name: "pets.encrypted.json".into(), is_dir: false },
            ]
        );

        let docs = storage.list("documents").await.unwrap();
        let names: Vec<_> = docs.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["pets", "vet"]);
        assert!(docs.iter().all(|e| e.is_dir));
    }
}
