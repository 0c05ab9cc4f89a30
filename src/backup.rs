//! ALFA Data Vault - Backup, Reconciliation and Restore
//!
//! A backup copies the already-encrypted files verbatim; nothing is
//! decrypted. The archive is one JSON document:
//!
//! ```text
//! {
//!   "format": "alfa-data-vault-backup",
//!   "formatVersion": 1,
//!   "createdAt": "...",
//!   "appVersion": "...",
//!   "schemaVersions": { "<collection>": n },
//!   "manifest": { "dataFiles": [...], "documentFiles": [...], "includesMasterKey": true },
//!   "files": { "<relative path>": "<base64 of file bytes>" }
//! }
//! ```
//!
//! Managed files are `master.key`, every `*.encrypted.json` at the root and
//! every `*.encrypted` file under `documents/<category>/`.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::crypto::EncryptedBlob;
use crate::documents::{DOCUMENTS_DIR, DOCUMENT_SUFFIX};
use crate::error::{VaultError, VaultResult};
use crate::master_key::WRAPPED_KEY_FILE;
use crate::migration::LEGACY_VERSION;
use crate::records::{RecordStore, COLLECTION_SUFFIX};
use crate::storage::{self, validate_path, StorageBackend};

/// Archive format tag
pub const ARCHIVE_FORMAT: &str = "alfa-data-vault-backup";

/// Highest archive layout this build reads
pub const ARCHIVE_FORMAT_VERSION: u32 = 1;

/// One file in the manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestEntry {
    pub path: String,
    pub size: u64,
    /// Hex SHA-256 of the file bytes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

/// What a backup contains
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupManifest {
    pub data_files: Vec<ManifestEntry>,
    pub document_files: Vec<ManifestEntry>,
    pub includes_master_key: bool,
}

impl BackupManifest {
    /// Every entry, data files first
    pub fn entries(&self) -> impl Iterator<Item = &ManifestEntry> {
        self.data_files.iter().chain(self.document_files.iter())
    }

    pub fn find(&self, path: &str) -> Option<&ManifestEntry> {
        self.entries().find(|e| e.path == path)
    }

    pub fn len(&self) -> usize {
        self.data_files.len() + self.document_files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BackupArchive {
    format: String,
    format_version: u32,
    created_at: DateTime<Utc>,
    app_version: String,
    #[serde(default)]
    schema_versions: BTreeMap<String, u32>,
    manifest: BackupManifest,
    files: BTreeMap<String, String>,
}

/// How a backed-up file compares with the live tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReconcileStatus {
    /// In the backup, absent on disk
    New,
    /// Identical on both sides
    Same,
    /// Present on both sides with different content
    Conflict,
    /// On disk, absent from the backup
    Orphan,
}

/// Per-file comparison result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciliationEntry {
    pub path: String,
    pub size_in_backup: Option<u64>,
    pub size_on_disk: Option<u64>,
    pub modified_on_disk: Option<DateTime<Utc>>,
    pub status: ReconcileStatus,
}

/// A collection whose backed-up schema is newer than this build
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncompatibleCollection {
    pub collection: String,
    pub backup_version: u32,
    pub supported_version: u32,
}

/// Advisory diff of a backup against disk
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciliationReport {
    pub created_at: Option<DateTime<Utc>>,
    pub entries: Vec<ReconciliationEntry>,
    pub incompatible: Vec<IncompatibleCollection>,
}

impl ReconciliationReport {
    pub fn count(&self, status: ReconcileStatus) -> usize {
        self.entries.iter().filter(|e| e.status == status).count()
    }

    /// Entries with the given status
    pub fn with_status(&self, status: ReconcileStatus) -> impl Iterator<Item = &ReconciliationEntry> {
        self.entries.iter().filter(move |e| e.status == status)
    }

    /// Check if the backup can be restored by this build
    pub fn is_compatible(&self) -> bool {
        self.incompatible.is_empty()
    }
}

/// A file that could not be restored
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreFailure {
    pub path: String,
    pub reason: String,
}

/// Outcome of a restore, one line per requested file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RestoreReport {
    pub restored: Vec<String>,
    pub failed: Vec<RestoreFailure>,
}

impl RestoreReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Outcome of importing a legacy export
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LegacyImportReport {
    /// Collection name -> record count
    pub imported: BTreeMap<String, usize>,
    pub skipped: Vec<String>,
}

/// Backup / Reconciliation Service
pub struct BackupService {
    backend: Arc<dyn StorageBackend>,
    records: RecordStore,
}

impl BackupService {
    pub fn new(backend: Arc<dyn StorageBackend>, records: RecordStore) -> Self {
        Self { backend, records }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // CREATE
    // ═══════════════════════════════════════════════════════════════════════

    /// Copy every managed file into a new archive at `output`
    pub async fn create_backup(&self, output: &Path) -> VaultResult<BackupManifest> {
        let mut manifest = BackupManifest::default();
        let mut files = BTreeMap::new();

        for path in self.managed_files().await? {
            let data = match self.backend.read(&path).await {
                Ok(data) => data,
                Err(VaultError::NotFound(_)) => {
                    log::warn!("{} vanished during backup, skipping", path);
                    continue;
                }
                Err(e) => return Err(e),
            };

            let entry = ManifestEntry {
                path: path.clone(),
                size: data.len() as u64,
                sha256: Some(sha256_hex(&data)),
            };

            if path == WRAPPED_KEY_FILE {
                manifest.includes_master_key = true;
                manifest.data_files.push(entry);
            } else if path.starts_with(DOCUMENTS_DIR) {
                manifest.document_files.push(entry);
            } else {
                manifest.data_files.push(entry);
            }
            files.insert(path, STANDARD.encode(&data));
        }

        let archive = BackupArchive {
            format: ARCHIVE_FORMAT.to_string(),
            format_version: ARCHIVE_FORMAT_VERSION,
            created_at: Utc::now(),
            app_version: crate::VERSION.to_string(),
            schema_versions: self.schema_versions().await?,
            manifest: manifest.clone(),
            files,
        };

        write_archive(output, &archive).await?;

        log::info!(
            "Backup written to {} ({} data files, {} document files)",
            output.display(),
            manifest.data_files.len(),
            manifest.document_files.len()
        );
        Ok(manifest)
    }

    /// Schema version each collection is stored at
    async fn schema_versions(&self) -> VaultResult<BTreeMap<String, u32>> {
        let mut versions = BTreeMap::new();
        for collection in self.records.list_collections().await? {
            let version = match self.records.load_stored(&collection).await {
                Ok(Some((_, version))) => version,
                Ok(None) => continue,
                Err(e) => {
                    let target = self.records.migrations().target_version(&collection);
                    log::warn!(
                        "Cannot read schema version of '{}' ({}); recording v{}",
                        collection,
                        e,
                        target
                    );
                    target
                }
            };
            versions.insert(collection, version);
        }
        Ok(versions)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // RECONCILE
    // ═══════════════════════════════════════════════════════════════════════

    /// Classify every file in the backup, and every managed file on disk,
    /// without writing anything
    pub async fn reconcile(&self, backup: &Path) -> VaultResult<ReconciliationReport> {
        let archive = read_archive(backup).await?;
        let mut entries = Vec::with_capacity(archive.manifest.len());

        for item in archive.manifest.entries() {
            let meta = self.backend.metadata(&item.path).await?;
            let status = match &meta {
                None => ReconcileStatus::New,
                Some(meta) if meta.size != item.size => ReconcileStatus::Conflict,
                Some(_) => match &item.sha256 {
                    Some(expected) => {
                        let data = self.backend.read(&item.path).await?;
                        if sha256_hex(&data).eq_ignore_ascii_case(expected) {
                            ReconcileStatus::Same
                        } else {
                            ReconcileStatus::Conflict
                        }
                    }
                    None => ReconcileStatus::Same,
                },
            };

            entries.push(ReconciliationEntry {
                path: item.path.clone(),
                size_in_backup: Some(item.size),
                size_on_disk: meta.as_ref().map(|m| m.size),
                modified_on_disk: meta.and_then(|m| m.modified),
                status,
            });
        }

        let in_backup: BTreeSet<&str> = archive.manifest.entries().map(|e| e.path.as_str()).collect();
        for path in self.managed_files().await? {
            if in_backup.contains(path.as_str()) {
                continue;
            }
            let meta = self.backend.metadata(&path).await?;
            entries.push(ReconciliationEntry {
                size_in_backup: None,
                size_on_disk: meta.as_ref().map(|m| m.size),
                modified_on_disk: meta.and_then(|m| m.modified),
                path,
                status: ReconcileStatus::Orphan,
            });
        }

        Ok(ReconciliationReport {
            created_at: Some(archive.created_at),
            entries,
            incompatible: self.incompatible_collections(&archive),
        })
    }

    fn incompatible_collections(&self, archive: &BackupArchive) -> Vec<IncompatibleCollection> {
        let migrations = self.records.migrations();
        archive
            .schema_versions
            .iter()
            .filter_map(|(collection, &backup_version)| {
                let supported_version = migrations.target_version(collection);
                (backup_version > supported_version).then(|| IncompatibleCollection {
                    collection: collection.clone(),
                    backup_version,
                    supported_version,
                })
            })
            .collect()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // RESTORE
    // ═══════════════════════════════════════════════════════════════════════

    /// Copy files from the archive over the live tree.
    ///
    /// `selection` of `None` restores everything. A backup written with a
    /// newer schema than this build supports is refused outright; individual
    /// file failures are reported and do not stop the batch.
    pub async fn restore(&self, backup: &Path, selection: Option<&[String]>) -> VaultResult<RestoreReport> {
        let archive = read_archive(backup).await?;

        if let Some(first) = self.incompatible_collections(&archive).into_iter().next() {
            return Err(VaultError::IncompatibleBackup {
                collection: first.collection,
                backup_version: first.backup_version,
                supported_version: first.supported_version,
            });
        }

        let paths: Vec<String> = match selection {
            Some(paths) => paths.to_vec(),
            None => archive.manifest.entries().map(|e| e.path.clone()).collect(),
        };

        let mut report = RestoreReport::default();
        for path in paths {
            match self.restore_one(&archive, &path).await {
                Ok(()) => report.restored.push(path),
                Err(e) => {
                    log::warn!("Restore of {} failed: {}", path, e);
                    report.failed.push(RestoreFailure {
                        path,
                        reason: e.to_string(),
                    });
                }
            }
        }

        log::info!(
            "Restore finished: {} restored, {} failed",
            report.restored.len(),
            report.failed.len()
        );
        Ok(report)
    }

    async fn restore_one(&self, archive: &BackupArchive, path: &str) -> VaultResult<()> {
        validate_path(path)?;
        if !is_managed_path(path) {
            return Err(VaultError::InvalidPath(format!("{} is not a vault file", path)));
        }

        let entry = archive
            .manifest
            .find(path)
            .ok_or_else(|| VaultError::NotFound(format!("{} is not in the backup", path)))?;
        let encoded = archive
            .files
            .get(path)
            .ok_or_else(|| VaultError::InvalidBackup(format!("{} is listed but has no content", path)))?;

        let data = STANDARD.decode(encoded)?;
        if data.len() as u64 != entry.size {
            return Err(VaultError::InvalidBackup(format!("{} has the wrong size", path)));
        }
        if let Some(expected) = &entry.sha256 {
            if !sha256_hex(&data).eq_ignore_ascii_case(expected) {
                return Err(VaultError::InvalidBackup(format!("{} fails its checksum", path)));
            }
        }

        self.backend.write(path, &data).await
    }

    // ═══════════════════════════════════════════════════════════════════════
    // LEGACY IMPORT
    // ═══════════════════════════════════════════════════════════════════════

    /// Import an older whole-store export into per-collection files.
    ///
    /// The file is either plain JSON or one encrypted blob, tried with the
    /// DEK and then the store's legacy password. Its payload is
    /// `{"collections": {...}}`, `{"data": {...}}` or a bare map of
    /// collection name to record array. Records are treated as v1 and
    /// migrated before saving.
    pub async fn import_legacy_backup(&self, path: &Path) -> VaultResult<LegacyImportReport> {
        let text = tokio::fs::read_to_string(path).await?;
        let payload = self.decode_legacy(&text)?;

        let collections = match payload {
            Value::Object(root) => unwrap_legacy_root(root),
            _ => {
                return Err(VaultError::InvalidBackup(
                    "legacy export is not a map of collections".into(),
                ))
            }
        };

        let mut report = LegacyImportReport::default();
        for (name, value) in collections {
            let records = match value {
                Value::Array(records) => records,
                _ => {
                    log::warn!("Legacy export entry '{}' is not a record array, skipping", name);
                    report.skipped.push(name);
                    continue;
                }
            };

            let migrated = self.records.migrations().migrate(&name, records, LEGACY_VERSION)?;
            match self.records.save(&name, &migrated.records).await {
                Ok(()) => {
                    report.imported.insert(name, migrated.records.len());
                }
                Err(e @ (VaultError::InvalidPath(_) | VaultError::NewerSchema { .. })) => {
                    log::warn!("Skipping legacy collection '{}': {}", name, e);
                    report.skipped.push(name);
                }
                Err(e) => return Err(e),
            }
        }

        log::info!(
            "Imported {} legacy collections ({} skipped)",
            report.imported.len(),
            report.skipped.len()
        );
        Ok(report)
    }

    fn decode_legacy(&self, text: &str) -> VaultResult<Value> {
        let blob = match serde_json::from_str::<Value>(text) {
            Ok(Value::String(blob)) => EncryptedBlob::from_text(&blob),
            Ok(value) => return Ok(value),
            Err(_) => EncryptedBlob::from_text(text),
        };
        let plaintext = self.records.decrypt_with_fallback(&blob)?;
        Ok(serde_json::from_slice(&plaintext)?)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // HELPERS
    // ═══════════════════════════════════════════════════════════════════════

    /// Every managed file currently on disk, sorted
    pub async fn managed_files(&self) -> VaultResult<Vec<String>> {
        let mut paths = Vec::new();

        for entry in self.backend.list("").await? {
            if !entry.is_dir && is_managed_path(&entry.name) {
                paths.push(entry.name);
            }
        }

        for category in self.backend.list(DOCUMENTS_DIR).await? {
            if !category.is_dir {
                continue;
            }
            let dir = storage::join(DOCUMENTS_DIR, &category.name);
            for file in self.backend.list(&dir).await? {
                if !file.is_dir && file.name.ends_with(DOCUMENT_SUFFIX) {
                    paths.push(storage::join(&dir, &file.name));
                }
            }
        }

        paths.sort();
        Ok(paths)
    }
}

/// Find the collection map of a legacy export. A `collections` or `data` key
/// only wraps the map when its value is an object; otherwise it is a
/// collection like any other.
fn unwrap_legacy_root(mut root: Map<String, Value>) -> Map<String, Value> {
    for wrapper in ["collections", "data"] {
        if let Some(Value::Object(_)) = root.get(wrapper) {
            if let Some(Value::Object(map)) = root.remove(wrapper) {
                return map;
            }
        }
    }
    root
}

/// Check if a relative path names a file a backup may contain
pub fn is_managed_path(path: &str) -> bool {
    let segments: Vec<&str> = path.split('/').collect();
    match segments.as_slice() {
        [name] => *name == WRAPPED_KEY_FILE || (name.ends_with(COLLECTION_SUFFIX) && name.len() > COLLECTION_SUFFIX.len()),
        [root, category, name] => {
            *root == DOCUMENTS_DIR
                && !category.is_empty()
                && *category != ".."
                && name.ends_with(DOCUMENT_SUFFIX)
                && name.len() > DOCUMENT_SUFFIX.len()
        }
        _ => false,
    }
}

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

async fn write_archive(output: &Path, archive: &BackupArchive) -> VaultResult<()> {
    let json = serde_json::to_vec(archive)?;

    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }

    let mut tmp = output.as_os_str().to_owned();
    tmp.push(".tmp");
    tokio::fs::write(&tmp, &json).await?;
    tokio::fs::rename(&tmp, output).await?;
    Ok(())
}

async fn read_archive(path: &Path) -> VaultResult<BackupArchive> {
    let data = match tokio::fs::read(path).await {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(VaultError::NotFound(format!("backup {}", path.display())))
        }
        Err(e) => return Err(e.into()),
    };

    let archive: BackupArchive = serde_json::from_slice(&data)
        .map_err(|e| VaultError::InvalidBackup(format!("{}: {}", path.display(), e)))?;

    if archive.format != ARCHIVE_FORMAT {
        return Err(VaultError::InvalidBackup(format!("unknown format '{}'", archive.format)));
    }
    if archive.format_version > ARCHIVE_FORMAT_VERSION {
        return Err(VaultError::InvalidBackup(format!(
            "archive layout v{} is newer than supported v{}",
            archive.format_version, ARCHIVE_FORMAT_VERSION
        )));
    }
    Ok(archive)
}
