//! ALFA Data Vault - Session
//!
//! [`DataVault`] owns the unwrapped DEK for the length of a session and hands
//! copies of it to the stores it builds. Locking drops the key.

use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;
use zeroize::Zeroizing;

use crate::backup::BackupService;
use crate::config::VaultConfig;
use crate::crypto::MasterKey;
use crate::documents::{DocumentReference, DocumentStore};
use crate::error::{VaultError, VaultResult};
use crate::integrity::{IntegrityChecker, IntegrityReport};
use crate::master_key::{Bootstrap, MasterKeyManager};
use crate::migration::MigrationRegistry;
use crate::records::{collection_names, record_id, LegacySecret, RecordStore};
use crate::storage::{open_backend, StorageBackend};
use crate::thumbs::ThumbnailEngine;

/// Vault state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VaultState {
    Locked,
    Unlocked,
    Lockdown,
}

struct Session {
    key: MasterKey,
    /// Unlock password, kept to read data encrypted before key wrapping
    password: Zeroizing<String>,
}

/// Data Vault - main entry point
pub struct DataVault {
    config: VaultConfig,
    backend: Arc<dyn StorageBackend>,
    keys: MasterKeyManager,
    migrations: Arc<MigrationRegistry>,
    state: RwLock<VaultState>,
    session: RwLock<Option<Session>>,
    failed_attempts: RwLock<u8>,
}

impl DataVault {
    // ═══════════════════════════════════════════════════════════════════════
    // INITIALIZATION
    // ═══════════════════════════════════════════════════════════════════════

    /// Open the vault described by `config`. It starts locked.
    pub fn open(config: VaultConfig) -> VaultResult<Self> {
        config.validate()?;
        let backend = open_backend(&config);
        Ok(Self::with_backend(config, backend))
    }

    /// Open over an explicit backend
    pub fn with_backend(config: VaultConfig, backend: Arc<dyn StorageBackend>) -> Self {
        let keys = MasterKeyManager::new(Arc::clone(&backend), &config.kdf);
        Self {
            config,
            backend,
            keys,
            migrations: Arc::new(MigrationRegistry::new()),
            state: RwLock::new(VaultState::Locked),
            session: RwLock::new(None),
            failed_attempts: RwLock::new(0),
        }
    }

    /// Install the schema migrations for this build
    pub fn with_migrations(mut self, migrations: MigrationRegistry) -> Self {
        self.migrations = Arc::new(migrations);
        self
    }

    pub fn config(&self) -> &VaultConfig {
        &self.config
    }

    pub fn backend(&self) -> Arc<dyn StorageBackend> {
        Arc::clone(&self.backend)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // UNLOCK / LOCK
    // ═══════════════════════════════════════════════════════════════════════

    /// Unlock with the user's password.
    ///
    /// The first unlock of an installation creates and wraps the DEK, then
    /// re-encrypts any collections written before key wrapping existed.
    pub async fn unlock(&self, password: &str) -> VaultResult<Bootstrap> {
        if *self.state.read() == VaultState::Lockdown {
            return Err(VaultError::TooManyAttempts);
        }

        let pre_existing = if self.keys.exists().await? {
            Vec::new()
        } else {
            collection_names(self.backend.as_ref()).await?
        };

        let (key, how) = match self.keys.bootstrap(password).await {
            Ok(opened) => opened,
            Err(VaultError::Authentication) => {
                let err = self.record_failure();
                if err.requires_lockdown() {
                    self.end_session().await;
                }
                return Err(err);
            }
            Err(e) => return Err(e),
        };

        *self.failed_attempts.write() = 0;
        *self.session.write() = Some(Session {
            key,
            password: Zeroizing::new(password.to_string()),
        });
        *self.state.write() = VaultState::Unlocked;

        if how == Bootstrap::FirstRun && !pre_existing.is_empty() {
            self.reencrypt_collections(&pre_existing).await?;
        }

        log::info!("Vault unlocked");
        Ok(how)
    }

    fn record_failure(&self) -> VaultError {
        let mut attempts = self.failed_attempts.write();
        *attempts = attempts.saturating_add(1);

        if *attempts >= self.config.max_unlock_attempts {
            *self.state.write() = VaultState::Lockdown;
            log::warn!("Unlock failed {} times, vault in lockdown", *attempts);
            return VaultError::TooManyAttempts;
        }

        log::warn!("Unlock failed ({} of {})", *attempts, self.config.max_unlock_attempts);
        VaultError::Authentication
    }

    async fn reencrypt_collections(&self, names: &[String]) -> VaultResult<()> {
        let records = self.records()?;
        let mut converted = 0;

        for name in names {
            match records.get_for_write(name).await {
                Ok(data) => {
                    records.write(name, &data).await?;
                    converted += 1;
                }
                Err(e) => log::warn!("Leaving '{}' as-is, cannot read it: {}", name, e),
            }
        }

        log::info!("Re-encrypted {} of {} collections under the new master key", converted, names.len());
        Ok(())
    }

    /// Lock the vault, wiping viewer copies and dropping the DEK
    pub async fn lock(&self) {
        self.end_session().await;
        let mut state = self.state.write();
        if *state == VaultState::Unlocked {
            *state = VaultState::Locked;
        }
        log::info!("Vault locked");
    }

    async fn end_session(&self) {
        if let Some(documents) = self.session_documents() {
            if let Err(e) = documents.cleanup_external_copies().await {
                log::warn!("Could not wipe external viewer copies: {}", e);
            }
        }
        *self.session.write() = None;
    }

    pub fn state(&self) -> VaultState {
        *self.state.read()
    }

    /// Check if vault is unlocked
    pub fn is_unlocked(&self) -> bool {
        self.state() == VaultState::Unlocked
    }

    /// Re-wrap the DEK under a new password. No other file is rewritten.
    pub async fn change_password(&self, old_password: &str, new_password: &str) -> VaultResult<()> {
        self.ensure_unlocked()?;
        self.keys.change_password(old_password, new_password).await?;

        if let Some(session) = self.session.write().as_mut() {
            session.password = Zeroizing::new(new_password.to_string());
        }
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // STORES
    // ═══════════════════════════════════════════════════════════════════════

    /// Record store bound to this session's key
    pub fn records(&self) -> VaultResult<RecordStore> {
        self.ensure_unlocked()?;
        let session = self.session.read();
        let session = session.as_ref().ok_or(VaultError::VaultLocked)?;

        let legacy = LegacySecret::new(&session.password, self.config.kdf.legacy_iterations);
        Ok(RecordStore::new(
            Arc::clone(&self.backend),
            session.key.clone(),
            Arc::clone(&self.migrations),
        )
        .with_legacy_secret(legacy))
    }

    /// Document store bound to this session's key
    pub fn documents(&self) -> VaultResult<DocumentStore> {
        self.ensure_unlocked()?;
        self.session_documents().ok_or(VaultError::VaultLocked)
    }

    fn session_documents(&self) -> Option<DocumentStore> {
        let session = self.session.read();
        let session = session.as_ref()?;

        Some(DocumentStore::new(
            Arc::clone(&self.backend),
            session.key.clone(),
            ThumbnailEngine::new(self.config.thumbnail_max_edge),
            self.config.view_dir(),
        ))
    }

    pub fn backup(&self) -> VaultResult<BackupService> {
        Ok(BackupService::new(Arc::clone(&self.backend), self.records()?))
    }

    /// Cross-check document references against files on disk
    pub async fn run_integrity_check(&self) -> VaultResult<IntegrityReport> {
        let checker = IntegrityChecker::new(Arc::clone(&self.backend), self.records()?);
        checker.run().await
    }

    // ═══════════════════════════════════════════════════════════════════════
    // DOCUMENT ATTACHMENTS
    // ═══════════════════════════════════════════════════════════════════════

    /// Store a document and append its reference to `record[field]`.
    ///
    /// The file is written before the reference, so an interruption leaves
    /// at worst an orphaned file.
    pub async fn attach_document(
        &self,
        collection: &str,
        record_id_value: &str,
        field: &str,
        category: &str,
        filename: &str,
        data_url: &str,
    ) -> VaultResult<DocumentReference> {
        let records = self.records()?;
        let documents = self.documents()?;

        let mut data = records.get_for_write(collection).await?;
        let index = find_record(&data, collection, record_id_value)?;
        match data[index].get(field) {
            None | Some(Value::Null) | Some(Value::Array(_)) => {}
            Some(_) => {
                return Err(VaultError::Format(format!(
                    "field '{}' of record '{}' is not a document list",
                    field, record_id_value
                )))
            }
        }

        let reference = documents.save_document(category, filename, data_url).await?;

        let slot = data[index]
            .as_object_mut()
            .ok_or_else(|| VaultError::Format(format!("record '{}' is not an object", record_id_value)))?
            .entry(field.to_string())
            .or_insert_with(|| Value::Array(Vec::new()));
        if slot.is_null() {
            *slot = Value::Array(Vec::new());
        }
        if let Value::Array(list) = slot {
            list.push(reference.to_value()?);
        }

        records.write(collection, &data).await?;
        Ok(reference)
    }

    /// Remove a document reference from `record[field]`, then its file.
    ///
    /// Returns false if the record holds no such document.
    pub async fn detach_document(
        &self,
        collection: &str,
        record_id_value: &str,
        field: &str,
        category: &str,
        document_id: &str,
    ) -> VaultResult<bool> {
        let records = self.records()?;
        let documents = self.documents()?;

        let mut data = records.get_for_write(collection).await?;
        let index = find_record(&data, collection, record_id_value)?;

        let removed = match data[index].get_mut(field) {
            Some(Value::Array(list)) => {
                let position = list
                    .iter()
                    .position(|v| v.get("id").and_then(Value::as_str) == Some(document_id));
                position.map(|p| list.remove(p))
            }
            Some(slot) if slot.get("id").and_then(Value::as_str) == Some(document_id) => {
                Some(std::mem::replace(slot, Value::Null))
            }
            _ => None,
        };

        let Some(removed) = removed else {
            return Ok(false);
        };
        let reference = DocumentReference::from_value(&removed)?;

        records.write(collection, &data).await?;

        if let Err(e) = documents.delete_document(category, &reference).await {
            log::warn!("Reference to {} removed but its file remains: {}", reference.id, e);
        }
        Ok(true)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // HELPERS
    // ═══════════════════════════════════════════════════════════════════════

    /// Ensure vault is unlocked
    fn ensure_unlocked(&self) -> VaultResult<()> {
        match self.state() {
            VaultState::Unlocked => Ok(()),
            VaultState::Lockdown => Err(VaultError::TooManyAttempts),
            VaultState::Locked => Err(VaultError::VaultLocked),
        }
    }
}

fn find_record(records: &[Value], collection: &str, id: &str) -> VaultResult<usize> {
    records
        .iter()
        .position(|r| record_id(r).as_deref() == Some(id))
        .ok_or_else(|| VaultError::NotFound(format!("record '{}' in '{}'", id, collection)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackendKind, KdfConfig};
    use crate::crypto::{encrypt, CipherKey};
    use crate::data_url;
    use crate::master_key::{unwrap, WRAPPED_KEY_FILE};
    use crate::storage::{LocalFs, MemoryBackend};
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::path::Path;
    use tempfile::tempdir;

    const FAST: u32 = 1_000;

    fn config(view_dir: &Path) -> VaultConfig {
        VaultConfig {
            backend: BackendKind::Memory,
            kdf: KdfConfig {
                kek_iterations: FAST,
                legacy_iterations: FAST,
            },
            external_view_dir: Some(view_dir.to_path_buf()),
            ..Default::default()
        }
    }

    fn memory_vault(view_dir: &Path) -> DataVault {
        DataVault::with_backend(config(view_dir), Arc::new(MemoryBackend::new()))
    }

    /// Every file except the wrapped key
    async fn snapshot(backend: &Arc<dyn StorageBackend>) -> BTreeMap<String, Vec<u8>> {
        let mut out = BTreeMap::new();
        let mut pending = vec![String::new()];
        while let Some(dir) = pending.pop() {
            for entry in backend.list(&dir).await.unwrap() {
                let path = crate::storage::join(&dir, &entry.name);
                if entry.is_dir {
                    pending.push(path);
                } else if path != WRAPPED_KEY_FILE {
                    let data = backend.read(&path).await.unwrap();
                    out.insert(path, data);
                }
            }
        }
        out
    }

    #[tokio::test]
    async fn test_first_run_then_unlock() {
        let view = tempdir().unwrap();
        let vault = memory_vault(view.path());
        assert_eq!(vault.state(), VaultState::Locked);
        assert!(matches!(vault.records(), Err(VaultError::VaultLocked)));

        assert_eq!(vault.unlock("correct-horse").await.unwrap(), Bootstrap::FirstRun);
        assert!(vault.is_unlocked());
        vault.records().unwrap().add("pets", json!({"id": "1"})).await.unwrap();

        vault.lock().await;
        assert_eq!(vault.state(), VaultState::Locked);
        assert!(matches!(vault.unlock("wrong").await, Err(VaultError::Authentication)));

        assert_eq!(vault.unlock("correct-horse").await.unwrap(), Bootstrap::Unlocked);
        assert_eq!(vault.records().unwrap().get("pets").await.unwrap(), vec![json!({"id": "1"})]);
    }

    #[tokio::test]
    async fn test_lockdown_after_retry_budget() {
        let view = tempdir().unwrap();
        let vault = memory_vault(view.path());
        vault.unlock("right").await.unwrap();
        vault.lock().await;

        assert!(matches!(vault.unlock("no").await, Err(VaultError::Authentication)));
        assert!(matches!(vault.unlock("no").await, Err(VaultError::Authentication)));
        assert!(matches!(vault.unlock("no").await, Err(VaultError::TooManyAttempts)));
        assert_eq!(vault.state(), VaultState::Lockdown);

        // Even the right password is refused now
        assert!(matches!(vault.unlock("right").await, Err(VaultError::TooManyAttempts)));
    }

    #[tokio::test]
    async fn test_success_resets_attempts() {
        let view = tempdir().unwrap();
        let vault = memory_vault(view.path());
        vault.unlock("right").await.unwrap();

        for _ in 0..2 {
            assert!(vault.unlock("no").await.is_err());
        }
        vault.unlock("right").await.unwrap();
        for _ in 0..2 {
            assert!(matches!(vault.unlock("no").await, Err(VaultError::Authentication)));
        }
    }

    #[tokio::test]
    async fn test_change_password_touches_only_key_file() {
        let data = tempdir().unwrap();
        let view = tempdir().unwrap();
        let backend: Arc<dyn StorageBackend> = Arc::new(LocalFs::new(data.path()));
        let vault = DataVault::with_backend(config(view.path()), Arc::clone(&backend));

        vault.unlock("pw1").await.unwrap();
        vault.records().unwrap().save("pets", &[json!({"id": "1", "name": "Willow"})]).await.unwrap();
        vault
            .attach_document("pets", "1", "documents", "pets", "note.txt", &data_url::encode("text/plain", b"hi"))
            .await
            .unwrap();

        let before = snapshot(&backend).await;
        assert_eq!(before.len(), 2);
        let key_before = backend.read(WRAPPED_KEY_FILE).await.unwrap();

        vault.change_password("pw1", "pw2").await.unwrap();

        assert_eq!(snapshot(&backend).await, before);
        assert_ne!(backend.read(WRAPPED_KEY_FILE).await.unwrap(), key_before);

        vault.lock().await;
        assert!(vault.unlock("pw1").await.is_err());
        vault.unlock("pw2").await.unwrap();
        assert_eq!(vault.records().unwrap().get("pets").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_unlocks_while_unlocked_end_session() {
        let view = tempdir().unwrap();
        let vault = memory_vault(view.path());
        vault.unlock("right").await.unwrap();

        let documents = vault.documents().unwrap();
        let reference = documents
            .save_document("notes", "a.txt", &data_url::encode("text/plain", b"secret"))
            .await
            .unwrap();
        let copy = documents.export_for_viewer("notes", &reference).await.unwrap();

        for _ in 0..3 {
            assert!(vault.unlock("wrong").await.is_err());
        }
        assert_eq!(vault.state(), VaultState::Lockdown);
        assert!(!vault.is_unlocked());
        assert!(matches!(vault.records(), Err(VaultError::TooManyAttempts)));
        assert!(matches!(vault.documents(), Err(VaultError::TooManyAttempts)));
        assert!(matches!(vault.backup(), Err(VaultError::TooManyAttempts)));
        assert!(matches!(vault.run_integrity_check().await, Err(VaultError::TooManyAttempts)));
        assert!(!copy.exists());

        // Locking does not leave lockdown
        vault.lock().await;
        assert_eq!(vault.state(), VaultState::Lockdown);
    }

    #[tokio::test]
    async fn test_change_password_refreshes_legacy_secret() {
        let view = tempdir().unwrap();
        let vault = memory_vault(view.path());
        vault.unlock("pw1").await.unwrap();
        vault.change_password("pw1", "pw2").await.unwrap();

        // Data encrypted straight from the password now in use
        let legacy = encrypt(
            br#"[{"id":"1"}]"#,
            CipherKey::Password { password: "pw2", iterations: FAST },
        )
        .unwrap();
        vault
            .backend()
            .write("pets.encrypted.json", serde_json::to_string(legacy.as_str()).unwrap().as_bytes())
            .await
            .unwrap();

        assert_eq!(vault.records().unwrap().get("pets").await.unwrap(), vec![json!({"id": "1"})]);
    }

    #[tokio::test]
    async fn test_change_password_wrong_old() {
        let view = tempdir().unwrap();
        let vault = memory_vault(view.path());
        vault.unlock("pw1").await.unwrap();

        assert!(matches!(
            vault.change_password("nope", "pw2").await,
            Err(VaultError::Authentication)
        ));
        vault.lock().await;
        vault.unlock("pw1").await.unwrap();
    }

    #[tokio::test]
    async fn test_first_run_reencrypts_existing_collections() {
        let view = tempdir().unwrap();
        let backend: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());

        // Written by a build that encrypted straight from the password
        let legacy = encrypt(
            br#"[{"id":"1","name":"Willow"}]"#,
            CipherKey::Password { password: "pw", iterations: FAST },
        )
        .unwrap();
        backend
            .write("pets.encrypted.json", serde_json::to_string(legacy.as_str()).unwrap().as_bytes())
            .await
            .unwrap();

        let vault = DataVault::with_backend(config(view.path()), Arc::clone(&backend));
        assert_eq!(vault.unlock("pw").await.unwrap(), Bootstrap::FirstRun);

        let wrapped = crate::master_key::WrappedMasterKey::from_text(
            &backend.read_to_string(WRAPPED_KEY_FILE).await.unwrap(),
        );
        let dek = unwrap(&wrapped, "pw", FAST).unwrap();
        let plain = RecordStore::new(backend, dek, Arc::new(MigrationRegistry::new()));
        assert_eq!(
            plain.get("pets").await.unwrap(),
            vec![json!({"id": "1", "name": "Willow"})]
        );
    }

    #[tokio::test]
    async fn test_attach_and_detach() {
        let view = tempdir().unwrap();
        let vault = memory_vault(view.path());
        vault.unlock("pw").await.unwrap();
        let records = vault.records().unwrap();
        records.save("vet_visits", &[json!({"id": "v1", "reason": "checkup"})]).await.unwrap();

        let url = data_url::encode("application/pdf", b"%PDF-1.4");
        let reference = vault
            .attach_document("vet_visits", "v1", "attachments", "vet", "invoice.pdf", &url)
            .await
            .unwrap();

        let record = records.find("vet_visits", "v1").await.unwrap().unwrap();
        assert_eq!(record["attachments"][0]["id"], json!(reference.id));
        assert!(vault.backend().exists(&reference.encrypted_path).await.unwrap());
        assert!(vault.run_integrity_check().await.unwrap().is_consistent());

        assert!(vault
            .detach_document("vet_visits", "v1", "attachments", "vet", &reference.id)
            .await
            .unwrap());
        let record = records.find("vet_visits", "v1").await.unwrap().unwrap();
        assert_eq!(record["attachments"], json!([]));
        assert!(!vault.backend().exists(&reference.encrypted_path).await.unwrap());

        assert!(!vault
            .detach_document("vet_visits", "v1", "attachments", "vet", &reference.id)
            .await
            .unwrap());
        let report = vault.run_integrity_check().await.unwrap();
        assert!(report.matched.is_empty());
        assert!(report.is_consistent());
    }

    #[tokio::test]
    async fn test_attach_to_missing_record_writes_nothing() {
        let view = tempdir().unwrap();
        let vault = memory_vault(view.path());
        vault.unlock("pw").await.unwrap();
        vault.records().unwrap().save("pets", &[]).await.unwrap();

        let url = data_url::encode("text/plain", b"x");
        assert!(matches!(
            vault.attach_document("pets", "nope", "docs", "pets", "a.txt", &url).await,
            Err(VaultError::NotFound(_))
        ));
        assert!(vault.backend().list("documents").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_attach_to_newer_schema_writes_nothing() {
        let view = tempdir().unwrap();
        let vault = memory_vault(view.path());
        vault.unlock("pw").await.unwrap();

        let wrapped = crate::master_key::WrappedMasterKey::from_text(
            &vault.backend().read_to_string(WRAPPED_KEY_FILE).await.unwrap(),
        );
        let dek = unwrap(&wrapped, "pw", FAST).unwrap();
        let mut newer = MigrationRegistry::new();
        newer.set_target("pets", 4);
        RecordStore::new(vault.backend(), dek, Arc::new(newer))
            .save("pets", &[json!({"id": "1"})])
            .await
            .unwrap();

        let url = data_url::encode("text/plain", b"x");
        assert!(matches!(
            vault.attach_document("pets", "1", "docs", "pets", "a.txt", &url).await,
            Err(VaultError::NewerSchema { .. })
        ));
        assert!(vault.backend().list("documents").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_lock_wipes_viewer_copies() {
        let view = tempdir().unwrap();
        let vault = memory_vault(view.path());
        vault.unlock("pw").await.unwrap();

        let documents = vault.documents().unwrap();
        let reference = documents
            .save_document("notes", "a.txt", &data_url::encode("text/plain", b"secret"))
            .await
            .unwrap();
        let copy = documents.export_for_viewer("notes", &reference).await.unwrap();
        assert!(copy.exists());

        vault.lock().await;
        assert!(!copy.exists());
        assert!(matches!(vault.documents(), Err(VaultError::VaultLocked)));
    }

    #[tokio::test]
    async fn test_open_uses_configured_backend() {
        let view = tempdir().unwrap();
        let vault = DataVault::open(config(view.path())).unwrap();
        vault.unlock("pw").await.unwrap();
        assert!(vault.backend().exists(WRAPPED_KEY_FILE).await.unwrap());

        let bad = VaultConfig {
            max_unlock_attempts: 0,
            ..config(view.path())
        };
        assert!(DataVault::open(bad).is_err());
    }
}
