//! ALFA Data Vault - Encrypted Record Store
//!
//! Each collection is one file, `<name>.encrypted.json`, holding a JSON string
//! whose value is a single encrypted blob of
//! `{"schemaVersion": n, "records": [...]}`. Every mutation rewrites the file.
//!
//! Older installs stored a JSON array of `{"data": <blob>}` items, one blob per
//! record. Those are still read; an item that will not decrypt is skipped.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use zeroize::Zeroizing;

use crate::crypto::{decrypt, encrypt, CipherKey, EncryptedBlob, MasterKey};
use crate::error::{VaultError, VaultResult};
use crate::migration::{MigrationRegistry, Records, LEGACY_VERSION};
use crate::storage::StorageBackend;

/// File name suffix of every collection
pub const COLLECTION_SUFFIX: &str = ".encrypted.json";

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CollectionPayload {
    schema_version: u32,
    records: Records,
}

/// Stored layout of a collection file
enum StoredCollection {
    Blob(EncryptedBlob),
    Items(Vec<EncryptedBlob>),
}

/// Password that encrypted data directly before key wrapping existed
#[derive(Clone)]
pub struct LegacySecret {
    password: Zeroizing<String>,
    iterations: u32,
}

impl LegacySecret {
    pub fn new(password: &str, iterations: u32) -> Self {
        Self {
            password: Zeroizing::new(password.to_string()),
            iterations,
        }
    }

    fn cipher_key(&self) -> CipherKey<'_> {
        CipherKey::Password {
            password: &self.password,
            iterations: self.iterations,
        }
    }
}

/// Identifier of a record: its `id` field as text
pub fn record_id(record: &Value) -> Option<String> {
    match record.get("id")? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Relative path of a collection file
pub fn collection_path(collection: &str) -> VaultResult<String> {
    let valid = !collection.is_empty()
        && !collection.contains(&['/', '\\', ':'][..])
        && collection != "."
        && collection != "..";
    if !valid {
        return Err(VaultError::InvalidPath(format!("collection name '{}'", collection)));
    }
    Ok(format!("{}{}", collection, COLLECTION_SUFFIX))
}

/// Collection files at the root of `backend`, by name
pub async fn collection_names(backend: &dyn StorageBackend) -> VaultResult<Vec<String>> {
    let entries = backend.list("").await?;
    Ok(entries
        .into_iter()
        .filter(|e| !e.is_dir)
        .filter_map(|e| e.name.strip_suffix(COLLECTION_SUFFIX).map(str::to_string))
        .filter(|name| !name.is_empty())
        .collect())
}

/// Encrypted Record Store
#[derive(Clone)]
pub struct RecordStore {
    backend: Arc<dyn StorageBackend>,
    key: MasterKey,
    legacy: Option<LegacySecret>,
    migrations: Arc<MigrationRegistry>,
}

impl RecordStore {
    /// Create a store over `backend` using its own copy of the DEK
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        key: MasterKey,
        migrations: Arc<MigrationRegistry>,
    ) -> Self {
        Self {
            backend,
            key,
            legacy: None,
            migrations,
        }
    }

    /// Also try a password-derived key when the DEK does not authenticate
    pub fn with_legacy_secret(mut self, legacy: LegacySecret) -> Self {
        self.legacy = Some(legacy);
        self
    }

    pub fn migrations(&self) -> &MigrationRegistry {
        &self.migrations
    }

    // ═══════════════════════════════════════════════════════════════════════
    // READ
    // ═══════════════════════════════════════════════════════════════════════

    /// Load a collection, migrated to its current schema.
    ///
    /// A missing file is an empty collection. A blob that does not decrypt is
    /// an error, never an empty result.
    pub async fn get(&self, collection: &str) -> VaultResult<Records> {
        let (records, version) = match self.load_stored(collection).await? {
            Some(loaded) => loaded,
            None => return Ok(Vec::new()),
        };

        if !self.migrations.needs_migration(collection, version) {
            return Ok(records);
        }

        let migrated = self.migrations.migrate(collection, records, version)?;
        log::info!(
            "Collection '{}' migrated v{} -> v{}",
            collection,
            version,
            migrated.to_version
        );
        Ok(migrated.records)
    }

    /// Find one record by id
    pub async fn find(&self, collection: &str, id: &str) -> VaultResult<Option<Value>> {
        let records = self.get(collection).await?;
        Ok(records.into_iter().find(|r| record_id(r).as_deref() == Some(id)))
    }

    /// Names of every collection present on disk
    pub async fn list_collections(&self) -> VaultResult<Vec<String>> {
        collection_names(self.backend.as_ref()).await
    }

    /// Raw stored records and their schema version, without migrating
    pub async fn load_stored(&self, collection: &str) -> VaultResult<Option<(Records, u32)>> {
        let path = collection_path(collection)?;
        let text = match self.backend.read_to_string(&path).await {
            Ok(text) => text,
            Err(VaultError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };

        let loaded = match parse_stored(&text)? {
            StoredCollection::Blob(blob) => {
                let plaintext = self.decrypt_with_fallback(&blob)?;
                decode_payload(&plaintext)?
            }
            StoredCollection::Items(items) => (self.decrypt_items(collection, &items), LEGACY_VERSION),
        };

        Ok(Some(loaded))
    }

    /// Decrypt with the DEK, then with the legacy password key if one is set
    pub(crate) fn decrypt_with_fallback(&self, blob: &EncryptedBlob) -> VaultResult<Zeroizing<Vec<u8>>> {
        match decrypt(blob, CipherKey::Master(&self.key)) {
            Err(VaultError::Authentication) => match &self.legacy {
                Some(legacy) => {
                    log::debug!("DEK did not authenticate, trying legacy password key");
                    decrypt(blob, legacy.cipher_key())
                }
                None => Err(VaultError::Authentication),
            },
            other => other,
        }
    }

    fn decrypt_items(&self, collection: &str, items: &[EncryptedBlob]) -> Records {
        let mut records = Vec::with_capacity(items.len());
        for (index, item) in items.iter().enumerate() {
            let decoded = self
                .decrypt_with_fallback(item)
                .and_then(|plain| serde_json::from_slice::<Value>(&plain).map_err(VaultError::from));
            match decoded {
                Ok(record) => records.push(record),
                Err(e) => log::warn!(
                    "Skipping legacy item {} of '{}': {}",
                    index,
                    collection,
                    e
                ),
            }
        }
        records
    }

    // ═══════════════════════════════════════════════════════════════════════
    // WRITE
    // ═══════════════════════════════════════════════════════════════════════

    /// Replace a collection's contents, tagged with its current schema version.
    ///
    /// Refuses to overwrite a collection stored at a newer schema than this
    /// build supports.
    pub async fn save(&self, collection: &str, records: &[Value]) -> VaultResult<()> {
        if let Some((_, version)) = self.load_stored(collection).await? {
            self.ensure_writable(collection, version)?;
        }
        self.write(collection, records).await
    }

    /// Append a record
    pub async fn add(&self, collection: &str, record: Value) -> VaultResult<()> {
        let mut records = self.get_for_write(collection).await?;
        records.push(record);
        self.write(collection, &records).await
    }

    /// Replace the record whose id matches
    pub async fn update(&self, collection: &str, id: &str, record: Value) -> VaultResult<()> {
        let mut records = self.get_for_write(collection).await?;
        let slot = records
            .iter_mut()
            .find(|r| record_id(r).as_deref() == Some(id))
            .ok_or_else(|| VaultError::NotFound(format!("record '{}' in '{}'", id, collection)))?;
        *slot = record;
        self.write(collection, &records).await
    }

    /// Remove the record whose id matches. Returns whether one was removed.
    pub async fn delete(&self, collection: &str, id: &str) -> VaultResult<bool> {
        let mut records = self.get_for_write(collection).await?;
        let before = records.len();
        records.retain(|r| record_id(r).as_deref() != Some(id));

        if records.len() == before {
            return Ok(false);
        }
        self.write(collection, &records).await?;
        Ok(true)
    }

    /// Like `get`, but fails on data this build would downgrade when saving
    pub(crate) async fn get_for_write(&self, collection: &str) -> VaultResult<Records> {
        let (records, version) = match self.load_stored(collection).await? {
            Some(loaded) => loaded,
            None => return Ok(Vec::new()),
        };
        self.ensure_writable(collection, version)?;

        if !self.migrations.needs_migration(collection, version) {
            return Ok(records);
        }
        Ok(self.migrations.migrate(collection, records, version)?.records)
    }

    fn ensure_writable(&self, collection: &str, stored_version: u32) -> VaultResult<()> {
        let supported = self.migrations.target_version(collection);
        if stored_version > supported {
            return Err(VaultError::NewerSchema {
                collection: collection.to_string(),
                stored_version,
                supported_version: supported,
            });
        }
        Ok(())
    }

    /// Write without re-reading; callers loaded through `get_for_write`
    pub(crate) async fn write(&self, collection: &str, records: &[Value]) -> VaultResult<()> {
        let path = collection_path(collection)?;
        let payload = CollectionPayload {
            schema_version: self.migrations.target_version(collection),
            records: records.to_vec(),
        };

        let plaintext = Zeroizing::new(serde_json::to_vec(&payload)?);
        let blob = encrypt(&plaintext, CipherKey::Master(&self.key))?;
        let file = serde_json::to_string(blob.as_str())?;

        self.backend.write(&path, file.as_bytes()).await
    }

    /// Delete a collection file
    pub async fn clear(&self, collection: &str) -> VaultResult<()> {
        let path = collection_path(collection)?;
        self.backend.remove(&path).await
    }
}

fn parse_stored(text: &str) -> VaultResult<StoredCollection> {
    match serde_json::from_str::<Value>(text) {
        Ok(Value::String(blob)) => Ok(StoredCollection::Blob(EncryptedBlob::from_text(&blob))),
        Ok(Value::Array(items)) => {
            let blobs = items
                .into_iter()
                .filter_map(|item| match item {
                    Value::String(s) => Some(EncryptedBlob::from_text(&s)),
                    Value::Object(mut obj) => match obj.remove("data") {
                        Some(Value::String(s)) => Some(EncryptedBlob::from_text(&s)),
                        _ => None,
                    },
                    _ => None,
                })
                .collect();
            Ok(StoredCollection::Items(blobs))
        }
        Ok(_) => Err(VaultError::Format("collection file is neither a blob nor an item array".into())),
        // Bare blob text without JSON quoting
        Err(_) => Ok(StoredCollection::Blob(EncryptedBlob::from_text(text))),
    }
}

fn decode_payload(plaintext: &[u8]) -> VaultResult<(Records, u32)> {
    let value: Value = serde_json::from_slice(plaintext)?;
    match value {
        Value::Array(records) => Ok((records, LEGACY_VERSION)),
        Value::Object(_) => {
            let payload: CollectionPayload = serde_json::from_value(value)?;
            Ok((payload.records, payload.schema_version))
        }
        _ => Err(VaultError::Format("collection payload is not an array or object".into())),
    }
}
