//! ALFA Data Vault - Document Store
//!
//! Every attachment is one file under `documents/<category>/`:
//!
//! ```text
//! documents/<category>/<id>.<ext>.encrypted        EncryptedBlob(data URL)
//! documents/<category>/<id>.<ext>.thumb.encrypted  EncryptedBlob(JPEG data URL)
//! ```
//!
//! The files hold bare base64 text with no JSON wrapper. Their metadata, a
//! [`DocumentReference`], lives inside some record of some collection and is
//! written by the caller.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::{distributions::Alphanumeric, Rng};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::crypto::{decrypt_str, encrypt_str, CipherKey, EncryptedBlob, MasterKey};
use crate::data_url::{self, DataUrl};
use crate::error::{VaultError, VaultResult};
use crate::storage::{self, local::wipe_file, StorageBackend};
use crate::thumbs::ThumbnailEngine;

/// Root directory of all categories
pub const DOCUMENTS_DIR: &str = "documents";

/// Suffix of an encrypted document file
pub const DOCUMENT_SUFFIX: &str = ".encrypted";

/// Suffix of an encrypted thumbnail file
pub const THUMBNAIL_SUFFIX: &str = ".thumb.encrypted";

/// Metadata of one stored document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentReference {
    pub id: String,
    pub filename: String,
    pub mime_type: String,
    pub upload_date: DateTime<Utc>,
    /// `documents/<category>/<file>`
    pub encrypted_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail_path: Option<String>,
    /// Decoded content size in bytes
    pub size: u64,
}

impl DocumentReference {
    /// Read a reference embedded in a record
    pub fn from_value(value: &Value) -> VaultResult<Self> {
        Ok(serde_json::from_value(value.clone())?)
    }

    pub fn to_value(&self) -> VaultResult<Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Name of the main file on disk
    pub fn file_name(&self) -> &str {
        storage::file_name(&self.encrypted_path)
    }

    pub fn is_image(&self) -> bool {
        self.mime_type.starts_with("image/")
    }
}

/// Check if a file name in a category directory is a thumbnail
pub fn is_thumbnail(name: &str) -> bool {
    name.ends_with(THUMBNAIL_SUFFIX)
}

/// Thumbnail file name belonging to a document file name
pub fn thumbnail_name(document_name: &str) -> String {
    let stem = document_name
        .strip_suffix(DOCUMENT_SUFFIX)
        .unwrap_or(document_name);
    format!("{}{}", stem, THUMBNAIL_SUFFIX)
}

/// Document file name a thumbnail belongs to
pub fn document_name_for_thumbnail(thumbnail: &str) -> Option<String> {
    thumbnail
        .strip_suffix(THUMBNAIL_SUFFIX)
        .map(|stem| format!("{}{}", stem, DOCUMENT_SUFFIX))
}

/// Relative directory of a category
pub fn category_dir(category: &str) -> VaultResult<String> {
    check_segment(category, "category")?;
    Ok(storage::join(DOCUMENTS_DIR, category))
}

fn check_segment(name: &str, what: &str) -> VaultResult<()> {
    let valid = !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(&['/', '\\', ':'][..]);
    if valid {
        Ok(())
    } else {
        Err(VaultError::InvalidPath(format!("{} '{}'", what, name)))
    }
}

/// `doc_<millis>_<random>`
fn mint_id() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(9)
        .map(|b| char::from(b).to_ascii_lowercase())
        .collect();
    format!("doc_{}_{}", Utc::now().timestamp_millis(), suffix)
}

/// Encrypted per-file attachment storage
#[derive(Clone)]
pub struct DocumentStore {
    backend: Arc<dyn StorageBackend>,
    key: MasterKey,
    thumbs: ThumbnailEngine,
    view_dir: PathBuf,
}

impl DocumentStore {
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        key: MasterKey,
        thumbs: ThumbnailEngine,
        view_dir: PathBuf,
    ) -> Self {
        Self {
            backend,
            key,
            thumbs,
            view_dir,
        }
    }

    /// Directory that receives decrypted viewer copies
    pub fn view_dir(&self) -> &Path {
        &self.view_dir
    }

    // ═══════════════════════════════════════════════════════════════════════
    // SAVE / LOAD
    // ═══════════════════════════════════════════════════════════════════════

    /// Encrypt a data URL into `documents/<category>/`.
    ///
    /// Images also get a thumbnail. A thumbnail that cannot be rendered is
    /// logged and left out; the document itself is still saved.
    pub async fn save_document(
        &self,
        category: &str,
        filename: &str,
        data_url: &str,
    ) -> VaultResult<DocumentReference> {
        let dir = category_dir(category)?;
        let parsed = DataUrl::parse(data_url)?;

        let id = mint_id();
        let file = format!("{}.{}{}", id, parsed.extension(), DOCUMENT_SUFFIX);
        let encrypted_path = storage::join(&dir, &file);

        let blob = encrypt_str(data_url, self.cipher())?;
        self.backend.write(&encrypted_path, blob.as_str().as_bytes()).await?;

        let thumbnail_path = if parsed.is_image() {
            self.write_thumbnail(&dir, &file, &parsed).await?
        } else {
            None
        };

        log::debug!("Saved document {} in '{}'", id, category);

        Ok(DocumentReference {
            id,
            filename: filename.to_string(),
            mime_type: parsed.mime_type.clone(),
            upload_date: Utc::now(),
            encrypted_path,
            thumbnail_path,
            size: parsed.decoded_len(),
        })
    }

    /// Decrypt a document back to its original data URL
    pub async fn load_document(&self, category: &str, reference: &DocumentReference) -> VaultResult<String> {
        let path = self.resolve(category, reference.file_name())?;
        self.read_encrypted(&path, &reference.filename).await
    }

    /// Decrypt a document's thumbnail data URL
    pub async fn load_thumbnail(&self, category: &str, reference: &DocumentReference) -> VaultResult<String> {
        let thumb = reference
            .thumbnail_path
            .as_deref()
            .ok_or_else(|| VaultError::NotFound(format!("thumbnail of '{}'", reference.filename)))?;
        let path = self.resolve(category, storage::file_name(thumb))?;
        self.read_encrypted(&path, &reference.filename).await
    }

    /// Remove a document and its thumbnail
    pub async fn delete_document(&self, category: &str, reference: &DocumentReference) -> VaultResult<()> {
        let path = self.resolve(category, reference.file_name())?;
        self.backend.remove(&path).await?;

        let thumb = match &reference.thumbnail_path {
            Some(thumb) => storage::file_name(thumb).to_string(),
            None => thumbnail_name(reference.file_name()),
        };
        self.backend.remove(&self.resolve(category, &thumb)?).await?;

        log::debug!("Deleted document {} from '{}'", reference.id, category);
        Ok(())
    }

    /// Rebuild a document's thumbnail from its content.
    ///
    /// Non-image documents come back without a thumbnail.
    pub async fn regenerate_thumbnail(
        &self,
        category: &str,
        reference: &DocumentReference,
    ) -> VaultResult<DocumentReference> {
        let dir = category_dir(category)?;
        let content = self.load_document(category, reference).await?;
        let parsed = DataUrl::parse(&content)?;

        let mut updated = reference.clone();
        updated.thumbnail_path = if parsed.is_image() {
            self.write_thumbnail(&dir, reference.file_name(), &parsed).await?
        } else {
            None
        };
        Ok(updated)
    }

    async fn write_thumbnail(
        &self,
        dir: &str,
        document_file: &str,
        parsed: &DataUrl<'_>,
    ) -> VaultResult<Option<String>> {
        let rendered = parsed
            .decode()
            .and_then(|bytes| self.thumbs.generate_data_url(&bytes));

        let thumb_url = match rendered {
            Ok(url) => url,
            Err(e) if e.is_recoverable() || matches!(e, VaultError::InvalidDataUrl(_)) => {
                log::warn!("No thumbnail for {}: {}", document_file, e);
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let path = storage::join(dir, &thumbnail_name(document_file));
        let blob = encrypt_str(&thumb_url, self.cipher())?;
        self.backend.write(&path, blob.as_str().as_bytes()).await?;
        Ok(Some(path))
    }

    async fn read_encrypted(&self, path: &str, display_name: &str) -> VaultResult<String> {
        let text = match self.backend.read_to_string(path).await {
            Ok(text) => text,
            Err(VaultError::NotFound(_)) => {
                return Err(VaultError::NotFound(format!(
                    "document '{}' ({}) is unavailable",
                    display_name, path
                )))
            }
            Err(e) => return Err(e),
        };
        // Tolerates whitespace picked up from JSON round trips
        let blob = EncryptedBlob::from_text(&text);
        decrypt_str(&blob, self.cipher())
    }

    fn resolve(&self, category: &str, file: &str) -> VaultResult<String> {
        check_segment(file, "document file")?;
        Ok(storage::join(&category_dir(category)?, file))
    }

    fn cipher(&self) -> CipherKey<'_> {
        CipherKey::Master(&self.key)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // EXTERNAL VIEWER
    // ═══════════════════════════════════════════════════════════════════════

    /// Write the decoded document into the view directory.
    ///
    /// The copy is plaintext on disk until [`cleanup_external_copies`] runs.
    ///
    /// [`cleanup_external_copies`]: DocumentStore::cleanup_external_copies
    pub async fn export_for_viewer(&self, category: &str, reference: &DocumentReference) -> VaultResult<PathBuf> {
        let content = self.load_document(category, reference).await?;
        let bytes = DataUrl::parse(&content)?.decode()?;

        tokio::fs::create_dir_all(&self.view_dir).await?;
        let target = self.view_dir.join(viewer_file_name(reference));
        tokio::fs::write(&target, &bytes).await?;

        log::warn!("Decrypted copy of '{}' written to {}", reference.filename, target.display());
        Ok(target)
    }

    /// Decrypt a document and hand it to the platform's default viewer
    pub async fn open_document_external(&self, category: &str, reference: &DocumentReference) -> VaultResult<PathBuf> {
        let target = self.export_for_viewer(category, reference).await?;
        launch_viewer(&target)?;
        Ok(target)
    }

    /// Overwrite and remove every file in the view directory
    pub async fn cleanup_external_copies(&self) -> VaultResult<usize> {
        let mut entries = match tokio::fs::read_dir(&self.view_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut wiped = 0;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                wipe_file(&entry.path()).await?;
                wiped += 1;
            }
        }

        if wiped > 0 {
            log::info!("Wiped {} external viewer copies", wiped);
        }
        Ok(wiped)
    }
}

fn viewer_file_name(reference: &DocumentReference) -> String {
    let clean: String = storage::file_name(&reference.filename)
        .chars()
        .map(|c| if c.is_alphanumeric() || matches!(c, '.' | '-' | '_') { c } else { '_' })
        .collect();
    let clean = clean.trim_start_matches('.');

    let name = if clean.is_empty() {
        format!("document.{}", data_url::extension_for_mime(&reference.mime_type))
    } else {
        clean.to_string()
    };
    format!("{}_{}", reference.id, name)
}

fn launch_viewer(path: &Path) -> VaultResult<()> {
    #[cfg(target_os = "windows")]
    let mut command = {
        let mut c = std::process::Command::new("cmd");
        c.args(["/C", "start", ""]).arg(path);
        c
    };
    #[cfg(target_os = "macos")]
    let mut command = {
        let mut c = std::process::Command::new("open");
        c.arg(path);
        c
    };
    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    let mut command = {
        let mut c = std::process::Command::new("xdg-open");
        c.arg(path);
        c
    };

    command.spawn()?;
    Ok(())
}
