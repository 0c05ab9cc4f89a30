//! ALFA Data Vault - Integrity Checker
//!
//! Cross-references document references held in records with the encrypted
//! files under `documents/`. Read-only: nothing is repaired or deleted.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::documents::{document_name_for_thumbnail, is_thumbnail, thumbnail_name, DOCUMENTS_DIR, DOCUMENT_SUFFIX};
use crate::error::VaultResult;
use crate::records::{record_id, RecordStore};
use crate::storage::{self, StorageBackend};

/// A reference whose file exists
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchedDocument {
    pub collection: String,
    pub record_id: Option<String>,
    pub document_id: String,
    pub category: String,
    pub file: String,
}

/// A reference whose file is gone
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MissingDocument {
    pub collection: String,
    pub record_id: Option<String>,
    pub document_id: String,
    pub encrypted_path: String,
}

/// A file no record points at
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrphanedFile {
    pub category: String,
    pub file: String,
    /// Thumbnail sitting next to the orphan
    pub thumbnail: Option<String>,
}

impl OrphanedFile {
    pub fn path(&self) -> String {
        storage::join(&storage::join(DOCUMENTS_DIR, &self.category), &self.file)
    }
}

/// A matched document whose recorded thumbnail is gone
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MissingThumbnail {
    pub collection: String,
    pub document_id: String,
    pub thumbnail_path: String,
}

/// A collection that could not be loaded
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnreadableCollection {
    pub collection: String,
    pub reason: String,
}

/// Integrity Report
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrityReport {
    pub categories: Vec<String>,
    pub collections_scanned: usize,
    pub matched: Vec<MatchedDocument>,
    pub missing: Vec<MissingDocument>,
    pub orphaned: Vec<OrphanedFile>,
    pub missing_thumbnails: Vec<MissingThumbnail>,
    pub unreadable_collections: Vec<UnreadableCollection>,
}

impl IntegrityReport {
    /// No missing files, no orphans, every collection readable
    pub fn is_consistent(&self) -> bool {
        self.missing.is_empty()
            && self.orphaned.is_empty()
            && self.missing_thumbnails.is_empty()
            && self.unreadable_collections.is_empty()
    }
}

/// A document reference found by shape inside a record
struct FoundReference<'a> {
    id: &'a str,
    encrypted_path: &'a str,
    thumbnail_path: Option<&'a str>,
}

impl<'a> FoundReference<'a> {
    /// Any object with string `id` and `encryptedPath` fields
    fn from_object(obj: &'a Map<String, Value>) -> Option<Self> {
        Some(Self {
            id: obj.get("id")?.as_str()?,
            encrypted_path: obj.get("encryptedPath")?.as_str()?,
            thumbnail_path: obj.get("thumbnailPath").and_then(Value::as_str),
        })
    }
}

fn collect_references<'a>(value: &'a Value, out: &mut Vec<FoundReference<'a>>) {
    match value {
        Value::Object(obj) => match FoundReference::from_object(obj) {
            Some(found) => out.push(found),
            None => obj.values().for_each(|v| collect_references(v, out)),
        },
        Value::Array(items) => items.iter().for_each(|v| collect_references(v, out)),
        _ => {}
    }
}

/// Files present in one category directory
#[derive(Default)]
struct CategoryFiles {
    documents: BTreeSet<String>,
    thumbnails: BTreeSet<String>,
}

/// Integrity Checker
pub struct IntegrityChecker {
    backend: Arc<dyn StorageBackend>,
    records: RecordStore,
}

impl IntegrityChecker {
    pub fn new(backend: Arc<dyn StorageBackend>, records: RecordStore) -> Self {
        Self { backend, records }
    }

    /// Scan every collection and category
    pub async fn run(&self) -> VaultResult<IntegrityReport> {
        let disk = self.scan_categories().await?;
        let mut report = IntegrityReport {
            categories: disk.keys().cloned().collect(),
            ..Default::default()
        };

        // file name -> categories holding it
        let mut locations: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for (category, files) in &disk {
            for name in &files.documents {
                locations.entry(name.as_str()).or_default().push(category.as_str());
            }
        }

        let mut referenced: BTreeSet<(String, String)> = BTreeSet::new();

        for collection in self.records.list_collections().await? {
            let records = match self.records.get(&collection).await {
                Ok(records) => records,
                Err(e) => {
                    log::warn!("Integrity check cannot read '{}': {}", collection, e);
                    report.unreadable_collections.push(UnreadableCollection {
                        collection,
                        reason: e.to_string(),
                    });
                    continue;
                }
            };
            report.collections_scanned += 1;

            for record in &records {
                let mut found = Vec::new();
                collect_references(record, &mut found);

                for reference in found {
                    let file = storage::file_name(reference.encrypted_path);
                    let category = locations.get(file).and_then(|cats| pick_category(reference.encrypted_path, cats));

                    let Some(category) = category else {
                        report.missing.push(MissingDocument {
                            collection: collection.clone(),
                            record_id: record_id(record),
                            document_id: reference.id.to_string(),
                            encrypted_path: reference.encrypted_path.to_string(),
                        });
                        continue;
                    };

                    if let Some(thumb) = reference.thumbnail_path {
                        let present = disk
                            .get(category)
                            .map(|f| f.thumbnails.contains(storage::file_name(thumb)))
                            .unwrap_or(false);
                        if !present {
                            report.missing_thumbnails.push(MissingThumbnail {
                                collection: collection.clone(),
                                document_id: reference.id.to_string(),
                                thumbnail_path: thumb.to_string(),
                            });
                        }
                    }

                    referenced.insert((category.to_string(), file.to_string()));
                    report.matched.push(MatchedDocument {
                        collection: collection.clone(),
                        record_id: record_id(record),
                        document_id: reference.id.to_string(),
                        category: category.to_string(),
                        file: file.to_string(),
                    });
                }
            }
        }

        for (category, files) in &disk {
            for name in &files.documents {
                if referenced.contains(&(category.clone(), name.clone())) {
                    continue;
                }
                let thumb = thumbnail_name(name);
                report.orphaned.push(OrphanedFile {
                    category: category.clone(),
                    file: name.clone(),
                    thumbnail: files.thumbnails.contains(&thumb).then_some(thumb),
                });
            }

            // Thumbnails whose document is gone
            for thumb in &files.thumbnails {
                let owner_exists = document_name_for_thumbnail(thumb)
                    .map(|doc| files.documents.contains(&doc))
                    .unwrap_or(false);
                if !owner_exists {
                    report.orphaned.push(OrphanedFile {
                        category: category.clone(),
                        file: thumb.clone(),
                        thumbnail: None,
                    });
                }
            }
        }

        log::info!(
            "Integrity check: {} matched, {} missing, {} orphaned",
            report.matched.len(),
            report.missing.len(),
            report.orphaned.len()
        );
        Ok(report)
    }

    async fn scan_categories(&self) -> VaultResult<BTreeMap<String, CategoryFiles>> {
        let mut categories = BTreeMap::new();

        for entry in self.backend.list(DOCUMENTS_DIR).await? {
            if !entry.is_dir {
                continue;
            }
            let dir = storage::join(DOCUMENTS_DIR, &entry.name);
            let mut files = CategoryFiles::default();

            for file in self.backend.list(&dir).await? {
                if file.is_dir || !file.name.ends_with(DOCUMENT_SUFFIX) {
                    continue;
                }
                if is_thumbnail(&file.name) {
                    files.thumbnails.insert(file.name);
                } else {
                    files.documents.insert(file.name);
                }
            }
            categories.insert(entry.name, files);
        }

        Ok(categories)
    }
}

/// Prefer the category named in the path, else the first holding the file
fn pick_category<'a>(encrypted_path: &str, candidates: &[&'a str]) -> Option<&'a str> {
    let mut segments = encrypted_path.rsplit(|c| c == '/' || c == '\\');
    segments.next();
    let named = segments.next();

    candidates
        .iter()
        .copied()
        .find(|c| Some(*c) == named)
        .or_else(|| candidates.first().copied())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::MasterKey;
    use crate::data_url;
    use crate::documents::DocumentStore;
    use crate::migration::MigrationRegistry;
    use crate::storage::MemoryBackend;
    use crate::thumbs::ThumbnailEngine;
    use image::{DynamicImage, ImageFormat};
    use serde_json::json;
    use std::io::Cursor;

    struct Fixture {
        backend: Arc<dyn StorageBackend>,
        records: RecordStore,
        documents: DocumentStore,
        checker: IntegrityChecker,
    }

    fn fixture() -> Fixture {
        let backend: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        let key = MasterKey::generate();
        let records = RecordStore::new(Arc::clone(&backend), key.clone(), Arc::new(MigrationRegistry::new()));
        let documents = DocumentStore::new(
            Arc::clone(&backend),
            key,
            ThumbnailEngine::default(),
            std::env::temp_dir().join("alfa_integrity_test_view"),
        );
        let checker = IntegrityChecker::new(Arc::clone(&backend), records.clone());
        Fixture {
            backend,
            records,
            documents,
            checker,
        }
    }

    fn jpeg_url() -> String {
        let mut buffer = Vec::new();
        DynamicImage::new_rgb8(40, 30)
            .write_to(&mut Cursor::new(&mut buffer), ImageFormat::Jpeg)
            .unwrap();
        data_url::encode("image/jpeg", &buffer)
    }

    async fn consistent(f: &Fixture) -> (Value, Value) {
        let photo = f.documents.save_document("pets", "willow.jpg", &jpeg_url()).await.unwrap();
        let report = f
            .documents
            .save_document("vet", "x-ray.pdf", &data_url::encode("application/pdf", b"%PDF"))
            .await
            .unwrap();

        let photo = photo.to_value().unwrap();
        let report = report.to_value().unwrap();
        f.records
            .save("pets", &[json!({"id": "p1", "name": "Willow", "photo": photo})])
            .await
            .unwrap();
        f.records
            .save(
                "vet_visits",
                &[json!({"id": "v1", "details": {"attachments": [report]}})],
            )
            .await
            .unwrap();
        (photo, report)
    }

    #[tokio::test]
    async fn test_consistent_store() {
        let f = fixture();
        consistent(&f).await;

        let report = f.checker.run().await.unwrap();
        assert_eq!(report.categories, vec!["pets", "vet"]);
        assert_eq!(report.collections_scanned, 2);
        assert_eq!(report.matched.len(), 2);
        assert!(report.missing.is_empty());
        assert!(report.orphaned.is_empty());
        assert!(report.is_consistent());

        let nested = report.matched.iter().find(|m| m.collection == "vet_visits").unwrap();
        assert_eq!(nested.record_id.as_deref(), Some("v1"));
        assert_eq!(nested.category, "vet");
    }

    #[tokio::test]
    async fn test_deleted_file_is_one_missing() {
        let f = fixture();
        let (_photo, report_ref) = consistent(&f).await;
        let path = report_ref["encryptedPath"].as_str().unwrap().to_string();
        f.backend.remove(&path).await.unwrap();

        let report = f.checker.run().await.unwrap();
        assert_eq!(report.missing.len(), 1);
        assert_eq!(report.missing[0].encrypted_path, path);
        assert!(report.orphaned.is_empty());
    }

    #[tokio::test]
    async fn test_deleted_reference_is_one_orphan() {
        let f = fixture();
        let (photo, _report_ref) = consistent(&f).await;
        f.records
            .save("pets", &[json!({"id": "p1", "name": "Willow"})])
            .await
            .unwrap();

        let report = f.checker.run().await.unwrap();
        assert_eq!(report.orphaned.len(), 1);
        assert!(report.missing.is_empty());

        let orphan = &report.orphaned[0];
        assert_eq!(orphan.category, "pets");
        assert_eq!(orphan.path(), photo["encryptedPath"].as_str().unwrap());
        assert!(orphan.thumbnail.is_some());
    }

    #[tokio::test]
    async fn test_missing_thumbnail_and_unreadable() {
        let f = fixture();
        let (photo, _report_ref) = consistent(&f).await;
        f.backend
            .remove(photo["thumbnailPath"].as_str().unwrap())
            .await
            .unwrap();
        f.backend
            .write("broken.encrypted.json", b"\"bm90IGEgYmxvYg==\"")
            .await
            .unwrap();

        let report = f.checker.run().await.unwrap();
        assert_eq!(report.missing_thumbnails.len(), 1);
        assert_eq!(report.unreadable_collections.len(), 1);
        assert_eq!(report.unreadable_collections[0].collection, "broken");
        assert!(report.orphaned.is_empty());
        assert!(!report.is_consistent());
    }

    #[tokio::test]
    async fn test_stray_thumbnail_is_orphan() {
        let f = fixture();
        f.backend
            .write("documents/pets/doc_9_zz.png.thumb.encrypted", b"x")
            .await
            .unwrap();

        let report = f.checker.run().await.unwrap();
        assert_eq!(report.orphaned.len(), 1);
        assert_eq!(report.orphaned[0].file, "doc_9_zz.png.thumb.encrypted");
    }

    #[test]
    fn test_structural_detection() {
        let record = json!({
            "id": "r1",
            "scan": {"id": "d1", "encryptedPath": "documents/a/d1.pdf.encrypted"},
            "list": [{"id": "d2", "encryptedPath": "documents/b/d2.png.encrypted", "thumbnailPath": "t"}],
            "notADoc": {"id": "x", "path": "y"},
            "numericId": {"id": 5, "encryptedPath": "z"}
        });
        let mut found = Vec::new();
        collect_references(&record, &mut found);

        let mut ids: Vec<_> = found.iter().map(|r| r.id).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec!["d1", "d2"]);

        let d2 = found.iter().find(|r| r.id == "d2").unwrap();
        assert_eq!(d2.thumbnail_path, Some("t"));
    }

    #[test]
    fn test_pick_category_prefers_path() {
        assert_eq!(pick_category("documents/vet/a.encrypted", &["pets", "vet"]), Some("vet"));
        assert_eq!(pick_category("documents/old/a.encrypted", &["pets", "vet"]), Some("pets"));
        assert_eq!(pick_category("a.encrypted", &[]), None);
    }
}
