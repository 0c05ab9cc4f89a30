//! # ALFA Data Vault
//!
//! Encrypted local storage for structured records and file attachments.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    ALFA DATA VAULT                       │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────┐  │
//! │  │  RECORDS    │  │  DOCUMENTS  │  │  BACKUP /       │  │
//! │  │  + MIGRATE  │  │  + THUMBS   │  │  INTEGRITY      │  │
//! │  └──────┬──────┘  └──────┬──────┘  └────────┬────────┘  │
//! │         │                │                   │           │
//! │  ┌──────┴────────────────┴───────────────────┴────────┐ │
//! │  │        MASTER KEY (DEK) wrapped by PBKDF2 KEK       │ │
//! │  └──────────────────────────┬──────────────────────────┘ │
//! │  ┌──────────────────────────┴──────────────────────────┐ │
//! │  │     STORAGE BACKEND (local files / in-memory)       │ │
//! │  └─────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Security Model
//!
//! - Records and documents encrypted with AES-256-GCM under one random DEK
//! - The DEK is wrapped by a key derived from the password (PBKDF2-HMAC-SHA256)
//! - Changing the password rewrites only the wrapped key
//! - Backups copy ciphertext verbatim
//! - Keys zeroized on lock

pub mod backup;
pub mod config;
pub mod crypto;
pub mod data_url;
pub mod documents;
pub mod error;
pub mod integrity;
pub mod master_key;
pub mod migration;
pub mod records;
pub mod storage;
pub mod thumbs;
pub mod vault;

pub use backup::{BackupManifest, BackupService, ReconcileStatus, ReconciliationReport, RestoreReport};
pub use config::VaultConfig;
pub use documents::{DocumentReference, DocumentStore};
pub use error::{VaultError, VaultResult};
pub use integrity::{IntegrityChecker, IntegrityReport};
pub use master_key::{Bootstrap, MasterKeyManager};
pub use migration::{Migration, MigrationRegistry};
pub use records::RecordStore;
pub use storage::StorageBackend;
pub use thumbs::ThumbnailEngine;
pub use vault::{DataVault, VaultState};

/// ALFA Data Vault version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
