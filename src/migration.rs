//! ALFA Data Vault - Schema Migrations
//!
//! Each collection has a target schema version and an ordered list of record
//! transforms. Loading older data runs every transform between the stored
//! version and the target, in ascending order, exactly once.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::error::{VaultError, VaultResult};

/// Version assumed for data written before collections were tagged
pub const LEGACY_VERSION: u32 = 1;

/// A collection's records as stored
pub type Records = Vec<Value>;

type TransformFn = dyn Fn(Records) -> Result<Records, String> + Send + Sync;

/// One schema step
#[derive(Clone)]
pub struct Migration {
    pub version: u32,
    pub description: String,
    transform: Arc<TransformFn>,
}

impl Migration {
    pub fn new<F>(version: u32, description: impl Into<String>, transform: F) -> Self
    where
        F: Fn(Records) -> Result<Records, String> + Send + Sync + 'static,
    {
        Self {
            version,
            description: description.into(),
            transform: Arc::new(transform),
        }
    }

    /// Build a migration that rewrites each record independently
    pub fn per_record<F>(version: u32, description: impl Into<String>, transform: F) -> Self
    where
        F: Fn(Value) -> Result<Value, String> + Send + Sync + 'static,
    {
        Self::new(version, description, move |records: Records| {
            records.into_iter().map(&transform).collect()
        })
    }
}

impl fmt::Debug for Migration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Migration")
            .field("version", &self.version)
            .field("description", &self.description)
            .finish()
    }
}

/// Result of running the chain
#[derive(Debug, Clone, PartialEq)]
pub struct Migrated {
    pub records: Records,
    pub to_version: u32,
}

#[derive(Debug, Default, Clone)]
struct CollectionSchema {
    target: u32,
    migrations: Vec<Migration>,
}

/// Target versions and migrations for every collection
#[derive(Debug, Default, Clone)]
pub struct MigrationRegistry {
    collections: HashMap<String, CollectionSchema>,
}

impl MigrationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a migration. The collection's target rises to the highest
    /// registered version.
    pub fn register(&mut self, collection: &str, migration: Migration) -> VaultResult<&mut Self> {
        let schema = self
            .collections
            .entry(collection.to_string())
            .or_insert_with(|| CollectionSchema {
                target: LEGACY_VERSION,
                migrations: Vec::new(),
            });

        if migration.version <= LEGACY_VERSION {
            return Err(VaultError::InvalidConfig(format!(
                "migration for '{}' must target a version above {}",
                collection, LEGACY_VERSION
            )));
        }
        if schema.migrations.iter().any(|m| m.version == migration.version) {
            return Err(VaultError::InvalidConfig(format!(
                "duplicate migration v{} for '{}'",
                migration.version, collection
            )));
        }

        schema.target = schema.target.max(migration.version);
        schema.migrations.push(migration);
        schema.migrations.sort_by_key(|m| m.version);

        Ok(self)
    }

    /// Pin a collection's target version explicitly
    pub fn set_target(&mut self, collection: &str, version: u32) -> &mut Self {
        let schema = self.collections.entry(collection.to_string()).or_default();
        schema.target = version.max(LEGACY_VERSION);
        self
    }

    /// Current schema version for a collection. Unknown collections are v1.
    pub fn target_version(&self, collection: &str) -> u32 {
        self.collections
            .get(collection)
            .map(|s| s.target)
            .unwrap_or(LEGACY_VERSION)
    }

    /// Target versions of every registered collection
    pub fn targets(&self) -> BTreeMap<String, u32> {
        self.collections
            .iter()
            .map(|(name, schema)| (name.clone(), schema.target))
            .collect()
    }

    /// Check if data at `from_version` is behind the target
    pub fn needs_migration(&self, collection: &str, from_version: u32) -> bool {
        from_version < self.target_version(collection)
    }

    /// Advance records from `from_version` to the collection's target.
    ///
    /// Any failing step aborts the whole chain; the caller's stored data is
    /// never touched here. Data already at or beyond the target is returned
    /// unchanged.
    pub fn migrate(&self, collection: &str, records: Records, from_version: u32) -> VaultResult<Migrated> {
        let target = self.target_version(collection);

        if from_version >= target {
            if from_version > target {
                log::warn!(
                    "Collection '{}' is at v{}, newer than supported v{}; leaving as-is",
                    collection,
                    from_version,
                    target
                );
            }
            return Ok(Migrated {
                records,
                to_version: from_version,
            });
        }

        let steps = self
            .collections
            .get(collection)
            .map(|s| s.migrations.as_slice())
            .unwrap_or_default()
            .iter()
            .filter(|m| m.version > from_version && m.version <= target);

        let mut current = records;
        for step in steps {
            log::debug!(
                "Migrating '{}' to v{}: {}",
                collection,
                step.version,
                step.description
            );
            current = (step.transform)(current).map_err(|reason| VaultError::Migration {
                collection: collection.to_string(),
                version: step.version,
                reason,
            })?;
        }

        Ok(Migrated {
            records: current,
            to_version: target,
        })
    }
}
