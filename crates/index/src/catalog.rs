//! The index catalog.
//!
//! Descriptors live in the `catalog` column family under
//! `meta:{index_name}` and are cached in memory. Create, drop, and
//! rebuild serialize on one catalog mutex; everything else reads the
//! cache lock-free.

use crate::fulltext::AnalyzerConfig;
use crate::keys::CF_CATALOG;
use crate::vector::VectorConfig;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use themis_core::error::{Result, ThemisError};
use themis_core::key::validate_collection_name;
use themis_core::types::SchemaVersion;
use themis_storage::Store;
use tracing::info;

/// The eight index kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IndexKind {
    /// Equality on one field, or composite over several.
    Equality,
    /// Order-preserving range index; backs `SORT` and range filters.
    Range,
    /// Equality that skips null/missing values.
    Sparse,
    /// Morton-interleaved geo index.
    Geo,
    /// Expiry index derived from a timestamp field plus a TTL.
    Ttl,
    /// BM25 fulltext postings.
    Fulltext,
    /// Adjacency index over a named graph.
    Graph,
    /// HNSW vector index.
    Vector,
}

/// String collation for range indexes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Collation {
    /// Raw byte order.
    #[default]
    Binary,
    /// Case-insensitive: values are lowercased before encoding.
    Natural,
}

/// Closed per-kind option set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum IndexConfig {
    /// Equality / composite options.
    Equality {
        /// Reject a second pk for the same value vector.
        unique: bool,
    },
    /// Range options.
    Range {
        /// String collation.
        collation: Collation,
    },
    /// Sparse options.
    Sparse {
        /// Reject a second pk for the same (present) value.
        unique: bool,
    },
    /// Geo options: the sibling-field convention.
    Geo {
        /// Latitude field name.
        field_lat: String,
        /// Longitude field name.
        field_lon: String,
    },
    /// TTL options.
    Ttl {
        /// Field holding the base timestamp (epoch ms or ISO-8601).
        field: String,
        /// Seconds added to the base timestamp to get the expiry.
        ttl_seconds: i64,
    },
    /// Fulltext analyzer configuration, stored with the index so query
    /// time analyzes identically to index time.
    Fulltext(AnalyzerConfig),
    /// Vector index configuration.
    Vector(VectorConfig),
    /// Graph options.
    Graph {
        /// The named graph this index serves.
        graph_id: String,
    },
}

impl IndexConfig {
    /// The kind this config belongs to.
    pub fn kind(&self) -> IndexKind {
        match self {
            IndexConfig::Equality { .. } => IndexKind::Equality,
            IndexConfig::Range { .. } => IndexKind::Range,
            IndexConfig::Sparse { .. } => IndexKind::Sparse,
            IndexConfig::Geo { .. } => IndexKind::Geo,
            IndexConfig::Ttl { .. } => IndexKind::Ttl,
            IndexConfig::Fulltext(_) => IndexKind::Fulltext,
            IndexConfig::Vector(_) => IndexKind::Vector,
            IndexConfig::Graph { .. } => IndexKind::Graph,
        }
    }
}

/// One registered index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexDescriptor {
    /// Unique index name.
    pub name: String,
    /// Owning collection.
    pub collection: String,
    /// Indexed fields (dotted paths). Empty for graph indexes; one
    /// field for most kinds; several for composite equality.
    pub fields: Vec<String>,
    /// Kind-specific configuration.
    pub config: IndexConfig,
    /// Bumped on rebuild; invalidates outstanding cursors.
    pub schema_version: SchemaVersion,
}

impl IndexDescriptor {
    /// The index kind.
    pub fn kind(&self) -> IndexKind {
        self.config.kind()
    }
}

fn meta_key(name: &str) -> Vec<u8> {
    format!("meta:{}", name).into_bytes()
}

/// In-memory catalog over the `catalog` column family.
pub struct Catalog {
    store: Store,
    cache: DashMap<String, Arc<IndexDescriptor>>,
    /// Serializes create/drop/rebuild.
    ddl_lock: Mutex<()>,
}

impl Catalog {
    /// Load the catalog from the store.
    pub fn load(store: Store) -> Result<Self> {
        let catalog = Catalog {
            store,
            cache: DashMap::new(),
            ddl_lock: Mutex::new(()),
        };
        let snapshot = catalog.store.snapshot();
        for (_, value) in catalog
            .store
            .prefix_iter(CF_CATALOG, b"meta:", &snapshot, themis_core::Direction::Forward)
        {
            let descriptor: IndexDescriptor = bincode::deserialize(&value)?;
            catalog
                .cache
                .insert(descriptor.name.clone(), Arc::new(descriptor));
        }
        Ok(catalog)
    }

    /// Register a new index. Fails when the name is taken or the config
    /// shape is invalid for the kind.
    pub fn create(
        &self,
        name: &str,
        collection: &str,
        fields: Vec<String>,
        config: IndexConfig,
    ) -> Result<Arc<IndexDescriptor>> {
        let _ddl = self.ddl_lock.lock();
        validate_collection_name(collection)?;
        validate_shape(&fields, &config)?;
        if self.cache.contains_key(name) {
            return Err(ThemisError::schema_violation(format!(
                "index '{}' already exists",
                name
            )));
        }
        let descriptor = Arc::new(IndexDescriptor {
            name: name.to_string(),
            collection: collection.to_string(),
            fields,
            config,
            schema_version: 1,
        });
        self.persist(&descriptor)?;
        self.cache.insert(name.to_string(), descriptor.clone());
        info!(index = name, collection, "index created");
        Ok(descriptor)
    }

    /// Remove an index descriptor. The caller is responsible for
    /// deleting the index's entries.
    pub fn drop_index(&self, name: &str) -> Result<Arc<IndexDescriptor>> {
        let _ddl = self.ddl_lock.lock();
        let descriptor = self
            .cache
            .remove(name)
            .map(|(_, d)| d)
            .ok_or_else(|| ThemisError::not_found(format!("index '{}'", name)))?;
        let mut txn = self.store.begin();
        txn.delete(CF_CATALOG, &meta_key(name))?;
        txn.commit()?;
        info!(index = name, "index dropped");
        Ok(descriptor)
    }

    /// Bump the schema version after a rebuild, invalidating cursors
    /// issued against the old layout.
    pub fn bump_schema_version(&self, name: &str) -> Result<Arc<IndexDescriptor>> {
        let _ddl = self.ddl_lock.lock();
        let current = self
            .cache
            .get(name)
            .map(|d| d.clone())
            .ok_or_else(|| ThemisError::not_found(format!("index '{}'", name)))?;
        let mut bumped = (*current).clone();
        bumped.schema_version += 1;
        let bumped = Arc::new(bumped);
        self.persist(&bumped)?;
        self.cache.insert(name.to_string(), bumped.clone());
        Ok(bumped)
    }

    fn persist(&self, descriptor: &IndexDescriptor) -> Result<()> {
        let mut txn = self.store.begin();
        txn.put(
            CF_CATALOG,
            &meta_key(&descriptor.name),
            &bincode::serialize(descriptor)?,
        )?;
        txn.commit()?;
        Ok(())
    }

    /// Look up one index.
    pub fn get(&self, name: &str) -> Option<Arc<IndexDescriptor>> {
        self.cache.get(name).map(|d| d.clone())
    }

    /// All indexes, sorted by name.
    pub fn list(&self) -> Vec<Arc<IndexDescriptor>> {
        let mut all: Vec<_> = self.cache.iter().map(|e| e.value().clone()).collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// Indexes defined over one collection, sorted by name.
    pub fn for_collection(&self, collection: &str) -> Vec<Arc<IndexDescriptor>> {
        let mut matching: Vec<_> = self
            .cache
            .iter()
            .filter(|e| e.value().collection == collection)
            .map(|e| e.value().clone())
            .collect();
        matching.sort_by(|a, b| a.name.cmp(&b.name));
        matching
    }

    /// The first index of `kind` over `collection` whose field list is
    /// exactly `fields`, if any. The planner's lookup primitive.
    pub fn find(
        &self,
        collection: &str,
        kind: IndexKind,
        fields: &[String],
    ) -> Option<Arc<IndexDescriptor>> {
        self.for_collection(collection)
            .into_iter()
            .find(|d| d.kind() == kind && d.fields == fields)
    }
}

fn validate_shape(fields: &[String], config: &IndexConfig) -> Result<()> {
    let expect = |ok: bool, message: &str| -> Result<()> {
        if ok {
            Ok(())
        } else {
            Err(ThemisError::schema_violation(message))
        }
    };
    match config {
        IndexConfig::Equality { .. } => expect(
            !fields.is_empty(),
            "equality index requires at least one field",
        ),
        IndexConfig::Range { .. } | IndexConfig::Sparse { .. } | IndexConfig::Ttl { .. } => expect(
            fields.len() == 1,
            "this index kind requires exactly one field",
        ),
        IndexConfig::Geo { .. } => expect(
            fields.is_empty(),
            "geo indexes take their fields from the lat/lon config",
        ),
        IndexConfig::Fulltext(_) => {
            expect(fields.len() == 1, "fulltext index requires exactly one field")
        }
        IndexConfig::Vector(cfg) => {
            expect(fields.len() == 1, "vector index requires exactly one field")?;
            expect(cfg.dim > 0, "vector dimension must be positive")
        }
        IndexConfig::Graph { graph_id } => {
            expect(fields.is_empty(), "graph indexes take no fields")?;
            expect(!graph_id.is_empty(), "graph_id must not be empty")
        }
    }
}
