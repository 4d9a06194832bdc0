//! The `Themis` database facade.
//!
//! Owns the store, the index catalog, the per-index HNSW handles, and
//! the graph-topology registry. All public entry points — CRUD, edges,
//! traversal, searches, index management, checkpoints, the TTL sweep —
//! go through here; the AQL executor sits on top and consumes the same
//! surface.

use crate::entity::{self, Record};
use crate::options::Options;
use crate::traverse::{
    self, TraversalPredicates, TraversalResult, TraversalSpec,
};
use crate::txn::Transaction;
use dashmap::DashMap;
use parking_lot::RwLock;
use rayon::prelude::*;
use std::path::Path;
use std::sync::Arc;
use themis_core::deadline::Deadline;
use themis_core::error::{Result, ThemisError};
use themis_core::key::Pk;
use themis_core::limits::{BATCH_MATERIALIZE_THRESHOLD, MATERIALIZE_CHUNK_SIZE};
use themis_core::types::Direction;
use themis_core::value::Value;
use themis_index::catalog::{Catalog, IndexConfig, IndexDescriptor, IndexKind};
use themis_index::fulltext::{self, FulltextHit};
use themis_index::geo::{self, GeoHit};
use themis_index::graph::topology::TopologyRegistry;
use themis_index::keys::{index_prefix, prefix, CF_INDEX};
use themis_index::maintain;
use themis_index::ttl;
use themis_index::vector::{VectorIndex, Whitelist};
use themis_storage::{Snapshot, Store};
use tracing::{info, warn};

/// Callback invoked with the commit sequence after every successful
/// commit. The hook point for audit-log consumers.
pub type CommitObserver = Box<dyn Fn(u64) + Send + Sync>;

pub(crate) struct Shared {
    pub(crate) store: Store,
    pub(crate) catalog: Catalog,
    pub(crate) vectors: DashMap<String, Arc<VectorIndex>>,
    pub(crate) topology: TopologyRegistry,
    pub(crate) options: Options,
    pub(crate) commit_observer: RwLock<Option<CommitObserver>>,
}

impl Shared {
    pub(crate) fn vector_index(&self, name: &str) -> Option<Arc<VectorIndex>> {
        if let Some(handle) = self.vectors.get(name) {
            return Some(handle.clone());
        }
        // Registered in the catalog but not yet materialized (fresh
        // open): create the handle on demand.
        let descriptor = self.catalog.get(name)?;
        if descriptor.kind() != IndexKind::Vector {
            return None;
        }
        let handle = Arc::new(VectorIndex::from_descriptor(&descriptor).ok()?);
        self.vectors.insert(name.to_string(), handle.clone());
        Some(handle)
    }
}

/// The embedded multi-model database.
#[derive(Clone)]
pub struct Themis {
    shared: Arc<Shared>,
}

impl Themis {
    /// Open (or create) a database at `path`.
    pub fn open(path: impl AsRef<Path>, options: Options) -> Result<Self> {
        let store = Store::open(path, options.store.clone())?;
        Self::wrap(store, options)
    }

    /// An in-memory database for tests and ephemeral use.
    pub fn in_memory() -> Result<Self> {
        Self::wrap(Store::in_memory(), Options::in_memory())
    }

    fn wrap(store: Store, options: Options) -> Result<Self> {
        let catalog = Catalog::load(store.clone())?;
        let shared = Arc::new(Shared {
            store,
            catalog,
            vectors: DashMap::new(),
            topology: TopologyRegistry::new(),
            options,
            commit_observer: RwLock::new(None),
        });
        info!(indexes = shared.catalog.list().len(), "database opened");
        Ok(Themis { shared })
    }

    /// The underlying store (executor plumbing).
    pub fn store(&self) -> &Store {
        &self.shared.store
    }

    /// The index catalog (executor plumbing).
    pub fn catalog(&self) -> &Catalog {
        &self.shared.catalog
    }

    /// Open-time options.
    pub fn options(&self) -> &Options {
        &self.shared.options
    }

    /// Default deadline for a query, from the configured request
    /// timeout.
    pub fn default_deadline(&self) -> Deadline {
        Deadline::from_timeout_ms(self.shared.options.clamped_timeout_ms())
    }

    /// Pin a read snapshot at the newest commit.
    pub fn snapshot(&self) -> Snapshot {
        self.shared.store.snapshot()
    }

    /// Install the post-commit observer (audit hook).
    pub fn set_commit_observer(&self, observer: CommitObserver) {
        *self.shared.commit_observer.write() = Some(observer);
    }

    // ========================================================================
    // Transactions & CRUD
    // ========================================================================

    /// Begin a transaction.
    pub fn begin(&self) -> Transaction {
        Transaction::new(self.shared.clone(), self.shared.store.begin())
    }

    /// Run `f` inside a transaction: commit on `Ok`, abort on `Err`.
    pub fn transaction<T>(&self, f: impl FnOnce(&mut Transaction) -> Result<T>) -> Result<T> {
        let mut txn = self.begin();
        match f(&mut txn) {
            Ok(value) => {
                txn.commit()?;
                Ok(value)
            }
            Err(e) => {
                txn.abort();
                Err(e)
            }
        }
    }

    /// Auto-commit put. Returns the new record version.
    pub fn put(&self, collection: &str, key: &str, value: Value) -> Result<u64> {
        self.transaction(|txn| txn.put(collection, key, value))
    }

    /// Point read at the newest commit.
    pub fn get(&self, collection: &str, key: &str) -> Result<Option<Value>> {
        let pk = Pk::new(collection, key)?;
        let snapshot = self.snapshot();
        Ok(entity::get_snapshot(&self.shared.store, &snapshot, &pk)?.map(|r| r.value))
    }

    /// Point read including version and content hash.
    pub fn get_record(&self, collection: &str, key: &str) -> Result<Option<Record>> {
        let pk = Pk::new(collection, key)?;
        let snapshot = self.snapshot();
        entity::get_snapshot(&self.shared.store, &snapshot, &pk)
    }

    /// Auto-commit delete. Deleting a missing record is a no-op.
    pub fn delete(&self, collection: &str, key: &str) -> Result<()> {
        self.transaction(|txn| txn.delete(collection, key))
    }

    /// Auto-commit edge insert.
    pub fn add_edge(&self, edge: themis_index::graph::Edge) -> Result<()> {
        self.transaction(|txn| txn.add_edge(edge))
    }

    /// Auto-commit edge removal.
    pub fn remove_edge(&self, graph_id: &str, edge_id: &str) -> Result<themis_index::graph::Edge> {
        self.transaction(|txn| txn.remove_edge(graph_id, edge_id))
    }

    /// Materialize records for a sorted pk stream under one snapshot.
    /// Large batches fan out across the thread pool in fixed chunks.
    pub fn materialize(
        &self,
        snapshot: &Snapshot,
        pks: &[String],
    ) -> Result<Vec<(String, Option<Record>)>> {
        let fetch = |pk: &String| -> Result<(String, Option<Record>)> {
            let parsed = Pk::parse(pk)?;
            Ok((
                pk.clone(),
                entity::get_snapshot(&self.shared.store, snapshot, &parsed)?,
            ))
        };
        if pks.len() >= BATCH_MATERIALIZE_THRESHOLD {
            pks.par_chunks(MATERIALIZE_CHUNK_SIZE)
                .map(|chunk| chunk.iter().map(fetch).collect::<Result<Vec<_>>>())
                .collect::<Result<Vec<_>>>()
                .map(|chunks| chunks.into_iter().flatten().collect())
        } else {
            pks.iter().map(fetch).collect()
        }
    }

    // ========================================================================
    // Index management
    // ========================================================================

    /// Create an index and backfill it from the collection's current
    /// contents.
    pub fn create_index(
        &self,
        name: &str,
        collection: &str,
        fields: Vec<String>,
        config: IndexConfig,
    ) -> Result<Arc<IndexDescriptor>> {
        let descriptor = self.shared.catalog.create(name, collection, fields, config)?;
        if let Err(e) = self.backfill(&descriptor) {
            // Leave no half-built index behind.
            let _ = self.shared.catalog.drop_index(name);
            let _ = self.clear_entries(&descriptor);
            return Err(e);
        }
        Ok(descriptor)
    }

    /// Drop an index and delete its entries.
    pub fn drop_index(&self, name: &str) -> Result<()> {
        let descriptor = self.shared.catalog.drop_index(name)?;
        self.clear_entries(&descriptor)?;
        self.shared.vectors.remove(name);
        Ok(())
    }

    /// Rebuild an index online: clear, rescan under a fresh snapshot,
    /// bump the schema version (outstanding cursors invalidate).
    pub fn rebuild_index(&self, name: &str) -> Result<Arc<IndexDescriptor>> {
        let descriptor = self
            .shared
            .catalog
            .get(name)
            .ok_or_else(|| ThemisError::not_found(format!("index '{}'", name)))?;
        self.clear_entries(&descriptor)?;
        self.backfill(&descriptor)?;
        if descriptor.kind() == IndexKind::Vector {
            // A stale persistence triple must not outlive the rebuild:
            // the next load has to come from the fresh registry.
            if let IndexConfig::Vector(cfg) = &descriptor.config {
                if let Some(base) = &cfg.save_path {
                    let dir = std::path::Path::new(base).join(&descriptor.collection);
                    if dir.exists() {
                        std::fs::remove_dir_all(&dir)?;
                    }
                }
            }
            if let Some(handle) = self.shared.vectors.get(name) {
                handle.unload();
            }
        }
        if let IndexConfig::Graph { graph_id } = &descriptor.config {
            self.shared.topology.invalidate(graph_id);
        }
        let bumped = self.shared.catalog.bump_schema_version(name)?;
        info!(index = name, "index rebuilt");
        Ok(bumped)
    }

    /// All registered indexes.
    pub fn list_indexes(&self) -> Vec<Arc<IndexDescriptor>> {
        self.shared.catalog.list()
    }

    fn backfill(&self, descriptor: &IndexDescriptor) -> Result<()> {
        if descriptor.kind() == IndexKind::Graph {
            // Adjacency entries are written by edge mutations, not
            // derived from records.
            return Ok(());
        }
        let snapshot = self.snapshot();
        let records: Vec<_> = entity::scan_collection(
            &self.shared.store,
            &snapshot,
            &descriptor.collection,
            Direction::Forward,
            None,
        )
        .collect::<Result<Vec<_>>>()?;
        for chunk in records.chunks(512) {
            let mut txn = self.shared.store.begin();
            for (pk, record) in chunk {
                maintain::apply_one(
                    &mut txn,
                    descriptor,
                    &pk.to_string(),
                    None,
                    Some(&record.value),
                )?;
            }
            txn.commit()?;
        }
        Ok(())
    }

    fn clear_entries(&self, descriptor: &IndexDescriptor) -> Result<()> {
        let prefixes: &[&str] = match descriptor.kind() {
            IndexKind::Equality => &[prefix::EQUALITY],
            IndexKind::Sparse => &[prefix::SPARSE],
            IndexKind::Range => &[prefix::RANGE],
            IndexKind::Geo => &[prefix::GEO],
            IndexKind::Ttl => &[prefix::TTL],
            IndexKind::Fulltext => &[
                prefix::FULLTEXT,
                prefix::FT_DOC,
                prefix::FT_TERM,
                prefix::FT_STAT,
            ],
            IndexKind::Vector => &[prefix::VECTOR_REG],
            IndexKind::Graph => &[],
        };
        let snapshot = self.snapshot();
        for kind_prefix in prefixes {
            let scan_prefix = index_prefix(kind_prefix, &descriptor.name);
            let keys: Vec<_> = self
                .shared
                .store
                .prefix_iter(CF_INDEX, &scan_prefix, &snapshot, Direction::Forward)
                .map(|(k, _)| k)
                .collect();
            for chunk in keys.chunks(512) {
                let mut txn = self.shared.store.begin();
                for key in chunk {
                    txn.delete(CF_INDEX, key)?;
                }
                txn.commit()?;
            }
        }
        Ok(())
    }

    // ========================================================================
    // Search entry points
    // ========================================================================

    /// Fulltext BM25 search through a named index.
    pub fn fulltext_search(
        &self,
        index_name: &str,
        query: &str,
        limit: usize,
    ) -> Result<Vec<FulltextHit>> {
        let descriptor = self.descriptor_of_kind(index_name, IndexKind::Fulltext)?;
        let snapshot = self.snapshot();
        fulltext::search(&self.shared.store, &snapshot, &descriptor, query, limit)
    }

    /// Vector k-NN through a named index.
    pub fn vector_search_index(
        &self,
        index_name: &str,
        query: &[f32],
        k: usize,
        whitelist: Option<&Whitelist>,
        ef_search: Option<usize>,
    ) -> Result<Vec<(String, f32)>> {
        let handle = self
            .shared
            .vector_index(index_name)
            .ok_or_else(|| ThemisError::not_found(format!("vector index '{}'", index_name)))?;
        let snapshot = self.snapshot();
        let deadline = self.default_deadline();
        handle.search(
            &self.shared.store,
            &snapshot,
            query,
            k,
            whitelist,
            ef_search,
            Some(&deadline),
        )
    }

    /// Vector k-NN through the (single) vector index of a collection.
    pub fn vector_search(
        &self,
        collection: &str,
        query: &[f32],
        k: usize,
        whitelist: Option<&Whitelist>,
        ef_search: Option<usize>,
    ) -> Result<Vec<(String, f32)>> {
        let descriptor = self
            .shared
            .catalog
            .for_collection(collection)
            .into_iter()
            .find(|d| d.kind() == IndexKind::Vector)
            .ok_or_else(|| {
                ThemisError::not_found(format!("vector index on collection '{}'", collection))
            })?;
        self.vector_search_index(&descriptor.name, query, k, whitelist, ef_search)
    }

    /// Geo bounding-box search through a named index.
    pub fn geo_box_search(
        &self,
        index_name: &str,
        min_lat: f64,
        min_lon: f64,
        max_lat: f64,
        max_lon: f64,
    ) -> Result<Vec<GeoHit>> {
        let descriptor = self.descriptor_of_kind(index_name, IndexKind::Geo)?;
        let snapshot = self.snapshot();
        geo::scan_bbox(
            &self.shared.store,
            &snapshot,
            &descriptor,
            min_lat,
            min_lon,
            max_lat,
            max_lon,
        )
    }

    /// Geo radius search (inclusive boundary), sorted by distance.
    pub fn geo_radius_search(
        &self,
        index_name: &str,
        lat: f64,
        lon: f64,
        radius_km: f64,
    ) -> Result<Vec<(GeoHit, f64)>> {
        let descriptor = self.descriptor_of_kind(index_name, IndexKind::Geo)?;
        let snapshot = self.snapshot();
        geo::scan_radius(
            &self.shared.store,
            &snapshot,
            &descriptor,
            lat,
            lon,
            radius_km,
        )
    }

    fn descriptor_of_kind(&self, name: &str, kind: IndexKind) -> Result<Arc<IndexDescriptor>> {
        let descriptor = self
            .shared
            .catalog
            .get(name)
            .ok_or_else(|| ThemisError::not_found(format!("index '{}'", name)))?;
        if descriptor.kind() != kind {
            return Err(ThemisError::schema_violation(format!(
                "index '{}' is not a {:?} index",
                name, kind
            )));
        }
        Ok(descriptor)
    }

    // ========================================================================
    // Traversal
    // ========================================================================

    /// Run a traversal with no result predicates.
    pub fn traverse(&self, spec: &TraversalSpec) -> Result<TraversalResult> {
        self.traverse_with(spec, &TraversalPredicates::default(), &self.default_deadline())
    }

    /// Run a traversal with result predicates and an explicit deadline.
    pub fn traverse_with(
        &self,
        spec: &TraversalSpec,
        predicates: &TraversalPredicates<'_>,
        deadline: &Deadline,
    ) -> Result<TraversalResult> {
        let snapshot = self.snapshot();
        let topology =
            self.shared
                .topology
                .get_or_build(&self.shared.store, &snapshot, &spec.graph)?;
        let guard = topology.read();
        traverse::traverse(&guard, spec, predicates, deadline)
    }

    /// A* traversal with a caller heuristic.
    pub fn traverse_astar(
        &self,
        spec: &TraversalSpec,
        predicates: &TraversalPredicates<'_>,
        heuristic: &dyn Fn(&str) -> f64,
        deadline: &Deadline,
    ) -> Result<TraversalResult> {
        let snapshot = self.snapshot();
        let topology =
            self.shared
                .topology
                .get_or_build(&self.shared.store, &snapshot, &spec.graph)?;
        let guard = topology.read();
        traverse::traverse_astar(&guard, spec, predicates, deadline, heuristic)
    }

    // ========================================================================
    // TTL sweep, checkpoints, shutdown
    // ========================================================================

    /// Delete every record whose TTL expiry is at or before `now_ms`.
    /// Returns the number of deleted records.
    pub fn sweep_expired(&self, now_ms: i64) -> Result<usize> {
        let mut deleted = 0usize;
        for descriptor in self.shared.catalog.list() {
            if descriptor.kind() != IndexKind::Ttl {
                continue;
            }
            loop {
                let snapshot = self.snapshot();
                let expired = ttl::scan_expired(
                    &self.shared.store,
                    &snapshot,
                    &descriptor,
                    now_ms,
                    256,
                )?;
                if expired.is_empty() {
                    break;
                }
                for (_, pk) in &expired {
                    let parsed = Pk::parse(pk)?;
                    self.transaction(|txn| txn.delete(parsed.collection(), parsed.key()))?;
                    deleted += 1;
                }
            }
        }
        if deleted > 0 {
            info!(deleted, "TTL sweep removed expired records");
        }
        Ok(deleted)
    }

    /// Write a self-contained checkpoint into `dir`. Vector membership
    /// is part of the checkpoint through the registry; reopened stores
    /// rebuild the HNSW graphs lazily.
    pub fn checkpoint(&self, dir: impl AsRef<Path>) -> Result<()> {
        self.shared.store.create_checkpoint(dir)
    }

    /// Restore a checkpoint into a fresh data directory.
    pub fn restore_from_checkpoint(
        checkpoint_dir: impl AsRef<Path>,
        dest: impl AsRef<Path>,
    ) -> Result<()> {
        Store::restore_from_checkpoint(checkpoint_dir, dest)
    }

    /// Clean shutdown: save dirty vector indexes (where configured) and
    /// flush the store.
    pub fn close(&self) -> Result<()> {
        for entry in self.shared.vectors.iter() {
            let handle = entry.value();
            if handle.config().auto_save {
                if let Err(e) = handle.save() {
                    warn!(index = entry.key().as_str(), error = %e, "vector save failed on shutdown");
                }
            }
        }
        self.shared.store.close()
    }
}
