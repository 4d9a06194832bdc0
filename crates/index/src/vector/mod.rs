//! Vector index: HNSW with a transactional registry and on-disk
//! persistence.
//!
//! Membership is split across two structures with different guarantees:
//!
//! - the **registry** (`vreg:{name}:{pk}` in the `index` column family)
//!   is maintained inside the record's transaction and is therefore
//!   always consistent with committed records;
//! - the **HNSW graph** is an in-memory structure reconciled right
//!   after commit under the index mutex. A crash between the two is
//!   healed on reopen, because loading falls back to rebuilding the
//!   graph from the registry.
//!
//! Searches take a shared view (the mutex held only around the graph
//! call), accept a whitelist (pk set or pk prefix) as a pre-filter, and
//! honor a per-call `ef_search` override. If the graph ever fails a
//! structural insert the index degrades to exact scans over the
//! registry, trading speed for correctness.

pub mod hnsw;
pub mod persist;

pub use hnsw::{Hnsw, Metric};

use crate::catalog::{IndexConfig, IndexDescriptor};
use crate::keys::{index_prefix, prefix, CF_INDEX};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use themis_core::deadline::Deadline;
use themis_core::error::{Result, ThemisError};
use themis_core::limits::{DEFAULT_HNSW_EF_CONSTRUCTION, DEFAULT_HNSW_EF_SEARCH, DEFAULT_HNSW_M};
use themis_core::types::Direction;
use themis_core::value::Value;
use themis_storage::{Snapshot, Store, StoreTxn};
use tracing::{info, warn};

/// Vector index configuration, fixed at create time except `ef_search`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorConfig {
    /// Vector dimension.
    pub dim: usize,
    /// Distance metric.
    pub metric: Metric,
    /// HNSW degree bound.
    pub m: usize,
    /// HNSW construction beam width.
    pub ef_construction: usize,
    /// Default search beam width; tunable at runtime and per call.
    pub ef_search: usize,
    /// Directory for the persistence triple; `None` disables saving.
    pub save_path: Option<String>,
    /// Save on clean shutdown.
    pub auto_save: bool,
}

impl VectorConfig {
    /// A config with the default HNSW tuning.
    pub fn new(dim: usize, metric: Metric) -> Self {
        VectorConfig {
            dim,
            metric,
            m: DEFAULT_HNSW_M,
            ef_construction: DEFAULT_HNSW_EF_CONSTRUCTION,
            ef_search: DEFAULT_HNSW_EF_SEARCH,
            save_path: None,
            auto_save: true,
        }
    }
}

/// A committed change the engine must reconcile into the in-memory
/// graph after the storage transaction lands.
#[derive(Debug, Clone, PartialEq)]
pub enum VectorChange {
    /// Insert or replace the vector of `pk`.
    Upsert {
        /// Index name.
        index: String,
        /// Primary key.
        pk: String,
        /// The new vector.
        vector: Vec<f32>,
    },
    /// Remove the vector of `pk`.
    Remove {
        /// Index name.
        index: String,
        /// Primary key.
        pk: String,
    },
}

fn config_of(descriptor: &IndexDescriptor) -> Result<&VectorConfig> {
    match &descriptor.config {
        IndexConfig::Vector(cfg) => Ok(cfg),
        _ => Err(ThemisError::internal(format!(
            "index '{}' is not a vector index",
            descriptor.name
        ))),
    }
}

fn reg_key(name: &str, pk: &str) -> Vec<u8> {
    let mut key = index_prefix(prefix::VECTOR_REG, name);
    key.extend_from_slice(pk.as_bytes());
    key
}

/// Stage the registry mutation for one record change. Returns the
/// change the engine must apply to the in-memory graph once the
/// transaction commits, if any.
pub fn apply(
    txn: &mut StoreTxn,
    descriptor: &IndexDescriptor,
    pk: &str,
    before: Option<&Value>,
    after: Option<&Value>,
) -> Result<Option<VectorChange>> {
    let cfg = config_of(descriptor)?;
    let field = &descriptor.fields[0];
    let old = before.and_then(|v| v.get_path(field)).and_then(Value::as_vector);
    let new = after.and_then(|v| v.get_path(field)).and_then(Value::as_vector);

    if let Some(vector) = &new {
        if vector.len() != cfg.dim {
            return Err(ThemisError::dimension_mismatch(cfg.dim, vector.len()));
        }
    }
    if old == new {
        return Ok(None);
    }
    match new {
        Some(vector) => {
            txn.put(CF_INDEX, &reg_key(&descriptor.name, pk), &bincode::serialize(&vector)?)?;
            Ok(Some(VectorChange::Upsert {
                index: descriptor.name.clone(),
                pk: pk.to_string(),
                vector,
            }))
        }
        None => {
            if old.is_some() {
                txn.delete(CF_INDEX, &reg_key(&descriptor.name, pk))?;
                Ok(Some(VectorChange::Remove {
                    index: descriptor.name.clone(),
                    pk: pk.to_string(),
                }))
            } else {
                Ok(None)
            }
        }
    }
}

/// Scan the full registry of an index at a snapshot.
pub fn scan_registry(
    store: &Store,
    snapshot: &Snapshot,
    name: &str,
) -> Result<Vec<(String, Vec<f32>)>> {
    let base = index_prefix(prefix::VECTOR_REG, name);
    let mut out = Vec::new();
    for (key, value) in store.prefix_iter(CF_INDEX, &base, snapshot, Direction::Forward) {
        let pk = String::from_utf8_lossy(&key[base.len()..]).into_owned();
        out.push((pk, bincode::deserialize(&value)?));
    }
    Ok(out)
}

/// Pre-filter for a whitelisted search.
#[derive(Debug, Clone)]
pub enum Whitelist {
    /// A materialized pk set.
    Pks(HashSet<String>),
    /// Every pk with this prefix.
    Prefix(String),
}

impl Whitelist {
    /// True when `pk` passes the filter.
    pub fn allows(&self, pk: &str) -> bool {
        match self {
            Whitelist::Pks(set) => set.contains(pk),
            Whitelist::Prefix(prefix) => pk.starts_with(prefix.as_str()),
        }
    }
}

#[derive(Default)]
struct VectorState {
    loaded: bool,
    hnsw: Option<Hnsw>,
    label_to_pk: Vec<String>,
    pk_to_label: FxHashMap<String, u32>,
    degraded: bool,
    dirty: bool,
}

/// One vector index: config plus the mutex-guarded in-memory state.
pub struct VectorIndex {
    name: String,
    collection: String,
    config: VectorConfig,
    state: Mutex<VectorState>,
}

impl VectorIndex {
    /// Create the runtime handle for a descriptor.
    pub fn from_descriptor(descriptor: &IndexDescriptor) -> Result<Self> {
        let config = config_of(descriptor)?.clone();
        Ok(VectorIndex {
            name: descriptor.name.clone(),
            collection: descriptor.collection.clone(),
            config,
            state: Mutex::new(VectorState::default()),
        })
    }

    /// Index name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The configuration.
    pub fn config(&self) -> &VectorConfig {
        &self.config
    }

    fn save_dir(&self) -> Option<PathBuf> {
        self.config
            .save_path
            .as_ref()
            .map(|base| PathBuf::from(base).join(&self.collection))
    }

    /// Load lazily: the persisted triple when present and matching,
    /// otherwise a rebuild from the registry. Called on the first
    /// search and before the first post-commit reconciliation.
    fn ensure_loaded(&self, state: &mut VectorState, store: &Store, snapshot: &Snapshot) -> Result<()> {
        if state.loaded {
            return Ok(());
        }
        if let Some(dir) = self.save_dir() {
            match persist::load(&dir, &self.config)? {
                Some((hnsw, labels)) => {
                    let mut pk_to_label = FxHashMap::default();
                    for (label, pk) in labels.iter().enumerate() {
                        if hnsw.contains(label as u32) {
                            pk_to_label.insert(pk.clone(), label as u32);
                        }
                    }
                    info!(index = %self.name, vectors = hnsw.len(), "vector index loaded from disk");
                    state.hnsw = Some(hnsw);
                    state.label_to_pk = labels;
                    state.pk_to_label = pk_to_label;
                    state.loaded = true;
                    return Ok(());
                }
                None => {}
            }
        }
        self.rebuild_from_store(state, store, snapshot)
    }

    /// Rebuild the graph from the registry at a snapshot.
    pub fn rebuild_from_store(
        &self,
        state: &mut VectorState,
        store: &Store,
        snapshot: &Snapshot,
    ) -> Result<()> {
        let mut hnsw = Hnsw::new(
            self.config.dim,
            self.config.metric,
            self.config.m,
            self.config.ef_construction,
        );
        let mut label_to_pk = Vec::new();
        let mut pk_to_label = FxHashMap::default();
        let mut degraded = false;
        let entries = scan_registry(store, snapshot, &self.name)?;
        let count = entries.len();
        for (pk, vector) in entries {
            match hnsw.insert(vector) {
                Ok(label) => {
                    debug_assert_eq!(label as usize, label_to_pk.len());
                    pk_to_label.insert(pk.clone(), label);
                    label_to_pk.push(pk);
                }
                Err(e) => {
                    warn!(index = %self.name, pk = %pk, error = %e, "HNSW insert failed; degrading to exact scans");
                    degraded = true;
                }
            }
        }
        info!(index = %self.name, vectors = count, degraded, "vector index rebuilt from registry");
        state.hnsw = Some(hnsw);
        state.label_to_pk = label_to_pk;
        state.pk_to_label = pk_to_label;
        state.degraded = degraded;
        state.loaded = true;
        state.dirty = true;
        Ok(())
    }

    /// Reconcile a committed change into the graph.
    pub fn apply_change(&self, change: &VectorChange) -> Result<()> {
        let mut state = self.state.lock();
        if !state.loaded {
            // Not materialized yet: the registry already has the change,
            // so the eventual load sees it.
            return Ok(());
        }
        match change {
            VectorChange::Upsert { pk, vector, .. } => {
                if let Some(&old_label) = state.pk_to_label.get(pk) {
                    if let Some(hnsw) = state.hnsw.as_mut() {
                        hnsw.remove(old_label);
                    }
                }
                let insert_result = state
                    .hnsw
                    .as_mut()
                    .map(|h| h.insert(vector.clone()))
                    .transpose();
                match insert_result {
                    Ok(Some(label)) => {
                        state.pk_to_label.insert(pk.clone(), label);
                        debug_assert_eq!(label as usize, state.label_to_pk.len());
                        state.label_to_pk.push(pk.clone());
                    }
                    Ok(None) => {}
                    Err(ThemisError::DimensionMismatch { expected, got }) => {
                        return Err(ThemisError::dimension_mismatch(expected, got));
                    }
                    Err(e) => {
                        warn!(index = %self.name, pk = %pk, error = %e, "HNSW insert failed; degrading to exact scans");
                        state.degraded = true;
                    }
                }
            }
            VectorChange::Remove { pk, .. } => {
                if let Some(label) = state.pk_to_label.remove(pk) {
                    if let Some(hnsw) = state.hnsw.as_mut() {
                        hnsw.remove(label);
                    }
                }
            }
        }
        state.dirty = true;
        Ok(())
    }

    /// k-NN search. Results are `(pk, distance)` sorted ascending by
    /// distance; `ef_override` trades recall for latency per call.
    pub fn search(
        &self,
        store: &Store,
        snapshot: &Snapshot,
        query: &[f32],
        k: usize,
        whitelist: Option<&Whitelist>,
        ef_override: Option<usize>,
        deadline: Option<&Deadline>,
    ) -> Result<Vec<(String, f32)>> {
        if query.len() != self.config.dim {
            return Err(ThemisError::dimension_mismatch(self.config.dim, query.len()));
        }
        let mut state = self.state.lock();
        self.ensure_loaded(&mut state, store, snapshot)?;

        if state.degraded {
            return self.exact_scan(store, snapshot, query, k, whitelist, deadline);
        }

        let ef = ef_override.unwrap_or(self.config.ef_search);
        let state_ref = &*state;
        let hnsw = state_ref.hnsw.as_ref().ok_or_else(|| {
            ThemisError::internal(format!("vector index '{}' has no graph", self.name))
        })?;
        let label_to_pk = &state_ref.label_to_pk;
        let filter = whitelist.map(|w| {
            move |label: u32| -> bool {
                label_to_pk
                    .get(label as usize)
                    .map(|pk| w.allows(pk))
                    .unwrap_or(false)
            }
        });
        let hits = match &filter {
            Some(f) => hnsw.search(query, k, ef, Some(f), deadline)?,
            None => hnsw.search(query, k, ef, None, deadline)?,
        };
        Ok(hits
            .into_iter()
            .filter_map(|(label, dist)| {
                label_to_pk.get(label as usize).map(|pk| (pk.clone(), dist))
            })
            .collect())
    }

    /// Exact scan over the registry: the degraded-mode and correctness
    /// fallback path.
    fn exact_scan(
        &self,
        store: &Store,
        snapshot: &Snapshot,
        query: &[f32],
        k: usize,
        whitelist: Option<&Whitelist>,
        deadline: Option<&Deadline>,
    ) -> Result<Vec<(String, f32)>> {
        let mut prepared = query.to_vec();
        if self.config.metric.normalizes() {
            hnsw::normalize(&mut prepared);
        }
        let mut hits = Vec::new();
        for (i, (pk, vector)) in scan_registry(store, snapshot, &self.name)?.into_iter().enumerate()
        {
            if i % 256 == 0 {
                if let Some(deadline) = deadline {
                    deadline.check("vector scan")?;
                }
            }
            if let Some(w) = whitelist {
                if !w.allows(&pk) {
                    continue;
                }
            }
            let mut v = vector;
            if self.config.metric.normalizes() {
                hnsw::normalize(&mut v);
            }
            hits.push((pk, self.config.metric.distance(&prepared, &v)));
        }
        hits.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(k);
        Ok(hits)
    }

    /// Persist the triple if configured and dirty. Called on clean
    /// shutdown and on explicit saves.
    pub fn save(&self) -> Result<bool> {
        let mut state = self.state.lock();
        if !state.loaded || !state.dirty {
            return Ok(false);
        }
        let dir = match self.save_dir() {
            Some(dir) => dir,
            None => return Ok(false),
        };
        let hnsw = state.hnsw.as_ref().ok_or_else(|| {
            ThemisError::internal(format!("vector index '{}' has no graph", self.name))
        })?;
        persist::save(&dir, &hnsw.dump(), &state.label_to_pk)?;
        info!(index = %self.name, dir = %dir.display(), "vector index saved");
        state.dirty = false;
        Ok(true)
    }

    /// Drop the in-memory state, forcing a reload on next use.
    pub fn unload(&self) {
        let mut state = self.state.lock();
        *state = VectorState::default();
    }
}
