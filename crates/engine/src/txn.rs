//! Engine transactions.
//!
//! A [`Transaction`] wraps a storage transaction and keeps the index
//! layer in lockstep: every record put/delete stages its index diffs in
//! the same batch, and every edge mutation stages both adjacency sides.
//! Commit applies the batch atomically and then reconciles the two
//! in-memory mirrors (HNSW graphs, graph topologies) with what just
//! committed. Abort — explicit or by drop — leaves no trace anywhere.

use crate::database::Shared;
use crate::entity;
use std::sync::Arc;
use themis_core::error::{Result, ThemisError};
use themis_core::key::Pk;
use themis_core::value::Value;
use themis_index::graph::{self, Edge};
use themis_index::maintain;
use themis_index::vector::VectorChange;
use themis_storage::StoreTxn;
use tracing::{debug, error};

/// A read-write transaction over records, indexes, and edges.
pub struct Transaction {
    shared: Arc<Shared>,
    inner: Option<StoreTxn>,
    vector_changes: Vec<VectorChange>,
    edge_adds: Vec<Edge>,
    edge_removals: Vec<(String, String)>,
}

impl Transaction {
    pub(crate) fn new(shared: Arc<Shared>, inner: StoreTxn) -> Self {
        Transaction {
            shared,
            inner: Some(inner),
            vector_changes: Vec::new(),
            edge_adds: Vec::new(),
            edge_removals: Vec::new(),
        }
    }

    fn txn(&mut self) -> Result<&mut StoreTxn> {
        self.inner
            .as_mut()
            .ok_or_else(|| ThemisError::internal("transaction already finished"))
    }

    /// Storage transaction id.
    pub fn id(&self) -> Option<u64> {
        self.inner.as_ref().map(|t| t.id())
    }

    /// Read a record (read-your-writes within this transaction).
    pub fn get(&self, collection: &str, key: &str) -> Result<Option<Value>> {
        let pk = Pk::new(collection, key)?;
        let txn = self
            .inner
            .as_ref()
            .ok_or_else(|| ThemisError::internal("transaction already finished"))?;
        Ok(entity::get_txn(txn, &pk)?.map(|r| r.value))
    }

    /// Write a record and maintain every index. Returns the new record
    /// version.
    pub fn put(&mut self, collection: &str, key: &str, value: Value) -> Result<u64> {
        let pk = Pk::new(collection, key)?;
        let shared = self.shared.clone();
        let txn = self.txn()?;
        let (before, record) = entity::put_txn(txn, &pk, value)?;
        let changes = maintain::apply_record_change(
            txn,
            &shared.catalog,
            &pk,
            before.as_ref().map(|r| &r.value),
            Some(&record.value),
        )?;
        self.vector_changes.extend(changes);
        Ok(record.version)
    }

    /// Delete a record and retract every index entry derived from it.
    /// Deleting a missing record is a no-op.
    pub fn delete(&mut self, collection: &str, key: &str) -> Result<()> {
        let pk = Pk::new(collection, key)?;
        let shared = self.shared.clone();
        let txn = self.txn()?;
        if let Some(before) = entity::delete_txn(txn, &pk)? {
            let changes = maintain::apply_record_change(
                txn,
                &shared.catalog,
                &pk,
                Some(&before.value),
                None,
            )?;
            self.vector_changes.extend(changes);
        }
        Ok(())
    }

    /// Insert (or rewrite) an edge.
    pub fn add_edge(&mut self, edge: Edge) -> Result<()> {
        let txn = self.txn()?;
        graph::add_edge(txn, &edge)?;
        self.edge_adds.push(edge);
        Ok(())
    }

    /// Remove an edge by id. Fails with `NotFound` when absent.
    pub fn remove_edge(&mut self, graph_id: &str, edge_id: &str) -> Result<Edge> {
        let txn = self.txn()?;
        let removed = graph::remove_edge(txn, graph_id, edge_id)?;
        self.edge_removals
            .push((graph_id.to_string(), edge_id.to_string()));
        Ok(removed)
    }

    /// Commit atomically across the entity layer and every index, then
    /// reconcile the in-memory mirrors.
    pub fn commit(mut self) -> Result<u64> {
        let txn = self
            .inner
            .take()
            .ok_or_else(|| ThemisError::internal("transaction already finished"))?;
        let seq = txn.commit()?;

        // The storage batch is durable; the mirrors follow. A mirror
        // failure here is an invariant violation, not a commit failure:
        // the registry and key space are the source of truth and a
        // rebuild recovers the mirror.
        for change in self.vector_changes.drain(..) {
            let name = match &change {
                VectorChange::Upsert { index, .. } | VectorChange::Remove { index, .. } => {
                    index.clone()
                }
            };
            if let Some(vector_index) = self.shared.vector_index(&name) {
                if let Err(e) = vector_index.apply_change(&change) {
                    error!(index = %name, error = %e, "vector mirror reconciliation failed");
                }
            }
        }
        for edge in self.edge_adds.drain(..) {
            self.shared.topology.apply_add(&edge);
        }
        for (graph_id, edge_id) in self.edge_removals.drain(..) {
            self.shared.topology.apply_remove(&graph_id, &edge_id);
        }

        if let Some(observer) = self.shared.commit_observer.read().as_ref() {
            observer(seq);
        }
        debug!(seq, "transaction committed");
        Ok(seq)
    }

    /// Discard everything.
    pub fn abort(mut self) {
        if let Some(txn) = self.inner.take() {
            txn.abort();
        }
        self.vector_changes.clear();
        self.edge_adds.clear();
        self.edge_removals.clear();
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if let Some(txn) = self.inner.take() {
            txn.abort();
        }
    }
}
