//! Graph adjacency index.
//!
//! Storage layout in the `graph` column family:
//!
//! ```text
//! out:{graph}\x00{from}\x00{type}\x00{eid} -> bincode(Edge)
//! in:{graph}\x00{to}\x00{type}\x00{eid}    -> bincode(Edge)
//! edge:{graph}\x00{eid}                    -> bincode(Edge)
//! ```
//!
//! The outbound entry and its inbound mirror are written and removed in
//! the same transaction, so they exist iff the edge is live. Filters on
//! graph id, node, and edge type are key components, answered at the
//! scan level rather than post-filtered. Multiple named graphs coexist
//! in the key space.
//!
//! The in-memory topology mirror for traversals lives in
//! [`topology`]; it is rebuilt from this key space on open or on demand
//! and updated incrementally as commits land.

pub mod topology;

pub use topology::{GraphTopology, TopologyRegistry};

use serde::{Deserialize, Serialize};
use themis_core::error::{Result, ThemisError};
use themis_core::types::Direction;
use themis_core::value::Value;
use themis_storage::{Snapshot, Store, StoreTxn};
use uuid::Uuid;

use crate::keys::CF_GRAPH;

/// A directed, typed edge between two records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    /// Edge id, unique within its graph.
    pub id: String,
    /// Named graph this edge belongs to.
    pub graph: String,
    /// Source pk.
    pub from: String,
    /// Target pk.
    pub to: String,
    /// Edge-type label.
    pub edge_type: String,
    /// Optional weight for Dijkstra / A*.
    pub weight: Option<f64>,
    /// Start of temporal validity (epoch ms), if bounded below.
    pub valid_from: Option<i64>,
    /// End of temporal validity (epoch ms), if bounded above.
    pub valid_to: Option<i64>,
    /// User properties.
    pub properties: Value,
}

impl Edge {
    /// Build an edge with a fresh id and no optional attributes.
    pub fn new(
        graph: impl Into<String>,
        from: impl Into<String>,
        to: impl Into<String>,
        edge_type: impl Into<String>,
    ) -> Self {
        Edge {
            id: Uuid::new_v4().to_string(),
            graph: graph.into(),
            from: from.into(),
            to: to.into(),
            edge_type: edge_type.into(),
            weight: None,
            valid_from: None,
            valid_to: None,
            properties: Value::Null,
        }
    }

    /// Builder: set the weight.
    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = Some(weight);
        self
    }

    /// Builder: set the validity interval.
    pub fn with_validity(mut self, valid_from: Option<i64>, valid_to: Option<i64>) -> Self {
        self.valid_from = valid_from;
        self.valid_to = valid_to;
        self
    }

    /// Builder: set user properties.
    pub fn with_properties(mut self, properties: Value) -> Self {
        self.properties = properties;
        self
    }

    /// True when the edge is live at time `t`: `valid_from <= t <=
    /// valid_to`, with a missing bound treated as unbounded.
    pub fn live_at(&self, t: i64) -> bool {
        self.valid_from.map_or(true, |from| from <= t)
            && self.valid_to.map_or(true, |to| t <= to)
    }
}

fn join(parts: &[&str]) -> Vec<u8> {
    let mut out = Vec::new();
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            out.push(0);
        }
        out.extend_from_slice(part.as_bytes());
    }
    out
}

fn out_key(edge: &Edge) -> Vec<u8> {
    let mut key = b"out:".to_vec();
    key.extend(join(&[&edge.graph, &edge.from, &edge.edge_type, &edge.id]));
    key
}

fn in_key(edge: &Edge) -> Vec<u8> {
    let mut key = b"in:".to_vec();
    key.extend(join(&[&edge.graph, &edge.to, &edge.edge_type, &edge.id]));
    key
}

fn edge_key(graph: &str, edge_id: &str) -> Vec<u8> {
    let mut key = b"edge:".to_vec();
    key.extend(join(&[graph, edge_id]));
    key
}

/// Stage an edge insert (or full rewrite of the same edge id).
pub fn add_edge(txn: &mut StoreTxn, edge: &Edge) -> Result<()> {
    if edge.graph.is_empty() || edge.from.is_empty() || edge.to.is_empty() {
        return Err(ThemisError::schema_violation(
            "edge requires graph, from, and to",
        ));
    }
    if let (Some(from), Some(to)) = (edge.valid_from, edge.valid_to) {
        if from > to {
            return Err(ThemisError::schema_violation(
                "edge validity interval is inverted",
            ));
        }
    }
    // Rewriting an existing id first retracts the old adjacency entries:
    // from/to/type may all have changed.
    if let Some(existing) = get_edge_txn(txn, &edge.graph, &edge.id) {
        txn.delete(CF_GRAPH, &out_key(&existing))?;
        txn.delete(CF_GRAPH, &in_key(&existing))?;
    }
    let body = bincode::serialize(edge)?;
    txn.put(CF_GRAPH, &out_key(edge), &body)?;
    txn.put(CF_GRAPH, &in_key(edge), &body)?;
    txn.put(CF_GRAPH, &edge_key(&edge.graph, &edge.id), &body)?;
    Ok(())
}

/// Stage an edge removal. Returns the removed edge.
pub fn remove_edge(txn: &mut StoreTxn, graph: &str, edge_id: &str) -> Result<Edge> {
    let edge = get_edge_txn(txn, graph, edge_id)
        .ok_or_else(|| ThemisError::not_found(format!("edge '{}' in graph '{}'", edge_id, graph)))?;
    txn.delete(CF_GRAPH, &out_key(&edge))?;
    txn.delete(CF_GRAPH, &in_key(&edge))?;
    txn.delete(CF_GRAPH, &edge_key(graph, edge_id))?;
    Ok(edge)
}

fn get_edge_txn(txn: &StoreTxn, graph: &str, edge_id: &str) -> Option<Edge> {
    txn.get(CF_GRAPH, &edge_key(graph, edge_id))
        .and_then(|bytes| bincode::deserialize(&bytes).ok())
}

/// Read one edge at a snapshot.
pub fn get_edge(store: &Store, snapshot: &Snapshot, graph: &str, edge_id: &str) -> Option<Edge> {
    store
        .get(CF_GRAPH, &edge_key(graph, edge_id), snapshot)
        .and_then(|bytes| bincode::deserialize(&bytes).ok())
}

/// Which adjacency side to scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdjacencyDirection {
    /// Edges out of the node.
    Outbound,
    /// Edges into the node.
    Inbound,
}

/// Scan the adjacency of one node, optionally restricted to an edge
/// type. Both restrictions are key prefixes, not post-filters.
pub fn scan_adjacency(
    store: &Store,
    snapshot: &Snapshot,
    graph: &str,
    node: &str,
    direction: AdjacencyDirection,
    edge_type: Option<&str>,
) -> Result<Vec<Edge>> {
    let side = match direction {
        AdjacencyDirection::Outbound => "out:",
        AdjacencyDirection::Inbound => "in:",
    };
    let mut prefix = side.as_bytes().to_vec();
    prefix.extend(join(&[graph, node]));
    prefix.push(0);
    if let Some(t) = edge_type {
        prefix.extend_from_slice(t.as_bytes());
        prefix.push(0);
    }

    let mut edges = Vec::new();
    for (_, value) in store.prefix_iter(CF_GRAPH, &prefix, snapshot, Direction::Forward) {
        edges.push(bincode::deserialize::<Edge>(&value)?);
    }
    Ok(edges)
}

/// All edges of one graph (rebuild and diagnostics path).
pub fn scan_graph_edges(store: &Store, snapshot: &Snapshot, graph: &str) -> Result<Vec<Edge>> {
    let mut prefix = b"edge:".to_vec();
    prefix.extend_from_slice(graph.as_bytes());
    prefix.push(0);
    let mut edges = Vec::new();
    for (_, value) in store.prefix_iter(CF_GRAPH, &prefix, snapshot, Direction::Forward) {
        edges.push(bincode::deserialize::<Edge>(&value)?);
    }
    Ok(edges)
}
