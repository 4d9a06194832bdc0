//! In-memory graph topology mirror.
//!
//! Traversals need O(1) adjacency access, which the key space cannot
//! give without a scan per node. The mirror is an arena: node slots hold
//! per-node adjacency lists of indices into an edge arena, and edge
//! removal tombstones the slot (compaction happens on rebuild). Lookups
//! address slots by index, never by pointer, so the cyclic structure
//! needs no reference counting.
//!
//! Concurrency: one `RwLock` per graph. Edge mutations take the writer
//! lock after their transaction commits; traversal steps take the
//! reader lock. Rebuild swaps the whole arena under the writer lock.

use super::Edge;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use std::collections::HashMap;
use std::sync::Arc;
use themis_core::error::Result;
use themis_storage::{Snapshot, Store};
use tracing::debug;

/// Arena index of a node slot.
pub type NodeIdx = u32;
/// Arena index of an edge slot.
pub type EdgeIdx = u32;

#[derive(Debug, Default)]
struct NodeSlot {
    pk: String,
    out: SmallVec<[EdgeIdx; 4]>,
    inbound: SmallVec<[EdgeIdx; 4]>,
}

/// One edge in the arena. Tombstoned slots stay in place until the next
/// rebuild so indices remain stable.
#[derive(Debug, Clone)]
pub struct EdgeSlot {
    /// Source node index.
    pub from: NodeIdx,
    /// Target node index.
    pub to: NodeIdx,
    /// The edge itself.
    pub edge: Edge,
    /// True once removed.
    pub deleted: bool,
}

/// Adjacency arena of one named graph.
#[derive(Debug, Default)]
pub struct GraphTopology {
    nodes: Vec<NodeSlot>,
    edges: Vec<EdgeSlot>,
    by_pk: FxHashMap<String, NodeIdx>,
    by_edge_id: FxHashMap<String, EdgeIdx>,
    live_edges: usize,
}

impl GraphTopology {
    /// An empty topology.
    pub fn new() -> Self {
        GraphTopology::default()
    }

    fn intern(&mut self, pk: &str) -> NodeIdx {
        if let Some(&idx) = self.by_pk.get(pk) {
            return idx;
        }
        let idx = self.nodes.len() as NodeIdx;
        self.nodes.push(NodeSlot {
            pk: pk.to_string(),
            ..NodeSlot::default()
        });
        self.by_pk.insert(pk.to_string(), idx);
        idx
    }

    /// Node index of a pk, if the node participates in any edge.
    pub fn node(&self, pk: &str) -> Option<NodeIdx> {
        self.by_pk.get(pk).copied()
    }

    /// Pk of a node index.
    pub fn pk_of(&self, idx: NodeIdx) -> &str {
        &self.nodes[idx as usize].pk
    }

    /// Number of live edges.
    pub fn edge_count(&self) -> usize {
        self.live_edges
    }

    /// Number of known nodes (tombstoned edges keep their endpoints).
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Insert one edge into the arena.
    pub fn add(&mut self, edge: Edge) {
        if let Some(&existing) = self.by_edge_id.get(&edge.id) {
            // Rewrite of a known id: tombstone the old slot first.
            if !self.edges[existing as usize].deleted {
                self.edges[existing as usize].deleted = true;
                self.live_edges -= 1;
            }
        }
        let from = self.intern(&edge.from);
        let to = self.intern(&edge.to);
        let idx = self.edges.len() as EdgeIdx;
        self.by_edge_id.insert(edge.id.clone(), idx);
        self.edges.push(EdgeSlot {
            from,
            to,
            edge,
            deleted: false,
        });
        self.nodes[from as usize].out.push(idx);
        self.nodes[to as usize].inbound.push(idx);
        self.live_edges += 1;
    }

    /// Tombstone one edge by id.
    pub fn remove(&mut self, edge_id: &str) {
        if let Some(&idx) = self.by_edge_id.get(edge_id) {
            let slot = &mut self.edges[idx as usize];
            if !slot.deleted {
                slot.deleted = true;
                self.live_edges -= 1;
            }
        }
    }

    /// The edge stored at an arena index.
    pub fn edge_at(&self, idx: EdgeIdx) -> &Edge {
        &self.edges[idx as usize].edge
    }

    /// Iterate the live outbound edges of a node, optionally filtered by
    /// edge type.
    pub fn out_edges<'a>(
        &'a self,
        node: NodeIdx,
        edge_type: Option<&'a str>,
    ) -> impl Iterator<Item = (EdgeIdx, &'a EdgeSlot)> + 'a {
        self.adjacent(&self.nodes[node as usize].out, edge_type)
    }

    /// Iterate the live inbound edges of a node.
    pub fn in_edges<'a>(
        &'a self,
        node: NodeIdx,
        edge_type: Option<&'a str>,
    ) -> impl Iterator<Item = (EdgeIdx, &'a EdgeSlot)> + 'a {
        self.adjacent(&self.nodes[node as usize].inbound, edge_type)
    }

    fn adjacent<'a>(
        &'a self,
        list: &'a [EdgeIdx],
        edge_type: Option<&'a str>,
    ) -> impl Iterator<Item = (EdgeIdx, &'a EdgeSlot)> + 'a {
        list.iter().filter_map(move |&idx| {
            let slot = &self.edges[idx as usize];
            if slot.deleted {
                return None;
            }
            if let Some(t) = edge_type {
                if slot.edge.edge_type != t {
                    return None;
                }
            }
            Some((idx, slot))
        })
    }
}

/// Registry of per-graph topologies, built lazily from the key space.
#[derive(Default)]
pub struct TopologyRegistry {
    graphs: RwLock<HashMap<String, Arc<RwLock<GraphTopology>>>>,
}

impl TopologyRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        TopologyRegistry::default()
    }

    /// The topology of `graph`, rebuilding it from the store on first
    /// access.
    pub fn get_or_build(
        &self,
        store: &Store,
        snapshot: &Snapshot,
        graph: &str,
    ) -> Result<Arc<RwLock<GraphTopology>>> {
        if let Some(existing) = self.graphs.read().get(graph) {
            return Ok(existing.clone());
        }
        let rebuilt = self.rebuild(store, snapshot, graph)?;
        let mut graphs = self.graphs.write();
        // A racing builder may have won; keep whichever landed first.
        Ok(graphs
            .entry(graph.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(rebuilt)))
            .clone())
    }

    fn rebuild(&self, store: &Store, snapshot: &Snapshot, graph: &str) -> Result<GraphTopology> {
        let mut topology = GraphTopology::new();
        for edge in super::scan_graph_edges(store, snapshot, graph)? {
            topology.add(edge);
        }
        debug!(
            graph,
            nodes = topology.node_count(),
            edges = topology.edge_count(),
            "graph topology rebuilt"
        );
        Ok(topology)
    }

    /// Apply a committed edge insert to the mirror, if the graph is
    /// materialized. Unmaterialized graphs pick the edge up on rebuild.
    pub fn apply_add(&self, edge: &Edge) {
        if let Some(topology) = self.graphs.read().get(&edge.graph) {
            topology.write().add(edge.clone());
        }
    }

    /// Apply a committed edge removal to the mirror.
    pub fn apply_remove(&self, graph: &str, edge_id: &str) {
        if let Some(topology) = self.graphs.read().get(graph) {
            topology.write().remove(edge_id);
        }
    }

    /// Drop a materialized graph, forcing the next access to rebuild.
    pub fn invalidate(&self, graph: &str) {
        self.graphs.write().remove(graph);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use themis_core::value::Value;

    fn edge(id: &str, from: &str, to: &str, edge_type: &str) -> Edge {
        Edge {
            id: id.into(),
            graph: "g".into(),
            from: from.into(),
            to: to.into(),
            edge_type: edge_type.into(),
            weight: None,
            valid_from: None,
            valid_to: None,
            properties: Value::Null,
        }
    }

    #[test]
    fn test_adjacency_access() {
        let mut topo = GraphTopology::new();
        topo.add(edge("e1", "a", "b", "follows"));
        topo.add(edge("e2", "a", "c", "follows"));
        topo.add(edge("e3", "b", "a", "blocks"));

        let a = topo.node("a").unwrap();
        let out: Vec<_> = topo
            .out_edges(a, None)
            .map(|(_, s)| topo.pk_of(s.to))
            .collect();
        assert_eq!(out, vec!["b", "c"]);

        let inbound: Vec<_> = topo
            .in_edges(a, None)
            .map(|(_, s)| topo.pk_of(s.from))
            .collect();
        assert_eq!(inbound, vec!["b"]);
    }

    #[test]
    fn test_type_filter() {
        let mut topo = GraphTopology::new();
        topo.add(edge("e1", "a", "b", "follows"));
        topo.add(edge("e2", "a", "c", "blocks"));
        let a = topo.node("a").unwrap();
        let follows: Vec<_> = topo
            .out_edges(a, Some("follows"))
            .map(|(_, s)| topo.pk_of(s.to))
            .collect();
        assert_eq!(follows, vec!["b"]);
    }

    #[test]
    fn test_tombstoned_edges_skipped() {
        let mut topo = GraphTopology::new();
        topo.add(edge("e1", "a", "b", "t"));
        topo.add(edge("e2", "a", "c", "t"));
        assert_eq!(topo.edge_count(), 2);
        topo.remove("e1");
        assert_eq!(topo.edge_count(), 1);

        let a = topo.node("a").unwrap();
        let out: Vec<_> = topo.out_edges(a, None).map(|(_, s)| topo.pk_of(s.to)).collect();
        assert_eq!(out, vec!["c"]);

        // Removing twice is a no-op.
        topo.remove("e1");
        assert_eq!(topo.edge_count(), 1);
    }

    #[test]
    fn test_rewrite_same_id() {
        let mut topo = GraphTopology::new();
        topo.add(edge("e1", "a", "b", "t"));
        topo.add(edge("e1", "a", "c", "t"));
        assert_eq!(topo.edge_count(), 1);
        let a = topo.node("a").unwrap();
        let out: Vec<_> = topo.out_edges(a, None).map(|(_, s)| topo.pk_of(s.to)).collect();
        assert_eq!(out, vec!["c"]);
    }

    #[test]
    fn test_registry_builds_from_store_and_tracks_commits() {
        let store = Store::in_memory();
        let mut txn = store.begin();
        super::super::add_edge(&mut txn, &edge("e1", "a", "b", "t")).unwrap();
        txn.commit().unwrap();

        let registry = TopologyRegistry::new();
        let snap = store.snapshot();
        let topo = registry.get_or_build(&store, &snap, "g").unwrap();
        assert_eq!(topo.read().edge_count(), 1);

        // Incremental updates land in the mirror.
        registry.apply_add(&edge("e2", "b", "c", "t"));
        assert_eq!(topo.read().edge_count(), 2);
        registry.apply_remove("g", "e1");
        assert_eq!(topo.read().edge_count(), 1);

        // Invalidation forces a rebuild from the store, which only has e1.
        registry.invalidate("g");
        let snap = store.snapshot();
        let rebuilt = registry.get_or_build(&store, &snap, "g").unwrap();
        assert_eq!(rebuilt.read().edge_count(), 1);
    }
}
