//! Graph traversal: BFS, Dijkstra, and A* over the in-memory topology.
//!
//! Scan-level filters (graph id, edge type, temporal validity at the
//! query time) restrict which edges are traversable at all. Vertex and
//! edge *predicates* are different: they may only suppress entries from
//! the result at admitted depths, never prune expansion earlier — until
//! a predicate is declared path-wide, pruning mid-path would change the
//! reachable set. Suppressed entries are counted in the metrics.
//!
//! BFS yields between depth levels, which is where the frontier cap and
//! the deadline fire. Dijkstra and A* check the deadline every few
//! hundred heap pops. Edge weight defaults to 1.0 where absent; the A*
//! heuristic is a caller-supplied lower bound on remaining cost.

use rustc_hash::FxHashMap;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use themis_core::deadline::Deadline;
use themis_core::error::{Result, ThemisError};
use themis_core::value::Value;
use themis_index::graph::topology::{EdgeIdx, GraphTopology, NodeIdx};
use themis_index::graph::Edge;

/// Traversal direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraverseDirection {
    /// Follow edges from source to target.
    Outbound,
    /// Follow edges from target to source.
    Inbound,
    /// Follow both directions.
    Any,
}

/// Traversal algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraversalMode {
    /// Uniform-cost breadth-first search.
    Bfs,
    /// Weighted shortest paths.
    Dijkstra,
    /// Weighted shortest paths with a heuristic.
    AStar,
}

/// One traversal request.
#[derive(Debug, Clone)]
pub struct TraversalSpec {
    /// Named graph.
    pub graph: String,
    /// Start vertex pk.
    pub start: String,
    /// Minimum reported depth (0 reports the start vertex).
    pub min_depth: u32,
    /// Maximum expanded depth.
    pub max_depth: u32,
    /// Direction.
    pub direction: TraverseDirection,
    /// Scan-level edge-type restriction.
    pub edge_type: Option<String>,
    /// Temporal filter: only edges live at this time are traversable.
    pub time_at: Option<i64>,
    /// Soft cap on the frontier per depth level.
    pub frontier_limit: Option<usize>,
    /// Soft cap on reported entries.
    pub result_limit: Option<usize>,
    /// Algorithm.
    pub mode: TraversalMode,
}

impl TraversalSpec {
    /// A BFS spec with no caps or filters.
    pub fn bfs(
        graph: impl Into<String>,
        start: impl Into<String>,
        min_depth: u32,
        max_depth: u32,
        direction: TraverseDirection,
    ) -> Self {
        TraversalSpec {
            graph: graph.into(),
            start: start.into(),
            min_depth,
            max_depth,
            direction,
            edge_type: None,
            time_at: None,
            frontier_limit: None,
            result_limit: None,
            mode: TraversalMode::Bfs,
        }
    }
}

/// One reported vertex.
#[derive(Debug, Clone)]
pub struct TraversalEntry {
    /// The vertex pk.
    pub vertex: String,
    /// The edge that admitted it (absent for the start vertex).
    pub edge: Option<Edge>,
    /// Full path from the start, start and vertex included.
    pub path: Vec<String>,
    /// Depth in hops.
    pub depth: u32,
    /// Accumulated cost (hops for BFS, summed weights otherwise).
    pub cost: f64,
}

/// Operator metrics reported through explain.
#[derive(Debug, Clone, Default)]
pub struct TraversalMetrics {
    /// Frontier size per depth level, level 0 first.
    pub frontier_size_by_depth: Vec<usize>,
    /// Entries suppressed by vertex/edge predicates at admitted depths.
    pub pruned_last_level: usize,
    /// Times the frontier cap truncated a level.
    pub frontier_limit_hits: usize,
    /// Whether the result cap stopped the traversal.
    pub result_limit_hit: bool,
}

/// Traversal output.
#[derive(Debug, Clone, Default)]
pub struct TraversalResult {
    /// Reported entries, in visit order.
    pub entries: Vec<TraversalEntry>,
    /// Metrics.
    pub metrics: TraversalMetrics,
}

/// Optional result predicates. Applied only at admitted depths.
pub struct TraversalPredicates<'a> {
    /// Predicate over the vertex record value (`Value::Null` when the
    /// vertex has no record).
    pub vertex: Option<&'a dyn Fn(&str, &Value) -> bool>,
    /// Predicate over the admitting edge.
    pub edge: Option<&'a dyn Fn(&Edge) -> bool>,
    /// Record lookup used to feed the vertex predicate.
    pub load_vertex: Option<&'a dyn Fn(&str) -> Value>,
}

impl<'a> Default for TraversalPredicates<'a> {
    fn default() -> Self {
        TraversalPredicates {
            vertex: None,
            edge: None,
            load_vertex: None,
        }
    }
}

struct Admission<'a> {
    predicates: &'a TraversalPredicates<'a>,
    result_limit: Option<usize>,
    pruned: usize,
    limit_hit: bool,
}

impl<'a> Admission<'a> {
    fn admit(
        &mut self,
        out: &mut Vec<TraversalEntry>,
        entry: TraversalEntry,
    ) -> bool {
        if let Some(limit) = self.result_limit {
            if out.len() >= limit {
                self.limit_hit = true;
                return false;
            }
        }
        if let Some(edge_pred) = self.predicates.edge {
            if let Some(edge) = &entry.edge {
                if !edge_pred(edge) {
                    self.pruned += 1;
                    return true;
                }
            }
        }
        if let Some(vertex_pred) = self.predicates.vertex {
            let value = self
                .predicates
                .load_vertex
                .map(|load| load(&entry.vertex))
                .unwrap_or(Value::Null);
            if !vertex_pred(&entry.vertex, &value) {
                self.pruned += 1;
                return true;
            }
        }
        out.push(entry);
        true
    }
}

fn neighbors<'t>(
    topology: &'t GraphTopology,
    node: NodeIdx,
    spec: &'t TraversalSpec,
) -> Vec<(EdgeIdx, &'t Edge, NodeIdx)> {
    let edge_type = spec.edge_type.as_deref();
    let mut out = Vec::new();
    if matches!(spec.direction, TraverseDirection::Outbound | TraverseDirection::Any) {
        for (idx, slot) in topology.out_edges(node, edge_type) {
            out.push((idx, &slot.edge, slot.to));
        }
    }
    if matches!(spec.direction, TraverseDirection::Inbound | TraverseDirection::Any) {
        for (idx, slot) in topology.in_edges(node, edge_type) {
            out.push((idx, &slot.edge, slot.from));
        }
    }
    if let Some(t) = spec.time_at {
        out.retain(|(_, edge, _)| edge.live_at(t));
    }
    out
}

fn rebuild_path(
    topology: &GraphTopology,
    parents: &FxHashMap<NodeIdx, (NodeIdx, EdgeIdx)>,
    start: NodeIdx,
    mut node: NodeIdx,
) -> Vec<String> {
    let mut path = vec![topology.pk_of(node).to_string()];
    while node != start {
        let (parent, _) = parents[&node];
        path.push(topology.pk_of(parent).to_string());
        node = parent;
    }
    path.reverse();
    path
}

/// Run a traversal over a materialized topology.
pub fn traverse(
    topology: &GraphTopology,
    spec: &TraversalSpec,
    predicates: &TraversalPredicates<'_>,
    deadline: &Deadline,
) -> Result<TraversalResult> {
    if spec.min_depth > spec.max_depth {
        return Err(ThemisError::schema_violation(
            "traversal minimum depth exceeds maximum",
        ));
    }
    match spec.mode {
        TraversalMode::Bfs => bfs(topology, spec, predicates, deadline),
        TraversalMode::Dijkstra => weighted(topology, spec, predicates, deadline, None),
        TraversalMode::AStar => {
            // Without a heuristic A* degenerates to Dijkstra.
            weighted(topology, spec, predicates, deadline, None)
        }
    }
}

/// Run an A* traversal with a caller-supplied heuristic (a lower bound
/// on remaining cost per vertex pk).
pub fn traverse_astar(
    topology: &GraphTopology,
    spec: &TraversalSpec,
    predicates: &TraversalPredicates<'_>,
    deadline: &Deadline,
    heuristic: &dyn Fn(&str) -> f64,
) -> Result<TraversalResult> {
    weighted(topology, spec, predicates, deadline, Some(heuristic))
}

fn start_entry(spec: &TraversalSpec) -> TraversalEntry {
    TraversalEntry {
        vertex: spec.start.clone(),
        edge: None,
        path: vec![spec.start.clone()],
        depth: 0,
        cost: 0.0,
    }
}

fn bfs(
    topology: &GraphTopology,
    spec: &TraversalSpec,
    predicates: &TraversalPredicates<'_>,
    deadline: &Deadline,
) -> Result<TraversalResult> {
    let mut result = TraversalResult::default();
    let mut admission = Admission {
        predicates,
        result_limit: spec.result_limit,
        pruned: 0,
        limit_hit: false,
    };

    if spec.min_depth == 0 {
        admission.admit(&mut result.entries, start_entry(spec));
    }

    let start = match topology.node(&spec.start) {
        Some(idx) => idx,
        None => {
            // The start vertex has no edges; only depth 0 can report.
            result.metrics.frontier_size_by_depth.push(0);
            result.metrics.pruned_last_level = admission.pruned;
            result.metrics.result_limit_hit = admission.limit_hit;
            return Ok(result);
        }
    };

    let mut visited: FxHashMap<NodeIdx, u32> = FxHashMap::default();
    let mut parents: FxHashMap<NodeIdx, (NodeIdx, EdgeIdx)> = FxHashMap::default();
    visited.insert(start, 0);
    let mut frontier = vec![start];
    result.metrics.frontier_size_by_depth.push(frontier.len());

    for depth in 1..=spec.max_depth {
        // Yield point between levels: deadline and caps fire here.
        deadline.check("graph traversal")?;
        let mut next: Vec<(NodeIdx, EdgeIdx)> = Vec::new();
        for &node in &frontier {
            for (edge_idx, _, target) in neighbors(topology, node, spec) {
                if visited.contains_key(&target) {
                    continue;
                }
                visited.insert(target, depth);
                parents.insert(target, (node, edge_idx));
                next.push((target, edge_idx));
            }
        }
        if let Some(limit) = spec.frontier_limit {
            if next.len() > limit {
                for (dropped, _) in next.drain(limit..) {
                    visited.remove(&dropped);
                    parents.remove(&dropped);
                }
                result.metrics.frontier_limit_hits += 1;
            }
        }
        result.metrics.frontier_size_by_depth.push(next.len());

        if depth >= spec.min_depth {
            for &(target, edge_idx) in &next {
                let entry = TraversalEntry {
                    vertex: topology.pk_of(target).to_string(),
                    edge: Some(edge_of(topology, edge_idx)),
                    path: rebuild_path(topology, &parents, start, target),
                    depth,
                    cost: depth as f64,
                };
                if !admission.admit(&mut result.entries, entry) {
                    break;
                }
            }
        }
        if admission.limit_hit || next.is_empty() {
            break;
        }
        frontier = next.into_iter().map(|(n, _)| n).collect();
    }

    result.metrics.pruned_last_level = admission.pruned;
    result.metrics.result_limit_hit = admission.limit_hit;
    Ok(result)
}

fn edge_of(topology: &GraphTopology, idx: EdgeIdx) -> Edge {
    topology.edge_at(idx).clone()
}

#[derive(Debug, PartialEq)]
struct HeapItem {
    priority: f64,
    cost: f64,
    depth: u32,
    node: NodeIdx,
    via: Option<EdgeIdx>,
}

impl Eq for HeapItem {}

impl PartialOrd for HeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapItem {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; invert for smallest-priority-first.
        other
            .priority
            .partial_cmp(&self.priority)
            .unwrap_or(Ordering::Equal)
            .then_with(|| other.depth.cmp(&self.depth))
    }
}

fn weighted(
    topology: &GraphTopology,
    spec: &TraversalSpec,
    predicates: &TraversalPredicates<'_>,
    deadline: &Deadline,
    heuristic: Option<&dyn Fn(&str) -> f64>,
) -> Result<TraversalResult> {
    let mut result = TraversalResult::default();
    let mut admission = Admission {
        predicates,
        result_limit: spec.result_limit,
        pruned: 0,
        limit_hit: false,
    };

    if spec.min_depth == 0 {
        admission.admit(&mut result.entries, start_entry(spec));
    }
    let start = match topology.node(&spec.start) {
        Some(idx) => idx,
        None => {
            result.metrics.pruned_last_level = admission.pruned;
            result.metrics.result_limit_hit = admission.limit_hit;
            return Ok(result);
        }
    };

    let mut best: FxHashMap<NodeIdx, f64> = FxHashMap::default();
    let mut parents: FxHashMap<NodeIdx, (NodeIdx, EdgeIdx)> = FxHashMap::default();
    let mut heap = BinaryHeap::new();
    best.insert(start, 0.0);
    heap.push(HeapItem {
        priority: 0.0,
        cost: 0.0,
        depth: 0,
        node: start,
        via: None,
    });

    let mut pops = 0usize;
    while let Some(item) = heap.pop() {
        pops += 1;
        if pops % 256 == 0 {
            deadline.check("graph traversal")?;
        }
        if admission.limit_hit {
            break;
        }
        // Stale heap entry: a cheaper path settled this node already.
        if best.get(&item.node).map_or(true, |&b| item.cost > b) {
            continue;
        }

        if item.depth >= spec.min_depth && item.depth > 0 {
            let entry = TraversalEntry {
                vertex: topology.pk_of(item.node).to_string(),
                edge: item.via.map(|idx| edge_of(topology, idx)),
                path: rebuild_path(topology, &parents, start, item.node),
                depth: item.depth,
                cost: item.cost,
            };
            admission.admit(&mut result.entries, entry);
        }
        if item.depth >= spec.max_depth {
            continue;
        }
        for (edge_idx, edge, target) in neighbors(topology, item.node, spec) {
            let weight = edge.weight.unwrap_or(1.0);
            if weight < 0.0 {
                return Err(ThemisError::schema_violation(format!(
                    "edge '{}' has a negative weight",
                    edge.id
                )));
            }
            let cost = item.cost + weight;
            if best.get(&target).map_or(true, |&b| cost < b) {
                best.insert(target, cost);
                parents.insert(target, (item.node, edge_idx));
                let priority = cost
                    + heuristic
                        .map(|h| h(topology.pk_of(target)))
                        .unwrap_or(0.0);
                heap.push(HeapItem {
                    priority,
                    cost,
                    depth: item.depth + 1,
                    node: target,
                    via: Some(edge_idx),
                });
            }
        }
    }

    result.metrics.pruned_last_level = admission.pruned;
    result.metrics.result_limit_hit = admission.limit_hit;
    Ok(result)
}
