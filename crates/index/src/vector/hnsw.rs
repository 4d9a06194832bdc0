//! Hierarchical Navigable Small World graph.
//!
//! A multi-layer proximity graph: every node lives on layer 0, and each
//! higher layer keeps an exponentially thinning subset used as an
//! express lane. Search descends greedily through the upper layers and
//! runs a best-first beam of width `ef` on layer 0. Inserts run the same
//! descent with `ef_construction` and wire the new node to its `M`
//! closest candidates per layer, pruning neighbor lists back to their
//! caps.
//!
//! Deletions tombstone the node: it keeps routing (removing it could
//! disconnect the graph) but never appears in results. Compaction is a
//! rebuild concern.
//!
//! Cosine vectors are L2-normalized on the way in and searched by inner
//! product; L2 and dot-product vectors are stored raw.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use themis_core::deadline::Deadline;
use themis_core::error::{Result, ThemisError};

/// Distance metric of a vector index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Metric {
    /// Euclidean distance.
    L2,
    /// Cosine distance (1 - cosine similarity), via normalization +
    /// inner product.
    Cosine,
    /// Negated dot product (so smaller is better, like the others).
    Dot,
}

impl Metric {
    /// Parse the wire name (`l2` / `cosine` / `dot`).
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "l2" => Ok(Metric::L2),
            "cosine" => Ok(Metric::Cosine),
            "dot" => Ok(Metric::Dot),
            other => Err(ThemisError::schema_violation(format!(
                "unknown vector metric '{}'",
                other
            ))),
        }
    }

    /// Wire name.
    pub fn name(self) -> &'static str {
        match self {
            Metric::L2 => "l2",
            Metric::Cosine => "cosine",
            Metric::Dot => "dot",
        }
    }

    /// True when vectors are pre-normalized at insert and query time.
    pub fn normalizes(self) -> bool {
        matches!(self, Metric::Cosine)
    }

    /// Distance between two prepared vectors (already normalized for
    /// cosine). Smaller is closer for every metric.
    pub fn distance(self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            Metric::L2 => a
                .iter()
                .zip(b)
                .map(|(x, y)| (x - y) * (x - y))
                .sum::<f32>()
                .sqrt(),
            Metric::Cosine => 1.0 - dot(a, b),
            Metric::Dot => -dot(a, b),
        }
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// L2-normalize in place; zero vectors stay zero.
pub fn normalize(v: &mut [f32]) {
    let norm = dot(v, v).sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

/// A candidate ordered by distance. The heap orderings below rely on
/// `Reverse`-style wrapping instead of a second struct.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Candidate {
    dist: f32,
    label: u32,
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap by distance; NaN sorts as equal (never produced by
        // finite inputs).
        self.dist
            .partial_cmp(&other.dist)
            .unwrap_or(Ordering::Equal)
            .then_with(|| self.label.cmp(&other.label))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Node {
    level: usize,
    /// Neighbor lists, one per layer `0..=level`.
    neighbors: Vec<Vec<u32>>,
}

/// Serializable dump of the whole graph (the `index.bin` payload).
#[derive(Debug, Serialize, Deserialize)]
pub struct HnswDump {
    /// Dimension.
    pub dim: usize,
    /// Metric.
    pub metric: Metric,
    /// Degree bound.
    pub m: usize,
    /// Construction beam width.
    pub ef_construction: usize,
    entry: Option<u32>,
    nodes: Vec<Node>,
    vectors: Vec<Vec<f32>>,
    deleted: Vec<bool>,
}

/// The in-memory HNSW index.
pub struct Hnsw {
    dim: usize,
    metric: Metric,
    m: usize,
    m_max0: usize,
    ef_construction: usize,
    level_mult: f64,
    entry: Option<u32>,
    nodes: Vec<Node>,
    vectors: Vec<Vec<f32>>,
    deleted: Vec<bool>,
    live: usize,
    rng: StdRng,
}

impl Hnsw {
    /// Create an empty index. `m` and `ef_construction` are fixed for
    /// the life of the index.
    pub fn new(dim: usize, metric: Metric, m: usize, ef_construction: usize) -> Self {
        let m = m.max(2);
        Hnsw {
            dim,
            metric,
            m,
            m_max0: m * 2,
            ef_construction: ef_construction.max(m),
            level_mult: 1.0 / (m as f64).ln(),
            entry: None,
            nodes: Vec::new(),
            vectors: Vec::new(),
            deleted: Vec::new(),
            live: 0,
            rng: StdRng::seed_from_u64(0x5eed_1e5),
        }
    }

    /// Dimension of stored vectors.
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// The metric.
    pub fn metric(&self) -> Metric {
        self.metric
    }

    /// Degree bound.
    pub fn m(&self) -> usize {
        self.m
    }

    /// Construction beam width.
    pub fn ef_construction(&self) -> usize {
        self.ef_construction
    }

    /// Number of live (non-tombstoned) vectors.
    pub fn len(&self) -> usize {
        self.live
    }

    /// True when no live vector is stored.
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    fn check_dim(&self, v: &[f32]) -> Result<()> {
        if v.len() != self.dim {
            return Err(ThemisError::dimension_mismatch(self.dim, v.len()));
        }
        Ok(())
    }

    fn prepare(&self, mut v: Vec<f32>) -> Vec<f32> {
        if self.metric.normalizes() {
            normalize(&mut v);
        }
        v
    }

    fn dist_to(&self, query: &[f32], label: u32) -> f32 {
        self.metric.distance(query, &self.vectors[label as usize])
    }

    fn sample_level(&mut self) -> usize {
        let r: f64 = self.rng.gen_range(f64::EPSILON..1.0);
        (-r.ln() * self.level_mult).floor() as usize
    }

    /// Insert a vector, returning its label. Labels are dense and never
    /// reused.
    pub fn insert(&mut self, vector: Vec<f32>) -> Result<u32> {
        self.check_dim(&vector)?;
        let vector = self.prepare(vector);
        let label = self.nodes.len() as u32;
        let level = self.sample_level();

        self.vectors.push(vector);
        self.deleted.push(false);
        self.nodes.push(Node {
            level,
            neighbors: vec![Vec::new(); level + 1],
        });
        self.live += 1;

        let entry = match self.entry {
            Some(e) => e,
            None => {
                self.entry = Some(label);
                return Ok(label);
            }
        };

        let query = self.vectors[label as usize].clone();
        let top_level = self.nodes[entry as usize].level;

        // Greedy descent through layers above the new node's level.
        let mut ep = entry;
        let mut layer = top_level;
        while layer > level {
            ep = self.greedy_step(&query, ep, layer);
            layer -= 1;
        }

        // Beam search + wiring on the layers the new node joins.
        let mut eps = vec![ep];
        let mut layer = level.min(top_level);
        loop {
            let found = self.search_layer(&query, &eps, self.ef_construction, layer, None)?;
            let chosen: Vec<u32> = found.iter().take(self.m).map(|c| c.label).collect();
            for &neighbor in &chosen {
                self.nodes[label as usize].neighbors[layer].push(neighbor);
                self.nodes[neighbor as usize].neighbors[layer].push(label);
                self.prune(neighbor, layer);
            }
            eps = found.iter().map(|c| c.label).collect();
            if eps.is_empty() {
                eps = vec![ep];
            }
            if layer == 0 {
                break;
            }
            layer -= 1;
        }

        if level > top_level {
            self.entry = Some(label);
        }
        Ok(label)
    }

    /// Trim a node's neighbor list on `layer` back to its cap, keeping
    /// the closest.
    fn prune(&mut self, node: u32, layer: usize) {
        let cap = if layer == 0 { self.m_max0 } else { self.m };
        let list = &self.nodes[node as usize].neighbors[layer];
        if list.len() <= cap {
            return;
        }
        let base = self.vectors[node as usize].clone();
        let mut scored: Vec<Candidate> = list
            .iter()
            .map(|&n| Candidate {
                dist: self.metric.distance(&base, &self.vectors[n as usize]),
                label: n,
            })
            .collect();
        scored.sort();
        scored.truncate(cap);
        self.nodes[node as usize].neighbors[layer] = scored.into_iter().map(|c| c.label).collect();
    }

    fn greedy_step(&self, query: &[f32], start: u32, layer: usize) -> u32 {
        let mut current = start;
        let mut current_dist = self.dist_to(query, current);
        loop {
            let mut improved = false;
            for &neighbor in &self.nodes[current as usize].neighbors[layer] {
                let d = self.dist_to(query, neighbor);
                if d < current_dist {
                    current = neighbor;
                    current_dist = d;
                    improved = true;
                }
            }
            if !improved {
                return current;
            }
        }
    }

    /// Best-first beam search on one layer. Returns up to `ef`
    /// candidates sorted by ascending distance. Tombstoned nodes are
    /// traversed but still returned here; result filtering happens in
    /// [`Hnsw::search`].
    fn search_layer(
        &self,
        query: &[f32],
        entry_points: &[u32],
        ef: usize,
        layer: usize,
        deadline: Option<&Deadline>,
    ) -> Result<Vec<Candidate>> {
        let mut visited = vec![false; self.nodes.len()];
        // Min-heap of frontier candidates (closest first) via Reverse.
        let mut frontier: BinaryHeap<std::cmp::Reverse<Candidate>> = BinaryHeap::new();
        // Max-heap of the current best `ef` results (farthest on top).
        let mut results: BinaryHeap<Candidate> = BinaryHeap::new();

        for &ep in entry_points {
            if visited[ep as usize] {
                continue;
            }
            visited[ep as usize] = true;
            let c = Candidate {
                dist: self.dist_to(query, ep),
                label: ep,
            };
            frontier.push(std::cmp::Reverse(c));
            results.push(c);
        }

        let mut steps = 0usize;
        while let Some(std::cmp::Reverse(current)) = frontier.pop() {
            steps += 1;
            if steps % 64 == 0 {
                if let Some(deadline) = deadline {
                    deadline.check("vector search")?;
                }
            }
            if let Some(worst) = results.peek() {
                if results.len() >= ef && current.dist > worst.dist {
                    break;
                }
            }
            for &neighbor in &self.nodes[current.label as usize].neighbors[layer] {
                if visited[neighbor as usize] {
                    continue;
                }
                visited[neighbor as usize] = true;
                let c = Candidate {
                    dist: self.dist_to(query, neighbor),
                    label: neighbor,
                };
                let worst = results.peek().map(|w| w.dist).unwrap_or(f32::INFINITY);
                if results.len() < ef || c.dist < worst {
                    frontier.push(std::cmp::Reverse(c));
                    results.push(c);
                    if results.len() > ef {
                        results.pop();
                    }
                }
            }
        }
        let mut out = results.into_vec();
        out.sort();
        Ok(out)
    }

    /// k-NN search. `filter` restricts which labels may appear in the
    /// result (tombstoned labels never do); the graph is still traversed
    /// through filtered nodes so connectivity is preserved.
    ///
    /// When `k` reaches the live size the search degrades to an exact
    /// scan, which also serves as the correctness fallback.
    pub fn search(
        &self,
        query: &[f32],
        k: usize,
        ef: usize,
        filter: Option<&dyn Fn(u32) -> bool>,
        deadline: Option<&Deadline>,
    ) -> Result<Vec<(u32, f32)>> {
        self.check_dim(query)?;
        if k == 0 || self.live == 0 {
            return Ok(Vec::new());
        }
        let query = self.prepare(query.to_vec());

        if k >= self.live {
            return self.brute_force(&query, k, filter);
        }

        let entry = match self.entry {
            Some(e) => e,
            None => return Ok(Vec::new()),
        };
        let mut ep = entry;
        let mut layer = self.nodes[entry as usize].level;
        while layer > 0 {
            ep = self.greedy_step(&query, ep, layer);
            layer -= 1;
        }

        let ef = ef.max(k);
        let found = self.search_layer(&query, &[ep], ef, 0, deadline)?;
        let mut out: Vec<(u32, f32)> = found
            .into_iter()
            .filter(|c| !self.deleted[c.label as usize])
            .filter(|c| filter.map_or(true, |f| f(c.label)))
            .map(|c| (c.label, c.dist))
            .take(k)
            .collect();

        // A restrictive filter can starve the beam; fall back to the
        // exact scan rather than return a short page.
        if out.len() < k && filter.is_some() {
            out = self.brute_force(&query, k, filter)?;
        }
        Ok(out)
    }

    /// Exact scan over every live vector.
    pub fn brute_force(
        &self,
        query: &[f32],
        k: usize,
        filter: Option<&dyn Fn(u32) -> bool>,
    ) -> Result<Vec<(u32, f32)>> {
        let mut all: Vec<(u32, f32)> = (0..self.nodes.len() as u32)
            .filter(|&label| !self.deleted[label as usize])
            .filter(|&label| filter.map_or(true, |f| f(label)))
            .map(|label| (label, self.dist_to(query, label)))
            .collect();
        all.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal));
        all.truncate(k);
        Ok(all)
    }

    /// Tombstone a label. Returns false when it was already gone.
    pub fn remove(&mut self, label: u32) -> bool {
        match self.deleted.get_mut(label as usize) {
            Some(flag) if !*flag => {
                *flag = true;
                self.live -= 1;
                true
            }
            _ => false,
        }
    }

    /// True when `label` exists and is live.
    pub fn contains(&self, label: u32) -> bool {
        self.deleted
            .get(label as usize)
            .map(|&d| !d)
            .unwrap_or(false)
    }

    /// Serialize the full graph state.
    pub fn dump(&self) -> HnswDump {
        HnswDump {
            dim: self.dim,
            metric: self.metric,
            m: self.m,
            ef_construction: self.ef_construction,
            entry: self.entry,
            nodes: self.nodes.clone(),
            vectors: self.vectors.clone(),
            deleted: self.deleted.clone(),
        }
    }

    /// Rebuild from a dump.
    pub fn from_dump(dump: HnswDump) -> Self {
        let live = dump.deleted.iter().filter(|&&d| !d).count();
        let m = dump.m.max(2);
        Hnsw {
            dim: dump.dim,
            metric: dump.metric,
            m,
            m_max0: m * 2,
            ef_construction: dump.ef_construction,
            level_mult: 1.0 / (m as f64).ln(),
            entry: dump.entry,
            nodes: dump.nodes,
            vectors: dump.vectors,
            deleted: dump.deleted,
            live,
            rng: StdRng::seed_from_u64(0x5eed_1e5),
        }
    }
}
