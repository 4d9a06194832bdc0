//! Explain output: the operator tree with estimates and actuals.
//!
//! Every rewrite and planner decision is judged against this tree; it
//! carries `estimated_rows` from the probe-based cost model and
//! `actual_rows`/`duration_ms` filled in during execution, plus
//! operator-specific details (index kind, frontier sizes, `ef_search`,
//! pruned counts).

use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Instant;

/// One operator in the explain tree.
#[derive(Debug, Clone, Serialize, Default)]
pub struct ExplainNode {
    /// Operator name (`IndexScan`, `Intersection`, `HashJoin`, ...).
    pub operator: String,
    /// Planner estimate, when the operator was costed.
    pub estimated_rows: Option<u64>,
    /// Rows the operator actually produced.
    pub actual_rows: u64,
    /// Wall time spent in the operator.
    pub duration_ms: f64,
    /// Operator-specific details.
    pub details: BTreeMap<String, String>,
    /// Child operators.
    pub children: Vec<ExplainNode>,
}

impl ExplainNode {
    /// A node with just a name.
    pub fn new(operator: impl Into<String>) -> Self {
        ExplainNode {
            operator: operator.into(),
            ..ExplainNode::default()
        }
    }

    /// Attach a detail entry.
    pub fn detail(mut self, key: &str, value: impl ToString) -> Self {
        self.details.insert(key.to_string(), value.to_string());
        self
    }

    /// Set the planner estimate.
    pub fn estimated(mut self, rows: usize) -> Self {
        self.estimated_rows = Some(rows as u64);
        self
    }

    /// Record actuals from a finished operator run.
    pub fn finish(mut self, actual_rows: usize, started: Instant) -> Self {
        self.actual_rows = actual_rows as u64;
        self.duration_ms = started.elapsed().as_secs_f64() * 1000.0;
        self
    }

    /// Add a child.
    pub fn child(mut self, node: ExplainNode) -> Self {
        self.children.push(node);
        self
    }

    /// Render as an indented tree, for logs and debugging.
    pub fn render(&self) -> String {
        let mut out = String::new();
        self.render_into(&mut out, 0);
        out
    }

    fn render_into(&self, out: &mut String, depth: usize) {
        for _ in 0..depth {
            out.push_str("  ");
        }
        out.push_str(&self.operator);
        if let Some(est) = self.estimated_rows {
            out.push_str(&format!(" est={}", est));
        }
        out.push_str(&format!(
            " rows={} time={:.2}ms",
            self.actual_rows, self.duration_ms
        ));
        for (k, v) in &self.details {
            out.push_str(&format!(" {}={}", k, v));
        }
        out.push('\n');
        for child in &self.children {
            child.render_into(out, depth + 1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tree_building_and_render() {
        let started = Instant::now();
        let scan = ExplainNode::new("IndexScan")
            .detail("index_kind", "range")
            .detail("index", "users_age_r")
            .estimated(128)
            .finish(120, started);
        let root = ExplainNode::new("Limit").finish(10, started).child(scan);

        assert_eq!(root.children.len(), 1);
        let rendered = root.render();
        assert!(rendered.contains("Limit"));
        assert!(rendered.contains("IndexScan"));
        assert!(rendered.contains("est=128"));
        assert!(rendered.contains("index_kind=range"));
        // Children are indented under parents.
        assert!(rendered.contains("\n  IndexScan"));
    }
}
