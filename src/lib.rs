//! # Themis
//!
//! A single-node, embedded multi-model database: relational rows,
//! property graphs, dense vectors, and fulltext documents behind one
//! transactional storage core and one query language (AQL).
//!
//! # Quick Start
//!
//! ```no_run
//! use themis::{Themis, Options, Value};
//!
//! fn main() -> themis::Result<()> {
//!     let db = Themis::open("./data", Options::default())?;
//!
//!     // Records live in collections under `collection:key`.
//!     db.put("users", "42", Value::object([
//!         ("name", Value::from("Alice")),
//!         ("age", Value::from(34i64)),
//!     ]))?;
//!
//!     // Everything is queryable through AQL.
//!     let result = themis::execute_aql(
//!         &db,
//!         "FOR u IN users FILTER u.age >= 18 SORT u.age RETURN u.name",
//!         Default::default(),
//!         themis::QueryOptions::new(),
//!     )?;
//!     for row in result.rows {
//!         println!("{}", row.to_json());
//!     }
//!     db.close()?;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! | Layer | Crate | Responsibility |
//! |-------|-------|----------------|
//! | Storage | `themis-storage` | ordered KV, MVCC snapshots, write locks, WAL, checkpoints |
//! | Entities & transactions | `themis-engine` | versioned records, atomic multi-index commits |
//! | Indexes | `themis-index` | equality/range/sparse/geo/TTL/fulltext, graph adjacency, HNSW |
//! | Query language | `themis-aql` | lexer, parser, boolean rewriting |
//! | Execution | `themis-executor` | optimizer, operators, cursors, fusion, explain |
//!
//! The [`Themis`] handle is the entry point for CRUD, edges, traversal,
//! vector and fulltext search, index management, checkpoints, and the
//! TTL sweep; [`execute_aql`] runs queries against it.

pub use themis_core::{CursorToken, Deadline, Direction, Pk, Result, ThemisError, Value};
pub use themis_engine::{
    Options, Record, Themis, Transaction, TraversalMetrics, TraversalMode, TraversalResult,
    TraversalSpec, TraverseDirection,
};
pub use themis_executor::{
    execute_aql, hybrid_search, ExplainNode, FusionHit, FusionMode, FusionRequest, QueryOptions,
    QueryResult,
};
pub use themis_index::catalog::{Collation, IndexConfig, IndexDescriptor, IndexKind};
pub use themis_index::fulltext::{AnalyzerConfig, Language};
pub use themis_index::graph::Edge;
pub use themis_index::vector::{Metric, VectorConfig, Whitelist};
pub use themis_storage::{CompressionLevel, DurabilityMode, StoreOptions};
