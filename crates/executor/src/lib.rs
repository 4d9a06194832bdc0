//! # themis-executor
//!
//! The query engine on top of the database facade: the optimizer that
//! turns a parsed AQL query into index scans, set operations, joins,
//! traversals, and post stages; the evaluator for the predicate
//! language; cursor paging; hybrid text+vector fusion; and the
//! `execute_aql` entry point with explain output.

pub mod eval;
pub mod exec;
pub mod explain;
pub mod fusion;
pub mod optimizer;
pub mod setops;
pub mod window;

pub use exec::{execute_aql, QueryOptions, QueryResult};
pub use explain::ExplainNode;
pub use fusion::{hybrid_search, FusionHit, FusionMode, FusionRequest};
