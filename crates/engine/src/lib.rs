//! # themis-engine
//!
//! The database facade: the entity layer (versioned, content-hashed
//! records), the transaction manager that keeps records and every index
//! in lockstep, graph traversal, vector search entry points, index
//! management, checkpoints, and the TTL sweep.
//!
//! [`Themis`] is the single entry point; everything else in the
//! workspace is plumbing underneath it or (the executor) a consumer on
//! top of it.

pub mod database;
pub mod entity;
pub mod options;
pub mod traverse;
pub mod txn;

pub use database::Themis;
pub use entity::Record;
pub use options::Options;
pub use traverse::{
    TraversalMetrics, TraversalMode, TraversalResult, TraversalSpec, TraverseDirection,
};
pub use txn::Transaction;
