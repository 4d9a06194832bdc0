//! # themis-index
//!
//! The index layer: eight index kinds behind one maintenance dispatch.
//!
//! Each kind is an independent maintainer. On a record mutation it
//! computes the difference of its indexable projection between the old
//! and new value and stages add/remove operations in the same storage
//! transaction, so a committed record and its index entries are never
//! observable apart. Scans return sorted primary-key streams, plus
//! scores where the kind produces them.
//!
//! Relational kinds (equality/composite, range, sparse, geo, TTL,
//! fulltext) live entirely in the `index` column family. The graph
//! adjacency index lives in the `graph` family with an in-memory
//! topology mirror. The vector index keeps its HNSW graph in memory,
//! backed by a transactional vector registry and an on-disk persistence
//! triple.

pub mod catalog;
pub mod equality;
pub mod fulltext;
pub mod geo;
pub mod graph;
pub mod keys;
pub mod maintain;
pub mod range;
pub mod ttl;
pub mod vector;

pub use catalog::{Catalog, Collation, IndexConfig, IndexDescriptor, IndexKind};
pub use maintain::apply_record_change;
