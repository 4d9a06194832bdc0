//! Shared tuning constants and limits.
//!
//! Everything here maps 1:1 to an open-time option or index config; the
//! constants are the defaults those options fall back to.

/// Default per-key write-lock acquisition timeout.
pub const DEFAULT_LOCK_TIMEOUT_MS: u64 = 1_000;

/// Default process-wide request timeout for queries.
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;

/// Lower bound of the runtime-adjustable request timeout.
pub const MIN_REQUEST_TIMEOUT_MS: u64 = 1_000;

/// Upper bound of the runtime-adjustable request timeout.
pub const MAX_REQUEST_TIMEOUT_MS: u64 = 300_000;

/// Cap on keys read during a selectivity probe of one index predicate.
pub const SELECTIVITY_PROBE_CAP: usize = 64;

/// Entity-materialization batches above this key count fan out across
/// worker threads.
pub const BATCH_MATERIALIZE_THRESHOLD: usize = 100;

/// Chunk size for parallel entity materialization.
pub const MATERIALIZE_CHUNK_SIZE: usize = 50;

/// DNF rewriting stops expanding past this many conjuncts and keeps the
/// original predicate as a post-filter instead.
pub const DNF_CONJUNCT_CAP: usize = 32;

/// Default `k` for Reciprocal Rank Fusion.
pub const DEFAULT_RRF_K: f64 = 60.0;

/// BM25 term-saturation parameter.
pub const BM25_K1: f64 = 1.2;

/// BM25 length-normalization parameter.
pub const BM25_B: f64 = 0.75;

/// Earth radius used by the Haversine post-filter, in kilometers.
pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// Default HNSW graph degree.
pub const DEFAULT_HNSW_M: usize = 16;

/// Default HNSW construction beam width.
pub const DEFAULT_HNSW_EF_CONSTRUCTION: usize = 200;

/// Default HNSW search beam width.
pub const DEFAULT_HNSW_EF_SEARCH: usize = 64;
