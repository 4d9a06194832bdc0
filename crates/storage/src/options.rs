//! Open-time options for the storage engine.

use themis_core::limits::DEFAULT_LOCK_TIMEOUT_MS;

/// How hard commits push bytes toward the disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DurabilityMode {
    /// Every commit appends to the WAL and fsyncs before returning.
    Strict,
    /// Commits append to the WAL; the OS decides when to flush.
    Buffered,
    /// No WAL at all. State lives and dies with the process.
    InMemory,
}

impl DurabilityMode {
    /// True when commits write WAL records.
    pub fn requires_wal(self) -> bool {
        !matches!(self, DurabilityMode::InMemory)
    }

    /// True when commits fsync.
    pub fn requires_sync(self) -> bool {
        matches!(self, DurabilityMode::Strict)
    }
}

/// zstd compression level pair for snapshot files. The hot level is used
/// for routine snapshot rewrites, the cold level for checkpoints, which
/// are written once and read rarely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressionLevel {
    /// Fast codec level for routine snapshot rewrites.
    pub hot: i32,
    /// Heavier codec level for checkpoint archives.
    pub cold: i32,
}

impl Default for CompressionLevel {
    fn default() -> Self {
        CompressionLevel { hot: 1, cold: 9 }
    }
}

/// Open-time configuration of the store.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Durability mode; `Buffered` by default.
    pub durability: DurabilityMode,
    /// Per-key write-lock acquisition timeout in milliseconds.
    pub lock_timeout_ms: u64,
    /// Snapshot compression levels.
    pub compression: CompressionLevel,
    /// WAL size (bytes) past which open/commit triggers compaction
    /// (snapshot rewrite + WAL truncation). Zero disables.
    pub wal_compaction_threshold: u64,
}

impl Default for StoreOptions {
    fn default() -> Self {
        StoreOptions {
            durability: DurabilityMode::Buffered,
            lock_timeout_ms: DEFAULT_LOCK_TIMEOUT_MS,
            compression: CompressionLevel::default(),
            wal_compaction_threshold: 64 * 1024 * 1024,
        }
    }
}

impl StoreOptions {
    /// Options for tests: in-memory, short lock timeout.
    pub fn in_memory() -> Self {
        StoreOptions {
            durability: DurabilityMode::InMemory,
            lock_timeout_ms: 100,
            ..StoreOptions::default()
        }
    }
}
