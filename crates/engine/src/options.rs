//! Open-time options of the database.

use themis_core::limits::{DEFAULT_REQUEST_TIMEOUT_MS, MAX_REQUEST_TIMEOUT_MS, MIN_REQUEST_TIMEOUT_MS};
use themis_storage::StoreOptions;

/// Configuration for [`crate::Themis::open`]. Environment-variable
/// driven deployments map their variables onto these fields 1:1.
#[derive(Debug, Clone)]
pub struct Options {
    /// Storage engine options (durability, lock timeout, compression,
    /// WAL compaction threshold).
    pub store: StoreOptions,
    /// Process-wide default request timeout for queries, in
    /// milliseconds. Clamped to the legal range at use.
    pub request_timeout_ms: u64,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            store: StoreOptions::default(),
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
        }
    }
}

impl Options {
    /// In-memory options for tests.
    pub fn in_memory() -> Self {
        Options {
            store: StoreOptions::in_memory(),
            ..Options::default()
        }
    }

    /// The request timeout clamped to the runtime-adjustable range.
    pub fn clamped_timeout_ms(&self) -> u64 {
        self.request_timeout_ms
            .clamp(MIN_REQUEST_TIMEOUT_MS, MAX_REQUEST_TIMEOUT_MS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_clamping() {
        let mut opts = Options::default();
        assert_eq!(opts.clamped_timeout_ms(), DEFAULT_REQUEST_TIMEOUT_MS);
        opts.request_timeout_ms = 1;
        assert_eq!(opts.clamped_timeout_ms(), MIN_REQUEST_TIMEOUT_MS);
        opts.request_timeout_ms = u64::MAX;
        assert_eq!(opts.clamped_timeout_ms(), MAX_REQUEST_TIMEOUT_MS);
    }
}
