//! Query deadlines.
//!
//! Every query carries a deadline derived from the request timeout.
//! Operators check it between batches, traversals between depth levels,
//! and the vector index between candidate-list extensions. An expired
//! deadline surfaces as `Cancelled` and aborts the transaction.

use crate::error::{Result, ThemisError};
use crate::limits::{MAX_REQUEST_TIMEOUT_MS, MIN_REQUEST_TIMEOUT_MS};
use std::time::{Duration, Instant};

/// A point in time after which an operation must stop.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Option<Instant>,
}

impl Deadline {
    /// A deadline that never expires.
    pub fn none() -> Self {
        Deadline { at: None }
    }

    /// A deadline `timeout` from now.
    pub fn after(timeout: Duration) -> Self {
        Deadline {
            at: Some(Instant::now() + timeout),
        }
    }

    /// A deadline from a millisecond timeout, clamped to the allowed
    /// request-timeout range.
    pub fn from_timeout_ms(timeout_ms: u64) -> Self {
        let clamped = timeout_ms.clamp(MIN_REQUEST_TIMEOUT_MS, MAX_REQUEST_TIMEOUT_MS);
        Deadline::after(Duration::from_millis(clamped))
    }

    /// True when the deadline has passed.
    pub fn expired(&self) -> bool {
        match self.at {
            Some(at) => Instant::now() >= at,
            None => false,
        }
    }

    /// Return `Cancelled` naming `operation` when the deadline passed.
    pub fn check(&self, operation: &str) -> Result<()> {
        if self.expired() {
            Err(ThemisError::cancelled(operation))
        } else {
            Ok(())
        }
    }

    /// Remaining time, if the deadline is finite.
    pub fn remaining(&self) -> Option<Duration> {
        self.at
            .map(|at| at.saturating_duration_since(Instant::now()))
    }
}
