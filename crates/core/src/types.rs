//! Small shared types used across layers.

use serde::{Deserialize, Serialize};

/// Scan direction for iterators, ordered scans, and cursors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Ascending key order.
    Forward,
    /// Descending key order.
    Reverse,
}

impl Direction {
    /// Flip the direction.
    pub fn reversed(self) -> Self {
        match self {
            Direction::Forward => Direction::Reverse,
            Direction::Reverse => Direction::Forward,
        }
    }

    /// True for the ascending direction.
    pub fn is_forward(self) -> bool {
        matches!(self, Direction::Forward)
    }
}

/// Schema version of an index. Bumped on rebuild so that outstanding
/// cursors against the old layout invalidate cleanly.
pub type SchemaVersion = u32;
