//! Opaque cursor tokens for resumable ordered scans.
//!
//! A token encodes everything needed to restart an ordered scan strictly
//! after (or before, for descending order) the last delivered row:
//! collection, index name, the encoded sort key, the tiebreaker pk, the
//! direction, and an optional expiry. Tokens are version-tagged so a
//! schema or index rebuild invalidates them, and base64-wrapped so
//! clients treat them as opaque.
//!
//! Decoding failures are classification results, not request failures:
//! the paging layer maps any `InvalidCursor` to an empty page with
//! `has_more=false`.

use crate::error::{Result, ThemisError};
use crate::types::Direction;
use base64::Engine;
use serde::{Deserialize, Serialize};

/// Current token format version. Bump when the encoded layout changes;
/// tokens carrying any other version are invalid.
pub const CURSOR_FORMAT_VERSION: u8 = 1;

/// Resumption marker for an ordered result page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CursorToken {
    /// Token format version.
    pub version: u8,
    /// Index the scan ran over; empty for primary-key order.
    pub index_name: String,
    /// Schema version of that index when the token was issued.
    pub schema_version: u32,
    /// Collection being paged.
    pub collection: String,
    /// Encoded sort-key position of the last delivered row.
    pub sort_key: Vec<u8>,
    /// Tiebreaker pk of the last delivered row.
    pub pk: String,
    /// Scan direction.
    pub direction: Direction,
    /// Optional expiry (epoch milliseconds).
    pub expiry_epoch_ms: Option<i64>,
}

impl CursorToken {
    /// Serialize to the opaque base64 wire form.
    pub fn encode(&self) -> Result<String> {
        let bytes = bincode::serialize(self)?;
        Ok(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes))
    }

    /// Parse a wire token. Returns `InvalidCursor` for malformed base64,
    /// undecodable bodies, unknown versions, or expired tokens.
    pub fn decode(token: &str, now_epoch_ms: i64) -> Result<Self> {
        let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(token)
            .map_err(|_| ThemisError::invalid_cursor("token is not valid base64"))?;
        let decoded: CursorToken = bincode::deserialize(&bytes)
            .map_err(|_| ThemisError::invalid_cursor("token body is malformed"))?;
        if decoded.version != CURSOR_FORMAT_VERSION {
            return Err(ThemisError::invalid_cursor(format!(
                "unknown token version {}",
                decoded.version
            )));
        }
        if let Some(expiry) = decoded.expiry_epoch_ms {
            if now_epoch_ms > expiry {
                return Err(ThemisError::invalid_cursor("token expired"));
            }
        }
        Ok(decoded)
    }

    /// Validate that the token belongs to the given collection/index and
    /// matches its current schema version.
    pub fn check_scope(
        &self,
        collection: &str,
        index_name: &str,
        schema_version: u32,
    ) -> Result<()> {
        if self.collection != collection {
            return Err(ThemisError::invalid_cursor(format!(
                "token is for collection '{}', not '{}'",
                self.collection, collection
            )));
        }
        if self.index_name != index_name {
            return Err(ThemisError::invalid_cursor(format!(
                "token is for index '{}', not '{}'",
                self.index_name, index_name
            )));
        }
        if self.schema_version != schema_version {
            return Err(ThemisError::invalid_cursor(
                "index was rebuilt since the token was issued",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> CursorToken {
        CursorToken {
            version: CURSOR_FORMAT_VERSION,
            index_name: "users_age_ridx".into(),
            schema_version: 3,
            collection: "users".into(),
            sort_key: vec![0x04, 0x80, 0, 0, 0, 0, 0, 0, 0],
            pk: "users:509".into(),
            direction: Direction::Forward,
            expiry_epoch_ms: None,
        }
    }

    #[test]
    fn test_round_trip() {
        let token = sample();
        let wire = token.encode().unwrap();
        let back = CursorToken::decode(&wire, 0).unwrap();
        assert_eq!(token, back);
    }

    #[test]
    fn test_malformed_tokens_rejected() {
        assert!(matches!(
            CursorToken::decode("!!! not base64 !!!", 0),
            Err(ThemisError::InvalidCursor { .. })
        ));
        assert!(matches!(
            CursorToken::decode("AAAA", 0),
            Err(ThemisError::InvalidCursor { .. })
        ));
    }

    #[test]
    fn test_unknown_version_rejected() {
        let mut token = sample();
        token.version = 99;
        let wire = token.encode().unwrap();
        assert!(matches!(
            CursorToken::decode(&wire, 0),
            Err(ThemisError::InvalidCursor { .. })
        ));
    }

    #[test]
    fn test_expiry_enforced() {
        let mut token = sample();
        token.expiry_epoch_ms = Some(1_000);
        let wire = token.encode().unwrap();
        assert!(CursorToken::decode(&wire, 999).is_ok());
        assert!(matches!(
            CursorToken::decode(&wire, 1_001),
            Err(ThemisError::InvalidCursor { .. })
        ));
    }

    #[test]
    fn test_scope_checks() {
        let token = sample();
        assert!(token.check_scope("users", "users_age_ridx", 3).is_ok());
        assert!(token.check_scope("orders", "users_age_ridx", 3).is_err());
        assert!(token.check_scope("users", "other_idx", 3).is_err());
        // Rebuild bumps the schema version and invalidates the token.
        assert!(token.check_scope("users", "users_age_ridx", 4).is_err());
    }
}
