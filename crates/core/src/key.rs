//! Primary keys.
//!
//! Every record is addressed by `collection:key`. Collections must not
//! contain the separator; keys may. Entity storage keys sort
//! lexicographically by `collection:key`, which makes collection scans a
//! prefix walk.

use crate::error::{Result, ThemisError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Separator between collection and key.
pub const PK_SEPARATOR: char = ':';

/// A primary key: `collection:key`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Pk {
    collection: String,
    key: String,
}

impl Pk {
    /// Build a pk after validating the collection name.
    pub fn new(collection: impl Into<String>, key: impl Into<String>) -> Result<Self> {
        let collection = collection.into();
        let key = key.into();
        validate_collection_name(&collection)?;
        if key.is_empty() {
            return Err(ThemisError::schema_violation("key must not be empty"));
        }
        Ok(Pk { collection, key })
    }

    /// Parse a pk from its `collection:key` string form.
    pub fn parse(s: &str) -> Result<Self> {
        match s.split_once(PK_SEPARATOR) {
            Some((collection, key)) => Pk::new(collection, key),
            None => Err(ThemisError::schema_violation(format!(
                "primary key '{}' is missing the '{}' separator",
                s, PK_SEPARATOR
            ))),
        }
    }

    /// The collection component.
    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// The key component.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Storage-key bytes: `collection:key`.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.collection.len() + 1 + self.key.len());
        out.extend_from_slice(self.collection.as_bytes());
        out.push(PK_SEPARATOR as u8);
        out.extend_from_slice(self.key.as_bytes());
        out
    }

    /// Prefix under which every pk of `collection` sorts.
    pub fn collection_prefix(collection: &str) -> Vec<u8> {
        let mut out = Vec::with_capacity(collection.len() + 1);
        out.extend_from_slice(collection.as_bytes());
        out.push(PK_SEPARATOR as u8);
        out
    }

    /// Decode storage-key bytes back into a pk.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let s = std::str::from_utf8(bytes)
            .map_err(|_| ThemisError::schema_violation("primary key is not valid UTF-8"))?;
        Pk::parse(s)
    }
}

impl fmt::Display for Pk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.collection, PK_SEPARATOR, self.key)
    }
}

/// Validate a collection name: non-empty, no separator, printable ASCII.
pub fn validate_collection_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(ThemisError::schema_violation(
            "collection name must not be empty",
        ));
    }
    if name.contains(PK_SEPARATOR) {
        return Err(ThemisError::schema_violation(format!(
            "collection name '{}' must not contain '{}'",
            name, PK_SEPARATOR
        )));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(ThemisError::schema_violation(format!(
            "collection name '{}' contains unsupported characters",
            name
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pk_round_trip() {
        let pk = Pk::new("users", "42").unwrap();
        assert_eq!(pk.to_string(), "users:42");
        assert_eq!(Pk::parse("users:42").unwrap(), pk);
        assert_eq!(Pk::decode(&pk.encode()).unwrap(), pk);
    }

    #[test]
    fn test_key_may_contain_separator() {
        let pk = Pk::parse("events:2024:01:05").unwrap();
        assert_eq!(pk.collection(), "events");
        assert_eq!(pk.key(), "2024:01:05");
    }

    #[test]
    fn test_invalid_collection_names() {
        assert!(Pk::new("", "k").is_err());
        assert!(Pk::new("a:b", "k").is_err());
        assert!(Pk::new("white space", "k").is_err());
        assert!(Pk::new("users", "").is_err());
        assert!(Pk::parse("no-separator").is_err());
    }

    #[test]
    fn test_collection_prefix_sorts_before_members() {
        let prefix = Pk::collection_prefix("users");
        let pk = Pk::new("users", "0").unwrap().encode();
        assert!(pk.starts_with(&prefix));

        // A different collection never shares the prefix.
        let other = Pk::new("userx", "0").unwrap().encode();
        assert!(!other.starts_with(&prefix));
    }

    #[test]
    fn test_pk_ordering_is_lexicographic() {
        let a = Pk::new("users", "1").unwrap();
        let b = Pk::new("users", "10").unwrap();
        let c = Pk::new("users", "2").unwrap();
        assert!(a < b);
        assert!(b < c);
    }
}
