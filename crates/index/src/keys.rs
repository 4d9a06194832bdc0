//! Column-family names and index-key construction.
//!
//! All relational index entries live in [`CF_INDEX`] under kind-specific
//! prefixes; the adjacency index lives in [`CF_GRAPH`]; descriptors in
//! [`CF_CATALOG`]. Key material after the prefix is the order-preserving
//! value encoding followed by the raw pk bytes, so a prefix walk yields
//! pks in (value, pk) order with no further sorting.

use themis_core::encoding::encoded_value_len;
use themis_core::error::Result;

/// Entity records (`collection:key` -> bincode record).
pub const CF_ENTITIES: &str = "entities";
/// Relational index entries.
pub const CF_INDEX: &str = "index";
/// Graph adjacency entries and edge bodies.
pub const CF_GRAPH: &str = "graph";
/// Index descriptors.
pub const CF_CATALOG: &str = "catalog";

/// Key prefixes per index kind.
pub mod prefix {
    /// Equality / composite.
    pub const EQUALITY: &str = "idx";
    /// Range / order.
    pub const RANGE: &str = "ridx";
    /// Sparse equality.
    pub const SPARSE: &str = "sidx";
    /// Geo (Morton).
    pub const GEO: &str = "gidx";
    /// TTL expiry.
    pub const TTL: &str = "ttlidx";
    /// Fulltext postings.
    pub const FULLTEXT: &str = "ftidx";
    /// Fulltext per-document length.
    pub const FT_DOC: &str = "ftdoc";
    /// Fulltext per-term document frequency.
    pub const FT_TERM: &str = "ftterm";
    /// Fulltext corpus statistics.
    pub const FT_STAT: &str = "ftstat";
    /// Vector registry (pk -> stored vector).
    pub const VECTOR_REG: &str = "vreg";
}

/// `"{prefix}:{index_name}:"` as bytes.
pub fn index_prefix(kind_prefix: &str, index_name: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(kind_prefix.len() + index_name.len() + 2);
    out.extend_from_slice(kind_prefix.as_bytes());
    out.push(b':');
    out.extend_from_slice(index_name.as_bytes());
    out.push(b':');
    out
}

/// `"{prefix}:{index_name}:" + encoded_value + pk`.
pub fn entry_key(kind_prefix: &str, index_name: &str, encoded_value: &[u8], pk: &str) -> Vec<u8> {
    let mut out = index_prefix(kind_prefix, index_name);
    out.extend_from_slice(encoded_value);
    out.extend_from_slice(pk.as_bytes());
    out
}

/// Split an entry key's suffix (everything after the index prefix) into
/// the encoded value(s) and the pk, given how many encoded components
/// the index holds (1 for single-field, N for composite).
pub fn split_entry_suffix(suffix: &[u8], components: usize) -> Result<(Vec<u8>, String)> {
    let mut offset = 0;
    for _ in 0..components {
        offset += encoded_value_len(&suffix[offset..])?;
    }
    let pk = String::from_utf8_lossy(&suffix[offset..]).into_owned();
    Ok((suffix[..offset].to_vec(), pk))
}

#[cfg(test)]
mod tests {
    use super::*;
    use themis_core::encoding::encode_index_value;
    use themis_core::value::Value;

    #[test]
    fn test_entry_key_layout() {
        let enc = encode_index_value(&Value::Int(25), false).unwrap();
        let key = entry_key(prefix::EQUALITY, "users_age", &enc, "users:7");
        assert!(key.starts_with(b"idx:users_age:"));
        let suffix = &key[index_prefix(prefix::EQUALITY, "users_age").len()..];
        let (value, pk) = split_entry_suffix(suffix, 1).unwrap();
        assert_eq!(value, enc);
        assert_eq!(pk, "users:7");
    }

    #[test]
    fn test_split_composite_suffix() {
        let mut enc = encode_index_value(&Value::String("de".into()), false).unwrap();
        enc.extend(encode_index_value(&Value::Int(3), false).unwrap());
        let key = entry_key(prefix::EQUALITY, "c_idx", &enc, "users:9");
        let suffix = &key[index_prefix(prefix::EQUALITY, "c_idx").len()..];
        let (value, pk) = split_entry_suffix(suffix, 2).unwrap();
        assert_eq!(value, enc);
        assert_eq!(pk, "users:9");
    }

    #[test]
    fn test_distinct_index_names_do_not_collide() {
        let a = index_prefix(prefix::EQUALITY, "ab");
        let b = index_prefix(prefix::EQUALITY, "abc");
        // The trailing ':' keeps "ab" from prefixing "abc".
        assert!(!b.starts_with(&a));
    }
}
