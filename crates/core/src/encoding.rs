//! Order-preserving key encodings.
//!
//! Range and equality indexes store field values inside storage keys, so
//! the byte encoding must sort the way the values do. The encodings here
//! are the usual tricks:
//!
//! - i64: offset-binary (flip the sign bit), big-endian.
//! - f64: sign-fold (negative values invert all bits, non-negative set
//!   the sign bit), big-endian. Total order matches IEEE-754 ordering
//!   with -0.0 < +0.0 and NaN sorting last.
//! - strings/bytes: escaped so the 0x00 terminator never collides with
//!   payload bytes (0x00 -> 0x00 0xFF, terminator 0x00 0x00).
//!
//! A one-byte family tag in front keeps mixed-type indexed fields in a
//! stable global order (null < bool < number < string < bytes).

use crate::error::{Result, ThemisError};
use crate::value::Value;
use byteorder::{BigEndian, ByteOrder};

const TAG_NULL: u8 = 0x01;
const TAG_FALSE: u8 = 0x02;
const TAG_TRUE: u8 = 0x03;
const TAG_NUMBER: u8 = 0x04;
const TAG_STRING: u8 = 0x05;
const TAG_BYTES: u8 = 0x06;

/// Encode an i64 so that byte order equals numeric order.
pub fn encode_i64(v: i64) -> [u8; 8] {
    let mut buf = [0u8; 8];
    BigEndian::write_u64(&mut buf, (v as u64) ^ (1 << 63));
    buf
}

/// Inverse of [`encode_i64`].
pub fn decode_i64(buf: &[u8]) -> i64 {
    (BigEndian::read_u64(buf) ^ (1 << 63)) as i64
}

/// Encode an f64 so that byte order equals numeric order.
pub fn encode_f64(v: f64) -> [u8; 8] {
    let bits = v.to_bits();
    let folded = if bits & (1 << 63) != 0 {
        !bits
    } else {
        bits | (1 << 63)
    };
    let mut buf = [0u8; 8];
    BigEndian::write_u64(&mut buf, folded);
    buf
}

/// Inverse of [`encode_f64`].
pub fn decode_f64(buf: &[u8]) -> f64 {
    let folded = BigEndian::read_u64(buf);
    let bits = if folded & (1 << 63) != 0 {
        folded & !(1 << 63)
    } else {
        !folded
    };
    f64::from_bits(bits)
}

/// Append escaped bytes plus terminator. The escape keeps prefix-freedom:
/// no encoded value is a prefix of another.
pub fn encode_terminated(out: &mut Vec<u8>, bytes: &[u8]) {
    for &b in bytes {
        if b == 0x00 {
            out.push(0x00);
            out.push(0xFF);
        } else {
            out.push(b);
        }
    }
    out.push(0x00);
    out.push(0x00);
}

/// Read one terminated run from `buf`, returning the decoded bytes and
/// the number of input bytes consumed.
pub fn decode_terminated(buf: &[u8]) -> Result<(Vec<u8>, usize)> {
    let mut out = Vec::new();
    let mut i = 0;
    while i + 1 < buf.len() {
        match (buf[i], buf[i + 1]) {
            (0x00, 0x00) => return Ok((out, i + 2)),
            (0x00, 0xFF) => {
                out.push(0x00);
                i += 2;
            }
            (b, _) => {
                out.push(b);
                i += 1;
            }
        }
    }
    Err(ThemisError::internal(
        "unterminated run in order-preserving encoding",
    ))
}

/// Encode a scalar value for use inside an index key. Arrays, objects,
/// vectors, and geo points cannot be range-encoded and are rejected with
/// a schema violation; the geo index has its own Morton encoding.
///
/// Numbers (Int and Float) share one family so that `age >= 500` matches
/// records regardless of which numeric tag the payload used. With
/// `natural` collation strings are lowercased before encoding.
pub fn encode_index_value(value: &Value, natural_collation: bool) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    match value {
        Value::Null => out.push(TAG_NULL),
        Value::Bool(false) => out.push(TAG_FALSE),
        Value::Bool(true) => out.push(TAG_TRUE),
        Value::Int(v) => {
            out.push(TAG_NUMBER);
            out.extend_from_slice(&encode_f64(*v as f64));
        }
        Value::Float(v) => {
            out.push(TAG_NUMBER);
            out.extend_from_slice(&encode_f64(*v));
        }
        Value::String(s) => {
            out.push(TAG_STRING);
            if natural_collation {
                encode_terminated(&mut out, s.to_lowercase().as_bytes());
            } else {
                encode_terminated(&mut out, s.as_bytes());
            }
        }
        Value::Bytes(b) => {
            out.push(TAG_BYTES);
            encode_terminated(&mut out, b);
        }
        other => {
            return Err(ThemisError::schema_violation(format!(
                "value of type {} cannot be encoded for an index key",
                type_name(other)
            )))
        }
    }
    Ok(out)
}

/// Length in bytes of the encoded value at the front of `buf`.
///
/// Index keys append the pk (or further composite components) directly
/// after an encoded value; this is how scans split a compound key back
/// apart. Works because every encoding is prefix-free: tags have fixed
/// payload widths except strings/bytes, which are terminator-delimited.
pub fn encoded_value_len(buf: &[u8]) -> Result<usize> {
    match buf.first() {
        Some(&TAG_NULL) | Some(&TAG_FALSE) | Some(&TAG_TRUE) => Ok(1),
        Some(&TAG_NUMBER) => {
            if buf.len() < 9 {
                return Err(ThemisError::internal("truncated number in index key"));
            }
            Ok(9)
        }
        Some(&TAG_STRING) | Some(&TAG_BYTES) => {
            let (_, consumed) = decode_terminated(&buf[1..])?;
            Ok(1 + consumed)
        }
        _ => Err(ThemisError::internal("unknown tag in index key")),
    }
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Int(_) => "int",
        Value::Float(_) => "float",
        Value::String(_) => "string",
        Value::Bytes(_) => "bytes",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
        Value::Vector(_) => "vector",
        Value::Geo { .. } => "geo",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_i64_order_preserved() {
        let samples = [i64::MIN, -1_000_000, -1, 0, 1, 42, i64::MAX];
        for window in samples.windows(2) {
            assert!(encode_i64(window[0]) < encode_i64(window[1]));
        }
        for v in samples {
            assert_eq!(decode_i64(&encode_i64(v)), v);
        }
    }

    #[test]
    fn test_f64_order_preserved() {
        let samples = [
            f64::NEG_INFINITY,
            -1e30,
            -1.5,
            -0.0,
            0.0,
            0.25,
            1.5,
            1e30,
            f64::INFINITY,
        ];
        for window in samples.windows(2) {
            assert!(
                encode_f64(window[0]) <= encode_f64(window[1]),
                "{} !<= {}",
                window[0],
                window[1]
            );
        }
        for v in samples {
            assert_eq!(decode_f64(&encode_f64(v)), v);
        }
    }

    #[test]
    fn test_terminated_escaping() {
        let mut a = Vec::new();
        encode_terminated(&mut a, b"ab\x00cd");
        let (decoded, consumed) = decode_terminated(&a).unwrap();
        assert_eq!(decoded, b"ab\x00cd");
        assert_eq!(consumed, a.len());
    }

    #[test]
    fn test_terminated_prefix_freedom() {
        // "a" must sort before "ab" and neither encoding is a prefix of
        // a key for a different value.
        let mut a = Vec::new();
        encode_terminated(&mut a, b"a");
        let mut ab = Vec::new();
        encode_terminated(&mut ab, b"ab");
        assert!(a < ab);
        assert!(!ab.starts_with(&a));
    }

    #[test]
    fn test_index_value_cross_family_order() {
        let null = encode_index_value(&Value::Null, false).unwrap();
        let fals = encode_index_value(&Value::Bool(false), false).unwrap();
        let tru = encode_index_value(&Value::Bool(true), false).unwrap();
        let num = encode_index_value(&Value::Int(0), false).unwrap();
        let s = encode_index_value(&Value::String("a".into()), false).unwrap();
        assert!(null < fals);
        assert!(fals < tru);
        assert!(tru < num);
        assert!(num < s);
    }

    #[test]
    fn test_index_value_int_float_share_family() {
        let i = encode_index_value(&Value::Int(2), false).unwrap();
        let f = encode_index_value(&Value::Float(2.0), false).unwrap();
        assert_eq!(i, f);

        let lo = encode_index_value(&Value::Int(2), false).unwrap();
        let hi = encode_index_value(&Value::Float(2.5), false).unwrap();
        assert!(lo < hi);
    }

    #[test]
    fn test_natural_collation_lowercases() {
        let a = encode_index_value(&Value::String("Apple".into()), true).unwrap();
        let b = encode_index_value(&Value::String("apple".into()), true).unwrap();
        assert_eq!(a, b);

        let bin_a = encode_index_value(&Value::String("Apple".into()), false).unwrap();
        assert_ne!(bin_a, a);
    }

    #[test]
    fn test_encoded_value_len_splits_compound_keys() {
        for value in [
            Value::Null,
            Value::Bool(true),
            Value::Int(42),
            Value::Float(2.5),
            Value::String("hello\x00world".into()),
            Value::Bytes(vec![1, 0, 2]),
        ] {
            let mut key = encode_index_value(&value, false).unwrap();
            let value_len = key.len();
            key.extend_from_slice(b"users:42");
            assert_eq!(encoded_value_len(&key).unwrap(), value_len);
            assert_eq!(&key[value_len..], b"users:42");
        }
    }

    #[test]
    fn test_unencodable_families_rejected() {
        assert!(encode_index_value(&Value::Array(vec![]), false).is_err());
        assert!(encode_index_value(&Value::Vector(vec![0.1]), false).is_err());
        assert!(encode_index_value(&Value::Geo { lat: 0.0, lon: 0.0 }, false).is_err());
    }

    proptest! {
        #[test]
        fn prop_i64_encoding_preserves_order(a in any::<i64>(), b in any::<i64>()) {
            prop_assert_eq!(a.cmp(&b), encode_i64(a).cmp(&encode_i64(b)));
        }

        #[test]
        fn prop_f64_encoding_preserves_order(a in any::<f64>(), b in any::<f64>()) {
            prop_assume!(a.is_finite() && b.is_finite());
            let ord = a.partial_cmp(&b).unwrap();
            prop_assert_eq!(ord, encode_f64(a).cmp(&encode_f64(b)));
        }

        #[test]
        fn prop_terminated_round_trip(bytes in proptest::collection::vec(any::<u8>(), 0..64)) {
            let mut enc = Vec::new();
            encode_terminated(&mut enc, &bytes);
            let (dec, consumed) = decode_terminated(&enc).unwrap();
            prop_assert_eq!(dec, bytes);
            prop_assert_eq!(consumed, enc.len());
        }

        #[test]
        fn prop_string_encoding_preserves_order(a in "\\PC*", b in "\\PC*") {
            let ea = encode_index_value(&Value::String(a.clone()), false).unwrap();
            let eb = encode_index_value(&Value::String(b.clone()), false).unwrap();
            prop_assert_eq!(a.as_bytes().cmp(b.as_bytes()), ea.cmp(&eb));
        }
    }
}
