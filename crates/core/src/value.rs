//! The entity value model.
//!
//! An entity payload is a tagged tree: null, bool, i64, f64, string,
//! bytes, array, object, dense f32 vector, or geo point. Canonical JSON
//! is the interchange form; indexable projections are produced by typed
//! accessors that never silently coerce across families.
//!
//! Two comparison relations exist on purpose:
//! - [`Value::cmp_filter`] implements predicate semantics: comparisons
//!   against null (or across families) yield no ordering, which filters
//!   treat as false.
//! - [`Value::cmp_sort`] is a total order used by `SORT` and grouping,
//!   ranking families (null < bool < number < string < ...) and then
//!   comparing within the family.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// A semi-structured entity value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// Absent / null.
    Null,
    /// Boolean.
    Bool(bool),
    /// 64-bit signed integer.
    Int(i64),
    /// 64-bit float.
    Float(f64),
    /// UTF-8 string.
    String(String),
    /// Raw bytes.
    Bytes(Vec<u8>),
    /// Ordered list.
    Array(Vec<Value>),
    /// String-keyed object. BTreeMap keeps keys sorted so the canonical
    /// JSON form (and therefore the content hash) is deterministic.
    Object(BTreeMap<String, Value>),
    /// Dense vector of f32, the embedding payload type.
    Vector(Vec<f32>),
    /// Geographic point in degrees.
    Geo {
        /// Latitude in degrees.
        lat: f64,
        /// Longitude in degrees.
        lon: f64,
    },
}

impl Value {
    /// Build an object value from an iterator of pairs.
    pub fn object<I, K>(fields: I) -> Self
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        Value::Object(fields.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// True when the value is `Null`.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Integer accessor. Only `Int` qualifies.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Numeric accessor. `Int` and `Float` are the numeric family;
    /// nothing else converts.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(v) => Some(*v as f64),
            Value::Float(v) => Some(*v),
            _ => None,
        }
    }

    /// String accessor.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Boolean accessor.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Array accessor.
    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Object accessor.
    pub fn as_object(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Object(fields) => Some(fields),
            _ => None,
        }
    }

    /// Dense-vector accessor.
    ///
    /// `Vector` returns its payload directly. A numeric `Array` is also
    /// accepted because vectors arrive as JSON arrays over the
    /// interchange form; any non-numeric element disqualifies the array.
    pub fn as_vector(&self) -> Option<Vec<f32>> {
        match self {
            Value::Vector(v) => Some(v.clone()),
            Value::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(item.as_f64()? as f32);
                }
                Some(out)
            }
            _ => None,
        }
    }

    /// Geo accessor: a `Geo` value, or an object with numeric `lat` and
    /// `lon` fields (the stored sibling-field convention).
    pub fn as_geo(&self) -> Option<(f64, f64)> {
        match self {
            Value::Geo { lat, lon } => Some((*lat, *lon)),
            Value::Object(fields) => {
                let lat = fields.get("lat")?.as_f64()?;
                let lon = fields.get("lon")?.as_f64()?;
                Some((lat, lon))
            }
            _ => None,
        }
    }

    /// Look up a field on an object value.
    pub fn get(&self, field: &str) -> Option<&Value> {
        match self {
            Value::Object(fields) => fields.get(field),
            _ => None,
        }
    }

    /// Walk a dotted path (`"address.city"`) through nested objects.
    /// Returns `None` when any segment is missing or not an object.
    pub fn get_path(&self, path: &str) -> Option<&Value> {
        let mut current = self;
        for segment in path.split('.') {
            current = current.get(segment)?;
        }
        Some(current)
    }

    /// Predicate comparison with null semantics: `None` when either side
    /// is null or the values belong to different families. Filters treat
    /// `None` as false.
    pub fn cmp_filter(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Null, _) | (_, Value::Null) => None,
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
            (Value::Bytes(a), Value::Bytes(b)) => Some(a.cmp(b)),
            (a, b) => {
                // Numeric family: Int and Float compare with each other.
                let (x, y) = (a.as_f64()?, b.as_f64()?);
                x.partial_cmp(&y)
            }
        }
    }

    /// Equality under predicate semantics: `None` when either side is
    /// null (three-valued logic), `Some(bool)` otherwise. Unlike
    /// `cmp_filter`, structured values compare by structural equality.
    pub fn eq_filter(&self, other: &Value) -> Option<bool> {
        if self.is_null() || other.is_null() {
            return None;
        }
        match self.cmp_filter(other) {
            Some(ord) => Some(ord == Ordering::Equal),
            None => Some(self == other),
        }
    }

    /// Total order for `SORT` and grouping. Families are ranked
    /// null < bool < number < string < bytes < array < object < vector
    /// < geo, then values compare within their family.
    pub fn cmp_sort(&self, other: &Value) -> Ordering {
        let (ra, rb) = (self.family_rank(), other.family_rank());
        if ra != rb {
            return ra.cmp(&rb);
        }
        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::String(a), Value::String(b)) => a.cmp(b),
            (Value::Bytes(a), Value::Bytes(b)) => a.cmp(b),
            (Value::Array(a), Value::Array(b)) => {
                for (x, y) in a.iter().zip(b.iter()) {
                    let ord = x.cmp_sort(y);
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                a.len().cmp(&b.len())
            }
            (Value::Object(a), Value::Object(b)) => {
                for ((ka, va), (kb, vb)) in a.iter().zip(b.iter()) {
                    let ord = ka.cmp(kb).then_with(|| va.cmp_sort(vb));
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                a.len().cmp(&b.len())
            }
            (Value::Vector(a), Value::Vector(b)) => {
                for (x, y) in a.iter().zip(b.iter()) {
                    let ord = x.partial_cmp(y).unwrap_or(Ordering::Equal);
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                a.len().cmp(&b.len())
            }
            (Value::Geo { lat: a1, lon: o1 }, Value::Geo { lat: a2, lon: o2 }) => a1
                .partial_cmp(a2)
                .unwrap_or(Ordering::Equal)
                .then(o1.partial_cmp(o2).unwrap_or(Ordering::Equal)),
            (a, b) => {
                let (x, y) = (a.as_f64().unwrap_or(0.0), b.as_f64().unwrap_or(0.0));
                x.partial_cmp(&y).unwrap_or(Ordering::Equal)
            }
        }
    }

    fn family_rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Int(_) | Value::Float(_) => 2,
            Value::String(_) => 3,
            Value::Bytes(_) => 4,
            Value::Array(_) => 5,
            Value::Object(_) => 6,
            Value::Vector(_) => 7,
            Value::Geo { .. } => 8,
        }
    }

    /// Truthiness in filter position: only `Bool(true)` passes. Null and
    /// every non-boolean value are false, matching the null-aware
    /// predicate semantics.
    pub fn is_truthy(&self) -> bool {
        matches!(self, Value::Bool(true))
    }

    /// Convert to the canonical JSON interchange form.
    ///
    /// Vectors render as number arrays, geo points as `{lat, lon}`
    /// objects, bytes as an array of integers. Non-finite floats render
    /// as null (JSON has no representation for them).
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(v) => serde_json::Value::Number((*v).into()),
            Value::Float(v) => serde_json::Number::from_f64(*v)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Bytes(b) => {
                serde_json::Value::Array(b.iter().map(|x| serde_json::Value::from(*x)).collect())
            }
            Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Value::Object(fields) => serde_json::Value::Object(
                fields
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
            Value::Vector(v) => serde_json::Value::Array(
                v.iter()
                    .map(|x| {
                        serde_json::Number::from_f64(*x as f64)
                            .map(serde_json::Value::Number)
                            .unwrap_or(serde_json::Value::Null)
                    })
                    .collect(),
            ),
            Value::Geo { lat, lon } => {
                let mut m = serde_json::Map::new();
                m.insert(
                    "lat".to_string(),
                    serde_json::Number::from_f64(*lat)
                        .map(serde_json::Value::Number)
                        .unwrap_or(serde_json::Value::Null),
                );
                m.insert(
                    "lon".to_string(),
                    serde_json::Number::from_f64(*lon)
                        .map(serde_json::Value::Number)
                        .unwrap_or(serde_json::Value::Null),
                );
                serde_json::Value::Object(m)
            }
        }
    }

    /// Build a value from the JSON interchange form. Integral numbers
    /// become `Int`, everything else `Float`; arrays stay arrays (the
    /// vector accessor converts on demand).
    pub fn from_json(json: &serde_json::Value) -> Value {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else {
                    Value::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            serde_json::Value::String(s) => Value::String(s.clone()),
            serde_json::Value::Array(items) => {
                Value::Array(items.iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(fields) => Value::Object(
                fields
                    .iter()
                    .map(|(k, v)| (k.clone(), Value::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Content hash of the canonical JSON form (xxh3). Object keys are
    /// already sorted, so the hash is stable across reorderings of the
    /// same logical payload.
    pub fn content_hash(&self) -> u64 {
        let canonical = self.to_json().to_string();
        xxhash_rust::xxh3::xxh3_64(canonical.as_bytes())
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<Vec<f32>> for Value {
    fn from(v: Vec<f32>) -> Self {
        Value::Vector(v)
    }
}
