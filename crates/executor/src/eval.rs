//! Pure pieces of the predicate language: arithmetic, comparisons with
//! null semantics, and the scalar built-ins (string, array, math,
//! date). Variable resolution, subqueries, and scoring accessors live
//! in the executor, which owns the row context.

use chrono::{DateTime, Datelike, Duration, Timelike, Utc};
use themis_core::error::{Result, ThemisError};
use themis_core::value::Value;
use themis_index::vector::hnsw::{normalize, Metric};

/// Arithmetic on the numeric family. Any null operand yields null; any
/// non-numeric operand is a query error.
pub fn arithmetic(op: &str, lhs: &Value, rhs: &Value) -> Result<Value> {
    if lhs.is_null() || rhs.is_null() {
        return Ok(Value::Null);
    }
    // Int stays Int where the operation is closed over integers.
    if let (Value::Int(a), Value::Int(b)) = (lhs, rhs) {
        match op {
            "+" => {
                if let Some(v) = a.checked_add(*b) {
                    return Ok(Value::Int(v));
                }
            }
            "-" => {
                if let Some(v) = a.checked_sub(*b) {
                    return Ok(Value::Int(v));
                }
            }
            "*" => {
                if let Some(v) = a.checked_mul(*b) {
                    return Ok(Value::Int(v));
                }
            }
            "%" => {
                if *b != 0 {
                    return Ok(Value::Int(a % b));
                }
                return Ok(Value::Null);
            }
            _ => {}
        }
    }
    let (a, b) = match (lhs.as_f64(), rhs.as_f64()) {
        (Some(a), Some(b)) => (a, b),
        _ => {
            return Err(ThemisError::invalid_query(
                format!("operator '{}' requires numeric operands", op),
                0,
                0,
            ))
        }
    };
    let out = match op {
        "+" => a + b,
        "-" => a - b,
        "*" => a * b,
        "/" => {
            if b == 0.0 {
                return Ok(Value::Null);
            }
            a / b
        }
        "%" => {
            if b == 0.0 {
                return Ok(Value::Null);
            }
            a % b
        }
        other => {
            return Err(ThemisError::internal(format!(
                "unknown arithmetic operator '{}'",
                other
            )))
        }
    };
    Ok(Value::Float(out))
}

/// Stringify a value the way `CONCAT` renders it. Null renders empty.
pub fn to_display_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Int(v) => v.to_string(),
        Value::Float(v) => v.to_string(),
        other => other.to_json().to_string(),
    }
}

/// Dispatch a scalar built-in by (uppercased) name. Returns `None` when
/// the name is not a scalar built-in, so the caller can try scoring and
/// window accessors next.
pub fn scalar_builtin(name: &str, args: &[Value]) -> Result<Option<Value>> {
    let arity = |want: usize| -> Result<()> {
        if args.len() == want {
            Ok(())
        } else {
            Err(ThemisError::invalid_query(
                format!("{} expects {} argument(s), got {}", name, want, args.len()),
                0,
                0,
            ))
        }
    };

    let value = match name {
        "CONCAT" => Value::String(args.iter().map(to_display_string).collect()),
        "UPPER" => {
            arity(1)?;
            match &args[0] {
                Value::Null => Value::Null,
                Value::String(s) => Value::String(s.to_uppercase()),
                _ => return Err(bad_arg(name, "a string")),
            }
        }
        "LOWER" => {
            arity(1)?;
            match &args[0] {
                Value::Null => Value::Null,
                Value::String(s) => Value::String(s.to_lowercase()),
                _ => return Err(bad_arg(name, "a string")),
            }
        }
        "LENGTH" => {
            arity(1)?;
            match &args[0] {
                Value::Null => Value::Null,
                Value::String(s) => Value::Int(s.chars().count() as i64),
                Value::Array(items) => Value::Int(items.len() as i64),
                Value::Object(fields) => Value::Int(fields.len() as i64),
                _ => return Err(bad_arg(name, "a string or array")),
            }
        }
        "CONTAINS" => {
            arity(2)?;
            match (&args[0], &args[1]) {
                (Value::Null, _) | (_, Value::Null) => Value::Null,
                (Value::String(s), Value::String(needle)) => Value::Bool(s.contains(needle)),
                (Value::Array(items), needle) => {
                    Value::Bool(items.iter().any(|item| item == needle))
                }
                _ => return Err(bad_arg(name, "a string or array haystack")),
            }
        }
        "SUBSTRING" => {
            if args.len() != 2 && args.len() != 3 {
                return Err(bad_arg(name, "(string, start [, length])"));
            }
            match (&args[0], args[1].as_i64()) {
                (Value::Null, _) => Value::Null,
                (Value::String(s), Some(start)) => {
                    let start = start.max(0) as usize;
                    let chars: Vec<char> = s.chars().collect();
                    let end = match args.get(2) {
                        Some(len) => {
                            let len = len
                                .as_i64()
                                .ok_or_else(|| bad_arg(name, "an integer length"))?
                                .max(0) as usize;
                            (start + len).min(chars.len())
                        }
                        None => chars.len(),
                    };
                    if start >= chars.len() {
                        Value::String(String::new())
                    } else {
                        Value::String(chars[start..end].iter().collect())
                    }
                }
                _ => return Err(bad_arg(name, "(string, start [, length])")),
            }
        }
        "ABS" => {
            arity(1)?;
            match &args[0] {
                Value::Null => Value::Null,
                Value::Int(v) => Value::Int(v.saturating_abs()),
                Value::Float(v) => Value::Float(v.abs()),
                _ => return Err(bad_arg(name, "a number")),
            }
        }
        "CEIL" => {
            arity(1)?;
            numeric_unary(name, &args[0], |v| v.ceil())?
        }
        "FLOOR" => {
            arity(1)?;
            numeric_unary(name, &args[0], |v| v.floor())?
        }
        "ROUND" => {
            arity(1)?;
            numeric_unary(name, &args[0], |v| v.round())?
        }
        "POW" => {
            arity(2)?;
            match (args[0].as_f64(), args[1].as_f64()) {
                (Some(base), Some(exp)) => Value::Float(base.powf(exp)),
                _ if args[0].is_null() || args[1].is_null() => Value::Null,
                _ => return Err(bad_arg(name, "numbers")),
            }
        }
        "NOW" => {
            arity(0)?;
            Value::String(Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true))
        }
        "DATE_TRUNC" => {
            arity(2)?;
            date_trunc(&args[0], &args[1])?
        }
        "DATE_ADD" => {
            arity(3)?;
            date_shift(&args[0], &args[1], &args[2], 1)?
        }
        "DATE_SUB" => {
            arity(3)?;
            date_shift(&args[0], &args[1], &args[2], -1)?
        }
        _ => return Ok(None),
    };
    Ok(Some(value))
}

fn bad_arg(name: &str, expected: &str) -> ThemisError {
    ThemisError::invalid_query(format!("{} expects {}", name, expected), 0, 0)
}

fn numeric_unary(name: &str, arg: &Value, f: impl Fn(f64) -> f64) -> Result<Value> {
    Ok(match arg {
        Value::Null => Value::Null,
        Value::Int(v) => Value::Int(*v),
        Value::Float(v) => {
            let out = f(*v);
            if out.fract() == 0.0 && out.abs() < i64::MAX as f64 {
                Value::Int(out as i64)
            } else {
                Value::Float(out)
            }
        }
        _ => return Err(bad_arg(name, "a number")),
    })
}

fn parse_date(value: &Value) -> Result<DateTime<Utc>> {
    let s = value
        .as_str()
        .ok_or_else(|| bad_arg("date function", "an ISO-8601 string"))?;
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            // A bare date is midnight UTC.
            chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .map(|d| d.and_hms_opt(0, 0, 0).expect("valid midnight").and_utc())
        })
        .map_err(|_| {
            ThemisError::invalid_query(format!("'{}' is not an ISO-8601 date", s), 0, 0)
        })
}

fn render_date(dt: DateTime<Utc>) -> Value {
    Value::String(dt.to_rfc3339_opts(chrono::SecondsFormat::Millis, true))
}

fn date_trunc(unit: &Value, date: &Value) -> Result<Value> {
    if date.is_null() {
        return Ok(Value::Null);
    }
    let unit = unit
        .as_str()
        .ok_or_else(|| bad_arg("DATE_TRUNC", "a unit string"))?
        .to_lowercase();
    let dt = parse_date(date)?;
    let truncated = match unit.as_str() {
        "year" => dt
            .with_month(1)
            .and_then(|d| d.with_day(1))
            .and_then(|d| d.with_hour(0))
            .and_then(|d| d.with_minute(0))
            .and_then(|d| d.with_second(0))
            .and_then(|d| d.with_nanosecond(0)),
        "month" => dt
            .with_day(1)
            .and_then(|d| d.with_hour(0))
            .and_then(|d| d.with_minute(0))
            .and_then(|d| d.with_second(0))
            .and_then(|d| d.with_nanosecond(0)),
        "day" => dt
            .with_hour(0)
            .and_then(|d| d.with_minute(0))
            .and_then(|d| d.with_second(0))
            .and_then(|d| d.with_nanosecond(0)),
        "hour" => dt
            .with_minute(0)
            .and_then(|d| d.with_second(0))
            .and_then(|d| d.with_nanosecond(0)),
        "minute" => dt.with_second(0).and_then(|d| d.with_nanosecond(0)),
        "second" => dt.with_nanosecond(0),
        other => {
            return Err(ThemisError::invalid_query(
                format!("unknown DATE_TRUNC unit '{}'", other),
                0,
                0,
            ))
        }
    };
    truncated
        .map(render_date)
        .ok_or_else(|| ThemisError::internal("date truncation out of range"))
}

fn date_shift(date: &Value, amount: &Value, unit: &Value, sign: i64) -> Result<Value> {
    if date.is_null() {
        return Ok(Value::Null);
    }
    let amount = amount
        .as_i64()
        .ok_or_else(|| bad_arg("DATE_ADD/DATE_SUB", "an integer amount"))?
        * sign;
    let unit = unit
        .as_str()
        .ok_or_else(|| bad_arg("DATE_ADD/DATE_SUB", "a unit string"))?
        .to_lowercase();
    let dt = parse_date(date)?;
    let shifted = match unit.as_str() {
        "day" | "days" => dt + Duration::days(amount),
        "hour" | "hours" => dt + Duration::hours(amount),
        "minute" | "minutes" => dt + Duration::minutes(amount),
        "second" | "seconds" => dt + Duration::seconds(amount),
        "month" | "months" => {
            let total = dt.year() as i64 * 12 + dt.month0() as i64 + amount;
            let year = total.div_euclid(12) as i32;
            let month = total.rem_euclid(12) as u32 + 1;
            let day = dt.day().min(days_in_month(year, month));
            dt.with_year(year)
                .and_then(|d| d.with_day(1))
                .and_then(|d| d.with_month(month))
                .and_then(|d| d.with_day(day))
                .ok_or_else(|| ThemisError::internal("date shift out of range"))?
        }
        "year" | "years" => {
            let year = dt.year() + amount as i32;
            let day = dt.day().min(days_in_month(year, dt.month()));
            dt.with_day(1)
                .and_then(|d| d.with_year(year))
                .and_then(|d| d.with_day(day))
                .ok_or_else(|| ThemisError::internal("date shift out of range"))?
        }
        other => {
            return Err(ThemisError::invalid_query(
                format!("unknown date unit '{}'", other),
                0,
                0,
            ))
        }
    };
    Ok(render_date(shifted))
}

fn days_in_month(year: i32, month: u32) -> u32 {
    match month {
        1 | 3 | 5 | 7 | 8 | 10 | 12 => 31,
        4 | 6 | 9 | 11 => 30,
        _ => {
            if chrono::NaiveDate::from_ymd_opt(year, 2, 29).is_some() {
                29
            } else {
                28
            }
        }
    }
}

/// `VECTOR_SIMILARITY(stored, query, metric)`: cosine similarity, the
/// raw dot product, or negated L2 distance, so bigger is always more
/// similar.
pub fn vector_similarity(stored: &Value, query: &Value, metric: &Value) -> Result<Value> {
    let metric = Metric::parse(
        metric
            .as_str()
            .ok_or_else(|| bad_arg("VECTOR_SIMILARITY", "a metric name"))?,
    )?;
    let a = match stored.as_vector() {
        Some(v) => v,
        None => return Ok(Value::Null),
    };
    let b = query
        .as_vector()
        .ok_or_else(|| bad_arg("VECTOR_SIMILARITY", "a query vector"))?;
    if a.len() != b.len() {
        return Err(ThemisError::dimension_mismatch(a.len(), b.len()));
    }
    let (mut a, mut b) = (a, b);
    if metric.normalizes() {
        normalize(&mut a);
        normalize(&mut b);
    }
    // Distance is "smaller is closer"; similarity flips that.
    let similarity = match metric {
        Metric::Cosine => 1.0 - metric.distance(&a, &b),
        Metric::Dot => -metric.distance(&a, &b),
        Metric::L2 => -metric.distance(&a, &b),
    };
    Ok(Value::Float(similarity as f64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arithmetic_int_preserving() {
        assert_eq!(arithmetic("+", &Value::Int(2), &Value::Int(3)).unwrap(), Value::Int(5));
        assert_eq!(arithmetic("*", &Value::Int(4), &Value::Int(5)).unwrap(), Value::Int(20));
        assert_eq!(arithmetic("%", &Value::Int(7), &Value::Int(3)).unwrap(), Value::Int(1));
        // Division always goes through floats.
        assert_eq!(arithmetic("/", &Value::Int(7), &Value::Int(2)).unwrap(), Value::Float(3.5));
    }

    #[test]
    fn test_arithmetic_null_and_errors() {
        assert_eq!(arithmetic("+", &Value::Null, &Value::Int(1)).unwrap(), Value::Null);
        assert_eq!(arithmetic("/", &Value::Int(1), &Value::Int(0)).unwrap(), Value::Null);
        assert!(arithmetic("+", &Value::from("x"), &Value::Int(1)).is_err());
    }

    #[test]
    fn test_string_builtins() {
        let out = scalar_builtin(
            "CONCAT",
            &[Value::from("a"), Value::Int(1), Value::Null, Value::from("b")],
        )
        .unwrap()
        .unwrap();
        assert_eq!(out, Value::from("a1b"));

        assert_eq!(
            scalar_builtin("UPPER", &[Value::from("abc")]).unwrap().unwrap(),
            Value::from("ABC")
        );
        assert_eq!(
            scalar_builtin("LENGTH", &[Value::from("héllo")]).unwrap().unwrap(),
            Value::Int(5)
        );
        assert_eq!(
            scalar_builtin("CONTAINS", &[Value::from("database"), Value::from("tab")])
                .unwrap()
                .unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            scalar_builtin(
                "SUBSTRING",
                &[Value::from("hello world"), Value::Int(6), Value::Int(5)]
            )
            .unwrap()
            .unwrap(),
            Value::from("world")
        );
    }

    #[test]
    fn test_math_builtins() {
        assert_eq!(
            scalar_builtin("ABS", &[Value::Int(-5)]).unwrap().unwrap(),
            Value::Int(5)
        );
        assert_eq!(
            scalar_builtin("CEIL", &[Value::Float(1.2)]).unwrap().unwrap(),
            Value::Int(2)
        );
        assert_eq!(
            scalar_builtin("FLOOR", &[Value::Float(1.8)]).unwrap().unwrap(),
            Value::Int(1)
        );
        assert_eq!(
            scalar_builtin("ROUND", &[Value::Float(2.5)]).unwrap().unwrap(),
            Value::Int(3)
        );
        assert_eq!(
            scalar_builtin("POW", &[Value::Int(2), Value::Int(10)]).unwrap().unwrap(),
            Value::Float(1024.0)
        );
    }

    #[test]
    fn test_date_builtins() {
        let trunc = scalar_builtin(
            "DATE_TRUNC",
            &[Value::from("month"), Value::from("2024-06-15T13:45:30Z")],
        )
        .unwrap()
        .unwrap();
        assert_eq!(trunc, Value::from("2024-06-01T00:00:00.000Z"));

        let added = scalar_builtin(
            "DATE_ADD",
            &[Value::from("2024-01-31T00:00:00Z"), Value::Int(1), Value::from("month")],
        )
        .unwrap()
        .unwrap();
        // Day clamps to the shorter month.
        assert_eq!(added, Value::from("2024-02-29T00:00:00.000Z"));

        let subbed = scalar_builtin(
            "DATE_SUB",
            &[Value::from("2024-06-15T00:00:00Z"), Value::Int(14), Value::from("days")],
        )
        .unwrap()
        .unwrap();
        assert_eq!(subbed, Value::from("2024-06-01T00:00:00.000Z"));

        // Bare dates parse as midnight.
        let trunc = scalar_builtin(
            "DATE_TRUNC",
            &[Value::from("year"), Value::from("2024-06-15")],
        )
        .unwrap()
        .unwrap();
        assert_eq!(trunc, Value::from("2024-01-01T00:00:00.000Z"));
    }

    #[test]
    fn test_now_is_parseable() {
        let now = scalar_builtin("NOW", &[]).unwrap().unwrap();
        assert!(parse_date(&now).is_ok());
    }

    #[test]
    fn test_unknown_name_returns_none() {
        assert!(scalar_builtin("BM25", &[Value::Null]).unwrap().is_none());
        assert!(scalar_builtin("NO_SUCH_FN", &[]).unwrap().is_none());
    }

    #[test]
    fn test_vector_similarity() {
        let a = Value::Vector(vec![1.0, 0.0]);
        let b = Value::Vector(vec![2.0, 0.0]);
        let orthogonal = Value::Vector(vec![0.0, 3.0]);

        let same = vector_similarity(&a, &b, &Value::from("cosine")).unwrap();
        assert!((same.as_f64().unwrap() - 1.0).abs() < 1e-6);
        let ortho = vector_similarity(&a, &orthogonal, &Value::from("cosine")).unwrap();
        assert!(ortho.as_f64().unwrap().abs() < 1e-6);

        let dot = vector_similarity(&a, &b, &Value::from("dot")).unwrap();
        assert!((dot.as_f64().unwrap() - 2.0).abs() < 1e-6);

        assert!(matches!(
            vector_similarity(&a, &Value::Vector(vec![1.0, 2.0, 3.0]), &Value::from("l2")),
            Err(ThemisError::DimensionMismatch { .. })
        ));
        // A record without the vector field scores null.
        assert_eq!(
            vector_similarity(&Value::Null, &b, &Value::from("l2")).unwrap(),
            Value::Null
        );
    }
}
