//! Partition-aware window functions.
//!
//! Window calls appear in `RETURN` position and are computed over the
//! fully staged row set (after filters and sort, before projection):
//! `ROW_NUMBER([partition])`, `RANK(order [, partition])`,
//! `DENSE_RANK(order [, partition])`, `LAG(expr, offset [, partition])`,
//! `LEAD(expr, offset [, partition])`, `FIRST_VALUE(expr [, partition])`,
//! `LAST_VALUE(expr [, partition])`. Rows keep their current order
//! inside each partition — `SORT` upstream defines the frame order.

use themis_core::error::{Result, ThemisError};
use themis_core::value::Value;

/// The supported window functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowFunc {
    /// 1-based position within the partition.
    RowNumber,
    /// Rank with gaps, over the order expression's values.
    Rank,
    /// Rank without gaps.
    DenseRank,
    /// Value of the expression `offset` rows back.
    Lag,
    /// Value of the expression `offset` rows ahead.
    Lead,
    /// First value of the expression in the partition.
    FirstValue,
    /// Last value of the expression in the partition.
    LastValue,
}

impl WindowFunc {
    /// Parse an (uppercased) call name.
    pub fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "ROW_NUMBER" => WindowFunc::RowNumber,
            "RANK" => WindowFunc::Rank,
            "DENSE_RANK" => WindowFunc::DenseRank,
            "LAG" => WindowFunc::Lag,
            "LEAD" => WindowFunc::Lead,
            "FIRST_VALUE" => WindowFunc::FirstValue,
            "LAST_VALUE" => WindowFunc::LastValue,
            _ => return None,
        })
    }
}

/// Inputs per row for one window computation: the partition key, the
/// order/input value (unused for `ROW_NUMBER`), and the lag/lead
/// offset.
pub struct WindowInput {
    /// Partition key per row (all-equal for a single partition).
    pub partitions: Vec<Value>,
    /// Order or input values per row.
    pub values: Vec<Value>,
    /// Offset for `LAG`/`LEAD`.
    pub offset: usize,
}

/// Compute a window function over rows in their current order. Returns
/// one output value per row.
pub fn compute(func: WindowFunc, input: &WindowInput) -> Result<Vec<Value>> {
    let n = input.partitions.len();
    if input.values.len() != n {
        return Err(ThemisError::internal(
            "window input length mismatch",
        ));
    }
    let mut out = vec![Value::Null; n];

    // Group row indices by partition key, preserving order.
    let mut partitions: Vec<(Value, Vec<usize>)> = Vec::new();
    for (idx, key) in input.partitions.iter().enumerate() {
        match partitions.iter_mut().find(|(k, _)| k == key) {
            Some((_, rows)) => rows.push(idx),
            None => partitions.push((key.clone(), vec![idx])),
        }
    }

    for (_, rows) in &partitions {
        match func {
            WindowFunc::RowNumber => {
                for (pos, &idx) in rows.iter().enumerate() {
                    out[idx] = Value::Int((pos + 1) as i64);
                }
            }
            WindowFunc::Rank | WindowFunc::DenseRank => {
                let mut rank = 0i64;
                let mut dense = 0i64;
                let mut previous: Option<&Value> = None;
                for (pos, &idx) in rows.iter().enumerate() {
                    let current = &input.values[idx];
                    let is_tie = previous
                        .map(|p| p.cmp_sort(current) == std::cmp::Ordering::Equal)
                        .unwrap_or(false);
                    if !is_tie {
                        rank = (pos + 1) as i64;
                        dense += 1;
                    }
                    out[idx] = Value::Int(if func == WindowFunc::Rank { rank } else { dense });
                    previous = Some(current);
                }
            }
            WindowFunc::Lag => {
                for (pos, &idx) in rows.iter().enumerate() {
                    if pos >= input.offset {
                        out[idx] = input.values[rows[pos - input.offset]].clone();
                    }
                }
            }
            WindowFunc::Lead => {
                for (pos, &idx) in rows.iter().enumerate() {
                    if pos + input.offset < rows.len() {
                        out[idx] = input.values[rows[pos + input.offset]].clone();
                    }
                }
            }
            WindowFunc::FirstValue => {
                let first = input.values[rows[0]].clone();
                for &idx in rows {
                    out[idx] = first.clone();
                }
            }
            WindowFunc::LastValue => {
                let last = input.values[*rows.last().expect("non-empty partition")].clone();
                for &idx in rows {
                    out[idx] = last.clone();
                }
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ints(values: &[i64]) -> Vec<Value> {
        values.iter().map(|v| Value::Int(*v)).collect()
    }

    fn single_partition(values: &[i64]) -> WindowInput {
        WindowInput {
            partitions: vec![Value::Null; values.len()],
            values: ints(values),
            offset: 1,
        }
    }

    #[test]
    fn test_row_number() {
        let out = compute(WindowFunc::RowNumber, &single_partition(&[30, 10, 20])).unwrap();
        assert_eq!(out, ints(&[1, 2, 3]));
    }

    #[test]
    fn test_rank_and_dense_rank_with_ties() {
        // Ordered values with a tie: 10, 10, 20, 30.
        let input = single_partition(&[10, 10, 20, 30]);
        assert_eq!(compute(WindowFunc::Rank, &input).unwrap(), ints(&[1, 1, 3, 4]));
        assert_eq!(
            compute(WindowFunc::DenseRank, &input).unwrap(),
            ints(&[1, 1, 2, 3])
        );
    }

    #[test]
    fn test_lag_and_lead() {
        let input = single_partition(&[1, 2, 3]);
        assert_eq!(
            compute(WindowFunc::Lag, &input).unwrap(),
            vec![Value::Null, Value::Int(1), Value::Int(2)]
        );
        assert_eq!(
            compute(WindowFunc::Lead, &input).unwrap(),
            vec![Value::Int(2), Value::Int(3), Value::Null]
        );
    }

    #[test]
    fn test_first_and_last_value() {
        let input = single_partition(&[7, 8, 9]);
        assert_eq!(compute(WindowFunc::FirstValue, &input).unwrap(), ints(&[7, 7, 7]));
        assert_eq!(compute(WindowFunc::LastValue, &input).unwrap(), ints(&[9, 9, 9]));
    }

    #[test]
    fn test_partitions_are_independent() {
        let input = WindowInput {
            partitions: vec![
                Value::from("a"),
                Value::from("b"),
                Value::from("a"),
                Value::from("b"),
            ],
            values: ints(&[1, 2, 3, 4]),
            offset: 1,
        };
        assert_eq!(
            compute(WindowFunc::RowNumber, &input).unwrap(),
            ints(&[1, 1, 2, 2])
        );
        assert_eq!(
            compute(WindowFunc::Lag, &input).unwrap(),
            vec![Value::Null, Value::Null, Value::Int(1), Value::Int(2)]
        );
    }
}
