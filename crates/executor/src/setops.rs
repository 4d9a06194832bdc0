//! Set operations over sorted primary-key streams.
//!
//! Conjunctive filters intersect, disjunctive filters union, and
//! negated index-answerable predicates subtract. All three walk their
//! inputs pairwise, so cost is linear in the stream lengths and the
//! output stays sorted for the next operation.

/// `a ∩ b`, both sorted ascending.
pub fn intersect_sorted(a: &[String], b: &[String]) -> Vec<String> {
    let mut out = Vec::new();
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        match a[i].cmp(&b[j]) {
            std::cmp::Ordering::Less => i += 1,
            std::cmp::Ordering::Greater => j += 1,
            std::cmp::Ordering::Equal => {
                out.push(a[i].clone());
                i += 1;
                j += 1;
            }
        }
    }
    out
}

/// `a ∪ b`, both sorted ascending, output deduplicated.
pub fn union_sorted(a: &[String], b: &[String]) -> Vec<String> {
    let mut out = Vec::with_capacity(a.len() + b.len());
    let (mut i, mut j) = (0, 0);
    while i < a.len() || j < b.len() {
        match (a.get(i), b.get(j)) {
            (Some(x), Some(y)) => match x.cmp(y) {
                std::cmp::Ordering::Less => {
                    out.push(x.clone());
                    i += 1;
                }
                std::cmp::Ordering::Greater => {
                    out.push(y.clone());
                    j += 1;
                }
                std::cmp::Ordering::Equal => {
                    out.push(x.clone());
                    i += 1;
                    j += 1;
                }
            },
            (Some(x), None) => {
                out.push(x.clone());
                i += 1;
            }
            (None, Some(y)) => {
                out.push(y.clone());
                j += 1;
            }
            (None, None) => break,
        }
    }
    out
}

/// `a \ b`, both sorted ascending.
pub fn difference_sorted(a: &[String], b: &[String]) -> Vec<String> {
    let mut out = Vec::new();
    let (mut i, mut j) = (0, 0);
    while i < a.len() {
        match b.get(j) {
            None => {
                out.extend_from_slice(&a[i..]);
                break;
            }
            Some(y) => match a[i].cmp(y) {
                std::cmp::Ordering::Less => {
                    out.push(a[i].clone());
                    i += 1;
                }
                std::cmp::Ordering::Greater => j += 1,
                std::cmp::Ordering::Equal => {
                    i += 1;
                    j += 1;
                }
            },
        }
    }
    out
}
