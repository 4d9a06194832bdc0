//! The planner's cost side: classify filter conjuncts against the
//! index catalog, probe indexes for selectivity, and order the pieces.
//!
//! The model is deliberately light — no histograms. An equality
//! conjunct is costed by reading up to [`SELECTIVITY_PROBE_CAP`] keys
//! from its index; a range conjunct by probing the bounded scan the
//! same way; `FULLTEXT` by the rarest term's document frequency;
//! `VECTOR_KNN` by its `k`. Conjuncts inside one disjunct are ordered
//! smallest-first so the intersection starts from the smallest set, and
//! whatever cannot be indexed is recorded as a residual post-filter
//! rather than silently dropped.

use std::collections::BTreeMap;
use std::sync::Arc;
use themis_aql::ast::{BinaryOp, Expr};
use themis_core::error::{Result, ThemisError};
use themis_core::limits::SELECTIVITY_PROBE_CAP;
use themis_core::value::Value;
use themis_index::catalog::{IndexDescriptor, IndexKind};
use themis_index::range::RangeBound;
use themis_index::vector::Whitelist;
use themis_index::{equality, fulltext, range};
use themis_storage::Snapshot;
use themis_engine::Themis;

/// An index-answerable predicate chosen for one disjunct.
#[derive(Debug, Clone)]
pub enum IndexPred {
    /// Equality (or composite equality) lookup.
    Eq {
        /// The index.
        desc: Arc<IndexDescriptor>,
        /// Lookup values, one per index field.
        values: Vec<Value>,
    },
    /// Range scan.
    Range {
        /// The index.
        desc: Arc<IndexDescriptor>,
        /// Lower bound.
        lo: Option<RangeBound>,
        /// Upper bound.
        hi: Option<RangeBound>,
    },
    /// Fulltext term intersection with BM25 scores.
    Fulltext {
        /// The index.
        desc: Arc<IndexDescriptor>,
        /// The raw query string.
        query: String,
        /// Optional hit limit from the call.
        limit: Option<usize>,
    },
    /// Vector k-NN with distances.
    Knn {
        /// The index.
        desc: Arc<IndexDescriptor>,
        /// The query vector.
        query: Vec<f32>,
        /// Result size.
        k: usize,
        /// Optional pre-filter.
        whitelist: Option<Whitelist>,
    },
}

impl IndexPred {
    /// Index kind label for explain output.
    pub fn kind_label(&self) -> &'static str {
        match self {
            IndexPred::Eq { desc, .. } => match desc.kind() {
                IndexKind::Sparse => "sparse",
                _ => "equality",
            },
            IndexPred::Range { .. } => "range",
            IndexPred::Fulltext { .. } => "fulltext",
            IndexPred::Knn { .. } => "vector",
        }
    }

    /// Index name for explain output.
    pub fn index_name(&self) -> &str {
        match self {
            IndexPred::Eq { desc, .. }
            | IndexPred::Range { desc, .. }
            | IndexPred::Fulltext { desc, .. }
            | IndexPred::Knn { desc, .. } => &desc.name,
        }
    }
}

/// One planned disjunct: indexed predicates (smallest estimate first)
/// plus residual conjuncts for the post-filter.
#[derive(Debug, Clone)]
pub struct DisjunctPlan {
    /// Indexed predicates with their estimates.
    pub preds: Vec<(IndexPred, usize)>,
    /// Conjuncts deferred to the post-filter.
    pub residual: Vec<Expr>,
}

impl DisjunctPlan {
    /// Estimated cardinality: the smallest indexed set, or `usize::MAX`
    /// when nothing is indexed.
    pub fn estimate(&self) -> usize {
        self.preds
            .first()
            .map(|(_, est)| *est)
            .unwrap_or(usize::MAX)
    }
}

/// The access plan of one collection-backed `FOR` source.
#[derive(Debug, Clone)]
pub struct SourceAccess {
    /// Disjuncts to union; `None` means a full collection scan.
    pub disjuncts: Option<Vec<DisjunctPlan>>,
    /// Predicate kept whole for post-filtering when DNF exploded.
    pub fallback_filter: Option<Expr>,
    /// Total estimated rows of the source.
    pub estimate: usize,
}

/// Bounds accumulated per field path while classifying a disjunct.
#[derive(Debug, Default, Clone)]
struct FieldConstraints {
    eq: Option<Value>,
    lo: Option<RangeBound>,
    hi: Option<RangeBound>,
}

fn tighten_lo(slot: &mut Option<RangeBound>, candidate: RangeBound) {
    let replace = match slot {
        None => true,
        Some(existing) => match existing.value.cmp_filter(&candidate.value) {
            Some(std::cmp::Ordering::Less) => true,
            Some(std::cmp::Ordering::Equal) => existing.inclusive && !candidate.inclusive,
            _ => false,
        },
    };
    if replace {
        *slot = Some(candidate);
    }
}

fn tighten_hi(slot: &mut Option<RangeBound>, candidate: RangeBound) {
    let replace = match slot {
        None => true,
        Some(existing) => match existing.value.cmp_filter(&candidate.value) {
            Some(std::cmp::Ordering::Greater) => true,
            Some(std::cmp::Ordering::Equal) => existing.inclusive && !candidate.inclusive,
            _ => false,
        },
    };
    if replace {
        *slot = Some(candidate);
    }
}

/// Classify one disjunct's conjuncts for `var` over `collection`.
///
/// `eval_const` evaluates variable-free expressions (literals, params,
/// constant arithmetic) to values; anything it cannot fold is residual.
pub fn plan_disjunct(
    db: &Themis,
    snapshot: &Snapshot,
    var: &str,
    collection: &str,
    conjuncts: &[Expr],
    eval_const: &dyn Fn(&Expr) -> Option<Value>,
) -> Result<DisjunctPlan> {
    let catalog = db.catalog();
    let mut constraints: BTreeMap<String, FieldConstraints> = BTreeMap::new();
    // Comparison conjuncts by path, kept so whatever an index does not
    // fully answer lands in the post-filter.
    let mut comparisons: Vec<(String, BinaryOp, Expr)> = Vec::new();
    let mut preds: Vec<IndexPred> = Vec::new();
    let mut residual: Vec<Expr> = Vec::new();

    for conjunct in conjuncts {
        match conjunct {
            Expr::Binary(op, lhs, rhs) if op.is_comparison() => {
                // Normalize to field-on-the-left.
                let (path, constant, op) = match (lhs.as_field_path(), rhs.as_field_path()) {
                    (Some((v, path)), None) if v == var => {
                        match eval_const(rhs) {
                            Some(value) => (path, value, *op),
                            None => {
                                residual.push(conjunct.clone());
                                continue;
                            }
                        }
                    }
                    (None, Some((v, path))) if v == var => match eval_const(lhs) {
                        Some(value) => (path, value, op.flipped()),
                        None => {
                            residual.push(conjunct.clone());
                            continue;
                        }
                    },
                    _ => {
                        residual.push(conjunct.clone());
                        continue;
                    }
                };
                if op == BinaryOp::Ne {
                    // Unsplit inequality: post-filter only.
                    residual.push(conjunct.clone());
                    continue;
                }
                let slot = constraints.entry(path.clone()).or_default();
                match op {
                    BinaryOp::Eq => slot.eq = Some(constant),
                    BinaryOp::Lt => tighten_hi(&mut slot.hi, RangeBound::exclusive(constant)),
                    BinaryOp::Le => tighten_hi(&mut slot.hi, RangeBound::inclusive(constant)),
                    BinaryOp::Gt => tighten_lo(&mut slot.lo, RangeBound::exclusive(constant)),
                    BinaryOp::Ge => tighten_lo(&mut slot.lo, RangeBound::inclusive(constant)),
                    _ => unreachable!(),
                }
                comparisons.push((path, op, conjunct.clone()));
            }
            Expr::Call(name, args) if name == "FULLTEXT" => {
                let (field_ok, query, limit) = match args.as_slice() {
                    [field, query] => (
                        matches_var_field(field, var),
                        eval_const(query),
                        None,
                    ),
                    [field, query, limit] => (
                        matches_var_field(field, var),
                        eval_const(query),
                        eval_const(limit).and_then(|v| v.as_i64()).map(|v| v.max(0) as usize),
                    ),
                    _ => (None, None, None),
                };
                match (field_ok, query) {
                    (Some(path), Some(Value::String(query))) => {
                        let desc = catalog
                            .find(collection, IndexKind::Fulltext, &[path.clone()])
                            .ok_or_else(|| {
                                ThemisError::invalid_query(
                                    format!(
                                        "FULLTEXT requires a fulltext index on {}.{}",
                                        collection, path
                                    ),
                                    0,
                                    0,
                                )
                            })?;
                        preds.push(IndexPred::Fulltext { desc, query, limit });
                    }
                    _ => residual.push(conjunct.clone()),
                }
            }
            Expr::Call(name, args) if name == "VECTOR_KNN" => {
                let pred = plan_knn(db, collection, args, eval_const)?;
                preds.push(pred);
            }
            other => residual.push(other.clone()),
        }
    }

    // Composite equality first: the index whose field list is fully
    // covered by equality constraints and is longest wins those fields.
    let mut claimed: Vec<String> = Vec::new();
    let mut candidates: Vec<Arc<IndexDescriptor>> = catalog
        .for_collection(collection)
        .into_iter()
        .filter(|d| matches!(d.kind(), IndexKind::Equality | IndexKind::Sparse))
        .collect();
    candidates.sort_by(|a, b| b.fields.len().cmp(&a.fields.len()));
    for desc in candidates {
        if desc.fields.iter().any(|f| claimed.contains(f)) {
            continue;
        }
        let values: Option<Vec<Value>> = desc
            .fields
            .iter()
            .map(|f| constraints.get(f).and_then(|c| c.eq.clone()))
            .collect();
        if let Some(values) = values {
            // A sparse index cannot answer a null lookup.
            if desc.kind() == IndexKind::Sparse && values.iter().any(Value::is_null) {
                continue;
            }
            claimed.extend(desc.fields.iter().cloned());
            preds.push(IndexPred::Eq { desc, values });
        }
    }

    // Range indexes for bounded (or equality-less) fields not already
    // claimed by an equality lookup.
    let mut range_covered: Vec<(String, bool)> = Vec::new();
    for (path, constraint) in &constraints {
        if claimed.contains(path) {
            continue;
        }
        let has_bounds = constraint.lo.is_some() || constraint.hi.is_some();
        let eq_as_range = constraint.eq.clone().map(RangeBound::inclusive);
        if !has_bounds && eq_as_range.is_none() {
            continue;
        }
        if let Some(desc) = catalog.find(collection, IndexKind::Range, &[path.clone()]) {
            let (lo, hi) = match &eq_as_range {
                Some(point) => (Some(point.clone()), Some(point.clone())),
                None => (constraint.lo.clone(), constraint.hi.clone()),
            };
            // When an equality point drives the scan, any extra bounds
            // on the same path stay in the post-filter.
            range_covered.push((path.clone(), eq_as_range.is_some()));
            preds.push(IndexPred::Range { desc, lo, hi });
        }
    }

    // Whatever no index fully answers becomes a residual post-filter.
    for (path, op, expr) in comparisons {
        let eq_claimed = claimed.contains(&path) && op == BinaryOp::Eq;
        let by_range = range_covered.iter().any(|(p, via_eq_point)| {
            *p == path
                && if *via_eq_point {
                    op == BinaryOp::Eq
                } else {
                    op != BinaryOp::Eq
                }
        });
        if !eq_claimed && !by_range {
            residual.push(expr);
        }
    }

    // Cost every predicate and order smallest-first for intersection.
    let mut costed: Vec<(IndexPred, usize)> = Vec::with_capacity(preds.len());
    for pred in preds {
        let estimate = estimate_pred(db, snapshot, &pred)?;
        costed.push((pred, estimate));
    }
    costed.sort_by_key(|(_, est)| *est);

    Ok(DisjunctPlan {
        preds: costed,
        residual,
    })
}

fn plan_knn(
    db: &Themis,
    collection: &str,
    args: &[Expr],
    eval_const: &dyn Fn(&Expr) -> Option<Value>,
) -> Result<IndexPred> {
    let bad = |msg: &str| ThemisError::invalid_query(format!("VECTOR_KNN: {}", msg), 0, 0);
    if args.len() < 3 || args.len() > 4 {
        return Err(bad("expects (collection, query_vector, k [, whitelist])"));
    }
    let target = match eval_const(&args[0]) {
        Some(Value::String(s)) => s,
        _ => return Err(bad("collection must be a string")),
    };
    if target != collection {
        return Err(bad(&format!(
            "targets collection '{}' but the loop variable iterates '{}'",
            target, collection
        )));
    }
    let query = eval_const(&args[1])
        .and_then(|v| v.as_vector())
        .ok_or_else(|| bad("query vector must be a constant vector"))?;
    let k = eval_const(&args[2])
        .and_then(|v| v.as_i64())
        .filter(|k| *k >= 0)
        .ok_or_else(|| bad("k must be a non-negative integer"))? as usize;
    let whitelist = match args.get(3) {
        None => None,
        Some(expr) => match eval_const(expr) {
            Some(Value::String(prefix)) => Some(Whitelist::Prefix(prefix)),
            Some(Value::Array(items)) => {
                let pks: Option<std::collections::HashSet<String>> = items
                    .iter()
                    .map(|v| v.as_str().map(str::to_string))
                    .collect();
                Some(Whitelist::Pks(pks.ok_or_else(|| {
                    bad("whitelist array must contain strings")
                })?))
            }
            _ => return Err(bad("whitelist must be a pk array or prefix string")),
        },
    };
    let desc = db
        .catalog()
        .for_collection(collection)
        .into_iter()
        .find(|d| d.kind() == IndexKind::Vector)
        .ok_or_else(|| bad(&format!("no vector index on collection '{}'", collection)))?;
    Ok(IndexPred::Knn {
        desc,
        query,
        k,
        whitelist,
    })
}

fn matches_var_field(expr: &Expr, var: &str) -> Option<String> {
    expr.as_field_path()
        .filter(|(v, _)| *v == var)
        .map(|(_, path)| path)
}

/// Probe-based cardinality estimate for one predicate.
pub fn estimate_pred(db: &Themis, snapshot: &Snapshot, pred: &IndexPred) -> Result<usize> {
    match pred {
        IndexPred::Eq { desc, values } => {
            equality::probe_count(db.store(), snapshot, desc, values, SELECTIVITY_PROBE_CAP)
        }
        IndexPred::Range { desc, lo, hi } => range::probe_count(
            db.store(),
            snapshot,
            desc,
            lo.as_ref(),
            hi.as_ref(),
            SELECTIVITY_PROBE_CAP,
        ),
        IndexPred::Fulltext { desc, query, .. } => {
            fulltext::probe_count(db.store(), snapshot, desc, query, SELECTIVITY_PROBE_CAP)
        }
        IndexPred::Knn { k, .. } => Ok(*k),
    }
}

/// Estimate the unconstrained size of a collection by probing its
/// prefix.
pub fn estimate_collection(db: &Themis, snapshot: &Snapshot, collection: &str) -> usize {
    let prefix = themis_core::key::Pk::collection_prefix(collection);
    db.store()
        .prefix_iter(
            themis_index::keys::CF_ENTITIES,
            &prefix,
            snapshot,
            themis_core::types::Direction::Forward,
        )
        .take(SELECTIVITY_PROBE_CAP * 4)
        .count()
}
