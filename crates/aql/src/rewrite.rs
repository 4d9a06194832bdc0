//! Boolean rewriting.
//!
//! The translator normalizes filter predicates before planning:
//!
//! - double negation is eliminated;
//! - `NOT` is pushed through `AND`/`OR` by De Morgan and through
//!   comparisons by operator inversion, so residual `NOT`s survive only
//!   around opaque expressions (function calls, subqueries);
//! - `field != literal` splits into `(field < lit) OR (field > lit)`,
//!   which the index layer can answer as two range scans;
//! - the result is normalized to DNF (an OR of AND-conjunct lists) for
//!   index-union planning, with an explosion cap: past
//!   [`DNF_CONJUNCT_CAP`] total conjuncts the original predicate is
//!   kept for post-filtering instead.

use crate::ast::{BinaryOp, Expr, UnaryOp};
use themis_core::limits::DNF_CONJUNCT_CAP;

/// Push negations inward and drop double negations.
pub fn push_negations(expr: &Expr) -> Expr {
    rewrite_not(expr, false)
}

fn rewrite_not(expr: &Expr, negated: bool) -> Expr {
    match expr {
        Expr::Unary(UnaryOp::Not, inner) => rewrite_not(inner, !negated),
        Expr::Binary(BinaryOp::And, lhs, rhs) => {
            let (lhs, rhs) = (rewrite_not(lhs, negated), rewrite_not(rhs, negated));
            // De Morgan: NOT(A AND B) = NOT A OR NOT B.
            let op = if negated { BinaryOp::Or } else { BinaryOp::And };
            Expr::Binary(op, Box::new(lhs), Box::new(rhs))
        }
        Expr::Binary(BinaryOp::Or, lhs, rhs) => {
            let (lhs, rhs) = (rewrite_not(lhs, negated), rewrite_not(rhs, negated));
            let op = if negated { BinaryOp::And } else { BinaryOp::Or };
            Expr::Binary(op, Box::new(lhs), Box::new(rhs))
        }
        Expr::Binary(op, lhs, rhs) if op.is_comparison() && negated => {
            let inverted = match op {
                BinaryOp::Eq => BinaryOp::Ne,
                BinaryOp::Ne => BinaryOp::Eq,
                BinaryOp::Lt => BinaryOp::Ge,
                BinaryOp::Le => BinaryOp::Gt,
                BinaryOp::Gt => BinaryOp::Le,
                BinaryOp::Ge => BinaryOp::Lt,
                _ => unreachable!(),
            };
            Expr::Binary(inverted, lhs.clone(), rhs.clone())
        }
        other => {
            if negated {
                Expr::Unary(UnaryOp::Not, Box::new(other.clone()))
            } else {
                other.clone()
            }
        }
    }
}

/// Split `field != literal` into `(field < lit) OR (field > lit)` when
/// the shape is indexable (field access vs. constant). Non-indexable
/// inequalities stay as they are for post-filtering.
pub fn split_inequalities(expr: &Expr) -> Expr {
    match expr {
        Expr::Binary(BinaryOp::Ne, lhs, rhs) => {
            let indexable = (lhs.as_field_path().is_some() && rhs.is_constant())
                || (rhs.as_field_path().is_some() && lhs.is_constant());
            if indexable {
                Expr::Binary(
                    BinaryOp::Or,
                    Box::new(Expr::Binary(BinaryOp::Lt, lhs.clone(), rhs.clone())),
                    Box::new(Expr::Binary(BinaryOp::Gt, lhs.clone(), rhs.clone())),
                )
            } else {
                expr.clone()
            }
        }
        Expr::Binary(op @ (BinaryOp::And | BinaryOp::Or), lhs, rhs) => Expr::Binary(
            *op,
            Box::new(split_inequalities(lhs)),
            Box::new(split_inequalities(rhs)),
        ),
        other => other.clone(),
    }
}

/// Disjunctive normal form: a vector of disjuncts, each a vector of
/// conjuncts. Returns `None` when normalization would exceed the
/// conjunct cap; callers fall back to post-filtering the original
/// predicate.
pub fn to_dnf(expr: &Expr) -> Option<Vec<Vec<Expr>>> {
    let normalized = split_inequalities(&push_negations(expr));
    let dnf = dnf_of(&normalized)?;
    let total: usize = dnf.iter().map(Vec::len).sum();
    if total > DNF_CONJUNCT_CAP {
        return None;
    }
    Some(dnf)
}

fn dnf_of(expr: &Expr) -> Option<Vec<Vec<Expr>>> {
    match expr {
        Expr::Binary(BinaryOp::Or, lhs, rhs) => {
            let mut out = dnf_of(lhs)?;
            out.extend(dnf_of(rhs)?);
            if out.iter().map(Vec::len).sum::<usize>() > DNF_CONJUNCT_CAP {
                return None;
            }
            Some(out)
        }
        Expr::Binary(BinaryOp::And, lhs, rhs) => {
            let left = dnf_of(lhs)?;
            let right = dnf_of(rhs)?;
            // Cross product of the two disjunct sets.
            let mut out = Vec::with_capacity(left.len() * right.len());
            for l in &left {
                for r in &right {
                    let mut conjuncts = l.clone();
                    conjuncts.extend(r.iter().cloned());
                    out.push(conjuncts);
                }
            }
            if out.iter().map(Vec::len).sum::<usize>() > DNF_CONJUNCT_CAP {
                return None;
            }
            Some(out)
        }
        // XOR stays opaque: it is not index-friendly either way.
        other => Some(vec![vec![other.clone()]]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use themis_core::value::Value;

    fn field(var: &str, name: &str) -> Expr {
        Expr::Field(Box::new(Expr::Variable(var.into())), name.into())
    }

    fn lit(v: i64) -> Expr {
        Expr::Literal(Value::Int(v))
    }

    fn cmp(op: BinaryOp, lhs: Expr, rhs: Expr) -> Expr {
        Expr::Binary(op, Box::new(lhs), Box::new(rhs))
    }

    fn not(e: Expr) -> Expr {
        Expr::Unary(UnaryOp::Not, Box::new(e))
    }

    #[test]
    fn test_double_negation_eliminated() {
        let e = not(not(cmp(BinaryOp::Eq, field("u", "a"), lit(1))));
        assert_eq!(push_negations(&e), cmp(BinaryOp::Eq, field("u", "a"), lit(1)));
    }

    #[test]
    fn test_de_morgan_or() {
        // NOT (A OR B) => NOT A AND NOT B, with comparisons inverted.
        let e = not(cmp(
            BinaryOp::Or,
            cmp(BinaryOp::Eq, field("u", "a"), lit(1)),
            cmp(BinaryOp::Lt, field("u", "b"), lit(2)),
        ));
        let expected = cmp(
            BinaryOp::And,
            cmp(BinaryOp::Ne, field("u", "a"), lit(1)),
            cmp(BinaryOp::Ge, field("u", "b"), lit(2)),
        );
        assert_eq!(push_negations(&e), expected);
    }

    #[test]
    fn test_de_morgan_and() {
        let e = not(cmp(
            BinaryOp::And,
            cmp(BinaryOp::Ge, field("u", "a"), lit(1)),
            cmp(BinaryOp::Le, field("u", "b"), lit(2)),
        ));
        let expected = cmp(
            BinaryOp::Or,
            cmp(BinaryOp::Lt, field("u", "a"), lit(1)),
            cmp(BinaryOp::Gt, field("u", "b"), lit(2)),
        );
        assert_eq!(push_negations(&e), expected);
    }

    #[test]
    fn test_residual_not_kept_for_opaque_expressions() {
        let call = Expr::Call("FULLTEXT".into(), vec![field("d", "body")]);
        let e = not(call.clone());
        assert_eq!(push_negations(&e), not(call));
    }

    #[test]
    fn test_split_inequality_on_indexable_shape() {
        let e = cmp(BinaryOp::Ne, field("u", "age"), lit(5));
        let split = split_inequalities(&e);
        assert_eq!(
            split,
            cmp(
                BinaryOp::Or,
                cmp(BinaryOp::Lt, field("u", "age"), lit(5)),
                cmp(BinaryOp::Gt, field("u", "age"), lit(5)),
            )
        );

        // Field-vs-field inequality is not index-friendly; untouched.
        let opaque = cmp(BinaryOp::Ne, field("u", "a"), field("u", "b"));
        assert_eq!(split_inequalities(&opaque), opaque);
    }

    #[test]
    fn test_dnf_of_conjunction_of_disjunctions() {
        // (a == 1 OR b == 2) AND c == 3 => two disjuncts of two conjuncts.
        let e = cmp(
            BinaryOp::And,
            cmp(
                BinaryOp::Or,
                cmp(BinaryOp::Eq, field("u", "a"), lit(1)),
                cmp(BinaryOp::Eq, field("u", "b"), lit(2)),
            ),
            cmp(BinaryOp::Eq, field("u", "c"), lit(3)),
        );
        let dnf = to_dnf(&e).unwrap();
        assert_eq!(dnf.len(), 2);
        assert!(dnf.iter().all(|conj| conj.len() == 2));
    }

    #[test]
    fn test_dnf_simple_conjunction_is_single_disjunct() {
        let e = cmp(
            BinaryOp::And,
            cmp(BinaryOp::Eq, field("u", "a"), lit(1)),
            cmp(BinaryOp::Ge, field("u", "b"), lit(2)),
        );
        let dnf = to_dnf(&e).unwrap();
        assert_eq!(dnf.len(), 1);
        assert_eq!(dnf[0].len(), 2);
    }

    #[test]
    fn test_de_morgan_correctness_example() {
        // NOT (A OR B) with A=true, B=false must be false; the rewrite
        // preserves that: NOT A AND NOT B = false AND true = false.
        let e = not(cmp(
            BinaryOp::Or,
            Expr::Literal(Value::Bool(true)),
            Expr::Literal(Value::Bool(false)),
        ));
        match push_negations(&e) {
            Expr::Binary(BinaryOp::And, lhs, rhs) => {
                assert_eq!(*lhs, not(Expr::Literal(Value::Bool(true))));
                assert_eq!(*rhs, not(Expr::Literal(Value::Bool(false))));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_dnf_cap_triggers_fallback() {
        // A chain of ORs of ANDs that multiplies out past the cap.
        let mut e = cmp(
            BinaryOp::Or,
            cmp(BinaryOp::Eq, field("u", "a"), lit(0)),
            cmp(BinaryOp::Eq, field("u", "b"), lit(0)),
        );
        for i in 1..8 {
            let pair = cmp(
                BinaryOp::Or,
                cmp(BinaryOp::Eq, field("u", "a"), lit(i)),
                cmp(BinaryOp::Eq, field("u", "b"), lit(i)),
            );
            e = cmp(BinaryOp::And, e, pair);
        }
        assert!(to_dnf(&e).is_none());
    }
}
