//! The AQL abstract syntax tree.

use serde::{Deserialize, Serialize};
use themis_core::value::Value;

/// Binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryOp {
    /// `==`
    Eq,
    /// `!=`
    Ne,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
    /// `AND` / `&&` (short-circuit)
    And,
    /// `OR` / `||` (short-circuit)
    Or,
    /// `XOR`
    Xor,
    /// `+`
    Add,
    /// `-`
    Sub,
    /// `*`
    Mul,
    /// `/`
    Div,
    /// `%`
    Mod,
    /// `IN` (list or subquery membership)
    In,
}

impl BinaryOp {
    /// True for the comparison operators.
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinaryOp::Eq | BinaryOp::Ne | BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge
        )
    }

    /// The comparison with both sides swapped (`a < b` ⇔ `b > a`).
    pub fn flipped(self) -> Self {
        match self {
            BinaryOp::Lt => BinaryOp::Gt,
            BinaryOp::Le => BinaryOp::Ge,
            BinaryOp::Gt => BinaryOp::Lt,
            BinaryOp::Ge => BinaryOp::Le,
            other => other,
        }
    }
}

/// Unary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnaryOp {
    /// `NOT` / `!`
    Not,
    /// Numeric negation.
    Neg,
}

/// How a subquery is consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubqueryKind {
    /// First row's value (null when empty).
    Scalar,
    /// `EXISTS ( ... )`.
    Exists,
}

/// An expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    /// A literal value.
    Literal(Value),
    /// A bound variable (`u`, a `LET` binding, or a CTE row).
    Variable(String),
    /// Field access `base.field`.
    Field(Box<Expr>, String),
    /// Bind parameter `@name`.
    Param(String),
    /// Array literal `[a, b, c]`.
    Array(Vec<Expr>),
    /// Object literal `{k: v, ...}`.
    Object(Vec<(String, Expr)>),
    /// Unary operation.
    Unary(UnaryOp, Box<Expr>),
    /// Binary operation.
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    /// Function call, name stored uppercase.
    Call(String, Vec<Expr>),
    /// Subquery in expression position.
    Subquery(Box<Query>, SubqueryKind),
}

impl Expr {
    /// Dotted path of a `var.a.b` chain: `Some((var, "a.b"))`.
    pub fn as_field_path(&self) -> Option<(&str, String)> {
        match self {
            Expr::Field(base, field) => match base.as_ref() {
                Expr::Variable(var) => Some((var, field.clone())),
                _ => {
                    let (var, inner) = base.as_field_path()?;
                    Some((var, format!("{}.{}", inner, field)))
                }
            },
            _ => None,
        }
    }

    /// True for expressions with no variables, parameters, or
    /// subqueries: safe to evaluate once before execution.
    pub fn is_constant(&self) -> bool {
        match self {
            Expr::Literal(_) => true,
            Expr::Variable(_) | Expr::Param(_) | Expr::Subquery(..) => false,
            Expr::Field(base, _) => base.is_constant(),
            Expr::Array(items) => items.iter().all(Expr::is_constant),
            Expr::Object(fields) => fields.iter().all(|(_, v)| v.is_constant()),
            Expr::Unary(_, inner) => inner.is_constant(),
            Expr::Binary(_, lhs, rhs) => lhs.is_constant() && rhs.is_constant(),
            Expr::Call(name, args) => {
                // NOW() depends on the clock; everything else is pure.
                name != "NOW" && args.iter().all(Expr::is_constant)
            }
        }
    }

    /// Variables referenced anywhere in the expression.
    pub fn referenced_variables(&self, out: &mut Vec<String>) {
        match self {
            Expr::Variable(name) => {
                if !out.contains(name) {
                    out.push(name.clone());
                }
            }
            Expr::Field(base, _) => base.referenced_variables(out),
            Expr::Array(items) => items.iter().for_each(|e| e.referenced_variables(out)),
            Expr::Object(fields) => fields.iter().for_each(|(_, e)| e.referenced_variables(out)),
            Expr::Unary(_, inner) => inner.referenced_variables(out),
            Expr::Binary(_, lhs, rhs) => {
                lhs.referenced_variables(out);
                rhs.referenced_variables(out);
            }
            Expr::Call(_, args) => args.iter().for_each(|e| e.referenced_variables(out)),
            Expr::Literal(_) | Expr::Param(_) => {}
            Expr::Subquery(query, _) => query.referenced_outer_variables(out),
        }
    }
}

/// Traversal direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TraversalDirection {
    /// Follow outbound edges.
    Outbound,
    /// Follow inbound edges.
    Inbound,
    /// Follow both.
    Any,
}

/// A traversal `FOR v[, e[, p]] IN min..max DIR ['type'] start GRAPH 'g'`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraversalClause {
    /// Vertex variable.
    pub vertex_var: String,
    /// Optional edge variable.
    pub edge_var: Option<String>,
    /// Optional path variable.
    pub path_var: Option<String>,
    /// Minimum depth.
    pub min_depth: u32,
    /// Maximum depth.
    pub max_depth: u32,
    /// Direction.
    pub direction: TraversalDirection,
    /// Optional edge-type restriction (scan-level).
    pub edge_type: Option<String>,
    /// Start vertex expression (evaluated once).
    pub start: Expr,
    /// Graph name.
    pub graph: String,
}

/// One `FOR` source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ForClause {
    /// `FOR var IN source` where source is a collection or CTE name.
    Collection {
        /// Bound variable.
        var: String,
        /// Collection (or CTE) name.
        source: String,
    },
    /// A graph traversal.
    Traversal(TraversalClause),
}

impl ForClause {
    /// The primary bound variable of this source.
    pub fn var(&self) -> &str {
        match self {
            ForClause::Collection { var, .. } => var,
            ForClause::Traversal(t) => &t.vertex_var,
        }
    }
}

/// An aggregate function in `COLLECT ... AGGREGATE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AggregateFunc {
    /// Row count.
    Count,
    /// Sum.
    Sum,
    /// Mean.
    Avg,
    /// Minimum.
    Min,
    /// Maximum.
    Max,
    /// Sample standard deviation.
    Stddev,
    /// Sample variance.
    Variance,
    /// Median.
    Median,
    /// Percentile; the second argument gives p in [0, 100].
    Percentile,
}

impl AggregateFunc {
    /// Parse an aggregate name (already uppercased).
    pub fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "COUNT" => AggregateFunc::Count,
            "SUM" => AggregateFunc::Sum,
            "AVG" => AggregateFunc::Avg,
            "MIN" => AggregateFunc::Min,
            "MAX" => AggregateFunc::Max,
            "STDDEV" => AggregateFunc::Stddev,
            "VARIANCE" => AggregateFunc::Variance,
            "MEDIAN" => AggregateFunc::Median,
            "PERCENTILE" => AggregateFunc::Percentile,
            _ => return None,
        })
    }
}

/// One aggregate binding `name = FUNC(expr)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateBinding {
    /// Output variable.
    pub var: String,
    /// The function.
    pub func: AggregateFunc,
    /// Input expression (absent for `COUNT()`).
    pub input: Option<Expr>,
    /// Percentile p, when `func` is `Percentile`.
    pub percentile: Option<f64>,
}

/// A `COLLECT` clause.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectClause {
    /// Grouping bindings `g = expr`.
    pub groups: Vec<(String, Expr)>,
    /// Aggregate bindings.
    pub aggregates: Vec<AggregateBinding>,
    /// Optional `HAVING` predicate over group/aggregate variables.
    pub having: Option<Expr>,
}

/// One sort key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SortKey {
    /// Sort expression.
    pub expr: Expr,
    /// True for ascending.
    pub ascending: bool,
}

/// A body clause, in source order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Clause {
    /// `FILTER expr`
    Filter(Expr),
    /// `LET var = expr`
    Let(String, Expr),
    /// `COLLECT ...`
    Collect(CollectClause),
    /// `SORT key [, key ...]`
    Sort(Vec<SortKey>),
    /// `LIMIT [offset,] count`
    Limit {
        /// Rows skipped.
        offset: u64,
        /// Rows returned.
        count: u64,
    },
}

/// The `RETURN` clause.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReturnClause {
    /// Deduplicate after projection.
    pub distinct: bool,
    /// Projected expression.
    pub expr: Expr,
}

/// A named CTE `WITH name AS ( query )`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cte {
    /// CTE name, usable as a `FOR` source.
    pub name: String,
    /// The inner query.
    pub query: Query,
}

/// A parsed query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    /// Non-recursive CTEs.
    pub ctes: Vec<Cte>,
    /// The `FOR` sources, in order. Multiple sources form implicit
    /// joins.
    pub fors: Vec<ForClause>,
    /// Body clauses in source order.
    pub clauses: Vec<Clause>,
    /// The `RETURN`.
    pub return_clause: ReturnClause,
}

impl Query {
    /// Variables bound inside this query (FOR vars, LET vars, COLLECT
    /// outputs).
    pub fn bound_variables(&self) -> Vec<String> {
        let mut bound = Vec::new();
        for f in &self.fors {
            match f {
                ForClause::Collection { var, .. } => bound.push(var.clone()),
                ForClause::Traversal(t) => {
                    bound.push(t.vertex_var.clone());
                    if let Some(e) = &t.edge_var {
                        bound.push(e.clone());
                    }
                    if let Some(p) = &t.path_var {
                        bound.push(p.clone());
                    }
                }
            }
        }
        for clause in &self.clauses {
            match clause {
                Clause::Let(var, _) => bound.push(var.clone()),
                Clause::Collect(collect) => {
                    bound.extend(collect.groups.iter().map(|(v, _)| v.clone()));
                    bound.extend(collect.aggregates.iter().map(|a| a.var.clone()));
                }
                _ => {}
            }
        }
        bound
    }

    /// Variables a subquery references but does not bind itself
    /// (correlated references to the outer query).
    pub fn referenced_outer_variables(&self, out: &mut Vec<String>) {
        let bound = self.bound_variables();
        let mut referenced = Vec::new();
        for f in &self.fors {
            if let ForClause::Traversal(t) = f {
                t.start.referenced_variables(&mut referenced);
            }
        }
        for clause in &self.clauses {
            match clause {
                Clause::Filter(e) => e.referenced_variables(&mut referenced),
                Clause::Let(_, e) => e.referenced_variables(&mut referenced),
                Clause::Collect(c) => {
                    for (_, e) in &c.groups {
                        e.referenced_variables(&mut referenced);
                    }
                    for a in &c.aggregates {
                        if let Some(e) = &a.input {
                            e.referenced_variables(&mut referenced);
                        }
                    }
                    if let Some(h) = &c.having {
                        h.referenced_variables(&mut referenced);
                    }
                }
                Clause::Sort(keys) => {
                    for k in keys {
                        k.expr.referenced_variables(&mut referenced);
                    }
                }
                Clause::Limit { .. } => {}
            }
        }
        self.return_clause.expr.referenced_variables(&mut referenced);
        for var in referenced {
            if !bound.contains(&var) && !out.contains(&var) {
                out.push(var);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field(var: &str, path: &[&str]) -> Expr {
        let mut expr = Expr::Variable(var.into());
        for p in path {
            expr = Expr::Field(Box::new(expr), p.to_string());
        }
        expr
    }

    #[test]
    fn test_as_field_path() {
        assert_eq!(
            field("u", &["age"]).as_field_path(),
            Some(("u", "age".to_string()))
        );
        assert_eq!(
            field("u", &["address", "city"]).as_field_path(),
            Some(("u", "address.city".to_string()))
        );
        assert_eq!(Expr::Variable("u".into()).as_field_path(), None);
    }

    #[test]
    fn test_is_constant() {
        assert!(Expr::Literal(Value::Int(1)).is_constant());
        assert!(Expr::Binary(
            BinaryOp::Add,
            Box::new(Expr::Literal(Value::Int(1))),
            Box::new(Expr::Literal(Value::Int(2))),
        )
        .is_constant());
        assert!(!field("u", &["age"]).is_constant());
        assert!(!Expr::Param("min".into()).is_constant());
        assert!(!Expr::Call("NOW".into(), vec![]).is_constant());
        assert!(Expr::Call("ABS".into(), vec![Expr::Literal(Value::Int(-3))]).is_constant());
    }

    #[test]
    fn test_referenced_variables() {
        let expr = Expr::Binary(
            BinaryOp::And,
            Box::new(field("u", &["age"])),
            Box::new(field("o", &["total"])),
        );
        let mut vars = Vec::new();
        expr.referenced_variables(&mut vars);
        assert_eq!(vars, vec!["u", "o"]);
    }

    #[test]
    fn test_flipped_comparison() {
        assert_eq!(BinaryOp::Lt.flipped(), BinaryOp::Gt);
        assert_eq!(BinaryOp::Ge.flipped(), BinaryOp::Le);
        assert_eq!(BinaryOp::Eq.flipped(), BinaryOp::Eq);
    }
}
