//! Query execution.
//!
//! `execute_aql` parses, plans, and runs a query against a pinned
//! snapshot. The pipeline mirrors the clause list: sources (index-merge
//! scans, full scans, traversals, CTE scans) produce rows, joins fold
//! in later `FOR`s (hash join for equi-predicates, nested loop
//! otherwise), and the remaining clauses run in source order. Filters
//! that the planner pushed into a scan are not re-evaluated; everything
//! else is a post stage.
//!
//! Ordered pagination runs through the streaming path: a query driven
//! by a range index (or plain pk order) fetches `count + 1` rows,
//! reports `has_more`, and issues an opaque resume token. Invalid or
//! stale tokens yield an empty page with `has_more = false` — never an
//! error.

use crate::eval;
use crate::setops::{intersect_sorted, union_sorted};
use crate::explain::ExplainNode;
use crate::optimizer::{self, DisjunctPlan, IndexPred};
use crate::window::{self, WindowFunc, WindowInput};
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::HashMap;
use std::time::Instant;
use themis_aql::ast::{
    AggregateBinding, AggregateFunc, Clause, CollectClause, Expr, ForClause, Query, SortKey,
    SubqueryKind, TraversalDirection, UnaryOp,
};
use themis_aql::rewrite;
use themis_aql::BinaryOp;
use themis_core::cursor::{CursorToken, CURSOR_FORMAT_VERSION};
use themis_core::deadline::Deadline;
use themis_core::error::{Result, ThemisError};
use themis_core::key::Pk;
use themis_core::types::Direction;
use themis_core::value::Value;
use themis_engine::entity;
use themis_engine::traverse::{TraversalPredicates, TraversalSpec, TraverseDirection};
use themis_engine::Themis;
use themis_index::catalog::IndexKind;
use themis_index::fulltext::analyzer;
use themis_index::range::RangeBound;
use themis_index::{equality, fulltext, range};
use themis_storage::Snapshot;
use tracing::debug;

/// Options of one `execute_aql` call.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// Page with an opaque cursor instead of offset slicing.
    pub use_cursor: bool,
    /// Resume token from a previous page.
    pub cursor: Option<String>,
    /// Attach the explain tree to the result.
    pub explain: bool,
    /// Per-query timeout override (clamped to the legal range).
    pub timeout_ms: Option<u64>,
    /// Permit full collection scans when nothing is indexable. On by
    /// default; turning it off makes such queries fail fast.
    pub allow_full_scan: bool,
}

impl QueryOptions {
    /// Defaults with full scans allowed.
    pub fn new() -> Self {
        QueryOptions {
            allow_full_scan: true,
            ..QueryOptions::default()
        }
    }
}

/// The result of one query.
#[derive(Debug, Clone)]
pub struct QueryResult {
    /// Projected rows.
    pub rows: Vec<Value>,
    /// True when more rows exist past this page.
    pub has_more: bool,
    /// Resume token, when the page came from an ordered, resumable
    /// scan.
    pub next_cursor: Option<String>,
    /// Explain tree, when requested.
    pub explain: Option<ExplainNode>,
}

/// One pipeline row: variable bindings plus per-variable scores and the
/// driving scan position for cursor paging.
#[derive(Debug, Clone, Default)]
struct Row {
    bindings: FxHashMap<String, Value>,
    scores: FxHashMap<String, f64>,
    position: Option<(Vec<u8>, String)>,
}

impl Row {
    fn bind(mut self, var: &str, value: Value) -> Self {
        self.bindings.insert(var.to_string(), value);
        self
    }
}

/// Execute an AQL query.
pub fn execute_aql(
    db: &Themis,
    query_text: &str,
    params: HashMap<String, Value>,
    options: QueryOptions,
) -> Result<QueryResult> {
    let query = themis_aql::parse(query_text)?;
    let deadline = match options.timeout_ms {
        Some(ms) => Deadline::from_timeout_ms(ms),
        None => db.default_deadline(),
    };
    let snapshot = db.snapshot();
    let mut exec = Exec {
        db,
        snapshot,
        params,
        deadline,
        allow_full_scan: options.allow_full_scan,
        ctes: FxHashMap::default(),
        explain: ExplainNode::new("Query"),
    };
    let started = Instant::now();

    // The streaming path handles ordered pagination; everything else
    // goes through the general pipeline.
    let outcome = match exec.try_streaming(&query, &options)? {
        Some(outcome) => outcome,
        None => {
            if options.cursor.is_some() {
                // A cursor against a non-resumable query shape is a
                // stale token: empty page, not an error.
                debug!("cursor supplied for a non-resumable query; returning empty page");
                Outcome {
                    rows: Vec::new(),
                    has_more: false,
                    next_cursor: None,
                }
            } else {
                exec.run_general(&query)?
            }
        }
    };

    let explain = if options.explain {
        let mut root = std::mem::replace(&mut exec.explain, ExplainNode::new("Query"));
        root.actual_rows = outcome.rows.len() as u64;
        root.duration_ms = started.elapsed().as_secs_f64() * 1000.0;
        Some(root)
    } else {
        None
    };
    Ok(QueryResult {
        rows: outcome.rows,
        has_more: outcome.has_more,
        next_cursor: outcome.next_cursor,
        explain,
    })
}

struct Outcome {
    rows: Vec<Value>,
    has_more: bool,
    next_cursor: Option<String>,
}

struct Exec<'a> {
    db: &'a Themis,
    snapshot: Snapshot,
    params: HashMap<String, Value>,
    deadline: Deadline,
    allow_full_scan: bool,
    ctes: FxHashMap<String, Vec<Value>>,
    explain: ExplainNode,
}

impl<'a> Exec<'a> {
    // ========================================================================
    // Expression evaluation
    // ========================================================================

    fn eval_const(&mut self, expr: &Expr) -> Option<Value> {
        match expr {
            Expr::Param(name) => self.params.get(name).cloned(),
            Expr::Literal(v) => Some(v.clone()),
            _ if expr.is_constant() => self.eval(expr, &Row::default()).ok(),
            _ => None,
        }
    }

    fn eval(&mut self, expr: &Expr, row: &Row) -> Result<Value> {
        match expr {
            Expr::Literal(v) => Ok(v.clone()),
            Expr::Param(name) => self.params.get(name).cloned().ok_or_else(|| {
                ThemisError::invalid_query(format!("unbound parameter @{}", name), 0, 0)
            }),
            Expr::Variable(name) => match row.bindings.get(name) {
                Some(value) => Ok(value.clone()),
                None => Err(ThemisError::invalid_query(
                    format!("unresolved variable '{}'", name),
                    0,
                    0,
                )),
            },
            Expr::Field(base, field) => {
                let base = self.eval(base, row)?;
                Ok(base.get(field).cloned().unwrap_or(Value::Null))
            }
            Expr::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(self.eval(item, row)?);
                }
                Ok(Value::Array(out))
            }
            Expr::Object(fields) => {
                let mut out = std::collections::BTreeMap::new();
                for (key, value) in fields {
                    out.insert(key.clone(), self.eval(value, row)?);
                }
                Ok(Value::Object(out))
            }
            Expr::Unary(UnaryOp::Not, inner) => {
                let v = self.eval(inner, row)?;
                Ok(Value::Bool(!v.is_truthy()))
            }
            Expr::Unary(UnaryOp::Neg, inner) => {
                let v = self.eval(inner, row)?;
                match v {
                    Value::Null => Ok(Value::Null),
                    Value::Int(x) => Ok(Value::Int(-x)),
                    Value::Float(x) => Ok(Value::Float(-x)),
                    _ => Err(ThemisError::invalid_query(
                        "unary minus requires a number",
                        0,
                        0,
                    )),
                }
            }
            Expr::Binary(op, lhs, rhs) => self.eval_binary(*op, lhs, rhs, row),
            Expr::Call(name, args) => self.eval_call(name, args, row),
            Expr::Subquery(query, kind) => {
                let rows = self.run_subquery(query, row)?;
                match kind {
                    SubqueryKind::Exists => Ok(Value::Bool(!rows.is_empty())),
                    SubqueryKind::Scalar => Ok(Value::Array(rows)),
                }
            }
        }
    }

    fn eval_binary(&mut self, op: BinaryOp, lhs: &Expr, rhs: &Expr, row: &Row) -> Result<Value> {
        match op {
            BinaryOp::And => {
                // Short-circuit: a false left side never evaluates the
                // right side.
                let l = self.eval(lhs, row)?;
                if !l.is_truthy() {
                    return Ok(Value::Bool(false));
                }
                Ok(Value::Bool(self.eval(rhs, row)?.is_truthy()))
            }
            BinaryOp::Or => {
                let l = self.eval(lhs, row)?;
                if l.is_truthy() {
                    return Ok(Value::Bool(true));
                }
                Ok(Value::Bool(self.eval(rhs, row)?.is_truthy()))
            }
            BinaryOp::Xor => {
                let l = self.eval(lhs, row)?.is_truthy();
                let r = self.eval(rhs, row)?.is_truthy();
                Ok(Value::Bool(l ^ r))
            }
            BinaryOp::Eq | BinaryOp::Ne => {
                let l = self.eval(lhs, row)?;
                let r = self.eval(rhs, row)?;
                match l.eq_filter(&r) {
                    // Null comparisons yield null, which filters treat
                    // as false.
                    None => Ok(Value::Null),
                    Some(eq) => Ok(Value::Bool(if op == BinaryOp::Eq { eq } else { !eq })),
                }
            }
            BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
                let l = self.eval(lhs, row)?;
                let r = self.eval(rhs, row)?;
                match l.cmp_filter(&r) {
                    None => Ok(Value::Null),
                    Some(ord) => {
                        let pass = match op {
                            BinaryOp::Lt => ord == std::cmp::Ordering::Less,
                            BinaryOp::Le => ord != std::cmp::Ordering::Greater,
                            BinaryOp::Gt => ord == std::cmp::Ordering::Greater,
                            BinaryOp::Ge => ord != std::cmp::Ordering::Less,
                            _ => unreachable!(),
                        };
                        Ok(Value::Bool(pass))
                    }
                }
            }
            BinaryOp::In => {
                let l = self.eval(lhs, row)?;
                if l.is_null() {
                    return Ok(Value::Null);
                }
                let r = self.eval(rhs, row)?;
                match r {
                    Value::Array(items) => Ok(Value::Bool(
                        items.iter().any(|item| l.eq_filter(item) == Some(true)),
                    )),
                    Value::Null => Ok(Value::Null),
                    _ => Err(ThemisError::invalid_query(
                        "IN requires an array or subquery on the right",
                        0,
                        0,
                    )),
                }
            }
            BinaryOp::Add => {
                let (l, r) = (self.eval(lhs, row)?, self.eval(rhs, row)?);
                eval::arithmetic("+", &l, &r)
            }
            BinaryOp::Sub => {
                let (l, r) = (self.eval(lhs, row)?, self.eval(rhs, row)?);
                eval::arithmetic("-", &l, &r)
            }
            BinaryOp::Mul => {
                let (l, r) = (self.eval(lhs, row)?, self.eval(rhs, row)?);
                eval::arithmetic("*", &l, &r)
            }
            BinaryOp::Div => {
                let (l, r) = (self.eval(lhs, row)?, self.eval(rhs, row)?);
                eval::arithmetic("/", &l, &r)
            }
            BinaryOp::Mod => {
                let (l, r) = (self.eval(lhs, row)?, self.eval(rhs, row)?);
                eval::arithmetic("%", &l, &r)
            }
        }
    }

    fn eval_call(&mut self, name: &str, args: &[Expr], row: &Row) -> Result<Value> {
        match name {
            "BM25" => {
                let var = match args.first() {
                    Some(Expr::Variable(v)) => v,
                    _ => {
                        return Err(ThemisError::invalid_query(
                            "BM25 takes a loop variable",
                            0,
                            0,
                        ))
                    }
                };
                Ok(row
                    .scores
                    .get(var)
                    .map(|s| Value::Float(*s))
                    .unwrap_or(Value::Null))
            }
            "VECTOR_SIMILARITY" => {
                if args.len() != 3 {
                    return Err(ThemisError::invalid_query(
                        "VECTOR_SIMILARITY expects (field, query, metric)",
                        0,
                        0,
                    ));
                }
                let stored = self.eval(&args[0], row)?;
                let query = self.eval(&args[1], row)?;
                let metric = self.eval(&args[2], row)?;
                eval::vector_similarity(&stored, &query, &metric)
            }
            "FULLTEXT" => {
                // Post-filter semantics when not consumed by a scan:
                // every analyzed query token appears in the field text.
                if args.len() < 2 {
                    return Err(ThemisError::invalid_query(
                        "FULLTEXT expects (field, query [, limit])",
                        0,
                        0,
                    ));
                }
                let text = self.eval(&args[0], row)?;
                let query = self.eval(&args[1], row)?;
                match (text.as_str(), query.as_str()) {
                    (Some(text), Some(query)) => {
                        let doc_tokens: FxHashSet<String> =
                            analyzer::tokenize(text).into_iter().collect();
                        let hit = analyzer::tokenize(query)
                            .into_iter()
                            .all(|t| doc_tokens.contains(&t));
                        Ok(Value::Bool(hit))
                    }
                    _ => Ok(Value::Bool(false)),
                }
            }
            "VECTOR_KNN" => Err(ThemisError::invalid_query(
                "VECTOR_KNN is only valid as a top-level FILTER predicate",
                0,
                0,
            )),
            _ if WindowFunc::parse(name).is_some() => Err(ThemisError::invalid_query(
                format!("window function {} is only valid in RETURN", name),
                0,
                0,
            )),
            _ => {
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    values.push(self.eval(arg, row)?);
                }
                match eval::scalar_builtin(name, &values)? {
                    Some(value) => Ok(value),
                    None => Err(ThemisError::invalid_query(
                        format!("unknown function {}", name),
                        0,
                        0,
                    )),
                }
            }
        }
    }

    fn run_subquery(&mut self, query: &Query, outer: &Row) -> Result<Vec<Value>> {
        let outcome = self.run_pipeline(query, Some(outer), None)?;
        Ok(outcome.rows)
    }

    // ========================================================================
    // General execution
    // ========================================================================

    fn run_general(&mut self, query: &Query) -> Result<Outcome> {
        self.run_pipeline(query, None, None)
    }

    /// Run the full pipeline. `page` is set by the streaming path to
    /// drive ordered pagination.
    fn run_pipeline(
        &mut self,
        query: &Query,
        outer: Option<&Row>,
        page: Option<&PageSpec>,
    ) -> Result<Outcome> {
        // CTEs materialize first; they are visible as FOR sources for
        // the duration of this query (dropped again on exit, so a
        // correlated subquery re-runs cleanly).
        let mut cte_names = Vec::new();
        for cte in &query.ctes {
            if self.ctes.contains_key(&cte.name) {
                return Err(ThemisError::invalid_query(
                    format!("duplicate CTE name '{}'", cte.name),
                    0,
                    0,
                ));
            }
            let rows = self.run_pipeline(&cte.query, outer, None)?.rows;
            self.ctes.insert(cte.name.clone(), rows);
            cte_names.push(cte.name.clone());
        }
        let result = self.run_clauses(query, outer, page);
        for name in cte_names {
            self.ctes.remove(&name);
        }
        result
    }

    fn run_clauses(
        &mut self,
        query: &Query,
        outer: Option<&Row>,
        page: Option<&PageSpec>,
    ) -> Result<Outcome> {

        if query.fors.is_empty() {
            return Err(ThemisError::invalid_query("query has no FOR source", 0, 0));
        }

        // Pushable filters: the leading run of FILTER clauses (before
        // any LIMIT/COLLECT) referencing exactly one source variable.
        let source_vars: Vec<String> = query.fors.iter().map(|f| f.var().to_string()).collect();
        let mut pushable: FxHashMap<String, Vec<Expr>> = FxHashMap::default();
        let mut consumed_filters: FxHashSet<usize> = FxHashSet::default();
        let mut join_keys: Vec<(usize, Expr, Expr)> = Vec::new(); // (clause idx, left, right)
        for (idx, clause) in query.clauses.iter().enumerate() {
            match clause {
                Clause::Filter(expr) => {
                    let mut vars = Vec::new();
                    expr.referenced_variables(&mut vars);
                    let source_refs: Vec<&String> =
                        vars.iter().filter(|v| source_vars.contains(v)).collect();
                    let only_sources = vars.iter().all(|v| source_vars.contains(v));
                    if only_sources && source_refs.len() == 1 {
                        pushable
                            .entry(source_refs[0].clone())
                            .or_default()
                            .push(expr.clone());
                        consumed_filters.insert(idx);
                    } else if only_sources && source_refs.len() == 2 {
                        // Equi-join candidate.
                        if let Expr::Binary(BinaryOp::Eq, lhs, rhs) = expr {
                            join_keys.push((idx, (**lhs).clone(), (**rhs).clone()));
                        }
                    }
                }
                Clause::Sort(_) | Clause::Let(..) => {}
                Clause::Limit { .. } | Clause::Collect(_) => break,
            }
        }

        // Build the driving rows from the first source, then fold in
        // the remaining sources as joins.
        let mut rows = self.source_rows(
            &query.fors[0],
            outer,
            pushable.remove(query.fors[0].var()).unwrap_or_default(),
            page,
        )?;
        let mut bound: Vec<String> = vec![query.fors[0].var().to_string()];

        for for_clause in &query.fors[1..] {
            self.deadline.check("join")?;
            let var = for_clause.var().to_string();
            let side_filters = pushable.remove(&var).unwrap_or_default();

            // An equi-key between an already-bound variable and this
            // one turns the fold into a hash join.
            let equi = join_keys.iter().find_map(|(idx, lhs, rhs)| {
                let lv = lhs.as_field_path()?;
                let rv = rhs.as_field_path()?;
                if bound.contains(&lv.0.to_string()) && rv.0 == var {
                    Some((*idx, lhs.clone(), rhs.clone()))
                } else if bound.contains(&rv.0.to_string()) && lv.0 == var {
                    Some((*idx, rhs.clone(), lhs.clone()))
                } else {
                    None
                }
            });

            match for_clause {
                ForClause::Traversal(_) => {
                    rows = self.traversal_join(for_clause, rows)?;
                    rows = self.apply_filters(&side_filters, rows)?;
                }
                ForClause::Collection { .. } => {
                    let side = self.source_rows(for_clause, outer, side_filters, None)?;
                    rows = match equi {
                        Some((idx, bound_key, new_key)) => {
                            consumed_filters.insert(idx);
                            self.hash_join(rows, side, &bound_key, &new_key)?
                        }
                        None => self.nested_loop_join(rows, side)?,
                    };
                }
            }
            bound.push(var);
        }

        // The clause pipeline, strictly in source order.
        let mut truncated_by_limit = false;
        for (idx, clause) in query.clauses.iter().enumerate() {
            self.deadline.check("pipeline")?;
            match clause {
                Clause::Filter(expr) => {
                    if consumed_filters.contains(&idx) {
                        continue;
                    }
                    let started = Instant::now();
                    let before = rows.len();
                    let mut kept = Vec::with_capacity(rows.len());
                    for row in rows {
                        if self.eval(expr, &row)?.is_truthy() {
                            kept.push(row);
                        }
                    }
                    rows = kept;
                    self.explain.children.push(
                        ExplainNode::new("PostFilter")
                            .estimated(before)
                            .finish(rows.len(), started),
                    );
                }
                Clause::Let(var, expr) => {
                    for row in rows.iter_mut() {
                        let value = self.eval(expr, &row.clone())?;
                        row.bindings.insert(var.clone(), value);
                    }
                }
                Clause::Collect(collect) => {
                    rows = self.group_by(collect, rows)?;
                }
                Clause::Sort(keys) => {
                    let started = Instant::now();
                    rows = self.post_sort(keys, rows)?;
                    self.explain.children.push(
                        ExplainNode::new("PostSort")
                            .detail("keys", keys.len())
                            .finish(rows.len(), started),
                    );
                }
                Clause::Limit { offset, count } => {
                    if page.is_some() {
                        // The pagination layer slices and issues the
                        // cursor; re-slicing here would double-apply.
                        continue;
                    }
                    let start = (*offset as usize).min(rows.len());
                    let end = (start + *count as usize).min(rows.len());
                    // LIMIT 0 is an empty result, not a truncated one.
                    truncated_by_limit = end < rows.len() && *count > 0;
                    rows = rows[start..end].to_vec();
                    self.explain.children.push(
                        ExplainNode::new("Limit")
                            .detail("offset", offset)
                            .detail("count", count)
                            .finish(rows.len(), Instant::now()),
                    );
                }
            }
        }

        // Projection, window functions, DISTINCT.
        let started = Instant::now();
        let mut projected = self.project(&query.return_clause.expr, &rows)?;
        if query.return_clause.distinct {
            let mut seen = FxHashSet::default();
            projected.retain(|value| seen.insert(value.to_json().to_string()));
        }
        self.explain.children.push(
            ExplainNode::new(if query.return_clause.distinct {
                "Project+Distinct"
            } else {
                "Project"
            })
            .finish(projected.len(), started),
        );

        // Ordered pagination: the streaming path slices and tokenizes.
        if let Some(page) = page {
            return Ok(self.paginate(projected, rows, page));
        }
        Ok(Outcome {
            rows: projected,
            has_more: truncated_by_limit,
            next_cursor: None,
        })
    }

    // ========================================================================
    // Sources
    // ========================================================================

    fn source_rows(
        &mut self,
        for_clause: &ForClause,
        outer: Option<&Row>,
        filters: Vec<Expr>,
        page: Option<&PageSpec>,
    ) -> Result<Vec<Row>> {
        let base_row = outer.cloned().unwrap_or_default();
        match for_clause {
            ForClause::Traversal(_) => {
                // Vertex/edge predicates apply at admitted depths only,
                // which post-application preserves exactly.
                let rows = self.traversal_join(for_clause, vec![base_row])?;
                self.apply_filters(&filters, rows)
            }
            ForClause::Collection { var, source } => {
                // CTE sources iterate materialized rows.
                if let Some(cte_rows) = self.ctes.get(source).cloned() {
                    let started = Instant::now();
                    let mut rows: Vec<Row> = cte_rows
                        .into_iter()
                        .map(|value| base_row.clone().bind(var, value))
                        .collect();
                    rows = self.apply_filters(&filters, rows)?;
                    self.explain.children.push(
                        ExplainNode::new("CteScan")
                            .detail("cte", source)
                            .finish(rows.len(), started),
                    );
                    return Ok(rows);
                }
                self.collection_rows(var, source, &base_row, filters, page)
            }
        }
    }

    fn apply_filters(&mut self, filters: &[Expr], rows: Vec<Row>) -> Result<Vec<Row>> {
        if filters.is_empty() {
            return Ok(rows);
        }
        let mut kept = Vec::with_capacity(rows.len());
        'rows: for row in rows {
            for filter in filters {
                if !self.eval(filter, &row)?.is_truthy() {
                    continue 'rows;
                }
            }
            kept.push(row);
        }
        Ok(kept)
    }

    /// Rows of one collection source: index merge when the filters make
    /// that possible, otherwise (pk-ordered) full scan.
    fn collection_rows(
        &mut self,
        var: &str,
        collection: &str,
        base_row: &Row,
        filters: Vec<Expr>,
        page: Option<&PageSpec>,
    ) -> Result<Vec<Row>> {
        // The streaming path drives the scan through the range index.
        if let Some(page) = page {
            return self.range_stream_rows(var, collection, base_row, filters, page);
        }

        // Combine the pushed filters into one predicate and normalize.
        let combined = filters
            .iter()
            .cloned()
            .reduce(|acc, e| Expr::Binary(BinaryOp::And, Box::new(acc), Box::new(e)));

        let dnf = combined.as_ref().map(|expr| rewrite::to_dnf(expr));
        match dnf {
            Some(Some(disjuncts)) => {
                let mut plans: Vec<DisjunctPlan> = Vec::new();
                for conjuncts in &disjuncts {
                    let snapshot = self.snapshot.clone();
                    let plan = {
                        let params = self.params.clone();
                        optimizer::plan_disjunct(
                            self.db,
                            &snapshot,
                            var,
                            collection,
                            conjuncts,
                            &|e| const_fold(e, &params),
                        )?
                    };
                    plans.push(plan);
                }
                if plans.iter().all(|p| !p.preds.is_empty()) {
                    return self.index_merge_rows(var, base_row, &plans);
                }
                // At least one disjunct has no index: fall through to a
                // full scan with the whole predicate as post-filter.
                self.full_scan_rows(var, collection, base_row, combined.as_ref().map(|e| vec![e.clone()]).unwrap_or_default())
            }
            Some(None) => {
                // DNF exploded past the cap: scan with the original
                // predicate as one post-filter.
                self.full_scan_rows(
                    var,
                    collection,
                    base_row,
                    combined.map(|e| vec![e]).unwrap_or_default(),
                )
            }
            None => self.full_scan_rows(var, collection, base_row, Vec::new()),
        }
    }

    fn index_merge_rows(
        &mut self,
        var: &str,
        base_row: &Row,
        plans: &[DisjunctPlan],
    ) -> Result<Vec<Row>> {
        let started = Instant::now();
        let mut union: Vec<String> = Vec::new();
        let mut scores: FxHashMap<String, f64> = FxHashMap::default();
        let mut merge_node = ExplainNode::new(if plans.len() > 1 {
            "Union"
        } else {
            "Intersection"
        });

        // Preserve score order when one scored predicate drives a
        // single-disjunct plan (fulltext/KNN only queries).
        let single_scored = plans.len() == 1 && plans[0].preds.len() == 1;
        let mut scored_order: Option<Vec<String>> = None;

        let mut disjunct_sets: Vec<Vec<String>> = Vec::with_capacity(plans.len());
        for plan in plans {
            let mut set: Option<Vec<String>> = None;
            for (pred, estimate) in &plan.preds {
                self.deadline.check("index scan")?;
                let scan_started = Instant::now();
                let mut pks = self.scan_pred(pred, &mut scores)?;
                let mut node = ExplainNode::new("IndexScan")
                    .detail("index_kind", pred.kind_label())
                    .detail("index", pred.index_name())
                    .estimated(*estimate)
                    .finish(pks.len(), scan_started);
                if let IndexPred::Knn { desc, .. } = pred {
                    if let themis_index::catalog::IndexConfig::Vector(cfg) = &desc.config {
                        node = node.detail("ef_search", cfg.ef_search);
                    }
                }
                merge_node.children.push(node);
                if single_scored && matches!(pred, IndexPred::Fulltext { .. } | IndexPred::Knn { .. })
                {
                    scored_order = Some(pks.clone());
                }
                pks.sort();
                set = Some(match set {
                    None => pks,
                    Some(existing) => intersect_sorted(&existing, &pks),
                });
            }
            let set = set.unwrap_or_default();
            union = union_sorted(&union, &set);
            disjunct_sets.push(set);
        }

        // Materialize, then admit each pk through the disjuncts whose
        // indexed sets contain it: the row passes when any of those
        // disjuncts' residuals all hold.
        let pk_order = scored_order.unwrap_or(union);
        let records = self.db.materialize(&self.snapshot, &pk_order)?;
        let mut rows = Vec::with_capacity(records.len());
        'pks: for (pk, record) in records {
            let value = match record {
                Some(r) => r.value,
                None => continue,
            };
            let mut row = base_row.clone().bind(var, value);
            if let Some(score) = scores.get(&pk) {
                row.scores.insert(var.to_string(), *score);
            }
            row.position = Some((Vec::new(), pk.clone()));
            for (plan, set) in plans.iter().zip(&disjunct_sets) {
                if set.binary_search(&pk).is_err() {
                    continue;
                }
                let mut ok = true;
                for residual in &plan.residual {
                    if !self.eval(residual, &row)?.is_truthy() {
                        ok = false;
                        break;
                    }
                }
                if ok {
                    rows.push(row);
                    continue 'pks;
                }
            }
        }

        self.explain
            .children
            .push(merge_node.finish(rows.len(), started));
        Ok(rows)
    }

    fn scan_pred(
        &mut self,
        pred: &IndexPred,
        scores: &mut FxHashMap<String, f64>,
    ) -> Result<Vec<String>> {
        match pred {
            IndexPred::Eq { desc, values } => equality::scan_eq(
                self.db.store(),
                &self.snapshot,
                desc,
                values,
                Direction::Forward,
                usize::MAX,
            ),
            IndexPred::Range { desc, lo, hi } => Ok(range::scan(
                self.db.store(),
                &self.snapshot,
                desc,
                lo.as_ref(),
                hi.as_ref(),
                Direction::Forward,
                None,
                usize::MAX,
            )?
            .into_iter()
            .map(|(_, pk)| pk)
            .collect()),
            IndexPred::Fulltext { desc, query, limit } => {
                let hits = fulltext::search(
                    self.db.store(),
                    &self.snapshot,
                    desc,
                    query,
                    limit.unwrap_or(usize::MAX),
                )?;
                Ok(hits
                    .into_iter()
                    .map(|hit| {
                        scores.insert(hit.pk.clone(), hit.score);
                        hit.pk
                    })
                    .collect())
            }
            IndexPred::Knn {
                desc,
                query,
                k,
                whitelist,
            } => {
                let hits = self.db.vector_search_index(
                    &desc.name,
                    query,
                    *k,
                    whitelist.as_ref(),
                    None,
                )?;
                Ok(hits
                    .into_iter()
                    .map(|(pk, distance)| {
                        // Store the distance negated so "higher is
                        // better" holds for every score accessor.
                        scores.insert(pk.clone(), -(distance as f64));
                        pk
                    })
                    .collect())
            }
        }
    }

    fn full_scan_rows(
        &mut self,
        var: &str,
        collection: &str,
        base_row: &Row,
        post_filters: Vec<Expr>,
    ) -> Result<Vec<Row>> {
        if !self.allow_full_scan {
            return Err(ThemisError::invalid_query(
                format!(
                    "query requires a full scan of '{}', which is disabled",
                    collection
                ),
                0,
                0,
            ));
        }
        let started = Instant::now();
        let mut rows = Vec::new();
        let mut scanned = 0usize;
        for item in entity::scan_collection(
            self.db.store(),
            &self.snapshot,
            collection,
            Direction::Forward,
            None,
        ) {
            scanned += 1;
            if scanned % 512 == 0 {
                self.deadline.check("full scan")?;
            }
            let (pk, record) = item?;
            let mut row = base_row.clone().bind(var, record.value);
            row.position = Some((Vec::new(), pk.to_string()));
            rows.push(row);
        }
        rows = self.apply_filters(&post_filters, rows)?;
        self.explain.children.push(
            ExplainNode::new("FullScan")
                .detail("collection", collection)
                .detail("post_filtered", post_filters.len())
                .estimated(scanned)
                .finish(rows.len(), started),
        );
        Ok(rows)
    }

    // ========================================================================
    // Traversal source
    // ========================================================================

    fn traversal_join(&mut self, for_clause: &ForClause, input: Vec<Row>) -> Result<Vec<Row>> {
        let clause = match for_clause {
            ForClause::Traversal(t) => t,
            ForClause::Collection { .. } => {
                return Err(ThemisError::internal("traversal join on a collection"))
            }
        };
        let started = Instant::now();
        let mut out = Vec::new();
        let mut metrics_node = ExplainNode::new("Traversal")
            .detail("graph", &clause.graph)
            .detail(
                "direction",
                format!("{:?}", clause.direction).to_lowercase(),
            );
        if let Some(t) = &clause.edge_type {
            metrics_node = metrics_node.detail("edge_type", t);
        }

        for row in input {
            self.deadline.check("traversal")?;
            // The start expression is evaluated once per input row;
            // with a constant start that is exactly once overall.
            let start_value = self.eval(&clause.start, &row)?;
            let start = match &start_value {
                Value::String(pk) => pk.clone(),
                Value::Object(_) => {
                    return Err(ThemisError::invalid_query(
                        "traversal start must be a pk string",
                        0,
                        0,
                    ))
                }
                Value::Null => continue,
                other => {
                    return Err(ThemisError::invalid_query(
                        format!("traversal start must be a pk string, got {:?}", other),
                        0,
                        0,
                    ))
                }
            };

            let spec = TraversalSpec {
                graph: clause.graph.clone(),
                start,
                min_depth: clause.min_depth,
                max_depth: clause.max_depth,
                direction: match clause.direction {
                    TraversalDirection::Outbound => TraverseDirection::Outbound,
                    TraversalDirection::Inbound => TraverseDirection::Inbound,
                    TraversalDirection::Any => TraverseDirection::Any,
                },
                edge_type: clause.edge_type.clone(),
                time_at: None,
                frontier_limit: None,
                result_limit: None,
                mode: themis_engine::traverse::TraversalMode::Bfs,
            };
            let result =
                self.db
                    .traverse_with(&spec, &TraversalPredicates::default(), &self.deadline)?;

            metrics_node = metrics_node
                .detail(
                    "frontier_size_by_depth",
                    format!("{:?}", result.metrics.frontier_size_by_depth),
                )
                .detail("pruned_last_level", result.metrics.pruned_last_level);

            for entry in result.entries {
                let vertex_value = match Pk::parse(&entry.vertex) {
                    Ok(pk) => entity::get_snapshot(self.db.store(), &self.snapshot, &pk)?
                        .map(|r| r.value)
                        .unwrap_or(Value::Null),
                    Err(_) => Value::Null,
                };
                let mut new_row = row.clone().bind(&clause.vertex_var, vertex_value);
                if let Some(edge_var) = &clause.edge_var {
                    let edge_value = entry
                        .edge
                        .as_ref()
                        .map(edge_to_value)
                        .unwrap_or(Value::Null);
                    new_row.bindings.insert(edge_var.clone(), edge_value);
                }
                if let Some(path_var) = &clause.path_var {
                    let path_value = Value::object([(
                        "vertices",
                        Value::Array(entry.path.iter().map(|pk| Value::from(pk.clone())).collect()),
                    )]);
                    new_row.bindings.insert(path_var.clone(), path_value);
                }
                new_row.position = Some((Vec::new(), entry.vertex.clone()));
                out.push(new_row);
            }
        }
        self.explain
            .children
            .push(metrics_node.finish(out.len(), started));
        Ok(out)
    }

    // ========================================================================
    // Joins
    // ========================================================================

    fn hash_join(
        &mut self,
        left: Vec<Row>,
        right: Vec<Row>,
        left_key: &Expr,
        right_key: &Expr,
    ) -> Result<Vec<Row>> {
        let started = Instant::now();
        // Build on the smaller side.
        let build_on_right = right.len() <= left.len();
        let (build, probe, build_key, probe_key) = if build_on_right {
            (&right, &left, right_key, left_key)
        } else {
            (&left, &right, left_key, right_key)
        };

        let mut table: FxHashMap<String, Vec<usize>> = FxHashMap::default();
        for (idx, row) in build.iter().enumerate() {
            let key = self.eval(build_key, row)?;
            if key.is_null() {
                continue;
            }
            table
                .entry(key.to_json().to_string())
                .or_default()
                .push(idx);
        }

        let mut out = Vec::new();
        for row in probe {
            self.deadline.check("hash join")?;
            let key = self.eval(probe_key, row)?;
            if key.is_null() {
                continue;
            }
            if let Some(matches) = table.get(&key.to_json().to_string()) {
                for &idx in matches {
                    let mut merged = row.clone();
                    for (k, v) in &build[idx].bindings {
                        merged.bindings.entry(k.clone()).or_insert_with(|| v.clone());
                    }
                    for (k, v) in &build[idx].scores {
                        merged.scores.entry(k.clone()).or_insert(*v);
                    }
                    out.push(merged);
                }
            }
        }
        self.explain.children.push(
            ExplainNode::new("HashJoin")
                .detail("build_side", if build_on_right { "right" } else { "left" })
                .detail("build_rows", build.len())
                .finish(out.len(), started),
        );
        Ok(out)
    }

    fn nested_loop_join(&mut self, left: Vec<Row>, right: Vec<Row>) -> Result<Vec<Row>> {
        let started = Instant::now();
        let mut out = Vec::with_capacity(left.len() * right.len().max(1));
        for l in &left {
            self.deadline.check("nested loop join")?;
            for r in &right {
                let mut merged = l.clone();
                for (k, v) in &r.bindings {
                    merged.bindings.entry(k.clone()).or_insert_with(|| v.clone());
                }
                for (k, v) in &r.scores {
                    merged.scores.entry(k.clone()).or_insert(*v);
                }
                out.push(merged);
            }
        }
        self.explain.children.push(
            ExplainNode::new("NestedLoopJoin")
                .detail("left_rows", left.len())
                .detail("right_rows", right.len())
                .finish(out.len(), started),
        );
        Ok(out)
    }

    // ========================================================================
    // Grouping, sorting, projection
    // ========================================================================

    fn group_by(&mut self, collect: &CollectClause, rows: Vec<Row>) -> Result<Vec<Row>> {
        let started = Instant::now();
        // Hash-aggregate: group key is the canonical JSON of the
        // evaluated group expressions (a composite key for
        // multi-column grouping).
        let mut groups: Vec<(String, Vec<Value>, Vec<Row>)> = Vec::new();
        let mut index: FxHashMap<String, usize> = FxHashMap::default();
        for row in rows {
            let mut key_values = Vec::with_capacity(collect.groups.len());
            for (_, expr) in &collect.groups {
                key_values.push(self.eval(expr, &row)?);
            }
            let key = Value::Array(key_values.clone()).to_json().to_string();
            match index.get(&key) {
                Some(&slot) => groups[slot].2.push(row),
                None => {
                    index.insert(key.clone(), groups.len());
                    groups.push((key, key_values, vec![row]));
                }
            }
        }
        groups.sort_by(|a, b| {
            let av = Value::Array(a.1.clone());
            let bv = Value::Array(b.1.clone());
            av.cmp_sort(&bv)
        });

        let mut out = Vec::with_capacity(groups.len());
        for (_, key_values, members) in groups {
            let mut row = Row::default();
            for ((var, _), value) in collect.groups.iter().zip(key_values) {
                row.bindings.insert(var.clone(), value);
            }
            for aggregate in &collect.aggregates {
                let value = self.aggregate(aggregate, &members)?;
                row.bindings.insert(aggregate.var.clone(), value);
            }
            if let Some(having) = &collect.having {
                if !self.eval(having, &row)?.is_truthy() {
                    continue;
                }
            }
            out.push(row);
        }
        self.explain.children.push(
            ExplainNode::new("GroupBy")
                .detail("group_columns", collect.groups.len())
                .detail("aggregates", collect.aggregates.len())
                .finish(out.len(), started),
        );
        Ok(out)
    }

    fn aggregate(&mut self, binding: &AggregateBinding, members: &[Row]) -> Result<Value> {
        if binding.func == AggregateFunc::Count && binding.input.is_none() {
            return Ok(Value::Int(members.len() as i64));
        }
        let input = binding
            .input
            .as_ref()
            .ok_or_else(|| ThemisError::internal("aggregate without input"))?;
        let mut numbers: Vec<f64> = Vec::with_capacity(members.len());
        let mut values: Vec<Value> = Vec::with_capacity(members.len());
        for member in members {
            let value = self.eval(input, member)?;
            if value.is_null() {
                continue;
            }
            if let Some(n) = value.as_f64() {
                numbers.push(n);
            }
            values.push(value);
        }
        let out = match binding.func {
            AggregateFunc::Count => Value::Int(values.len() as i64),
            AggregateFunc::Sum => {
                if numbers.len() != values.len() {
                    return Err(ThemisError::invalid_query(
                        "SUM requires numeric inputs",
                        0,
                        0,
                    ));
                }
                Value::Float(numbers.iter().sum())
            }
            AggregateFunc::Avg => {
                if numbers.is_empty() {
                    Value::Null
                } else {
                    Value::Float(numbers.iter().sum::<f64>() / numbers.len() as f64)
                }
            }
            AggregateFunc::Min => values
                .iter()
                .min_by(|a, b| a.cmp_sort(b))
                .cloned()
                .unwrap_or(Value::Null),
            AggregateFunc::Max => values
                .iter()
                .max_by(|a, b| a.cmp_sort(b))
                .cloned()
                .unwrap_or(Value::Null),
            AggregateFunc::Variance | AggregateFunc::Stddev => {
                if numbers.len() < 2 {
                    Value::Null
                } else {
                    let mean = numbers.iter().sum::<f64>() / numbers.len() as f64;
                    let variance = numbers.iter().map(|n| (n - mean).powi(2)).sum::<f64>()
                        / (numbers.len() - 1) as f64;
                    if binding.func == AggregateFunc::Variance {
                        Value::Float(variance)
                    } else {
                        Value::Float(variance.sqrt())
                    }
                }
            }
            AggregateFunc::Median => percentile_of(&mut numbers, 50.0),
            AggregateFunc::Percentile => {
                let p = binding
                    .percentile
                    .ok_or_else(|| ThemisError::internal("percentile without p"))?;
                percentile_of(&mut numbers, p)
            }
        };
        Ok(out)
    }

    fn post_sort(&mut self, keys: &[SortKey], rows: Vec<Row>) -> Result<Vec<Row>> {
        // Evaluate the sort keys once per row, then sort stably.
        let mut keyed: Vec<(Vec<Value>, Row)> = Vec::with_capacity(rows.len());
        for row in rows {
            let mut sort_values = Vec::with_capacity(keys.len());
            for key in keys {
                sort_values.push(self.eval(&key.expr, &row)?);
            }
            keyed.push((sort_values, row));
        }
        keyed.sort_by(|(a, _), (b, _)| {
            for (idx, key) in keys.iter().enumerate() {
                let ord = a[idx].cmp_sort(&b[idx]);
                let ord = if key.ascending { ord } else { ord.reverse() };
                if ord != std::cmp::Ordering::Equal {
                    return ord;
                }
            }
            std::cmp::Ordering::Equal
        });
        Ok(keyed.into_iter().map(|(_, row)| row).collect())
    }

    fn project(&mut self, expr: &Expr, rows: &[Row]) -> Result<Vec<Value>> {
        // Window calls are computed over the whole staged row set and
        // substituted per row before ordinary evaluation.
        let mut window_calls = Vec::new();
        collect_window_calls(expr, &mut window_calls);
        let mut window_values: Vec<(Expr, Vec<Value>)> = Vec::new();
        for call in window_calls {
            let values = self.compute_window(&call, rows)?;
            window_values.push((call, values));
        }

        let mut out = Vec::with_capacity(rows.len());
        for (idx, row) in rows.iter().enumerate() {
            let effective = if window_values.is_empty() {
                expr.clone()
            } else {
                substitute_windows(expr, &window_values, idx)
            };
            out.push(self.eval(&effective, row)?);
        }
        Ok(out)
    }

    fn compute_window(&mut self, call: &Expr, rows: &[Row]) -> Result<Vec<Value>> {
        let (name, args) = match call {
            Expr::Call(name, args) => (name.as_str(), args),
            _ => return Err(ThemisError::internal("not a window call")),
        };
        let func = WindowFunc::parse(name)
            .ok_or_else(|| ThemisError::internal("not a window function"))?;

        // Argument shapes: ROW_NUMBER([partition]);
        // RANK/DENSE_RANK(order [, partition]);
        // LAG/LEAD(expr, offset [, partition]);
        // FIRST_VALUE/LAST_VALUE(expr [, partition]).
        let (value_expr, offset, partition_expr) = match func {
            WindowFunc::RowNumber => (None, 0usize, args.first()),
            WindowFunc::Rank | WindowFunc::DenseRank => {
                if args.is_empty() {
                    return Err(ThemisError::invalid_query(
                        format!("{} expects an order expression", name),
                        0,
                        0,
                    ));
                }
                (Some(&args[0]), 0, args.get(1))
            }
            WindowFunc::Lag | WindowFunc::Lead => {
                if args.len() < 2 {
                    return Err(ThemisError::invalid_query(
                        format!("{} expects (expr, offset [, partition])", name),
                        0,
                        0,
                    ));
                }
                let offset = self
                    .eval_const(&args[1])
                    .and_then(|v| v.as_i64())
                    .filter(|v| *v >= 0)
                    .ok_or_else(|| {
                        ThemisError::invalid_query(
                            format!("{} offset must be a non-negative integer", name),
                            0,
                            0,
                        )
                    })? as usize;
                (Some(&args[0]), offset, args.get(2))
            }
            WindowFunc::FirstValue | WindowFunc::LastValue => {
                if args.is_empty() {
                    return Err(ThemisError::invalid_query(
                        format!("{} expects an expression", name),
                        0,
                        0,
                    ));
                }
                (Some(&args[0]), 0, args.get(1))
            }
        };

        let mut partitions = Vec::with_capacity(rows.len());
        let mut values = Vec::with_capacity(rows.len());
        for row in rows {
            partitions.push(match partition_expr {
                Some(p) => self.eval(p, row)?,
                None => Value::Null,
            });
            values.push(match value_expr {
                Some(e) => self.eval(e, row)?,
                None => Value::Null,
            });
        }
        window::compute(
            func,
            &WindowInput {
                partitions,
                values,
                offset,
            },
        )
    }

    // ========================================================================
    // Streaming / cursor path
    // ========================================================================

    /// Try the streaming path: a single collection source whose order
    /// comes from a range index (via `SORT var.field`) or plain pk
    /// order, with an optional `LIMIT`. This is the shape that pages
    /// with cursors.
    fn try_streaming(&mut self, query: &Query, options: &QueryOptions) -> Result<Option<Outcome>> {
        if !options.use_cursor && options.cursor.is_none() {
            return Ok(None);
        }
        if query.fors.len() != 1 || !query.ctes.is_empty() || query.return_clause.distinct {
            return Ok(None);
        }
        let (var, collection) = match &query.fors[0] {
            ForClause::Collection { var, source } => (var.clone(), source.clone()),
            ForClause::Traversal(_) => return Ok(None),
        };
        if self.ctes.contains_key(&collection) {
            return Ok(None);
        }

        // Shape check: filters on the driving var, at most one SORT on
        // a single var field, at most one LIMIT, no COLLECT.
        let mut sort: Option<(String, Direction)> = None;
        let mut limit: Option<(u64, u64)> = None;
        for clause in &query.clauses {
            match clause {
                Clause::Filter(expr) => {
                    let mut vars = Vec::new();
                    expr.referenced_variables(&mut vars);
                    if vars.iter().any(|v| v != &var) {
                        return Ok(None);
                    }
                }
                Clause::Sort(keys) => {
                    if sort.is_some() || keys.len() != 1 {
                        return Ok(None);
                    }
                    match keys[0].expr.as_field_path() {
                        Some((v, path)) if v == var => {
                            let direction = if keys[0].ascending {
                                Direction::Forward
                            } else {
                                Direction::Reverse
                            };
                            sort = Some((path, direction));
                        }
                        _ => return Ok(None),
                    }
                }
                Clause::Limit { offset, count } => {
                    if limit.is_some() {
                        return Ok(None);
                    }
                    limit = Some((*offset, *count));
                }
                Clause::Let(..) | Clause::Collect(_) => return Ok(None),
            }
        }

        // An order from a range index, or pk order with no SORT.
        let (index, direction) = match &sort {
            Some((path, direction)) => {
                match self
                    .db
                    .catalog()
                    .find(&collection, IndexKind::Range, &[path.clone()])
                {
                    Some(desc) => (Some(desc), *direction),
                    // Sorted but not index-backed: the general path
                    // post-sorts; no cursor.
                    None => return Ok(None),
                }
            }
            None => (None, Direction::Forward),
        };

        // Decode the resume token, if any. Any defect in it means an
        // empty page, not an error.
        let now_ms = chrono::Utc::now().timestamp_millis();
        let resume = match &options.cursor {
            Some(token) => {
                let index_name = index.as_ref().map(|d| d.name.as_str()).unwrap_or("");
                let schema_version = index.as_ref().map(|d| d.schema_version).unwrap_or(0);
                match CursorToken::decode(token, now_ms)
                    .and_then(|t| {
                        t.check_scope(&collection, index_name, schema_version)?;
                        if t.direction != direction {
                            return Err(ThemisError::invalid_cursor(
                                "token direction does not match the query",
                            ));
                        }
                        Ok(t)
                    }) {
                    Ok(token) => Some((token.sort_key, token.pk)),
                    Err(e) => {
                        debug!(error = %e, "invalid cursor; returning empty page");
                        return Ok(Some(Outcome {
                            rows: Vec::new(),
                            has_more: false,
                            next_cursor: None,
                        }));
                    }
                }
            }
            None => None,
        };

        let (offset, count) = limit.unwrap_or((0, u64::MAX));
        // A resumed page never re-applies the offset.
        let offset = if resume.is_some() { 0 } else { offset };
        let page = PageSpec {
            index,
            direction,
            resume,
            offset,
            count,
            collection: collection.clone(),
            issue_cursor: true,
        };
        let outcome = self.run_pipeline(query, None, Some(&page))?;
        Ok(Some(outcome))
    }

    /// Enumerate rows for the streaming page: through the range index
    /// when one drives the order, else the pk-ordered scan.
    fn range_stream_rows(
        &mut self,
        var: &str,
        collection: &str,
        base_row: &Row,
        filters: Vec<Expr>,
        page: &PageSpec,
    ) -> Result<Vec<Row>> {
        let started = Instant::now();
        // Rows needed to decide has_more after slicing.
        let want = (page.offset as usize)
            .saturating_add(page.count as usize)
            .saturating_add(1);
        let mut rows: Vec<Row> = Vec::new();

        match &page.index {
            Some(desc) => {
                // Seek directly to the filtered window when the filters
                // bound the sorted field; they still re-check per row.
                let (seek_lo, seek_hi) = sort_field_bounds(&filters, var, &desc.fields[0], &self.params);
                let mut start_after = page.resume.clone();
                let batch = (want.max(64)).min(4096);
                'stream: loop {
                    self.deadline.check("range stream")?;
                    let entries = range::scan(
                        self.db.store(),
                        &self.snapshot,
                        desc,
                        seek_lo.as_ref(),
                        seek_hi.as_ref(),
                        page.direction,
                        start_after.as_ref(),
                        batch,
                    )?;
                    if entries.is_empty() {
                        break;
                    }
                    start_after = entries.last().cloned();
                    let pks: Vec<String> = entries.iter().map(|(_, pk)| pk.clone()).collect();
                    let records = self.db.materialize(&self.snapshot, &pks)?;
                    for ((sort_key, pk), (_, record)) in entries.iter().zip(records) {
                        let value = match record {
                            Some(r) => r.value,
                            None => continue,
                        };
                        let mut row = base_row.clone().bind(var, value);
                        row.position = Some((sort_key.clone(), pk.clone()));
                        let mut passes = true;
                        for filter in &filters {
                            if !self.eval(filter, &row)?.is_truthy() {
                                passes = false;
                                break;
                            }
                        }
                        if passes {
                            rows.push(row);
                            if rows.len() >= want {
                                break 'stream;
                            }
                        }
                    }
                }
                self.explain.children.push(
                    ExplainNode::new("RangeStream")
                        .detail("index", &desc.name)
                        .detail("index_kind", "range")
                        .detail(
                            "direction",
                            if page.direction.is_forward() { "asc" } else { "desc" },
                        )
                        .finish(rows.len(), started),
                );
            }
            None => {
                let start_after = page
                    .resume
                    .as_ref()
                    .map(|(_, pk)| Pk::parse(pk))
                    .transpose()?;
                let mut scanned = 0usize;
                for item in entity::scan_collection(
                    self.db.store(),
                    &self.snapshot,
                    collection,
                    page.direction,
                    start_after.as_ref(),
                ) {
                    scanned += 1;
                    if scanned % 512 == 0 {
                        self.deadline.check("collection stream")?;
                    }
                    let (pk, record) = item?;
                    let mut row = base_row.clone().bind(var, record.value);
                    row.position = Some((Vec::new(), pk.to_string()));
                    let mut passes = true;
                    for filter in &filters {
                        if !self.eval(filter, &row)?.is_truthy() {
                            passes = false;
                            break;
                        }
                    }
                    if passes {
                        rows.push(row);
                        if rows.len() >= want {
                            break;
                        }
                    }
                }
                self.explain.children.push(
                    ExplainNode::new("CollectionStream")
                        .detail("collection", collection)
                        .finish(rows.len(), started),
                );
            }
        }
        Ok(rows)
    }

    fn paginate(&mut self, projected: Vec<Value>, rows: Vec<Row>, page: &PageSpec) -> Outcome {
        let offset = (page.offset as usize).min(projected.len());
        let end = offset
            .saturating_add(page.count as usize)
            .min(projected.len());
        let has_more = projected.len() > end && page.count > 0;
        let page_rows = projected[offset..end].to_vec();

        let next_cursor = if page.issue_cursor && has_more && end > offset {
            rows.get(end - 1)
                .and_then(|row| row.position.clone())
                .and_then(|(sort_key, pk)| {
                    let token = CursorToken {
                        version: CURSOR_FORMAT_VERSION,
                        index_name: page
                            .index
                            .as_ref()
                            .map(|d| d.name.clone())
                            .unwrap_or_default(),
                        schema_version: page
                            .index
                            .as_ref()
                            .map(|d| d.schema_version)
                            .unwrap_or(0),
                        collection: page.collection.clone(),
                        sort_key,
                        pk,
                        direction: page.direction,
                        expiry_epoch_ms: None,
                    };
                    token.encode().ok()
                })
        } else {
            None
        };

        Outcome {
            rows: page_rows,
            has_more,
            next_cursor,
        }
    }
}

/// Pagination request threaded through the streaming path.
struct PageSpec {
    index: Option<std::sync::Arc<themis_index::catalog::IndexDescriptor>>,
    direction: Direction,
    resume: Option<(Vec<u8>, String)>,
    offset: u64,
    count: u64,
    collection: String,
    issue_cursor: bool,
}

fn percentile_of(numbers: &mut Vec<f64>, p: f64) -> Value {
    if numbers.is_empty() {
        return Value::Null;
    }
    numbers.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    // Nearest-rank percentile.
    let rank = ((p / 100.0) * numbers.len() as f64).ceil().max(1.0) as usize;
    Value::Float(numbers[rank.min(numbers.len()) - 1])
}

/// Extract lo/hi bounds on the sorted field from simple comparison
/// filters, so the ordered stream seeks instead of scanning from the
/// start of the index.
fn sort_field_bounds(
    filters: &[Expr],
    var: &str,
    path: &str,
    params: &HashMap<String, Value>,
) -> (Option<RangeBound>, Option<RangeBound>) {
    let mut lo: Option<RangeBound> = None;
    let mut hi: Option<RangeBound> = None;
    for filter in filters {
        if let Expr::Binary(op, lhs, rhs) = filter {
            let (constant, op) = match (lhs.as_field_path(), rhs.as_field_path()) {
                (Some((v, p)), None) if v == var && p == path => {
                    match const_fold(rhs, params) {
                        Some(value) => (value, *op),
                        None => continue,
                    }
                }
                (None, Some((v, p))) if v == var && p == path => match const_fold(lhs, params) {
                    Some(value) => (value, op.flipped()),
                    None => continue,
                },
                _ => continue,
            };
            match op {
                BinaryOp::Ge => lo = Some(RangeBound::inclusive(constant)),
                BinaryOp::Gt => lo = Some(RangeBound::exclusive(constant)),
                BinaryOp::Le => hi = Some(RangeBound::inclusive(constant)),
                BinaryOp::Lt => hi = Some(RangeBound::exclusive(constant)),
                BinaryOp::Eq => {
                    lo = Some(RangeBound::inclusive(constant.clone()));
                    hi = Some(RangeBound::inclusive(constant));
                }
                _ => {}
            }
        }
    }
    (lo, hi)
}

fn const_fold(expr: &Expr, params: &HashMap<String, Value>) -> Option<Value> {
    match expr {
        Expr::Literal(v) => Some(v.clone()),
        Expr::Param(name) => params.get(name).cloned(),
        Expr::Array(items) => {
            let folded: Option<Vec<Value>> =
                items.iter().map(|e| const_fold(e, params)).collect();
            folded.map(Value::Array)
        }
        Expr::Unary(UnaryOp::Neg, inner) => match const_fold(inner, params)? {
            Value::Int(v) => Some(Value::Int(-v)),
            Value::Float(v) => Some(Value::Float(-v)),
            _ => None,
        },
        Expr::Binary(op, lhs, rhs)
            if matches!(
                op,
                BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Mod
            ) =>
        {
            let l = const_fold(lhs, params)?;
            let r = const_fold(rhs, params)?;
            let symbol = match op {
                BinaryOp::Add => "+",
                BinaryOp::Sub => "-",
                BinaryOp::Mul => "*",
                BinaryOp::Div => "/",
                BinaryOp::Mod => "%",
                _ => unreachable!(),
            };
            eval::arithmetic(symbol, &l, &r).ok()
        }
        _ => None,
    }
}

fn edge_to_value(edge: &themis_index::graph::Edge) -> Value {
    let ms_to_iso = |ms: i64| {
        chrono::DateTime::from_timestamp_millis(ms)
            .map(|dt| {
                Value::String(dt.to_rfc3339_opts(chrono::SecondsFormat::Millis, true))
            })
            .unwrap_or(Value::Null)
    };
    let mut fields = vec![
        ("id".to_string(), Value::from(edge.id.clone())),
        ("from".to_string(), Value::from(edge.from.clone())),
        ("to".to_string(), Value::from(edge.to.clone())),
        ("type".to_string(), Value::from(edge.edge_type.clone())),
    ];
    if let Some(w) = edge.weight {
        fields.push(("weight".to_string(), Value::Float(w)));
    }
    if let Some(from) = edge.valid_from {
        fields.push(("valid_from".to_string(), ms_to_iso(from)));
    }
    if let Some(to) = edge.valid_to {
        fields.push(("valid_to".to_string(), ms_to_iso(to)));
    }
    if !edge.properties.is_null() {
        fields.push(("properties".to_string(), edge.properties.clone()));
    }
    Value::Object(fields.into_iter().collect())
}

fn collect_window_calls(expr: &Expr, out: &mut Vec<Expr>) {
    match expr {
        Expr::Call(name, _) if WindowFunc::parse(name).is_some() => {
            if !out.contains(expr) {
                out.push(expr.clone());
            }
        }
        Expr::Call(_, args) => args.iter().for_each(|a| collect_window_calls(a, out)),
        Expr::Field(base, _) => collect_window_calls(base, out),
        Expr::Array(items) => items.iter().for_each(|i| collect_window_calls(i, out)),
        Expr::Object(fields) => fields.iter().for_each(|(_, v)| collect_window_calls(v, out)),
        Expr::Unary(_, inner) => collect_window_calls(inner, out),
        Expr::Binary(_, lhs, rhs) => {
            collect_window_calls(lhs, out);
            collect_window_calls(rhs, out);
        }
        Expr::Literal(_) | Expr::Variable(_) | Expr::Param(_) | Expr::Subquery(..) => {}
    }
}

fn substitute_windows(expr: &Expr, windows: &[(Expr, Vec<Value>)], row_idx: usize) -> Expr {
    if let Some((_, values)) = windows.iter().find(|(call, _)| call == expr) {
        return Expr::Literal(values.get(row_idx).cloned().unwrap_or(Value::Null));
    }
    match expr {
        Expr::Call(name, args) => Expr::Call(
            name.clone(),
            args.iter()
                .map(|a| substitute_windows(a, windows, row_idx))
                .collect(),
        ),
        Expr::Field(base, field) => Expr::Field(
            Box::new(substitute_windows(base, windows, row_idx)),
            field.clone(),
        ),
        Expr::Array(items) => Expr::Array(
            items
                .iter()
                .map(|i| substitute_windows(i, windows, row_idx))
                .collect(),
        ),
        Expr::Object(fields) => Expr::Object(
            fields
                .iter()
                .map(|(k, v)| (k.clone(), substitute_windows(v, windows, row_idx)))
                .collect(),
        ),
        Expr::Unary(op, inner) => {
            Expr::Unary(*op, Box::new(substitute_windows(inner, windows, row_idx)))
        }
        Expr::Binary(op, lhs, rhs) => Expr::Binary(
            *op,
            Box::new(substitute_windows(lhs, windows, row_idx)),
            Box::new(substitute_windows(rhs, windows, row_idx)),
        ),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percentile_nearest_rank() {
        let mut n = vec![1.0, 2.0, 3.0, 4.0];
        assert_eq!(percentile_of(&mut n.clone(), 50.0), Value::Float(2.0));
        assert_eq!(percentile_of(&mut n.clone(), 100.0), Value::Float(4.0));
        assert_eq!(percentile_of(&mut n.clone(), 1.0), Value::Float(1.0));
        assert_eq!(percentile_of(&mut n, 75.0), Value::Float(3.0));
        assert_eq!(percentile_of(&mut Vec::new(), 50.0), Value::Null);
    }

    #[test]
    fn test_const_fold() {
        let params = HashMap::from([("k".to_string(), Value::Int(5))]);
        assert_eq!(
            const_fold(&Expr::Param("k".into()), &params),
            Some(Value::Int(5))
        );
        let sum = Expr::Binary(
            BinaryOp::Add,
            Box::new(Expr::Literal(Value::Int(1))),
            Box::new(Expr::Param("k".into())),
        );
        assert_eq!(const_fold(&sum, &params), Some(Value::Int(6)));
        assert_eq!(const_fold(&Expr::Variable("u".into()), &params), None);
    }
}
