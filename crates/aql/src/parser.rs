//! Recursive-descent parser for AQL.
//!
//! The grammar is clause-oriented: one or more `FOR` sources (collection
//! scans or graph traversals), any number of `FILTER` / `LET` /
//! `COLLECT` / `SORT` / `LIMIT` clauses in source order, and a final
//! `RETURN`. `WITH name AS ( ... )` introduces non-recursive CTEs ahead
//! of the body; subqueries appear in expression position either bare in
//! parentheses (scalar), behind `EXISTS`, or as the right side of `IN`.
//!
//! Every error is `InvalidQuery` with the line/column of the offending
//! token.

use crate::ast::*;
use crate::lexer::{tokenize, Token, TokenKind};
use themis_core::error::{Result, ThemisError};
use themis_core::value::Value;

/// Parse a query string into its AST.
pub fn parse(source: &str) -> Result<Query> {
    let tokens = tokenize(source)?;
    let mut parser = Parser { tokens, pos: 0 };
    let query = parser.query()?;
    parser.expect_eof()?;
    Ok(query)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn peek_kind(&self) -> &TokenKind {
        &self.peek().kind
    }

    fn bump(&mut self) -> Token {
        let token = self.tokens[self.pos.min(self.tokens.len() - 1)].clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn error_at(&self, token: &Token, message: impl Into<String>) -> ThemisError {
        ThemisError::invalid_query(message, token.line, token.column)
    }

    fn error_here(&self, message: impl Into<String>) -> ThemisError {
        let token = self.peek().clone();
        self.error_at(&token, message)
    }

    fn at_keyword(&self, kw: &str) -> bool {
        matches!(self.peek_kind(), TokenKind::Keyword(k) if k == kw)
    }

    fn eat_keyword(&mut self, kw: &str) -> bool {
        if self.at_keyword(kw) {
            self.bump();
            true
        } else {
            false
        }
    }

    fn expect_keyword(&mut self, kw: &str) -> Result<()> {
        if self.eat_keyword(kw) {
            Ok(())
        } else {
            Err(self.error_here(format!("expected {}", kw)))
        }
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.peek_kind() == kind {
            self.bump();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: &TokenKind, what: &str) -> Result<()> {
        if self.eat(kind) {
            Ok(())
        } else {
            Err(self.error_here(format!("expected {}", what)))
        }
    }

    fn expect_ident(&mut self, what: &str) -> Result<String> {
        match self.peek_kind().clone() {
            TokenKind::Ident(name) => {
                self.bump();
                Ok(name)
            }
            _ => Err(self.error_here(format!("expected {}", what))),
        }
    }

    fn expect_string(&mut self, what: &str) -> Result<String> {
        match self.peek_kind().clone() {
            TokenKind::Str(s) => {
                self.bump();
                Ok(s)
            }
            _ => Err(self.error_here(format!("expected {}", what))),
        }
    }

    fn expect_u64(&mut self, what: &str) -> Result<u64> {
        match self.peek_kind().clone() {
            TokenKind::Int(v) if v >= 0 => {
                self.bump();
                Ok(v as u64)
            }
            _ => Err(self.error_here(format!("expected {}", what))),
        }
    }

    fn expect_eof(&mut self) -> Result<()> {
        if matches!(self.peek_kind(), TokenKind::Eof) {
            Ok(())
        } else {
            Err(self.error_here("unexpected input after query"))
        }
    }

    // ========================================================================
    // Query structure
    // ========================================================================

    fn query(&mut self) -> Result<Query> {
        let mut ctes = Vec::new();
        if self.eat_keyword("WITH") {
            loop {
                let name = self.expect_ident("CTE name")?;
                self.expect_keyword("AS")?;
                self.expect(&TokenKind::LParen, "'('")?;
                let inner = self.query()?;
                self.expect(&TokenKind::RParen, "')'")?;
                ctes.push(Cte { name, query: inner });
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
            }
        }

        let mut fors = Vec::new();
        let mut clauses = Vec::new();
        if !self.at_keyword("FOR") {
            return Err(self.error_here("expected FOR"));
        }
        loop {
            if self.eat_keyword("FOR") {
                fors.push(self.for_clause()?);
            } else if self.eat_keyword("FILTER") {
                clauses.push(Clause::Filter(self.expr()?));
            } else if self.eat_keyword("LET") {
                let var = self.expect_ident("variable name")?;
                self.expect(&TokenKind::Assign, "'='")?;
                clauses.push(Clause::Let(var, self.expr()?));
            } else if self.eat_keyword("COLLECT") {
                clauses.push(Clause::Collect(self.collect_clause()?));
            } else if self.eat_keyword("SORT") {
                clauses.push(Clause::Sort(self.sort_keys()?));
            } else if self.eat_keyword("LIMIT") {
                let first = self.expect_u64("row count")?;
                if self.eat(&TokenKind::Comma) {
                    let count = self.expect_u64("row count")?;
                    clauses.push(Clause::Limit {
                        offset: first,
                        count,
                    });
                } else {
                    clauses.push(Clause::Limit {
                        offset: 0,
                        count: first,
                    });
                }
            } else if self.eat_keyword("RETURN") {
                let distinct = self.eat_keyword("DISTINCT");
                let expr = self.expr()?;
                return Ok(Query {
                    ctes,
                    fors,
                    clauses,
                    return_clause: ReturnClause { distinct, expr },
                });
            } else {
                return Err(self.error_here("expected FILTER, LET, COLLECT, SORT, LIMIT, FOR, or RETURN"));
            }
        }
    }

    fn for_clause(&mut self) -> Result<ForClause> {
        let first_var = self.expect_ident("variable name")?;
        let mut extra_vars = Vec::new();
        while self.eat(&TokenKind::Comma) {
            extra_vars.push(self.expect_ident("variable name")?);
        }
        self.expect_keyword("IN")?;

        // `FOR v IN 1..3 OUTBOUND ...` is a traversal; `FOR v IN users`
        // is a collection scan. The depth range is the discriminator.
        let is_traversal = matches!(self.peek_kind(), TokenKind::Int(_))
            && matches!(
                self.tokens.get(self.pos + 1).map(|t| &t.kind),
                Some(TokenKind::DotDot)
            );
        if !is_traversal {
            if !extra_vars.is_empty() {
                return Err(self.error_here("only traversals bind multiple variables"));
            }
            let source = self.expect_ident("collection name")?;
            return Ok(ForClause::Collection {
                var: first_var,
                source,
            });
        }
        if extra_vars.len() > 2 {
            return Err(self.error_here("a traversal binds at most vertex, edge, and path"));
        }

        let min_depth = self.expect_u64("minimum depth")? as u32;
        self.expect(&TokenKind::DotDot, "'..'")?;
        let max_depth = self.expect_u64("maximum depth")? as u32;
        if min_depth > max_depth {
            return Err(self.error_here("traversal minimum depth exceeds maximum"));
        }

        let direction = if self.eat_keyword("OUTBOUND") {
            TraversalDirection::Outbound
        } else if self.eat_keyword("INBOUND") {
            TraversalDirection::Inbound
        } else if self.eat_keyword("ANY") {
            TraversalDirection::Any
        } else {
            return Err(self.error_here("expected OUTBOUND, INBOUND, or ANY"));
        };

        // Either `'edgeType' start` or just `start`, disambiguated by
        // what follows the first expression.
        let first_expr = self.expr()?;
        let (edge_type, start) = if self.at_keyword("GRAPH") {
            (None, first_expr)
        } else {
            match first_expr {
                Expr::Literal(Value::String(t)) => (Some(t), self.expr()?),
                _ => return Err(self.error_here("edge type must be a string literal")),
            }
        };
        self.expect_keyword("GRAPH")?;
        let graph = self.expect_string("graph name")?;

        let mut vars = extra_vars.into_iter();
        Ok(ForClause::Traversal(TraversalClause {
            vertex_var: first_var,
            edge_var: vars.next(),
            path_var: vars.next(),
            min_depth,
            max_depth,
            direction,
            edge_type,
            start,
            graph,
        }))
    }

    fn collect_clause(&mut self) -> Result<CollectClause> {
        let mut groups = Vec::new();
        if !self.at_keyword("AGGREGATE") {
            loop {
                let var = self.expect_ident("group variable")?;
                self.expect(&TokenKind::Assign, "'='")?;
                groups.push((var, self.expr()?));
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
            }
        }

        let mut aggregates = Vec::new();
        if self.eat_keyword("AGGREGATE") {
            loop {
                let var = self.expect_ident("aggregate variable")?;
                self.expect(&TokenKind::Assign, "'='")?;
                let func_name = self.expect_ident("aggregate function")?.to_uppercase();
                let func = AggregateFunc::parse(&func_name)
                    .ok_or_else(|| self.error_here(format!("unknown aggregate '{}'", func_name)))?;
                self.expect(&TokenKind::LParen, "'('")?;
                let mut input = None;
                let mut percentile = None;
                if !matches!(self.peek_kind(), TokenKind::RParen) {
                    input = Some(self.expr()?);
                    if self.eat(&TokenKind::Comma) {
                        let p = match self.peek_kind().clone() {
                            TokenKind::Int(v) => {
                                self.bump();
                                v as f64
                            }
                            TokenKind::Float(v) => {
                                self.bump();
                                v
                            }
                            _ => return Err(self.error_here("expected percentile value")),
                        };
                        percentile = Some(p);
                    }
                }
                self.expect(&TokenKind::RParen, "')'")?;
                if func == AggregateFunc::Percentile && percentile.is_none() {
                    return Err(self.error_here("PERCENTILE requires a second argument"));
                }
                if func != AggregateFunc::Count && input.is_none() {
                    return Err(self.error_here(format!("{:?} requires an argument", func)));
                }
                aggregates.push(AggregateBinding {
                    var,
                    func,
                    input,
                    percentile,
                });
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
            }
        }

        let having = if self.eat_keyword("HAVING") {
            Some(self.expr()?)
        } else {
            None
        };

        if groups.is_empty() && aggregates.is_empty() {
            return Err(self.error_here("COLLECT needs group or aggregate bindings"));
        }
        Ok(CollectClause {
            groups,
            aggregates,
            having,
        })
    }

    fn sort_keys(&mut self) -> Result<Vec<SortKey>> {
        let mut keys = Vec::new();
        loop {
            let expr = self.expr()?;
            let ascending = if self.eat_keyword("DESC") {
                false
            } else {
                self.eat_keyword("ASC");
                true
            };
            keys.push(SortKey { expr, ascending });
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }
        Ok(keys)
    }

    // ========================================================================
    // Expressions, lowest precedence first
    // ========================================================================

    fn expr(&mut self) -> Result<Expr> {
        self.or_expr()
    }

    fn or_expr(&mut self) -> Result<Expr> {
        let mut lhs = self.xor_expr()?;
        loop {
            if self.eat_keyword("OR") || self.eat(&TokenKind::OrOr) {
                let rhs = self.xor_expr()?;
                lhs = Expr::Binary(BinaryOp::Or, Box::new(lhs), Box::new(rhs));
            } else {
                return Ok(lhs);
            }
        }
    }

    fn xor_expr(&mut self) -> Result<Expr> {
        let mut lhs = self.and_expr()?;
        while self.eat_keyword("XOR") {
            let rhs = self.and_expr()?;
            lhs = Expr::Binary(BinaryOp::Xor, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn and_expr(&mut self) -> Result<Expr> {
        let mut lhs = self.not_expr()?;
        loop {
            if self.eat_keyword("AND") || self.eat(&TokenKind::AndAnd) {
                let rhs = self.not_expr()?;
                lhs = Expr::Binary(BinaryOp::And, Box::new(lhs), Box::new(rhs));
            } else {
                return Ok(lhs);
            }
        }
    }

    fn not_expr(&mut self) -> Result<Expr> {
        if self.eat_keyword("NOT") || self.eat(&TokenKind::Bang) {
            let inner = self.not_expr()?;
            return Ok(Expr::Unary(UnaryOp::Not, Box::new(inner)));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Expr> {
        let lhs = self.additive()?;
        let op = match self.peek_kind() {
            TokenKind::EqEq => BinaryOp::Eq,
            TokenKind::Neq => BinaryOp::Ne,
            TokenKind::Lt => BinaryOp::Lt,
            TokenKind::Le => BinaryOp::Le,
            TokenKind::Gt => BinaryOp::Gt,
            TokenKind::Ge => BinaryOp::Ge,
            TokenKind::Keyword(k) if k == "IN" => BinaryOp::In,
            _ => return Ok(lhs),
        };
        self.bump();
        let rhs = self.additive()?;
        Ok(Expr::Binary(op, Box::new(lhs), Box::new(rhs)))
    }

    fn additive(&mut self) -> Result<Expr> {
        let mut lhs = self.multiplicative()?;
        loop {
            let op = match self.peek_kind() {
                TokenKind::Plus => BinaryOp::Add,
                TokenKind::Minus => BinaryOp::Sub,
                _ => return Ok(lhs),
            };
            self.bump();
            let rhs = self.multiplicative()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn multiplicative(&mut self) -> Result<Expr> {
        let mut lhs = self.unary()?;
        loop {
            let op = match self.peek_kind() {
                TokenKind::Star => BinaryOp::Mul,
                TokenKind::Slash => BinaryOp::Div,
                TokenKind::Percent => BinaryOp::Mod,
                _ => return Ok(lhs),
            };
            self.bump();
            let rhs = self.unary()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn unary(&mut self) -> Result<Expr> {
        if self.eat(&TokenKind::Minus) {
            let inner = self.unary()?;
            return Ok(Expr::Unary(UnaryOp::Neg, Box::new(inner)));
        }
        self.postfix()
    }

    fn postfix(&mut self) -> Result<Expr> {
        let mut expr = self.primary()?;
        loop {
            if self.eat(&TokenKind::Dot) {
                let field = match self.peek_kind().clone() {
                    TokenKind::Ident(name) => {
                        self.bump();
                        name
                    }
                    // Keywords are legal field names after a dot.
                    TokenKind::Keyword(name) => {
                        self.bump();
                        name.to_lowercase()
                    }
                    _ => return Err(self.error_here("expected field name")),
                };
                expr = Expr::Field(Box::new(expr), field);
            } else {
                return Ok(expr);
            }
        }
    }

    fn primary(&mut self) -> Result<Expr> {
        let token = self.peek().clone();
        match token.kind {
            TokenKind::Int(v) => {
                self.bump();
                Ok(Expr::Literal(Value::Int(v)))
            }
            TokenKind::Float(v) => {
                self.bump();
                Ok(Expr::Literal(Value::Float(v)))
            }
            TokenKind::Str(s) => {
                self.bump();
                Ok(Expr::Literal(Value::String(s)))
            }
            TokenKind::Param(name) => {
                self.bump();
                Ok(Expr::Param(name))
            }
            TokenKind::Keyword(k) if k == "TRUE" => {
                self.bump();
                Ok(Expr::Literal(Value::Bool(true)))
            }
            TokenKind::Keyword(k) if k == "FALSE" => {
                self.bump();
                Ok(Expr::Literal(Value::Bool(false)))
            }
            TokenKind::Keyword(k) if k == "NULL" => {
                self.bump();
                Ok(Expr::Literal(Value::Null))
            }
            TokenKind::Keyword(k) if k == "EXISTS" => {
                self.bump();
                self.expect(&TokenKind::LParen, "'('")?;
                let query = self.query()?;
                self.expect(&TokenKind::RParen, "')'")?;
                Ok(Expr::Subquery(Box::new(query), SubqueryKind::Exists))
            }
            TokenKind::Ident(name) => {
                self.bump();
                if self.eat(&TokenKind::LParen) {
                    let mut args = Vec::new();
                    if !matches!(self.peek_kind(), TokenKind::RParen) {
                        loop {
                            args.push(self.expr()?);
                            if !self.eat(&TokenKind::Comma) {
                                break;
                            }
                        }
                    }
                    self.expect(&TokenKind::RParen, "')'")?;
                    Ok(Expr::Call(name.to_uppercase(), args))
                } else {
                    Ok(Expr::Variable(name))
                }
            }
            TokenKind::LParen => {
                self.bump();
                // A parenthesized subquery or a grouped expression.
                if self.at_keyword("FOR") || self.at_keyword("WITH") {
                    let query = self.query()?;
                    self.expect(&TokenKind::RParen, "')'")?;
                    Ok(Expr::Subquery(Box::new(query), SubqueryKind::Scalar))
                } else {
                    let inner = self.expr()?;
                    self.expect(&TokenKind::RParen, "')'")?;
                    Ok(inner)
                }
            }
            TokenKind::LBracket => {
                self.bump();
                let mut items = Vec::new();
                if !matches!(self.peek_kind(), TokenKind::RBracket) {
                    loop {
                        items.push(self.expr()?);
                        if !self.eat(&TokenKind::Comma) {
                            break;
                        }
                    }
                }
                self.expect(&TokenKind::RBracket, "']'")?;
                Ok(Expr::Array(items))
            }
            TokenKind::LBrace => {
                self.bump();
                let mut fields = Vec::new();
                if !matches!(self.peek_kind(), TokenKind::RBrace) {
                    loop {
                        let key = match self.peek_kind().clone() {
                            TokenKind::Ident(name) => {
                                self.bump();
                                name
                            }
                            TokenKind::Str(s) => {
                                self.bump();
                                s
                            }
                            TokenKind::Keyword(name) => {
                                self.bump();
                                name.to_lowercase()
                            }
                            _ => return Err(self.error_here("expected object key")),
                        };
                        self.expect(&TokenKind::Colon, "':'")?;
                        fields.push((key, self.expr()?));
                        if !self.eat(&TokenKind::Comma) {
                            break;
                        }
                    }
                }
                self.expect(&TokenKind::RBrace, "'}'")?;
                Ok(Expr::Object(fields))
            }
            _ => Err(self.error_at(&token, "expected an expression")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_query() {
        let q = parse("FOR u IN users RETURN u").unwrap();
        assert_eq!(q.fors.len(), 1);
        assert!(matches!(
            &q.fors[0],
            ForClause::Collection { var, source } if var == "u" && source == "users"
        ));
        assert!(!q.return_clause.distinct);
        assert_eq!(q.return_clause.expr, Expr::Variable("u".into()));
    }

    #[test]
    fn test_filter_sort_limit() {
        let q = parse(
            "FOR u IN users FILTER u.age >= 500 SORT u.age ASC LIMIT 10 RETURN u",
        )
        .unwrap();
        assert_eq!(q.clauses.len(), 3);
        match &q.clauses[0] {
            Clause::Filter(Expr::Binary(BinaryOp::Ge, lhs, rhs)) => {
                assert_eq!(lhs.as_field_path(), Some(("u", "age".to_string())));
                assert_eq!(**rhs, Expr::Literal(Value::Int(500)));
            }
            other => panic!("unexpected filter {:?}", other),
        }
        match &q.clauses[1] {
            Clause::Sort(keys) => {
                assert_eq!(keys.len(), 1);
                assert!(keys[0].ascending);
            }
            other => panic!("unexpected clause {:?}", other),
        }
        assert!(matches!(q.clauses[2], Clause::Limit { offset: 0, count: 10 }));
    }

    #[test]
    fn test_limit_with_offset() {
        let q = parse("FOR u IN users LIMIT 20, 10 RETURN u").unwrap();
        assert!(matches!(q.clauses[0], Clause::Limit { offset: 20, count: 10 }));
    }

    #[test]
    fn test_operator_precedence() {
        let q = parse("FOR u IN users FILTER u.a == 1 OR u.b == 2 AND u.c == 3 RETURN u").unwrap();
        // AND binds tighter than OR.
        match &q.clauses[0] {
            Clause::Filter(Expr::Binary(BinaryOp::Or, _, rhs)) => {
                assert!(matches!(**rhs, Expr::Binary(BinaryOp::And, _, _)));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_arithmetic_precedence() {
        let q = parse("FOR u IN users RETURN 1 + 2 * 3").unwrap();
        match &q.return_clause.expr {
            Expr::Binary(BinaryOp::Add, _, rhs) => {
                assert!(matches!(**rhs, Expr::Binary(BinaryOp::Mul, _, _)));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_let_and_collect() {
        let q = parse(
            "FOR o IN orders LET t = o.net * 1.19 \
             COLLECT c = o.country AGGREGATE s = SUM(t), n = COUNT() HAVING s > 100 \
             RETURN {country: c, total: s, orders: n}",
        )
        .unwrap();
        assert!(matches!(&q.clauses[0], Clause::Let(v, _) if v == "t"));
        match &q.clauses[1] {
            Clause::Collect(c) => {
                assert_eq!(c.groups.len(), 1);
                assert_eq!(c.aggregates.len(), 2);
                assert_eq!(c.aggregates[0].func, AggregateFunc::Sum);
                assert_eq!(c.aggregates[1].func, AggregateFunc::Count);
                assert!(c.aggregates[1].input.is_none());
                assert!(c.having.is_some());
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(&q.return_clause.expr, Expr::Object(fields) if fields.len() == 3));
    }

    #[test]
    fn test_multi_column_collect() {
        let q = parse(
            "FOR u IN users COLLECT c = u.country, y = u.year AGGREGATE n = COUNT() RETURN [c, y, n]",
        )
        .unwrap();
        match &q.clauses[0] {
            Clause::Collect(c) => assert_eq!(c.groups.len(), 2),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_traversal_with_type_and_edge_var() {
        let q = parse(
            "FOR v, e IN 1..3 OUTBOUND 'follows' 'users:a' GRAPH 'social' \
             FILTER e.valid_from <= '2022-01-01' RETURN v",
        )
        .unwrap();
        match &q.fors[0] {
            ForClause::Traversal(t) => {
                assert_eq!(t.vertex_var, "v");
                assert_eq!(t.edge_var.as_deref(), Some("e"));
                assert_eq!(t.path_var, None);
                assert_eq!((t.min_depth, t.max_depth), (1, 3));
                assert_eq!(t.direction, TraversalDirection::Outbound);
                assert_eq!(t.edge_type.as_deref(), Some("follows"));
                assert_eq!(t.start, Expr::Literal(Value::String("users:a".into())));
                assert_eq!(t.graph, "social");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_traversal_without_type() {
        let q = parse("FOR v IN 0..2 ANY 'users:a' GRAPH 'social' RETURN v").unwrap();
        match &q.fors[0] {
            ForClause::Traversal(t) => {
                assert_eq!(t.edge_type, None);
                assert_eq!(t.direction, TraversalDirection::Any);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_traversal_with_variable_start() {
        let q = parse(
            "FOR u IN users FOR v IN 1..1 OUTBOUND u GRAPH 'social' RETURN v",
        )
        .unwrap();
        assert_eq!(q.fors.len(), 2);
        match &q.fors[1] {
            ForClause::Traversal(t) => assert_eq!(t.start, Expr::Variable("u".into())),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_multiple_fors_form_join() {
        let q = parse(
            "FOR u IN users FOR o IN orders FILTER u.id == o.user_id RETURN {u: u, o: o}",
        )
        .unwrap();
        assert_eq!(q.fors.len(), 2);
    }

    #[test]
    fn test_function_calls() {
        let q = parse(
            "FOR d IN docs FILTER FULLTEXT(d.title, 'rust database', 50) \
             RETURN {score: BM25(d), sim: VECTOR_SIMILARITY(d.vec, @q, 'cosine')}",
        )
        .unwrap();
        match &q.clauses[0] {
            Clause::Filter(Expr::Call(name, args)) => {
                assert_eq!(name, "FULLTEXT");
                assert_eq!(args.len(), 3);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_with_cte_and_subqueries() {
        let q = parse(
            "WITH adults AS (FOR u IN users FILTER u.age >= 18 RETURN u) \
             FOR a IN adults \
             FILTER a.id IN (FOR o IN orders RETURN o.user_id) \
             FILTER EXISTS (FOR p IN payments FILTER p.user == a.id RETURN p) \
             RETURN a",
        )
        .unwrap();
        assert_eq!(q.ctes.len(), 1);
        assert_eq!(q.ctes[0].name, "adults");
        match &q.clauses[0] {
            Clause::Filter(Expr::Binary(BinaryOp::In, _, rhs)) => {
                assert!(matches!(**rhs, Expr::Subquery(_, SubqueryKind::Scalar)));
            }
            other => panic!("unexpected {:?}", other),
        }
        match &q.clauses[1] {
            Clause::Filter(Expr::Subquery(_, SubqueryKind::Exists)) => {}
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_return_distinct() {
        let q = parse("FOR u IN users RETURN DISTINCT u.country").unwrap();
        assert!(q.return_clause.distinct);
    }

    #[test]
    fn test_not_and_bang() {
        let a = parse("FOR u IN users FILTER NOT (u.a == 1) RETURN u").unwrap();
        let b = parse("FOR u IN users FILTER !(u.a == 1) RETURN u").unwrap();
        assert_eq!(a.clauses, b.clauses);
    }

    #[test]
    fn test_in_list() {
        let q = parse("FOR u IN users FILTER u.country IN ['de', 'at', 'ch'] RETURN u").unwrap();
        match &q.clauses[0] {
            Clause::Filter(Expr::Binary(BinaryOp::In, _, rhs)) => {
                assert!(matches!(**rhs, Expr::Array(ref items) if items.len() == 3));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_errors_carry_position() {
        for source in [
            "FILTER u.age > 1 RETURN u",
            "FOR u IN users",
            "FOR u IN users RETURN",
            "FOR u IN users FILTER RETURN u",
            "FOR v IN 3..1 OUTBOUND 'a' GRAPH 'g' RETURN v",
            "FOR u IN users LIMIT -1 RETURN u",
        ] {
            match parse(source) {
                Err(ThemisError::InvalidQuery { line, column, .. }) => {
                    assert!(line >= 1 && column >= 1, "bad position for {:?}", source);
                }
                other => panic!("expected InvalidQuery for {:?}, got {:?}", source, other),
            }
        }
    }

    #[test]
    fn test_keyword_field_names_after_dot() {
        let q = parse("FOR u IN users RETURN u.limit").unwrap();
        assert_eq!(
            q.return_clause.expr.as_field_path(),
            Some(("u", "limit".to_string()))
        );
    }
}
