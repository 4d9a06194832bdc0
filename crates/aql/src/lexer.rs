//! The AQL tokenizer.
//!
//! Accepts single- and double-quoted strings (with backslash escapes),
//! integer and float literals, identifiers, case-insensitive keywords,
//! parameters (`@name`), and the operator set. Every token carries its
//! 1-based line and column; lexer errors surface as `InvalidQuery` with
//! the position of the offending character.

use themis_core::error::{Result, ThemisError};

/// Keywords, matched case-insensitively. Everything else is an
/// identifier.
pub const KEYWORDS: &[&str] = &[
    "FOR", "IN", "FILTER", "LET", "COLLECT", "AGGREGATE", "HAVING", "SORT", "LIMIT", "RETURN",
    "DISTINCT", "ASC", "DESC", "OUTBOUND", "INBOUND", "ANY", "GRAPH", "WITH", "AS", "AND", "OR",
    "NOT", "XOR", "TRUE", "FALSE", "NULL", "EXISTS", "LIKE",
];

/// One lexical token.
#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    /// Identifier (collection, variable, function name).
    Ident(String),
    /// Keyword, stored uppercase.
    Keyword(String),
    /// Integer literal.
    Int(i64),
    /// Float literal.
    Float(f64),
    /// String literal, unescaped.
    Str(String),
    /// Bind parameter `@name`.
    Param(String),
    /// `==`
    EqEq,
    /// `!=`
    Neq,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
    /// `=` (binding in LET / COLLECT)
    Assign,
    /// `+`
    Plus,
    /// `-`
    Minus,
    /// `*`
    Star,
    /// `/`
    Slash,
    /// `%`
    Percent,
    /// `!`
    Bang,
    /// `&&`
    AndAnd,
    /// `||`
    OrOr,
    /// `(`
    LParen,
    /// `)`
    RParen,
    /// `[`
    LBracket,
    /// `]`
    RBracket,
    /// `{`
    LBrace,
    /// `}`
    RBrace,
    /// `,`
    Comma,
    /// `.`
    Dot,
    /// `..`
    DotDot,
    /// `:`
    Colon,
    /// End of input.
    Eof,
}

/// A token plus its source position.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    /// What was lexed.
    pub kind: TokenKind,
    /// 1-based line.
    pub line: u32,
    /// 1-based column.
    pub column: u32,
}

struct Lexer<'a> {
    chars: std::iter::Peekable<std::str::Chars<'a>>,
    line: u32,
    column: u32,
}

impl<'a> Lexer<'a> {
    fn new(source: &'a str) -> Self {
        Lexer {
            chars: source.chars().peekable(),
            line: 1,
            column: 1,
        }
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.chars.next()?;
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    fn peek(&mut self) -> Option<char> {
        self.chars.peek().copied()
    }

    fn error(&self, message: impl Into<String>) -> ThemisError {
        ThemisError::invalid_query(message, self.line, self.column)
    }

    fn string_literal(&mut self, quote: char, line: u32, column: u32) -> Result<Token> {
        let mut out = String::new();
        loop {
            match self.bump() {
                Some(c) if c == quote => break,
                Some('\\') => match self.bump() {
                    Some('n') => out.push('\n'),
                    Some('t') => out.push('\t'),
                    Some('r') => out.push('\r'),
                    Some(c @ ('\\' | '\'' | '"')) => out.push(c),
                    Some(other) => {
                        return Err(self.error(format!("unknown escape '\\{}'", other)))
                    }
                    None => return Err(self.error("unterminated string literal")),
                },
                Some(c) => out.push(c),
                None => return Err(self.error("unterminated string literal")),
            }
        }
        Ok(Token {
            kind: TokenKind::Str(out),
            line,
            column,
        })
    }

    fn number(&mut self, first: char, line: u32, column: u32) -> Result<Token> {
        let mut text = String::from(first);
        let mut is_float = false;
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() {
                text.push(c);
                self.bump();
            } else if c == '.' {
                // Leave `..` (range operator) alone.
                let mut ahead = self.chars.clone();
                ahead.next();
                if ahead.peek() == Some(&'.') {
                    break;
                }
                if is_float {
                    break;
                }
                is_float = true;
                text.push(c);
                self.bump();
            } else if c == 'e' || c == 'E' {
                is_float = true;
                text.push(c);
                self.bump();
                if let Some(sign @ ('+' | '-')) = self.peek() {
                    text.push(sign);
                    self.bump();
                }
            } else {
                break;
            }
        }
        let kind = if is_float {
            TokenKind::Float(
                text.parse::<f64>()
                    .map_err(|_| self.error(format!("malformed number '{}'", text)))?,
            )
        } else {
            TokenKind::Int(
                text.parse::<i64>()
                    .map_err(|_| self.error(format!("malformed number '{}'", text)))?,
            )
        };
        Ok(Token { kind, line, column })
    }

    fn word(&mut self, first: char, line: u32, column: u32) -> Token {
        let mut text = String::from(first);
        while let Some(c) = self.peek() {
            if c.is_alphanumeric() || c == '_' {
                text.push(c);
                self.bump();
            } else {
                break;
            }
        }
        let upper = text.to_uppercase();
        let kind = if KEYWORDS.contains(&upper.as_str()) {
            TokenKind::Keyword(upper)
        } else {
            TokenKind::Ident(text)
        };
        Token { kind, line, column }
    }
}

/// Tokenize a query string.
pub fn tokenize(source: &str) -> Result<Vec<Token>> {
    let mut lexer = Lexer::new(source);
    let mut tokens = Vec::new();
    loop {
        // Skip whitespace and `//` line comments.
        loop {
            match lexer.peek() {
                Some(c) if c.is_whitespace() => {
                    lexer.bump();
                }
                Some('/') => {
                    let mut ahead = lexer.chars.clone();
                    ahead.next();
                    if ahead.peek() == Some(&'/') {
                        while let Some(c) = lexer.bump() {
                            if c == '\n' {
                                break;
                            }
                        }
                    } else {
                        break;
                    }
                }
                _ => break,
            }
        }

        let (line, column) = (lexer.line, lexer.column);
        let c = match lexer.bump() {
            Some(c) => c,
            None => {
                tokens.push(Token {
                    kind: TokenKind::Eof,
                    line,
                    column,
                });
                return Ok(tokens);
            }
        };

        let token = match c {
            '\'' | '"' => lexer.string_literal(c, line, column)?,
            '0'..='9' => lexer.number(c, line, column)?,
            c if c.is_alphabetic() || c == '_' => lexer.word(c, line, column),
            '@' => match lexer.bump() {
                Some(first) if first.is_alphabetic() || first == '_' => {
                    let word = lexer.word(first, line, column);
                    lexer_param(word, line, column)?
                }
                _ => return Err(lexer.error("expected parameter name after '@'")),
            },
            '=' => {
                if lexer.peek() == Some('=') {
                    lexer.bump();
                    Token { kind: TokenKind::EqEq, line, column }
                } else {
                    Token { kind: TokenKind::Assign, line, column }
                }
            }
            '!' => {
                if lexer.peek() == Some('=') {
                    lexer.bump();
                    Token { kind: TokenKind::Neq, line, column }
                } else {
                    Token { kind: TokenKind::Bang, line, column }
                }
            }
            '<' => {
                if lexer.peek() == Some('=') {
                    lexer.bump();
                    Token { kind: TokenKind::Le, line, column }
                } else {
                    Token { kind: TokenKind::Lt, line, column }
                }
            }
            '>' => {
                if lexer.peek() == Some('=') {
                    lexer.bump();
                    Token { kind: TokenKind::Ge, line, column }
                } else {
                    Token { kind: TokenKind::Gt, line, column }
                }
            }
            '&' => {
                if lexer.peek() == Some('&') {
                    lexer.bump();
                    Token { kind: TokenKind::AndAnd, line, column }
                } else {
                    return Err(lexer.error("expected '&&'"));
                }
            }
            '|' => {
                if lexer.peek() == Some('|') {
                    lexer.bump();
                    Token { kind: TokenKind::OrOr, line, column }
                } else {
                    return Err(lexer.error("expected '||'"));
                }
            }
            '.' => {
                if lexer.peek() == Some('.') {
                    lexer.bump();
                    Token { kind: TokenKind::DotDot, line, column }
                } else {
                    Token { kind: TokenKind::Dot, line, column }
                }
            }
            '+' => Token { kind: TokenKind::Plus, line, column },
            '-' => Token { kind: TokenKind::Minus, line, column },
            '*' => Token { kind: TokenKind::Star, line, column },
            '/' => Token { kind: TokenKind::Slash, line, column },
            '%' => Token { kind: TokenKind::Percent, line, column },
            '(' => Token { kind: TokenKind::LParen, line, column },
            ')' => Token { kind: TokenKind::RParen, line, column },
            '[' => Token { kind: TokenKind::LBracket, line, column },
            ']' => Token { kind: TokenKind::RBracket, line, column },
            '{' => Token { kind: TokenKind::LBrace, line, column },
            '}' => Token { kind: TokenKind::RBrace, line, column },
            ',' => Token { kind: TokenKind::Comma, line, column },
            ':' => Token { kind: TokenKind::Colon, line, column },
            other => return Err(lexer.error(format!("unexpected character '{}'", other))),
        };
        tokens.push(token);
    }
}

/// Rewrap a lexed word as a parameter token.
fn lexer_param(word: Token, line: u32, column: u32) -> Result<Token> {
    let name = match word.kind {
        TokenKind::Ident(name) => name,
        TokenKind::Keyword(name) => name.to_lowercase(),
        _ => {
            return Err(ThemisError::invalid_query(
                "expected parameter name after '@'",
                line,
                column,
            ))
        }
    };
    Ok(Token {
        kind: TokenKind::Param(name),
        line,
        column,
    })
}
