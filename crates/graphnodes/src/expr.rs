//! Predicate language used by `condition`, `switch`, `filter` and `cost-guard`
//!
//! ```text
//! expr       := or
//! or         := and ("||" and)*
//! and        := not ("&&" not)*
//! not        := "!" not | comparison
//! comparison := operand (("==" | "!=" | ">" | ">=" | "<" | "<=" | "contains") operand)?
//! operand    := number | string | "true" | "false" | "null" | path | "(" expr ")"
//! path       := ident ("." (ident | digits))*
//! ```
//!
//! Paths resolve against the bound input. A leading `input` segment refers to the
//! input itself unless the input has an `input` field.

use graphcore::{NodeError, Value, ValueExt};
use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Path(Vec<String>),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Compare(Box<Expr>, CompareOp, Box<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Equal,
    NotEqual,
    GreaterThan,
    GreaterThanOrEqual,
    SmallerThan,
    SmallerThanOrEqual,
    Contains,
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let symbol = match self {
            CompareOp::Equal => "==",
            CompareOp::NotEqual => "!=",
            CompareOp::GreaterThan => ">",
            CompareOp::GreaterThanOrEqual => ">=",
            CompareOp::SmallerThan => "<",
            CompareOp::SmallerThanOrEqual => "<=",
            CompareOp::Contains => "contains",
        };
        f.write_str(symbol)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Str(String),
    Ident(String),
    Dot,
    LParen,
    RParen,
    Not,
    And,
    Or,
    Op(CompareOp),
}

fn invalid(source: &str, message: impl fmt::Display) -> NodeError {
    NodeError::Configuration(format!("invalid expression '{}': {}", source, message))
}

fn tokenize(source: &str) -> Result<Vec<Token>, NodeError> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        match c {
            _ if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '.' => {
                tokens.push(Token::Dot);
                i += 1;
            }
            '&' if next == Some('&') => {
                tokens.push(Token::And);
                i += 2;
            }
            '|' if next == Some('|') => {
                tokens.push(Token::Or);
                i += 2;
            }
            '=' if next == Some('=') => {
                tokens.push(Token::Op(CompareOp::Equal));
                i += 2;
            }
            '!' if next == Some('=') => {
                tokens.push(Token::Op(CompareOp::NotEqual));
                i += 2;
            }
            '!' => {
                tokens.push(Token::Not);
                i += 1;
            }
            '>' | '<' => {
                let op = match (c, next == Some('=')) {
                    ('>', true) => CompareOp::GreaterThanOrEqual,
                    ('>', false) => CompareOp::GreaterThan,
                    ('<', true) => CompareOp::SmallerThanOrEqual,
                    _ => CompareOp::SmallerThan,
                };
                tokens.push(Token::Op(op));
                i += if next == Some('=') { 2 } else { 1 };
            }
            '"' | '\'' => {
                let quote = c;
                let mut text = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err(invalid(source, "unterminated string")),
                        Some('\\') => {
                            if let Some(escaped) = chars.get(i + 1) {
                                text.push(*escaped);
                            }
                            i += 2;
                        }
                        Some(ch) if *ch == quote => {
                            i += 1;
                            break;
                        }
                        Some(ch) => {
                            text.push(*ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(text));
            }
            _ if c.is_ascii_digit() || (c == '-' && next.map_or(false, |n| n.is_ascii_digit())) => {
                let start = i;
                i += 1;
                // a dot directly after a path segment is a separator, not a decimal point
                let after_dot = matches!(tokens.last(), Some(Token::Dot));
                while i < chars.len()
                    && (chars[i].is_ascii_digit() || (chars[i] == '.' && !after_dot))
                {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                if after_dot {
                    tokens.push(Token::Ident(text));
                } else {
                    let number = text
                        .parse()
                        .map_err(|_| invalid(source, format!("bad number '{}'", text)))?;
                    tokens.push(Token::Number(number));
                }
            }
            _ if c.is_alphabetic() || c == '_' || c == '$' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '-' || chars[i] == '$')
                {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(match word.as_str() {
                    "contains" => Token::Op(CompareOp::Contains),
                    _ => Token::Ident(word),
                });
            }
            other => return Err(invalid(source, format!("unexpected character '{}'", other))),
        }
    }
    Ok(tokens)
}

struct Parser<'a> {
    source: &'a str,
    tokens: Vec<Token>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn or(&mut self) -> Result<Expr, NodeError> {
        let mut left = self.and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            left = Expr::Or(Box::new(left), Box::new(self.and()?));
        }
        Ok(left)
    }

    fn and(&mut self) -> Result<Expr, NodeError> {
        let mut left = self.not()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            left = Expr::And(Box::new(left), Box::new(self.not()?));
        }
        Ok(left)
    }

    fn not(&mut self) -> Result<Expr, NodeError> {
        if self.peek() == Some(&Token::Not) {
            self.pos += 1;
            return Ok(Expr::Not(Box::new(self.not()?)));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Expr, NodeError> {
        let left = self.operand()?;
        if let Some(Token::Op(op)) = self.peek().cloned() {
            self.pos += 1;
            let right = self.operand()?;
            return Ok(Expr::Compare(Box::new(left), op, Box::new(right)));
        }
        Ok(left)
    }

    fn operand(&mut self) -> Result<Expr, NodeError> {
        match self.advance() {
            Some(Token::Number(n)) => Ok(Expr::Literal(Value::from(n))),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::LParen) => {
                let inner = self.or()?;
                match self.advance() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(invalid(self.source, "missing ')'")),
                }
            }
            Some(Token::Ident(word)) => match word.as_str() {
                "true" => Ok(Expr::Literal(Value::Bool(true))),
                "false" => Ok(Expr::Literal(Value::Bool(false))),
                "null" => Ok(Expr::Literal(Value::Null)),
                _ => {
                    let mut segments = vec![word];
                    while self.peek() == Some(&Token::Dot) {
                        self.pos += 1;
                        match self.advance() {
                            Some(Token::Ident(segment)) => segments.push(segment),
                            _ => return Err(invalid(self.source, "expected a name after '.'")),
                        }
                    }
                    Ok(Expr::Path(segments))
                }
            },
            Some(token) => Err(invalid(self.source, format!("unexpected {:?}", token))),
            None => Err(invalid(self.source, "unexpected end of expression")),
        }
    }
}

impl Expr {
    pub fn parse(source: &str) -> Result<Self, NodeError> {
        let mut parser = Parser {
            source,
            tokens: tokenize(source)?,
            pos: 0,
        };
        if parser.tokens.is_empty() {
            return Err(invalid(source, "empty expression"));
        }
        let expr = parser.or()?;
        if parser.pos < parser.tokens.len() {
            return Err(invalid(source, "trailing input"));
        }
        Ok(expr)
    }

    pub fn evaluate(&self, scope: &Value) -> Value {
        match self {
            Expr::Literal(value) => value.clone(),
            Expr::Path(segments) => resolve(scope, segments),
            Expr::Not(inner) => Value::Bool(!inner.evaluate(scope).truthy()),
            Expr::And(l, r) => Value::Bool(l.evaluate(scope).truthy() && r.evaluate(scope).truthy()),
            Expr::Or(l, r) => Value::Bool(l.evaluate(scope).truthy() || r.evaluate(scope).truthy()),
            Expr::Compare(l, op, r) => Value::Bool(compare(&l.evaluate(scope), *op, &r.evaluate(scope))),
        }
    }

    pub fn matches(&self, scope: &Value) -> bool {
        self.evaluate(scope).truthy()
    }
}

fn resolve(scope: &Value, segments: &[String]) -> Value {
    let mut rest = segments;
    if segments.first().map(String::as_str) == Some("input") && scope.get("input").is_none() {
        rest = &segments[1..];
    }
    scope.lookup(&rest.join(".")).cloned().unwrap_or(Value::Null)
}

fn loosely_equal(left: &Value, right: &Value) -> bool {
    match (left.as_f64(), right.as_f64()) {
        (Some(l), Some(r)) => l == r,
        _ => left == right,
    }
}

fn compare(left: &Value, op: CompareOp, right: &Value) -> bool {
    use std::cmp::Ordering;

    let ordering = match (left, right) {
        (Value::Number(_), Value::Number(_)) => left
            .as_f64()
            .zip(right.as_f64())
            .and_then(|(l, r)| l.partial_cmp(&r)),
        (Value::String(l), Value::String(r)) => Some(l.cmp(r)),
        _ => None,
    };

    match op {
        CompareOp::Equal => loosely_equal(left, right),
        CompareOp::NotEqual => !loosely_equal(left, right),
        CompareOp::GreaterThan => ordering == Some(Ordering::Greater),
        CompareOp::GreaterThanOrEqual => matches!(ordering, Some(Ordering::Greater | Ordering::Equal)),
        CompareOp::SmallerThan => ordering == Some(Ordering::Less),
        CompareOp::SmallerThanOrEqual => matches!(ordering, Some(Ordering::Less | Ordering::Equal)),
        CompareOp::Contains => match left {
            Value::String(haystack) => right.as_str().map_or(false, |needle| haystack.contains(needle)),
            Value::Array(items) => items.iter().any(|item| loosely_equal(item, right)),
            Value::Object(map) => right.as_str().map_or(false, |key| map.contains_key(key)),
            _ => false,
        },
    }
}
