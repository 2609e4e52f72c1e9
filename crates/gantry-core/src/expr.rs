//! Condition expression evaluation.
//!
//! Gating conditions (`if:`) are written in a small closed expression
//! language: literals, context lookups (`env.*`, `matrix.*`,
//! `needs.<job>.result`, `needs.<job>.outputs.<key>`, `event.inputs.<key>`),
//! comparisons, short-circuiting `&&`/`||`, unary `!`, and a fixed set of
//! builtin functions (`success()`, `failure()`, `always()`, `cancelled()`,
//! `contains`, `startsWith`, `endsWith`).
//!
//! Coercion rules, chosen deliberately permissive and documented here:
//! - Unresolvable context lookups evaluate to `null`, never an error.
//! - Truthiness: `null`, `false`, `0` and `''` are falsey, all else truthy.
//! - Ordered comparisons (`<`, `<=`, `>`, `>=`) require both operands to be
//!   numeric (a number, or a string parsing as one); otherwise the
//!   comparison fails closed to `false`.
//! - Equality compares same-typed values directly; mixed types compare
//!   numerically when both sides are numeric, otherwise as strings with
//!   `null` coerced to the empty string.
//!
//! Malformed input (unbalanced parens, unknown functions, stray tokens)
//! surfaces as [`EvaluationError`] so the caller can report a parse failure
//! distinctly from a condition that legitimately evaluated false.

use crate::run::{ContextSnapshot, JobStatus};
use regex::Regex;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EvaluationError {
    #[error("unexpected character '{ch}' in expression")]
    UnexpectedChar { ch: char },

    #[error("unterminated string literal")]
    UnterminatedString,

    #[error("unexpected end of expression")]
    UnexpectedEnd,

    #[error("unexpected token '{token}'")]
    UnexpectedToken { token: String },

    #[error("invalid numeric literal '{literal}'")]
    InvalidNumber { literal: String },

    #[error("unknown function '{name}'")]
    UnknownFunction { name: String },

    #[error("function '{name}' expects {expected} arguments, got {got}")]
    WrongArity {
        name: String,
        expected: usize,
        got: usize,
    },
}

/// Result of evaluating an expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
}

impl Value {
    pub fn truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Number(n) => !n.is_nan() && *n != 0.0,
            Value::String(s) => !s.is_empty(),
        }
    }

    /// Numeric view: numbers directly, strings that parse as numbers.
    /// `null` and booleans are not numeric, so ordered comparisons
    /// involving them fail closed.
    fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// String view with `null` coerced to the empty string.
    fn as_str_lossy(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => {
                if n.fract() == 0.0 && n.is_finite() && n.abs() < 1e15 {
                    format!("{}", *n as i64)
                } else {
                    format!("{}", n)
                }
            }
            Value::String(s) => s.clone(),
        }
    }

    fn loose_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            _ => match (self.as_number(), other.as_number()) {
                (Some(a), Some(b)) => a == b,
                _ => self.as_str_lossy() == other.as_str_lossy(),
            },
        }
    }

    fn from_json(value: &serde_json::Value) -> Value {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
            serde_json::Value::String(s) => Value::String(s.clone()),
            // Composite values have no expression representation.
            _ => Value::Null,
        }
    }
}

/// Evaluate a condition expression against an immutable context snapshot.
///
/// An optional `${{ ... }}` wrapper is stripped before parsing, so both
/// `success()` and `${{ success() }}` are accepted.
pub fn evaluate(
    expr: &str,
    snapshot: &ContextSnapshot,
    env: &HashMap<String, String>,
) -> Result<Value, EvaluationError> {
    let re = Regex::new(r"^\s*\$\{\{(?s)(.*)\}\}\s*$").unwrap();
    let inner = match re.captures(expr) {
        Some(caps) => caps.get(1).map_or("", |m| m.as_str()).to_string(),
        None => expr.to_string(),
    };

    let tokens = lex(&inner)?;
    let mut parser = Parser { tokens, pos: 0 };
    let ast = parser.parse_or()?;
    if let Some(tok) = parser.peek() {
        return Err(EvaluationError::UnexpectedToken {
            token: tok.describe(),
        });
    }
    eval(&ast, snapshot, env)
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Num(f64),
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    AndAnd,
    OrOr,
    Bang,
    LParen,
    RParen,
    Comma,
    Dot,
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Token::Ident(s) => s.clone(),
            Token::Str(s) => format!("'{}'", s),
            Token::Num(n) => format!("{}", n),
            Token::Eq => "==".into(),
            Token::Ne => "!=".into(),
            Token::Lt => "<".into(),
            Token::Le => "<=".into(),
            Token::Gt => ">".into(),
            Token::Ge => ">=".into(),
            Token::AndAnd => "&&".into(),
            Token::OrOr => "||".into(),
            Token::Bang => "!".into(),
            Token::LParen => "(".into(),
            Token::RParen => ")".into(),
            Token::Comma => ",".into(),
            Token::Dot => ".".into(),
        }
    }
}

fn lex(input: &str) -> Result<Vec<Token>, EvaluationError> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '.' => {
                tokens.push(Token::Dot);
                i += 1;
            }
            '=' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Eq);
                i += 2;
            }
            '!' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Ne);
                i += 2;
            }
            '!' => {
                tokens.push(Token::Bang);
                i += 1;
            }
            '<' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Le);
                i += 2;
            }
            '<' => {
                tokens.push(Token::Lt);
                i += 1;
            }
            '>' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Ge);
                i += 2;
            }
            '>' => {
                tokens.push(Token::Gt);
                i += 1;
            }
            '&' if chars.get(i + 1) == Some(&'&') => {
                tokens.push(Token::AndAnd);
                i += 2;
            }
            '|' if chars.get(i + 1) == Some(&'|') => {
                tokens.push(Token::OrOr);
                i += 2;
            }
            '\'' => {
                // Single-quoted string; '' escapes a literal quote.
                let mut out = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        Some('\'') if chars.get(i + 1) == Some(&'\'') => {
                            out.push('\'');
                            i += 2;
                        }
                        Some('\'') => {
                            i += 1;
                            break;
                        }
                        Some(ch) => {
                            out.push(*ch);
                            i += 1;
                        }
                        None => return Err(EvaluationError::UnterminatedString),
                    }
                }
                tokens.push(Token::Str(out));
            }
            '-' if chars.get(i + 1).is_some_and(|ch| ch.is_ascii_digit()) => {
                let (num, next) = lex_number(&chars, i)?;
                tokens.push(Token::Num(num));
                i = next;
            }
            c if c.is_ascii_digit() => {
                let (num, next) = lex_number(&chars, i)?;
                tokens.push(Token::Num(num));
                i = next;
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '-')
                {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            other => return Err(EvaluationError::UnexpectedChar { ch: other }),
        }
    }

    Ok(tokens)
}

fn lex_number(chars: &[char], start: usize) -> Result<(f64, usize), EvaluationError> {
    let mut i = start;
    if chars[i] == '-' {
        i += 1;
    }
    while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
        i += 1;
    }
    let text: String = chars[start..i].iter().collect();
    let num = text
        .parse()
        .map_err(|_| EvaluationError::InvalidNumber { literal: text })?;
    Ok((num, i))
}

#[derive(Debug, Clone)]
enum Expr {
    Lit(Value),
    Path(Vec<String>),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Cmp(CmpOp, Box<Expr>, Box<Expr>),
    Call(String, Vec<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn parse_or(&mut self) -> Result<Expr, EvaluationError> {
        let mut lhs = self.parse_and()?;
        while self.eat(&Token::OrOr) {
            let rhs = self.parse_and()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr, EvaluationError> {
        let mut lhs = self.parse_cmp()?;
        while self.eat(&Token::AndAnd) {
            let rhs = self.parse_cmp()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_cmp(&mut self) -> Result<Expr, EvaluationError> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Eq) => CmpOp::Eq,
                Some(Token::Ne) => CmpOp::Ne,
                Some(Token::Lt) => CmpOp::Lt,
                Some(Token::Le) => CmpOp::Le,
                Some(Token::Gt) => CmpOp::Gt,
                Some(Token::Ge) => CmpOp::Ge,
                _ => break,
            };
            self.pos += 1;
            let rhs = self.parse_unary()?;
            lhs = Expr::Cmp(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr, EvaluationError> {
        if self.eat(&Token::Bang) {
            let inner = self.parse_unary()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, EvaluationError> {
        match self.advance() {
            Some(Token::Str(s)) => Ok(Expr::Lit(Value::String(s))),
            Some(Token::Num(n)) => Ok(Expr::Lit(Value::Number(n))),
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                if !self.eat(&Token::RParen) {
                    return match self.peek() {
                        Some(tok) => Err(EvaluationError::UnexpectedToken {
                            token: tok.describe(),
                        }),
                        None => Err(EvaluationError::UnexpectedEnd),
                    };
                }
                Ok(inner)
            }
            Some(Token::Ident(name)) => {
                if self.eat(&Token::LParen) {
                    return self.parse_call(name);
                }
                let mut path = vec![name];
                while self.eat(&Token::Dot) {
                    match self.advance() {
                        Some(Token::Ident(seg)) => path.push(seg),
                        Some(tok) => {
                            return Err(EvaluationError::UnexpectedToken {
                                token: tok.describe(),
                            });
                        }
                        None => return Err(EvaluationError::UnexpectedEnd),
                    }
                }
                if path.len() == 1 {
                    match path[0].as_str() {
                        "true" => return Ok(Expr::Lit(Value::Bool(true))),
                        "false" => return Ok(Expr::Lit(Value::Bool(false))),
                        "null" => return Ok(Expr::Lit(Value::Null)),
                        _ => {}
                    }
                }
                Ok(Expr::Path(path))
            }
            Some(tok) => Err(EvaluationError::UnexpectedToken {
                token: tok.describe(),
            }),
            None => Err(EvaluationError::UnexpectedEnd),
        }
    }

    fn parse_call(&mut self, name: String) -> Result<Expr, EvaluationError> {
        let mut args = Vec::new();
        if self.eat(&Token::RParen) {
            return Ok(Expr::Call(name, args));
        }
        loop {
            args.push(self.parse_or()?);
            if self.eat(&Token::Comma) {
                continue;
            }
            if self.eat(&Token::RParen) {
                return Ok(Expr::Call(name, args));
            }
            return match self.peek() {
                Some(tok) => Err(EvaluationError::UnexpectedToken {
                    token: tok.describe(),
                }),
                None => Err(EvaluationError::UnexpectedEnd),
            };
        }
    }
}

fn eval(
    expr: &Expr,
    snapshot: &ContextSnapshot,
    env: &HashMap<String, String>,
) -> Result<Value, EvaluationError> {
    match expr {
        Expr::Lit(v) => Ok(v.clone()),
        Expr::Path(path) => Ok(resolve_path(path, snapshot, env)),
        Expr::Not(inner) => Ok(Value::Bool(!eval(inner, snapshot, env)?.truthy())),
        Expr::And(lhs, rhs) => {
            let left = eval(lhs, snapshot, env)?;
            if !left.truthy() {
                return Ok(left);
            }
            eval(rhs, snapshot, env)
        }
        Expr::Or(lhs, rhs) => {
            let left = eval(lhs, snapshot, env)?;
            if left.truthy() {
                return Ok(left);
            }
            eval(rhs, snapshot, env)
        }
        Expr::Cmp(op, lhs, rhs) => {
            let left = eval(lhs, snapshot, env)?;
            let right = eval(rhs, snapshot, env)?;
            Ok(Value::Bool(compare(*op, &left, &right)))
        }
        Expr::Call(name, args) => {
            let values: Vec<Value> = args
                .iter()
                .map(|a| eval(a, snapshot, env))
                .collect::<Result<_, _>>()?;
            call_builtin(name, &values, snapshot)
        }
    }
}

fn compare(op: CmpOp, left: &Value, right: &Value) -> bool {
    match op {
        CmpOp::Eq => left.loose_eq(right),
        CmpOp::Ne => !left.loose_eq(right),
        // Ordered comparisons fail closed on non-numeric operands.
        CmpOp::Lt | CmpOp::Le | CmpOp::Gt | CmpOp::Ge => {
            match (left.as_number(), right.as_number()) {
                (Some(a), Some(b)) => match op {
                    CmpOp::Lt => a < b,
                    CmpOp::Le => a <= b,
                    CmpOp::Gt => a > b,
                    CmpOp::Ge => a >= b,
                    _ => unreachable!(),
                },
                _ => false,
            }
        }
    }
}

fn resolve_path(path: &[String], snapshot: &ContextSnapshot, env: &HashMap<String, String>) -> Value {
    let segments: Vec<&str> = path.iter().map(String::as_str).collect();
    match segments.as_slice() {
        ["env", key] => env
            .get(*key)
            .map(|v| Value::String(v.clone()))
            .unwrap_or(Value::Null),
        ["matrix", key] => snapshot
            .matrix
            .get(*key)
            .map(Value::from_json)
            .unwrap_or(Value::Null),
        ["needs", job, "result"] => snapshot
            .needs
            .get(*job)
            .map(|n| Value::String(status_str(n.result).to_string()))
            .unwrap_or(Value::Null),
        ["needs", job, "outputs", key] => snapshot
            .needs
            .get(*job)
            .and_then(|n| n.outputs.get(*key))
            .map(|v| Value::String(v.clone()))
            .unwrap_or(Value::Null),
        ["event", "inputs", key] => snapshot
            .inputs
            .get(*key)
            .map(|v| Value::String(v.clone()))
            .unwrap_or(Value::Null),
        // Anything unresolvable is null, not an error.
        _ => Value::Null,
    }
}

fn status_str(status: JobStatus) -> &'static str {
    match status {
        JobStatus::Pending => "pending",
        JobStatus::Running => "running",
        JobStatus::Success => "success",
        JobStatus::Failure => "failure",
        JobStatus::Skipped => "skipped",
        JobStatus::Cancelled => "cancelled",
    }
}

fn call_builtin(
    name: &str,
    args: &[Value],
    snapshot: &ContextSnapshot,
) -> Result<Value, EvaluationError> {
    let arity = |expected: usize| -> Result<(), EvaluationError> {
        if args.len() != expected {
            Err(EvaluationError::WrongArity {
                name: name.to_string(),
                expected,
                got: args.len(),
            })
        } else {
            Ok(())
        }
    };

    match name {
        // Status functions aggregate over the direct dependency instances
        // recorded in the snapshot, not global run state.
        "success" => {
            arity(0)?;
            Ok(Value::Bool(
                snapshot
                    .dependency_statuses()
                    .all(|s| s == JobStatus::Success),
            ))
        }
        "failure" => {
            arity(0)?;
            Ok(Value::Bool(
                snapshot
                    .dependency_statuses()
                    .any(|s| s == JobStatus::Failure),
            ))
        }
        "cancelled" => {
            arity(0)?;
            Ok(Value::Bool(
                snapshot
                    .dependency_statuses()
                    .any(|s| s == JobStatus::Cancelled),
            ))
        }
        "always" => {
            arity(0)?;
            Ok(Value::Bool(true))
        }
        "contains" => {
            arity(2)?;
            Ok(Value::Bool(
                args[0].as_str_lossy().contains(&args[1].as_str_lossy()),
            ))
        }
        "startsWith" => {
            arity(2)?;
            Ok(Value::Bool(
                args[0].as_str_lossy().starts_with(&args[1].as_str_lossy()),
            ))
        }
        "endsWith" => {
            arity(2)?;
            Ok(Value::Bool(
                args[0].as_str_lossy().ends_with(&args[1].as_str_lossy()),
            ))
        }
        _ => Err(EvaluationError::UnknownFunction {
            name: name.to_string(),
        }),
    }
}
