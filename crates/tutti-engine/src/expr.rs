//! Sandboxed expression evaluation for conditions and value mappings.
//!
//! Expressions are parsed into a small AST and interpreted against a
//! JSON scope — there is no code evaluation. The scope exposes the
//! roots `context`, `results`, and loop/error variables (`item`,
//! `index`, `error`); a bare leading identifier falls back to a lookup
//! under `context`.
//!
//! Failure handling is deliberately asymmetric, matching the workflow
//! contract authors rely on:
//! - a condition that fails to parse or resolve evaluates to `false`;
//! - a value expression that fails to resolve returns the raw
//!   expression text unevaluated.

use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;
use tracing::debug;

use tutti_core::error::{Result, TuttiError};

/// Evaluate a boolean condition. Any failure is `false`.
pub fn evaluate_condition(expr: &str, scope: &Value) -> bool {
    match evaluate(expr, scope) {
        Ok(value) => truthy(&value),
        Err(e) => {
            debug!(expr, error = %e, "Condition evaluation failed, treating as false");
            false
        }
    }
}

/// Resolve a value expression.
///
/// `{{ path }}` templates and bare expressions both resolve against the
/// scope; embedded placeholders are substituted into the surrounding
/// string. Any failure returns the raw expression string.
pub fn resolve_value(expr: &str, scope: &Value) -> Value {
    let trimmed = expr.trim();

    if let Some(inner) = full_template(trimmed) {
        return match evaluate(inner, scope) {
            Ok(value) => value,
            Err(e) => {
                debug!(expr, error = %e, "Value resolution failed, passing raw expression through");
                Value::String(expr.to_string())
            }
        };
    }

    if template_re().is_match(trimmed) {
        return Value::String(interpolate_str(trimmed, scope));
    }

    match evaluate(trimmed, scope) {
        Ok(value) => value,
        Err(e) => {
            debug!(expr, error = %e, "Value resolution failed, passing raw expression through");
            Value::String(expr.to_string())
        }
    }
}

/// Deep-walk an input mapping, resolving embedded `{{ ... }}`
/// placeholders in every string.
pub fn interpolate(mapping: &Value, scope: &Value) -> Value {
    match mapping {
        Value::String(s) => {
            if let Some(inner) = full_template(s.trim()) {
                match evaluate(inner, scope) {
                    Ok(value) => value,
                    Err(_) => Value::String(s.clone()),
                }
            } else if template_re().is_match(s) {
                Value::String(interpolate_str(s, scope))
            } else {
                Value::String(s.clone())
            }
        }
        Value::Array(items) => Value::Array(items.iter().map(|v| interpolate(v, scope)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), interpolate(v, scope)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Render a value for string embedding and switch-case lookup.
pub fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn template_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{\s*([^{}]+?)\s*\}\}").expect("static regex"))
}

/// If the whole string is a single `{{ ... }}` template, return the inner expression.
fn full_template(s: &str) -> Option<&str> {
    let captures = template_re().captures(s)?;
    let whole = captures.get(0)?;
    if whole.start() == 0 && whole.end() == s.len() {
        Some(captures.get(1)?.as_str())
    } else {
        None
    }
}

fn interpolate_str(s: &str, scope: &Value) -> String {
    template_re()
        .replace_all(s, |caps: &regex::Captures<'_>| {
            match evaluate(&caps[1], scope) {
                Ok(value) => stringify(&value),
                // Failed placeholders stay verbatim.
                Err(_) => caps[0].to_string(),
            }
        })
        .into_owned()
}

/// Parse and evaluate an expression against a scope.
pub fn evaluate(expr: &str, scope: &Value) -> Result<Value> {
    let tokens = tokenize(expr)?;
    let mut parser = Parser { tokens, pos: 0 };
    let ast = parser.parse_expr()?;
    if parser.pos != parser.tokens.len() {
        return Err(TuttiError::Expression(format!(
            "trailing input in expression '{}'",
            expr
        )));
    }
    eval_node(&ast, scope)
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Num(f64),
    True,
    False,
    Null,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Contains,
    And,
    Or,
    Not,
    Dot,
    LParen,
    RParen,
    LBracket,
    RBracket,
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
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
            '[' => {
                tokens.push(Token::LBracket);
                i += 1;
            }
            ']' => {
                tokens.push(Token::RBracket);
                i += 1;
            }
            '.' => {
                tokens.push(Token::Dot);
                i += 1;
            }
            '"' | '\'' => {
                let quote = c;
                let mut s = String::new();
                i += 1;
                let mut closed = false;
                while i < chars.len() {
                    if chars[i] == '\\' && i + 1 < chars.len() {
                        s.push(chars[i + 1]);
                        i += 2;
                    } else if chars[i] == quote {
                        closed = true;
                        i += 1;
                        break;
                    } else {
                        s.push(chars[i]);
                        i += 1;
                    }
                }
                if !closed {
                    return Err(TuttiError::Expression("unterminated string".into()));
                }
                tokens.push(Token::Str(s));
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
                tokens.push(Token::Not);
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
                tokens.push(Token::And);
                i += 2;
            }
            '|' if chars.get(i + 1) == Some(&'|') => {
                tokens.push(Token::Or);
                i += 2;
            }
            '-' | '0'..='9' => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let n: f64 = text
                    .parse()
                    .map_err(|_| TuttiError::Expression(format!("bad number '{}'", text)))?;
                tokens.push(Token::Num(n));
            }
            c if c.is_alphabetic() || c == '_' => {
                // Identifiers allow '-' so step ids like "fetch-sources"
                // work as path segments (there is no arithmetic).
                let start = i;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '-')
                {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(match word.as_str() {
                    "true" => Token::True,
                    "false" => Token::False,
                    "null" => Token::Null,
                    "contains" => Token::Contains,
                    _ => Token::Ident(word),
                });
            }
            other => {
                return Err(TuttiError::Expression(format!(
                    "unexpected character '{}'",
                    other
                )))
            }
        }
    }

    Ok(tokens)
}

#[derive(Debug, Clone)]
enum Node {
    Literal(Value),
    Path(Vec<PathSeg>),
    Not(Box<Node>),
    Binary {
        op: BinOp,
        left: Box<Node>,
        right: Box<Node>,
    },
}

#[derive(Debug, Clone)]
enum PathSeg {
    Key(String),
    Index(usize),
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum BinOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Contains,
    And,
    Or,
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn parse_expr(&mut self) -> Result<Node> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<Node> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.next();
            let right = self.parse_and()?;
            left = Node::Binary {
                op: BinOp::Or,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Node> {
        let mut left = self.parse_comparison()?;
        while self.peek() == Some(&Token::And) {
            self.next();
            let right = self.parse_comparison()?;
            left = Node::Binary {
                op: BinOp::And,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_comparison(&mut self) -> Result<Node> {
        let left = self.parse_unary()?;
        let op = match self.peek() {
            Some(Token::Eq) => BinOp::Eq,
            Some(Token::Ne) => BinOp::Ne,
            Some(Token::Lt) => BinOp::Lt,
            Some(Token::Le) => BinOp::Le,
            Some(Token::Gt) => BinOp::Gt,
            Some(Token::Ge) => BinOp::Ge,
            Some(Token::Contains) => BinOp::Contains,
            _ => return Ok(left),
        };
        self.next();
        let right = self.parse_unary()?;
        Ok(Node::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        })
    }

    fn parse_unary(&mut self) -> Result<Node> {
        if self.peek() == Some(&Token::Not) {
            self.next();
            let inner = self.parse_unary()?;
            return Ok(Node::Not(Box::new(inner)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Node> {
        match self.next() {
            Some(Token::Str(s)) => Ok(Node::Literal(Value::String(s))),
            Some(Token::Num(n)) => Ok(Node::Literal(
                serde_json::Number::from_f64(n)
                    .map(Value::Number)
                    .unwrap_or(Value::Null),
            )),
            Some(Token::True) => Ok(Node::Literal(Value::Bool(true))),
            Some(Token::False) => Ok(Node::Literal(Value::Bool(false))),
            Some(Token::Null) => Ok(Node::Literal(Value::Null)),
            Some(Token::LParen) => {
                let inner = self.parse_expr()?;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(TuttiError::Expression("expected ')'".into())),
                }
            }
            Some(Token::Ident(first)) => {
                let mut segs = vec![PathSeg::Key(first)];
                loop {
                    match self.peek() {
                        Some(Token::Dot) => {
                            self.next();
                            match self.next() {
                                Some(Token::Ident(key)) => segs.push(PathSeg::Key(key)),
                                _ => {
                                    return Err(TuttiError::Expression(
                                        "expected identifier after '.'".into(),
                                    ))
                                }
                            }
                        }
                        Some(Token::LBracket) => {
                            self.next();
                            let index = match self.next() {
                                Some(Token::Num(n)) if n >= 0.0 && n.fract() == 0.0 => n as usize,
                                _ => {
                                    return Err(TuttiError::Expression(
                                        "expected array index".into(),
                                    ))
                                }
                            };
                            match self.next() {
                                Some(Token::RBracket) => segs.push(PathSeg::Index(index)),
                                _ => return Err(TuttiError::Expression("expected ']'".into())),
                            }
                        }
                        _ => break,
                    }
                }
                Ok(Node::Path(segs))
            }
            other => Err(TuttiError::Expression(format!(
                "unexpected token {:?}",
                other
            ))),
        }
    }
}

fn eval_node(node: &Node, scope: &Value) -> Result<Value> {
    match node {
        Node::Literal(v) => Ok(v.clone()),
        Node::Path(segs) => resolve_path(segs, scope),
        Node::Not(inner) => {
            let v = eval_node(inner, scope)?;
            Ok(Value::Bool(!truthy(&v)))
        }
        Node::Binary { op, left, right } => match op {
            BinOp::And => {
                let l = eval_node(left, scope)?;
                if !truthy(&l) {
                    return Ok(Value::Bool(false));
                }
                let r = eval_node(right, scope)?;
                Ok(Value::Bool(truthy(&r)))
            }
            BinOp::Or => {
                let l = eval_node(left, scope)?;
                if truthy(&l) {
                    return Ok(Value::Bool(true));
                }
                let r = eval_node(right, scope)?;
                Ok(Value::Bool(truthy(&r)))
            }
            _ => {
                let l = eval_node(left, scope)?;
                let r = eval_node(right, scope)?;
                apply_comparison(*op, &l, &r)
            }
        },
    }
}

fn resolve_path(segs: &[PathSeg], scope: &Value) -> Result<Value> {
    let first = match &segs[0] {
        PathSeg::Key(k) => k,
        PathSeg::Index(_) => {
            return Err(TuttiError::Expression("path cannot start with index".into()))
        }
    };

    // Known roots resolve directly; bare identifiers fall back to the
    // context object.
    let (start, rest): (&Value, &[PathSeg]) = match scope.get(first) {
        Some(v) => (v, &segs[1..]),
        None => match scope.get("context").and_then(|c| c.get(first)) {
            Some(v) => (v, &segs[1..]),
            None => {
                return Err(TuttiError::Expression(format!(
                    "unknown identifier '{}'",
                    first
                )))
            }
        },
    };

    let mut current = start;
    for seg in rest {
        current = match seg {
            PathSeg::Key(k) => current.get(k).ok_or_else(|| {
                TuttiError::Expression(format!("missing key '{}' in path", k))
            })?,
            PathSeg::Index(i) => current.get(i).ok_or_else(|| {
                TuttiError::Expression(format!("index {} out of bounds", i))
            })?,
        };
    }
    Ok(current.clone())
}

fn apply_comparison(op: BinOp, left: &Value, right: &Value) -> Result<Value> {
    let result = match op {
        BinOp::Eq => values_equal(left, right),
        BinOp::Ne => !values_equal(left, right),
        BinOp::Contains => contains(left, right)?,
        BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
            let ordering = compare(left, right)?;
            match op {
                BinOp::Lt => ordering == std::cmp::Ordering::Less,
                BinOp::Le => ordering != std::cmp::Ordering::Greater,
                BinOp::Gt => ordering == std::cmp::Ordering::Greater,
                BinOp::Ge => ordering != std::cmp::Ordering::Less,
                _ => unreachable!(),
            }
        }
        BinOp::And | BinOp::Or => unreachable!("handled by eval_node"),
    };
    Ok(Value::Bool(result))
}

fn values_equal(left: &Value, right: &Value) -> bool {
    match (left.as_f64(), right.as_f64()) {
        // Numeric equality ignores integer/float representation.
        (Some(l), Some(r)) => (l - r).abs() < f64::EPSILON,
        _ => left == right,
    }
}

fn compare(left: &Value, right: &Value) -> Result<std::cmp::Ordering> {
    if let (Some(l), Some(r)) = (left.as_f64(), right.as_f64()) {
        return l
            .partial_cmp(&r)
            .ok_or_else(|| TuttiError::Expression("incomparable numbers".into()));
    }
    if let (Some(l), Some(r)) = (left.as_str(), right.as_str()) {
        return Ok(l.cmp(r));
    }
    Err(TuttiError::Expression(format!(
        "cannot order {} against {}",
        left, right
    )))
}

fn contains(left: &Value, right: &Value) -> Result<bool> {
    match left {
        Value::String(haystack) => match right.as_str() {
            Some(needle) => Ok(haystack.contains(needle)),
            None => Ok(haystack.contains(&stringify(right))),
        },
        Value::Array(items) => Ok(items.iter().any(|v| values_equal(v, right))),
        Value::Object(map) => match right.as_str() {
            Some(key) => Ok(map.contains_key(key)),
            None => Ok(false),
        },
        _ => Err(TuttiError::Expression(
            "contains requires a string, array, or object".into(),
        )),
    }
}

/// JS-like truthiness: null and false are false; zero and the empty
/// string are false; everything else is true.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}
