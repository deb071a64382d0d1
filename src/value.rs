//! Variable values and lenient scalar parsing.
//!
//! Source data carries values as raw text. Parsing is tolerant: a numeric
//! field that fails to parse is stripped of disallowed characters and
//! retried once before the assignment is skipped.

use serde::{Deserialize, Serialize};

/// A single variable value at one timeline instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Int(i64),
    Float(f64),
    Bool(bool),
    Text(String),
    List(Vec<String>),
    /// Future-event label attached by the reverse pass.
    Future(FutureOutcome),
}

/// What is known about a future event from the perspective of one entry.
///
/// `days_until` is present only when the occurrence lies strictly in the
/// future; an occurrence on or before the entry's day reports the
/// "now or past" category with no day count.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FutureOutcome {
    pub occurs: bool,
    pub days_until: Option<i64>,
    pub category: u8,
}

impl Value {
    /// Numeric view. Booleans read as 0/1, future labels as their
    /// category bucket. Text and lists have no numeric view.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(v) => Some(*v as f64),
            Value::Float(v) => Some(*v),
            Value::Bool(v) => Some(if *v { 1.0 } else { 0.0 }),
            Value::Future(f) => Some(f.category as f64),
            Value::Text(_) | Value::List(_) => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            Value::Float(v) => Some(*v as i64),
            Value::Bool(v) => Some(i64::from(*v)),
            Value::Future(f) => Some(f.category as i64),
            Value::Text(_) | Value::List(_) => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            Value::Int(v) => Some(*v != 0),
            Value::Float(v) => Some(*v != 0.0),
            Value::Future(f) => Some(f.occurs),
            Value::Text(_) | Value::List(_) => None,
        }
    }
}

/// Comparison relation used by criteria filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relation {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl Relation {
    pub fn parse(text: &str) -> Option<Relation> {
        match text {
            "=" | "==" => Some(Relation::Eq),
            "!=" | "<>" => Some(Relation::Ne),
            "<" => Some(Relation::Lt),
            "<=" => Some(Relation::Le),
            ">" => Some(Relation::Gt),
            ">=" => Some(Relation::Ge),
            _ => None,
        }
    }

    /// Evaluate `left <relation> right`. Operands without a common view
    /// (e.g. text vs. number) never match.
    pub fn evaluate(self, left: &Value, right: &Value) -> bool {
        if let (Some(a), Some(b)) = (left.as_f64(), right.as_f64()) {
            return match self {
                Relation::Eq => a == b,
                Relation::Ne => a != b,
                Relation::Lt => a < b,
                Relation::Le => a <= b,
                Relation::Gt => a > b,
                Relation::Ge => a >= b,
            };
        }
        if let (Value::Text(a), Value::Text(b)) = (left, right) {
            return match self {
                Relation::Eq => a == b,
                Relation::Ne => a != b,
                _ => false,
            };
        }
        false
    }
}

/// Parse a numeric field, stripping disallowed characters and retrying
/// once on failure. Returns `None` when even the stripped text does not
/// parse.
pub fn parse_number(raw: &str) -> Option<f64> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(v) = trimmed.parse::<f64>() {
        return Some(v);
    }
    let stripped: String = trimmed
        .chars()
        .filter(|c| c.is_ascii_digit() || matches!(c, '+' | '-' | '.' | 'e' | 'E'))
        .collect();
    if stripped.is_empty() {
        return None;
    }
    stripped.parse::<f64>().ok()
}

pub fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim() {
        "T" | "t" | "true" | "True" | "1" => Some(true),
        "F" | "f" | "false" | "False" | "0" => Some(false),
        _ => None,
    }
}
