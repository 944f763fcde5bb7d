use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::state::ExecutionContext;

/// An edge connecting two nodes in the workflow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    /// Source node id.
    pub from: String,
    /// Target node id.
    pub to: String,
    /// Condition that must be true to traverse this edge.
    #[serde(default)]
    pub condition: EdgeCondition,
}

/// Condition for traversing an edge.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EdgeCondition {
    /// Always traverse this edge.
    #[default]
    Always,
    /// Traverse only if the source node succeeded.
    OnSuccess,
    /// Traverse only if the source node failed.
    OnFailure,
    /// Traverse if an expression over the execution context holds.
    Conditional { expr: String },
    /// From a loop node, while it keeps looping.
    LoopContinue,
    /// From a loop node, once it stops.
    LoopExit,
}

impl Edge {
    /// Create an unconditional edge.
    pub fn always(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self::new(from, to, EdgeCondition::Always)
    }

    /// Create an edge that fires on success.
    pub fn on_success(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self::new(from, to, EdgeCondition::OnSuccess)
    }

    /// Create an edge that fires on failure.
    pub fn on_failure(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self::new(from, to, EdgeCondition::OnFailure)
    }

    /// Create a conditional edge.
    pub fn conditional(
        from: impl Into<String>,
        to: impl Into<String>,
        expr: impl Into<String>,
    ) -> Self {
        Self::new(from, to, EdgeCondition::Conditional { expr: expr.into() })
    }

    pub fn loop_continue(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self::new(from, to, EdgeCondition::LoopContinue)
    }

    pub fn loop_exit(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self::new(from, to, EdgeCondition::LoopExit)
    }

    fn new(from: impl Into<String>, to: impl Into<String>, condition: EdgeCondition) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            condition,
        }
    }
}

/// Evaluate a simple expression against the execution context.
///
/// Supported forms, where `path` is resolved by [`ExecutionContext::lookup`]:
/// - `path contains "substr"` (strings and arrays)
/// - `path == value`, `path != value`
/// - `path > n`, `path >= n`, `path < n`, `path <= n`
/// - `path` alone, true when the value is truthy
///
/// Values may be quoted strings, JSON literals or bare words.
/// Returns `false` for unparseable expressions and missing paths.
pub fn evaluate_condition(expr: &str, context: &ExecutionContext) -> bool {
    let expr = expr.trim();
    if expr.is_empty() {
        return false;
    }

    // Two-character operators before their one-character prefixes
    for op in [" contains ", "!=", "==", ">=", "<=", ">", "<"] {
        if let Some((path, raw)) = expr.split_once(op) {
            let path = path.trim();
            let expected = parse_literal(raw.trim());
            let actual = context.lookup(path);
            return compare(op.trim(), actual.as_ref(), &expected);
        }
    }

    context.lookup(expr).is_some_and(|v| truthy(&v))
}

fn parse_literal(raw: &str) -> Value {
    if raw.len() >= 2 {
        let quoted = (raw.starts_with('"') && raw.ends_with('"'))
            || (raw.starts_with('\'') && raw.ends_with('\''));
        if quoted {
            return Value::String(raw[1..raw.len() - 1].to_string());
        }
    }
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn compare(op: &str, actual: Option<&Value>, expected: &Value) -> bool {
    match op {
        "contains" => match (actual, expected) {
            (Some(Value::String(s)), Value::String(sub)) => s.contains(sub.as_str()),
            (Some(Value::Array(items)), v) => items.contains(v),
            _ => false,
        },
        "==" => actual.is_some_and(|a| loosely_equal(a, expected)),
        "!=" => !actual.is_some_and(|a| loosely_equal(a, expected)),
        _ => {
            let (Some(a), Some(b)) = (actual.and_then(as_number), as_number(expected)) else {
                return false;
            };
            match op {
                ">" => a > b,
                ">=" => a >= b,
                "<" => a < b,
                "<=" => a <= b,
                _ => false,
            }
        }
    }
}

fn as_number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// `==` treats `5` and `"5"` alike.
fn loosely_equal(a: &Value, b: &Value) -> bool {
    if a == b {
        return true;
    }
    match (a, b) {
        (Value::String(s), other) | (other, Value::String(s)) => match other {
            Value::Number(_) | Value::Bool(_) => s == &other.to_string(),
            _ => false,
        },
        _ => false,
    }
}

fn truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty() && s != "false",
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}
