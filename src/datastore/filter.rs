//! Boolean filter expressions evaluated against stream rows.
//!
//! The JSON shape mirrors what the UI layer sends:
//!
//! ```json
//! {"conditionType":"binary","operator":">=",
//!  "left":{"exprType":"column","columnName":"age"},
//!  "right":{"exprType":"value","value":18}}
//! ```
//!
//! Comparisons involving a null or missing operand are false, as in SQL.
//! Use `isNull` / `isEmpty` to test for them.

use std::cmp::Ordering;
use std::collections::HashMap;

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::worker::protocol::Row;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "exprType", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Expression {
    Column { column_name: String },
    Value { value: Value },
}

impl Expression {
    pub fn column(name: impl Into<String>) -> Self {
        Expression::Column {
            column_name: name.into(),
        }
    }

    pub fn value(value: impl Into<Value>) -> Self {
        Expression::Value {
            value: value.into(),
        }
    }

    fn resolve<'a>(&'a self, row: &'a Row) -> Option<&'a Value> {
        match self {
            Expression::Column { column_name } => row.get(column_name),
            Expression::Value { value } => Some(value),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryOperator {
    #[serde(rename = "=")]
    Eq,
    #[serde(rename = "<>", alias = "!=")]
    NotEq,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = "<=")]
    LtEq,
    #[serde(rename = ">=")]
    GtEq,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "conditionType",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum Condition {
    Binary {
        operator: BinaryOperator,
        left: Expression,
        right: Expression,
    },
    /// SQL `LIKE` with `%` and `_`, case-insensitive.
    Like { left: Expression, right: Expression },
    NotLike { left: Expression, right: Expression },
    IsNull { expr: Expression },
    IsNotNull { expr: Expression },
    /// Null, missing or empty string.
    IsEmpty { expr: Expression },
    IsNotEmpty { expr: Expression },
    In { expr: Expression, values: Vec<Value> },
    And { conditions: Vec<Condition> },
    Or { conditions: Vec<Condition> },
    Not { condition: Box<Condition> },
}

impl Condition {
    /// `column <op> value`
    pub fn compare(column: &str, operator: BinaryOperator, value: impl Into<Value>) -> Self {
        Condition::Binary {
            operator,
            left: Expression::column(column),
            right: Expression::value(value),
        }
    }

    /// Canonical serialization, used to decide whether two filters are the same.
    pub fn canonical(filter: Option<&Condition>) -> String {
        match filter {
            Some(condition) => serde_json::to_value(condition)
                .map(|v| v.to_string())
                .unwrap_or_default(),
            None => String::new(),
        }
    }

    /// One-off evaluation. Use a [`Matcher`] when testing many rows.
    pub fn evaluate(&self, row: &Row) -> bool {
        Matcher::new(self).matches(row)
    }

    fn eval(&self, row: &Row, patterns: &mut PatternCache) -> bool {
        match self {
            Condition::Binary {
                operator,
                left,
                right,
            } => match (left.resolve(row), right.resolve(row)) {
                (Some(l), Some(r)) => compare_with(*operator, l, r),
                _ => false,
            },
            Condition::Like { left, right } => {
                patterns.like(left.resolve(row), right.resolve(row))
            }
            Condition::NotLike { left, right } => {
                match (left.resolve(row), right.resolve(row)) {
                    (Some(l), Some(r)) if !l.is_null() && !r.is_null() => {
                        !patterns.like(Some(l), Some(r))
                    }
                    _ => false,
                }
            }
            Condition::IsNull { expr } => expr.resolve(row).map_or(true, Value::is_null),
            Condition::IsNotNull { expr } => !expr.resolve(row).map_or(true, Value::is_null),
            Condition::IsEmpty { expr } => is_empty(expr.resolve(row)),
            Condition::IsNotEmpty { expr } => !is_empty(expr.resolve(row)),
            Condition::In { expr, values } => match expr.resolve(row) {
                Some(v) if !v.is_null() => values
                    .iter()
                    .any(|candidate| compare_values(v, candidate) == Some(Ordering::Equal)),
                _ => false,
            },
            Condition::And { conditions } => conditions.iter().all(|c| c.eval(row, patterns)),
            Condition::Or { conditions } => conditions.iter().any(|c| c.eval(row, patterns)),
            Condition::Not { condition } => !condition.eval(row, patterns),
        }
    }
}

/// A condition with its `LIKE` patterns compiled once, for scanning many rows.
pub struct Matcher<'a> {
    condition: &'a Condition,
    patterns: PatternCache,
}

impl<'a> Matcher<'a> {
    pub fn new(condition: &'a Condition) -> Self {
        Self {
            condition,
            patterns: PatternCache::default(),
        }
    }

    pub fn matches(&mut self, row: &Row) -> bool {
        self.condition.eval(row, &mut self.patterns)
    }

    /// Distinct `LIKE` patterns compiled so far.
    pub fn compiled_patterns(&self) -> usize {
        self.patterns.compiled.len()
    }
}

/// `LIKE` pattern text to its regex; `None` when it failed to compile.
#[derive(Default)]
struct PatternCache {
    compiled: HashMap<String, Option<Regex>>,
}

impl PatternCache {
    fn like(&mut self, value: Option<&Value>, pattern: Option<&Value>) -> bool {
        let (Some(value), Some(pattern)) = (value, pattern) else {
            return false;
        };
        let (Some(text), Some(pattern)) = (as_text(value), as_text(pattern)) else {
            return false;
        };

        self.compiled
            .entry(pattern)
            .or_insert_with_key(|pattern| compile_like(pattern))
            .as_ref()
            .is_some_and(|re| re.is_match(&text))
    }
}

fn is_empty(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.is_empty(),
        Some(_) => false,
    }
}

fn compare_with(operator: BinaryOperator, left: &Value, right: &Value) -> bool {
    let Some(ordering) = compare_values(left, right) else {
        // Incomparable but non-null values can still differ.
        return operator == BinaryOperator::NotEq && !left.is_null() && !right.is_null();
    };
    match operator {
        BinaryOperator::Eq => ordering == Ordering::Equal,
        BinaryOperator::NotEq => ordering != Ordering::Equal,
        BinaryOperator::Lt => ordering == Ordering::Less,
        BinaryOperator::Gt => ordering == Ordering::Greater,
        BinaryOperator::LtEq => ordering != Ordering::Greater,
        BinaryOperator::GtEq => ordering != Ordering::Less,
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Order two JSON values. Numbers compare numerically, also against numeric
/// strings (filter values typed in a UI arrive as strings).
fn compare_values(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Null, _) | (_, Value::Null) => None,
        (Value::String(l), Value::String(r)) => Some(l.cmp(r)),
        (Value::Bool(l), Value::Bool(r)) => Some(l.cmp(r)),
        (Value::Number(_), _) | (_, Value::Number(_)) => {
            as_number(left)?.partial_cmp(&as_number(right)?)
        }
        (l, r) if l == r => Some(Ordering::Equal),
        _ => None,
    }
}

fn compile_like(pattern: &str) -> Option<Regex> {
    let mut regex = String::with_capacity(pattern.len() + 2);
    regex.push('^');
    for ch in pattern.chars() {
        match ch {
            '%' => regex.push_str(".*"),
            '_' => regex.push('.'),
            other => regex.push_str(&regex::escape(&other.to_string())),
        }
    }
    regex.push('$');

    RegexBuilder::new(&regex)
        .case_insensitive(true)
        .dot_matches_new_line(true)
        .build()
        .ok()
}

fn as_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}
