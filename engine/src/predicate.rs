//! Query predicates over record payloads.
//!
//! Predicates are used for conditional writes, local queries, mutation
//! conditions sent to the remote API, and per-model sync expressions.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;

/// Comparison operator for a field predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Operator {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    /// Substring for strings, membership for arrays
    Contains,
    BeginsWith,
}

/// A boolean condition over a record's fields.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum QueryPredicate {
    /// Matches every record
    #[default]
    All,
    Field {
        field: String,
        op: Operator,
        value: Value,
    },
    And {
        predicates: Vec<QueryPredicate>,
    },
    Or {
        predicates: Vec<QueryPredicate>,
    },
    Not {
        predicate: Box<QueryPredicate>,
    },
}

impl QueryPredicate {
    pub fn field(field: impl Into<String>, op: Operator, value: impl Into<Value>) -> Self {
        Self::Field {
            field: field.into(),
            op,
            value: value.into(),
        }
    }

    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::field(field, Operator::Eq, value)
    }

    pub fn gt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::field(field, Operator::Gt, value)
    }

    pub fn lt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::field(field, Operator::Lt, value)
    }

    /// Combine with another predicate, flattening nested conjunctions.
    pub fn and(self, other: QueryPredicate) -> Self {
        match (self, other) {
            (Self::All, p) | (p, Self::All) => p,
            (Self::And { mut predicates }, Self::And { predicates: rest }) => {
                predicates.extend(rest);
                Self::And { predicates }
            }
            (Self::And { mut predicates }, p) => {
                predicates.push(p);
                Self::And { predicates }
            }
            (p, q) => Self::And {
                predicates: vec![p, q],
            },
        }
    }

    pub fn or(self, other: QueryPredicate) -> Self {
        match self {
            Self::Or { mut predicates } => {
                predicates.push(other);
                Self::Or { predicates }
            }
            p => Self::Or {
                predicates: vec![p, other],
            },
        }
    }

    pub fn negate(self) -> Self {
        Self::Not {
            predicate: Box::new(self),
        }
    }

    pub fn is_all(&self) -> bool {
        matches!(self, Self::All)
    }

    /// Evaluate against a JSON payload. Missing fields read as null.
    pub fn matches(&self, payload: &Value) -> bool {
        match self {
            Self::All => true,
            Self::Field { field, op, value } => {
                let actual = payload.get(field).unwrap_or(&Value::Null);
                compare(actual, *op, value)
            }
            Self::And { predicates } => predicates.iter().all(|p| p.matches(payload)),
            Self::Or { predicates } => predicates.iter().any(|p| p.matches(payload)),
            Self::Not { predicate } => !predicate.matches(payload),
        }
    }
}

fn compare(actual: &Value, op: Operator, expected: &Value) -> bool {
    match op {
        Operator::Eq => values_equal(actual, expected),
        Operator::Ne => !values_equal(actual, expected),
        Operator::Lt => order(actual, expected) == Some(Ordering::Less),
        Operator::Le => matches!(
            order(actual, expected),
            Some(Ordering::Less | Ordering::Equal)
        ),
        Operator::Gt => order(actual, expected) == Some(Ordering::Greater),
        Operator::Ge => matches!(
            order(actual, expected),
            Some(Ordering::Greater | Ordering::Equal)
        ),
        Operator::Contains => match (actual, expected) {
            (Value::String(s), Value::String(needle)) => s.contains(needle.as_str()),
            (Value::Array(items), v) => items.iter().any(|item| values_equal(item, v)),
            _ => false,
        },
        Operator::BeginsWith => match (actual, expected) {
            (Value::String(s), Value::String(prefix)) => s.starts_with(prefix.as_str()),
            _ => false,
        },
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

/// Ordering between two JSON scalars of the same kind.
pub(crate) fn order(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}
