//! Row predicates and sort specifications
//!
//! `FilterExpr` is the predicate language shared by list-shaped query
//! descriptors (what a cached list is allowed to contain) and live
//! subscriptions (which change events a caller cares about).

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;

use crate::row::Row;

/// Filter operator for field comparisons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterOperator {
    /// Equal to
    Eq,
    /// Not equal to
    Ne,
    /// Greater than
    Gt,
    /// Less than
    Lt,
    /// Greater than or equal
    Gte,
    /// Less than or equal
    Lte,
    /// Contains substring (strings) or element (arrays)
    Contains,
    /// In list of values
    In,
    /// Matches regular expression
    Regex,
    /// Logical AND over nested expressions in `value`
    And,
    /// Logical OR over nested expressions in `value`
    Or,
    /// Logical NOT of the nested expression in `value`
    Not,
}

/// Filter expression evaluated against a single row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterExpr {
    /// Field to filter on (ignored by logical operators)
    #[serde(default)]
    pub field: String,
    /// Operator to apply
    pub operator: FilterOperator,
    /// Value to compare against; nested expressions for logical operators
    pub value: Value,
}

impl FilterExpr {
    /// Create a new filter expression.
    pub fn new(field: impl Into<String>, operator: FilterOperator, value: Value) -> Self {
        Self {
            field: field.into(),
            operator,
            value,
        }
    }

    /// Create an equality filter.
    pub fn eq(field: impl Into<String>, value: Value) -> Self {
        Self::new(field, FilterOperator::Eq, value)
    }

    /// Create a contains filter.
    pub fn contains(field: impl Into<String>, value: Value) -> Self {
        Self::new(field, FilterOperator::Contains, value)
    }

    /// Conjunction of several expressions.
    pub fn and(exprs: Vec<FilterExpr>) -> Self {
        Self::logical(FilterOperator::And, exprs)
    }

    /// Disjunction of several expressions.
    pub fn or(exprs: Vec<FilterExpr>) -> Self {
        Self::logical(FilterOperator::Or, exprs)
    }

    /// Negation.
    pub fn not(expr: FilterExpr) -> Self {
        Self {
            field: String::new(),
            operator: FilterOperator::Not,
            value: serde_json::to_value(expr).unwrap_or(Value::Null),
        }
    }

    fn logical(operator: FilterOperator, exprs: Vec<FilterExpr>) -> Self {
        Self {
            field: String::new(),
            operator,
            value: serde_json::to_value(exprs).unwrap_or(Value::Null),
        }
    }

    /// Deterministic textual form, used to group subscriptions.
    pub fn canonical(&self) -> String {
        crate::key::CacheKey::new("", "", serde_json::to_value(self).unwrap_or(Value::Null))
            .canonical_params()
            .to_string()
    }

    /// Evaluate the expression against `row`.
    ///
    /// Missing fields compare as `null`. Malformed nested expressions and
    /// invalid regular expressions never match.
    pub fn matches(&self, row: &Row) -> bool {
        match self.operator {
            FilterOperator::And => self
                .nested()
                .map(|exprs| exprs.iter().all(|e| e.matches(row)))
                .unwrap_or(false),
            FilterOperator::Or => self
                .nested()
                .map(|exprs| exprs.iter().any(|e| e.matches(row)))
                .unwrap_or(false),
            FilterOperator::Not => serde_json::from_value::<FilterExpr>(self.value.clone())
                .map(|e| !e.matches(row))
                .unwrap_or(false),
            _ => {
                let actual = row.get(&self.field).unwrap_or(&Value::Null);
                self.compare_field(actual)
            }
        }
    }

    fn nested(&self) -> Option<Vec<FilterExpr>> {
        serde_json::from_value(self.value.clone()).ok()
    }

    fn compare_field(&self, actual: &Value) -> bool {
        match self.operator {
            FilterOperator::Eq => actual == &self.value,
            FilterOperator::Ne => actual != &self.value,
            FilterOperator::Gt => ordered(actual, &self.value) == Some(Ordering::Greater),
            FilterOperator::Lt => ordered(actual, &self.value) == Some(Ordering::Less),
            FilterOperator::Gte => matches!(
                ordered(actual, &self.value),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            FilterOperator::Lte => matches!(
                ordered(actual, &self.value),
                Some(Ordering::Less | Ordering::Equal)
            ),
            FilterOperator::Contains => match (actual, &self.value) {
                (Value::String(haystack), Value::String(needle)) => haystack.contains(needle.as_str()),
                (Value::Array(items), needle) => items.contains(needle),
                _ => false,
            },
            FilterOperator::In => match &self.value {
                Value::Array(options) => options.contains(actual),
                _ => false,
            },
            FilterOperator::Regex => match (actual, &self.value) {
                (Value::String(text), Value::String(pattern)) => Regex::new(pattern)
                    .map(|re| re.is_match(text))
                    .unwrap_or(false),
                _ => false,
            },
            FilterOperator::And | FilterOperator::Or | FilterOperator::Not => false,
        }
    }
}

/// Ordering between comparable scalars of the same kind.
fn ordered(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// Total order over JSON values used for sorting cached lists.
///
/// `null` (and missing fields) sort first, then booleans, numbers, strings;
/// arrays and objects compare equal to each other.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Array(_) | Value::Object(_) => 4,
        }
    }
    match rank(a).cmp(&rank(b)) {
        Ordering::Equal => ordered(a, b).unwrap_or(Ordering::Equal),
        other => other,
    }
}

/// Sort order declared by a list-shaped query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortSpec {
    pub field: String,
    #[serde(default)]
    pub descending: bool,
}

impl SortSpec {
    pub fn ascending(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            descending: false,
        }
    }

    pub fn descending(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            descending: true,
        }
    }

    /// Compare two rows by the sort field.
    pub fn compare(&self, a: &Row, b: &Row) -> Ordering {
        let ord = compare_values(
            a.get(&self.field).unwrap_or(&Value::Null),
            b.get(&self.field).unwrap_or(&Value::Null),
        );
        if self.descending {
            ord.reverse()
        } else {
            ord
        }
    }
}
