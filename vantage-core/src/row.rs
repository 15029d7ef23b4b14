//! Rows and row identifiers.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// A server row, as delivered by queries and change events.
pub type Row = Value;

/// Normalized row identifier.
///
/// Server rows carry ids as strings (UUIDs) or integers; both normalize to
/// their string form so `7` and `"7"` identify the same row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RowId(String);

impl RowId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Normalize a JSON id. Returns `None` for non-scalar ids.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) => Some(Self(s.clone())),
            Value::Number(n) => Some(Self(n.to_string())),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether a JSON value identifies this row.
    pub fn matches(&self, value: &Value) -> bool {
        Self::from_value(value).as_ref() == Some(self)
    }
}

impl fmt::Display for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RowId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<u64> for RowId {
    fn from(value: u64) -> Self {
        Self(value.to_string())
    }
}

/// Extract the id of `row` from `id_field`.
pub fn row_id(row: &Row, id_field: &str) -> Option<RowId> {
    row.get(id_field).and_then(RowId::from_value)
}
