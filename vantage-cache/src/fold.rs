//! Folding change events into cached list values.
//!
//! A fold takes the cached value of a list-shaped query and one change event
//! and produces the value a refetch would return, as long as the list's
//! filter and sort are known. Anything the fold cannot decide locally is
//! reported as [`FoldOutcome::NeedsRefetch`].
//!
//! The rows a list holds depend on its key as well as its shape: parameters
//! bound through [`ListShape::param_fields`] narrow the declared filter, and
//! a key with parameters the shape does not bind is never folded.

use serde_json::Value;
use std::cmp::Ordering;
use vantage_core::{row_id, CacheKey, ChangeEvent, ChangeKind, FilterExpr, Row, StoreError};

use crate::registry::ListShape;

/// Result of folding one event into a cached list.
#[derive(Debug, Clone, PartialEq)]
pub enum FoldOutcome {
    /// The event does not affect this list.
    Unchanged,
    /// The new list value.
    Changed(Value),
    /// The event lacks the data needed to fold; refetch instead.
    NeedsRefetch,
}

/// Fold `event` into the cached list `current`.
pub fn fold_list(
    key: &CacheKey,
    shape: &ListShape,
    current: &Value,
    event: &ChangeEvent,
) -> Result<FoldOutcome, StoreError> {
    let rows = current.as_array().ok_or_else(|| StoreError::ShapeMismatch {
        key: key.to_string(),
        found: json_kind(current),
    })?;

    let position = rows
        .iter()
        .position(|row| row_id(row, &shape.id_field).as_ref() == Some(&event.row_id));

    let next = match event.change_kind {
        ChangeKind::Deleted => match position {
            Some(index) => {
                let mut next = rows.clone();
                next.remove(index);
                next
            }
            None => return Ok(FoldOutcome::Unchanged),
        },
        ChangeKind::Inserted | ChangeKind::Updated => {
            let Some(after) = event.after.as_ref() else {
                return Ok(FoldOutcome::NeedsRefetch);
            };
            let Some(bound) = bound_filters(key, shape) else {
                return Ok(FoldOutcome::NeedsRefetch);
            };
            let admitted = shape.filter.as_ref().map_or(true, |f| f.matches(after))
                && bound.iter().all(|f| f.matches(after));
            upsert(rows, position, after, admitted, shape)
        }
    };

    if &next == rows {
        Ok(FoldOutcome::Unchanged)
    } else {
        Ok(FoldOutcome::Changed(Value::Array(next)))
    }
}

/// Equality filters implied by the key's parameters, or `None` when a
/// parameter has no binding on `shape`.
fn bound_filters(key: &CacheKey, shape: &ListShape) -> Option<Vec<FilterExpr>> {
    match key.params() {
        Value::Null => Some(Vec::new()),
        Value::Object(params) => params
            .iter()
            .map(|(param, value)| {
                shape
                    .param_fields
                    .get(param)
                    .map(|field| FilterExpr::eq(field.as_str(), value.clone()))
            })
            .collect(),
        _ => None,
    }
}

fn upsert(
    rows: &[Row],
    position: Option<usize>,
    after: &Row,
    admitted: bool,
    shape: &ListShape,
) -> Vec<Row> {
    let mut next = rows.to_vec();

    if !admitted {
        if let Some(index) = position {
            next.remove(index);
        }
        return next;
    }

    match (&shape.sort, position) {
        // Unsorted lists keep the row where it was.
        (None, Some(index)) => next[index] = after.clone(),
        (None, None) => next.push(after.clone()),
        (Some(sort), _) => {
            if let Some(index) = position {
                next.remove(index);
            }
            let at = next.partition_point(|row| sort.compare(row, after) != Ordering::Greater);
            next.insert(at, after.clone());
        }
    }
    next
}

pub(crate) fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
