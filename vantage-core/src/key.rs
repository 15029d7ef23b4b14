//! Canonical cache keys.
//!
//! A [`CacheKey`] is the tuple `(resource, operation, params)`. Parameters are
//! canonicalized on construction: object fields are emitted in sorted order,
//! so two keys built from objects with different field insertion order are
//! equal and hash identically.

use serde_json::Value;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Canonical, immutable cache key.
///
/// Cloning is cheap: the key body is shared behind an `Arc`.
#[derive(Clone)]
pub struct CacheKey {
    inner: Arc<KeyInner>,
}

struct KeyInner {
    resource: String,
    operation: String,
    params: Value,
    canonical: String,
}

impl CacheKey {
    /// Build a key, canonicalizing `params`.
    pub fn new(resource: impl Into<String>, operation: impl Into<String>, params: Value) -> Self {
        let params = canonicalize(params);
        let mut canonical = String::new();
        write_canonical(&params, &mut canonical);
        Self {
            inner: Arc::new(KeyInner {
                resource: resource.into(),
                operation: operation.into(),
                params,
                canonical,
            }),
        }
    }

    /// Key without input parameters.
    pub fn bare(resource: impl Into<String>, operation: impl Into<String>) -> Self {
        Self::new(resource, operation, Value::Null)
    }

    /// Logical resource name (e.g. `appointment`).
    pub fn resource(&self) -> &str {
        &self.inner.resource
    }

    /// Operation name within the resource (e.g. `list`, `byId`).
    pub fn operation(&self) -> &str {
        &self.inner.operation
    }

    /// Canonicalized input parameters.
    pub fn params(&self) -> &Value {
        &self.inner.params
    }

    /// Look up a single top-level parameter.
    pub fn param(&self, name: &str) -> Option<&Value> {
        self.inner.params.get(name)
    }

    /// Deterministic serialization of the parameters.
    pub fn canonical_params(&self) -> &str {
        &self.inner.canonical
    }

    /// Remote procedure name for this key: `resource.operation`.
    pub fn procedure(&self) -> String {
        format!("{}.{}", self.inner.resource, self.inner.operation)
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
            || (self.inner.resource == other.inner.resource
                && self.inner.operation == other.inner.operation
                && self.inner.canonical == other.inner.canonical)
    }
}

impl Eq for CacheKey {}

impl Hash for CacheKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.resource.hash(state);
        self.inner.operation.hash(state);
        self.inner.canonical.hash(state);
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheKey")
            .field("resource", &self.inner.resource)
            .field("operation", &self.inner.operation)
            .field("params", &self.inner.canonical)
            .finish()
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}({})",
            self.inner.resource, self.inner.operation, self.inner.canonical
        )
    }
}

/// Rebuild `value` with every object's fields in sorted order.
fn canonicalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut fields: Vec<(String, Value)> = map.into_iter().collect();
            fields.sort_by(|a, b| a.0.cmp(&b.0));
            Value::Object(
                fields
                    .into_iter()
                    .map(|(k, v)| (k, canonicalize(v)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        other => other,
    }
}

/// Serialize with sorted object keys regardless of the map implementation
/// serde_json was compiled with.
fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut fields: Vec<(&String, &Value)> = map.iter().collect();
            fields.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (k, v)) in fields.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(k.clone()).to_string());
                out.push(':');
                write_canonical(v, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}
