//! Remote procedure boundary.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

use crate::error::RemoteError;

/// Request/response RPC boundary used for queries and mutations.
///
/// `procedure` is `resource.operation` for queries and the registered
/// procedure name for mutations. Implementations own transport concerns
/// (authentication, serialization, retries).
#[async_trait]
pub trait RemoteCall: Send + Sync {
    async fn call(&self, procedure: &str, input: Value) -> Result<Value, RemoteError>;
}

#[async_trait]
impl<T: RemoteCall + ?Sized> RemoteCall for Arc<T> {
    async fn call(&self, procedure: &str, input: Value) -> Result<Value, RemoteError> {
        (**self).call(procedure, input).await
    }
}
