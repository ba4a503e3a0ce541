//! Remote data service seam.
//!
//! Everything the engine needs from the server: create, update, delete and a
//! paginated list. Production code uses [`http::HttpRemote`]; tests script an
//! in-memory implementation.

pub mod http;

use async_trait::async_trait;
use serde_json::Value;
use shared_types::{EntityId, ListPage, ListQuery};

use crate::error::RemoteError;

pub use http::HttpRemote;

#[async_trait]
pub trait RemoteDataService: Send + Sync + 'static {
    /// Create a record. Returns the stored record, which may carry a
    /// server-assigned id.
    async fn create(&self, resource: &str, fields: &Value, token: &str) -> Result<Value, RemoteError>;

    /// Patch fields of one record. Returns the stored record when the server
    /// sends one back, `Value::Null` otherwise.
    async fn update(
        &self,
        resource: &str,
        id: &EntityId,
        patch: &Value,
        token: &str,
    ) -> Result<Value, RemoteError>;

    async fn delete(&self, resource: &str, id: &EntityId, token: &str) -> Result<(), RemoteError>;

    async fn list(&self, resource: &str, query: &ListQuery, token: &str) -> Result<ListPage, RemoteError>;
}

/// Source of the bearer credential. `None` means the session is gone.
pub trait AuthTokenProvider: Send + Sync + 'static {
    fn token(&self) -> Option<String>;
}

/// Fixed credential, typically from `OVERLAY_API_TOKEN`
#[derive(Debug, Clone, Default)]
pub struct StaticToken(Option<String>);

impl StaticToken {
    pub fn new(token: Option<String>) -> Self {
        Self(token.filter(|t| !t.trim().is_empty()))
    }
}

impl AuthTokenProvider for StaticToken {
    fn token(&self) -> Option<String> {
        self.0.clone()
    }
}
