//! Store error types.

use thiserror::Error;

/// Errors from store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The resource does not exist in the pool.
    #[error("resource {id:?} not found in pool {pool_id:?}")]
    NotFound { pool_id: String, id: String },

    /// The backing store could not be reached or misbehaved.
    #[error("store backend: {0}")]
    Backend(String),

    /// A stored payload could not be encoded or decoded.
    #[error("store payload: {0}")]
    Payload(#[from] serde_json::Error),
}

impl StoreError {
    pub fn not_found(pool_id: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            pool_id: pool_id.into(),
            id: id.into(),
        }
    }

    /// Whether this error is the not-found case.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        Self::Backend(err.to_string())
    }
}
