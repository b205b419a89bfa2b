//! Error types for the cache
//!
//! Provides unified error handling using thiserror.

use thiserror::Error;

// == Cache Error Enum ==
/// Unified error type for the cache engine and its durable stores.
#[derive(Error, Debug)]
pub enum CacheError {
    /// Null/empty key, non-positive duration or otherwise invalid input
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The cache has been disposed
    #[error("Cache has been disposed")]
    Disposed,

    /// The durable store rejected an operation
    #[error("Store failure: {0}")]
    Store(String),

    /// A key or value could not be converted to or from its stored form
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Error raised by the SQLite backend
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// The background worker could not be started
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CacheError {
    /// Returns true when the error originated in the durable store.
    pub fn is_store_failure(&self) -> bool {
        matches!(self, CacheError::Store(_) | CacheError::Sqlite(_))
    }
}

// == Result Type Alias ==
/// Convenience Result type for the cache.
pub type Result<T> = std::result::Result<T, CacheError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        assert_eq!(
            CacheError::InvalidArgument("key".to_string()).to_string(),
            "Invalid argument: key"
        );
        assert_eq!(CacheError::Disposed.to_string(), "Cache has been disposed");
    }

    #[test]
    fn test_store_failure_classification() {
        assert!(CacheError::Store("disk full".to_string()).is_store_failure());
        assert!(!CacheError::Disposed.is_store_failure());
    }
}
