//! Error types for cfgplane-store

use thiserror::Error;

/// Errors that can occur in the persistence layer.
///
/// `DuplicateKey` is the only variant callers are expected to branch on: the
/// lock and publish primitives turn it into a transaction retry or a
/// "slot already taken" answer. Everything else is an operational failure.
#[derive(Error, Debug)]
pub enum StorageError {
    /// Connection or pool failure
    #[error("database connection failed: {0}")]
    Connection(String),

    /// Statement execution failure
    #[error("database query failed: {0}")]
    Backend(String),

    /// An insert collided with an existing row on a unique key
    #[error("duplicate key on {table}: {key}")]
    DuplicateKey { table: &'static str, key: String },

    /// Waiting for another transaction's row lock took too long
    #[error("lock wait timeout on {table}")]
    LockWaitTimeout { table: &'static str },

    /// The transaction handle can no longer be used
    #[error("transaction already finished")]
    TxnFinished,

    /// A stored value could not be mapped back into its Rust type
    #[error("corrupted row in {table}: {reason}")]
    Corrupted { table: &'static str, reason: String },

    /// Schema setup error
    #[error("schema setup failed: {0}")]
    Schema(String),
}

impl StorageError {
    /// Whether this error reports a unique-key collision.
    pub fn is_duplicate_key(&self) -> bool {
        matches!(self, StorageError::DuplicateKey { .. })
    }
}

impl From<tokio_postgres::Error> for StorageError {
    fn from(err: tokio_postgres::Error) -> Self {
        StorageError::Backend(err.to_string())
    }
}

impl From<deadpool_postgres::PoolError> for StorageError {
    fn from(err: deadpool_postgres::PoolError) -> Self {
        StorageError::Connection(err.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Corrupted {
            table: "json",
            reason: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_key_is_recognised() {
        let err = StorageError::DuplicateKey {
            table: "resource_locks",
            key: "1/strategy/set-1".to_string(),
        };
        assert!(err.is_duplicate_key());
        assert!(err.to_string().contains("resource_locks"));
        assert!(!StorageError::TxnFinished.is_duplicate_key());
    }
}
