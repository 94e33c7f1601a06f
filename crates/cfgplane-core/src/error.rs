//! Error taxonomy for the cfgplane consistency primitives.

use cfgplane_store::StorageError;

use crate::kit::Kit;

/// Errors produced by the primitives and the operations composed from them.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Bad input, quota exceeded, or an unusable configuration.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("record not found: {0}")]
    RecordNotFound(String),

    /// Storage failure or a broken storage invariant, tagged with the request id.
    #[error("db operation failed, rid: {rid}, err: {message}")]
    DbOpFailed { rid: String, message: String },

    /// A business rule rejected the operation.
    #[error("aborted: {0}")]
    Aborted(String),

    /// The whole outer transaction must be re-run. Absorbed by `run_in_txn`.
    #[error("transaction must be retried")]
    RetryTransaction,

    #[error("deadline exceeded, rid: {rid}")]
    DeadlineExceeded { rid: String },
}

/// Result type for cfgplane core operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Storage failure attributed to the request carried by `kit`.
    pub fn db(kit: &Kit, err: impl std::fmt::Display) -> Self {
        Error::DbOpFailed {
            rid: kit.rid.clone(),
            message: err.to_string(),
        }
    }

    pub fn is_retry(&self) -> bool {
        matches!(self, Error::RetryTransaction)
    }
}

/// Attach the request id to storage errors at the core boundary.
pub trait StorageResultExt<T> {
    fn for_kit(self, kit: &Kit) -> Result<T>;
}

impl<T> StorageResultExt<T> for std::result::Result<T, StorageError> {
    fn for_kit(self, kit: &Kit) -> Result<T> {
        self.map_err(|e| Error::db(kit, e))
    }
}
