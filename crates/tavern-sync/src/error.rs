//! Error types for the replication layer

use crate::storage::StorageError;
use tavern_core::CoreError;
use thiserror::Error;

/// Sync engine error types
#[derive(Debug, Error)]
pub enum SyncError {
    /// Operation attempted before `initialize` completed
    #[error("sync engine not initialized")]
    NotInitialized,

    /// An imported event's transmitted id disagrees with its recomputed id;
    /// the enclosing import batch is aborted atomically
    #[error("content hash mismatch: computed {computed} != transmitted {transmitted}")]
    ContentHashMismatch {
        computed: String,
        transmitted: String,
    },

    /// Underlying store error
    #[error("storage failure: {0}")]
    Storage(#[from] StorageError),

    /// Codec or payload error
    #[error("codec error: {0}")]
    Codec(CoreError),

    /// Caller requested cancellation; nothing was committed
    #[error("operation cancelled")]
    Cancelled,
}

impl From<CoreError> for SyncError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::ContentHashMismatch {
                computed,
                transmitted,
            } => Self::ContentHashMismatch {
                computed,
                transmitted,
            },
            other => Self::Codec(other),
        }
    }
}
