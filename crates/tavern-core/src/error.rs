//! Error types for the Tavern core

use thiserror::Error;

/// Result type alias using [`CoreError`]
pub type Result<T> = std::result::Result<T, CoreError>;

/// Tavern core error types
#[derive(Debug, Error)]
pub enum CoreError {
    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Content hash mismatch (computed != transmitted event id)
    #[error("content hash mismatch: computed {computed} != transmitted {transmitted}")]
    ContentHashMismatch {
        computed: String,
        transmitted: String,
    },

    /// Unknown event kind number on the wire
    #[error("unknown event kind: {0}")]
    UnknownKind(u8),

    /// Invalid or undecodable key material
    #[error("invalid key material: {0}")]
    InvalidKey(String),

    /// Dice formula could not be parsed
    #[error("invalid dice formula: {0}")]
    FormulaInvalid(String),

    /// Dice formula parsed but is outside permitted bounds
    #[error("dice formula out of range: {0}")]
    FormulaOutOfRange(String),

    /// Secure storage failure (propagated from the embedding store)
    #[error("storage failure: {0}")]
    Storage(String),
}
