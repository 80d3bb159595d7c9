//! Error types for the secure channel

use crate::framing::FrameError;
use thiserror::Error;

/// Secure channel error types
#[derive(Debug, Error)]
pub enum ChannelError {
    /// IO error from the underlying byte pipe
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Framing error
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// Handshake or wire payload could not be (de)serialized
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Peer id does not match the fingerprint of the presented identity key
    #[error("peer identity mismatch: claimed {claimed}, computed {computed}")]
    PeerIdentityMismatch { claimed: String, computed: String },

    /// Ed25519 verification of the handshake signature failed
    #[error("handshake signature invalid")]
    HandshakeSignatureInvalid,

    /// Session id differs between hello and ack
    #[error("session id mismatch between hello and ack")]
    SessionMismatch,

    /// Key material in a handshake payload is undecodable or the wrong size
    #[error("invalid handshake key material: {0}")]
    InvalidKey(String),

    /// AEAD open failed
    #[error("cryptographic failure")]
    CryptographicFailure,

    /// Sequence number already seen
    #[error("replay detected: sequence {0}")]
    ReplayDetected(u64),

    /// No ack within the configured timeout
    #[error("ack timeout for sequence {0}")]
    AckTimeout(u64),

    /// Caller requested cancellation
    #[error("operation cancelled")]
    Cancelled,

    /// The channel is closed or the peer went away
    #[error("connection closed")]
    ConnectionClosed,

    /// Unexpected frame during the handshake
    #[error("unexpected frame during handshake: {0:?}")]
    UnexpectedFrame(crate::framing::FrameCode),
}
