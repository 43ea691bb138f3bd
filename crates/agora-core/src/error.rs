//! Error types for Agora core.

use thiserror::Error;

/// Errors from key handling and encoding.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid signature")]
    InvalidSignature,

    #[error("invalid public key")]
    InvalidPublicKey,

    #[error("invalid hex: {0}")]
    InvalidHex(#[from] hex::FromHexError),

    #[error("encoding error: {0}")]
    EncodingError(String),

    #[error("decoding error: {0}")]
    DecodingError(String),
}

/// Reasons a payload, entry or block fails structural or signature checks.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("signature verification failed")]
    SignatureFailed,

    #[error("owner key does not match the payload owner")]
    OwnerMismatch,

    #[error("payload of {size} bytes exceeds limit of {limit}")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error("payload is empty")]
    EmptyPayload,

    #[error("payload ttl must be positive")]
    InvalidTtl,

    #[error("payload ttl of {ttl_ms} ms exceeds limit of {limit_ms}")]
    TtlTooLong { ttl_ms: u64, limit_ms: u64 },

    #[error("content hash mismatch: claimed {claimed}, computed {computed}")]
    HashMismatch { claimed: String, computed: String },

    #[error("block {height} hash does not match its content")]
    BlockHashMismatch { height: u64 },
}

impl From<CoreError> for ValidationError {
    fn from(_: CoreError) -> Self {
        // Only key parsing and signature checks reach this conversion.
        ValidationError::SignatureFailed
    }
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
