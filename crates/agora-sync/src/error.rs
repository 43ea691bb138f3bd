//! Error types for the sync module.

use thiserror::Error;

use agora_core::NodeId;

use crate::chain::ChainError;

#[derive(Debug, Error)]
pub enum SyncError {
    /// Protocol version mismatch with peer.
    #[error("protocol version mismatch: local={local}, peer={peer}")]
    VersionMismatch { local: u8, peer: u8 },

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("transport error: {0}")]
    TransportError(String),

    #[error("peer not connected: {0}")]
    PeerNotConnected(NodeId),

    #[error("no connected peer to request blocks from")]
    NoPeerAvailable,

    /// The peer does not serve accounting blocks.
    #[error("peer does not serve accounting blocks: {0}")]
    NotBlockProvider(NodeId),

    #[error("timeout: {0}")]
    Timeout(String),

    /// A block did not link onto the local chain.
    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error("validation error: {0}")]
    ValidationError(#[from] agora_core::ValidationError),

    #[error("store error: {0}")]
    StoreError(#[from] agora_store::StoreError),

    #[error("core error: {0}")]
    CoreError(#[from] agora_core::CoreError),

    /// No oracle key configured; the accounting feed is off.
    #[error("oracle not configured")]
    OracleDisabled,

    /// The key is not on the permitted oracle list.
    #[error("oracle key not permitted: {0}")]
    OracleNotPermitted(String),

    #[error("oracle signature invalid")]
    OracleSignatureInvalid,

    /// The handler was stopped before it completed.
    #[error("sync cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, SyncError>;
