//! Error types for the mailbox.

use thiserror::Error;

use agora_core::PayloadHash;
use agora_store::RejectReason;

#[derive(Debug, Error)]
pub enum MailboxError {
    #[error("encryption error: {0}")]
    EncryptionError(String),

    /// Wrong key or tampered ciphertext.
    #[error("decryption error: {0}")]
    DecryptionError(String),

    #[error("serialization error: {0}")]
    SerializationError(String),

    /// No live mailbox entry under this key.
    #[error("mailbox entry not found: {0}")]
    NotFound(PayloadHash),

    /// The entry is addressed to someone else.
    #[error("mailbox entry {0} is not addressed to this node")]
    NotAddressedToUs(PayloadHash),

    /// The local store refused the mutation.
    #[error("store rejected mailbox operation: {0:?}")]
    Rejected(RejectReason),
}

pub type Result<T> = std::result::Result<T, MailboxError>;
