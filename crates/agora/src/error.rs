//! Error types for the node.

use thiserror::Error;

use agora_core::CoreError;
use agora_ledger::LedgerError;
use agora_mailbox::MailboxError;
use agora_store::StoreError;
use agora_sync::SyncError;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("core error: {0}")]
    Core(#[from] CoreError),

    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    #[error("sync error: {0}")]
    Sync(#[from] SyncError),

    #[error("mailbox error: {0}")]
    Mailbox(#[from] MailboxError),

    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("node already started")]
    AlreadyStarted,
}

pub type Result<T> = std::result::Result<T, NodeError>;
