//! Persistence: the abstract interface for durable node state.
//!
//! The replicated store itself is in-memory. What survives a restart is
//! written through this trait: accounting blocks, persistable entries,
//! content-addressed payloads and the remembered sequence numbers.

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};

use agora_core::{AccountingBlock, AppendOnlyPayload, PayloadCapability, PayloadHash, StorageEntry};

use crate::error::{Result, StoreError};
use crate::sequence::SequenceRecord;

/// Async interface for durable state. SQLite is the primary backend; the
/// in-memory backend has the same semantics and exists for tests.
#[async_trait]
pub trait Persistence: Send + Sync {
    // ─────────────────────────────────────────────────────────────────────────
    // Accounting blocks
    // ─────────────────────────────────────────────────────────────────────────

    /// Insert or overwrite blocks by height.
    async fn save_blocks(&self, blocks: &[AccountingBlock]) -> Result<()>;

    /// All stored blocks, ascending by height.
    async fn load_blocks(&self) -> Result<Vec<AccountingBlock>>;

    /// Delete every block at or above `height`. Returns how many were deleted.
    async fn delete_blocks_from(&self, height: u64) -> Result<usize>;

    // ─────────────────────────────────────────────────────────────────────────
    // Signed entries
    // ─────────────────────────────────────────────────────────────────────────

    async fn save_entry(&self, entry: &StorageEntry) -> Result<()>;

    async fn delete_entry(&self, key: &PayloadHash) -> Result<()>;

    async fn load_entries(&self) -> Result<Vec<StorageEntry>>;

    // ─────────────────────────────────────────────────────────────────────────
    // Content-addressed payloads
    // ─────────────────────────────────────────────────────────────────────────

    async fn save_append_only(&self, hash: &PayloadHash, payload: &AppendOnlyPayload) -> Result<()>;

    async fn load_append_only(&self) -> Result<Vec<(PayloadHash, AppendOnlyPayload)>>;

    // ─────────────────────────────────────────────────────────────────────────
    // Sequence numbers
    // ─────────────────────────────────────────────────────────────────────────

    /// Replace the stored map with `records`.
    async fn save_sequence_numbers(&self, records: &[(PayloadHash, SequenceRecord)]) -> Result<()>;

    async fn load_sequence_numbers(&self) -> Result<Vec<(PayloadHash, SequenceRecord)>>;
}

/// Only entries whose payload is marked persistable are written to disk.
pub fn should_persist(entry: &StorageEntry) -> bool {
    entry.payload.has_capability(PayloadCapability::Persistable)
}

pub(crate) fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|e| StoreError::Serialization(e.to_string()))?;
    Ok(buf)
}

pub(crate) fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    ciborium::from_reader(bytes).map_err(|e| StoreError::Serialization(e.to_string()))
}
