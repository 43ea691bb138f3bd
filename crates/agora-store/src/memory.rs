//! In-memory implementation of [`Persistence`].
//!
//! Same semantics as the SQLite backend, nothing survives the process.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use parking_lot::RwLock;

use agora_core::{AccountingBlock, AppendOnlyPayload, PayloadHash, StorageEntry};

use crate::error::Result;
use crate::persistence::Persistence;
use crate::sequence::SequenceRecord;

#[derive(Default)]
pub struct MemoryPersistence {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    blocks: BTreeMap<u64, AccountingBlock>,
    entries: HashMap<PayloadHash, StorageEntry>,
    append_only: HashMap<PayloadHash, AppendOnlyPayload>,
    sequence_numbers: Vec<(PayloadHash, SequenceRecord)>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Persistence for MemoryPersistence {
    async fn save_blocks(&self, blocks: &[AccountingBlock]) -> Result<()> {
        let mut inner = self.inner.write();
        for block in blocks {
            inner.blocks.insert(block.height, block.clone());
        }
        Ok(())
    }

    async fn load_blocks(&self) -> Result<Vec<AccountingBlock>> {
        Ok(self.inner.read().blocks.values().cloned().collect())
    }

    async fn delete_blocks_from(&self, height: u64) -> Result<usize> {
        let mut inner = self.inner.write();
        let removed = inner.blocks.split_off(&height);
        Ok(removed.len())
    }

    async fn save_entry(&self, entry: &StorageEntry) -> Result<()> {
        self.inner.write().entries.insert(entry.key(), entry.clone());
        Ok(())
    }

    async fn delete_entry(&self, key: &PayloadHash) -> Result<()> {
        self.inner.write().entries.remove(key);
        Ok(())
    }

    async fn load_entries(&self) -> Result<Vec<StorageEntry>> {
        Ok(self.inner.read().entries.values().cloned().collect())
    }

    async fn save_append_only(&self, hash: &PayloadHash, payload: &AppendOnlyPayload) -> Result<()> {
        self.inner
            .write()
            .append_only
            .entry(*hash)
            .or_insert_with(|| payload.clone());
        Ok(())
    }

    async fn load_append_only(&self) -> Result<Vec<(PayloadHash, AppendOnlyPayload)>> {
        Ok(self
            .inner
            .read()
            .append_only
            .iter()
            .map(|(k, v)| (*k, v.clone()))
            .collect())
    }

    async fn save_sequence_numbers(&self, records: &[(PayloadHash, SequenceRecord)]) -> Result<()> {
        self.inner.write().sequence_numbers = records.to_vec();
        Ok(())
    }

    async fn load_sequence_numbers(&self) -> Result<Vec<(PayloadHash, SequenceRecord)>> {
        Ok(self.inner.read().sequence_numbers.clone())
    }
}
