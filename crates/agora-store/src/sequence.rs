//! Remembered sequence numbers.
//!
//! The map outlives the entries themselves: after a remove or an expiry the
//! last seen sequence number is still known, so a replayed older add cannot
//! bring the entry back.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use agora_core::PayloadHash;

/// Records older than this are dropped once the map grows past its limit: 10 days.
pub const PURGE_AGE_MS: i64 = 10 * 24 * 60 * 60 * 1000;

/// Last sequence number seen for a key and when it was recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceRecord {
    pub sequence_number: u64,
    pub recorded_at: i64,
}

#[derive(Debug, Default, Clone)]
pub struct SequenceNumberMap {
    records: HashMap<PayloadHash, SequenceRecord>,
}

impl SequenceNumberMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &PayloadHash) -> Option<u64> {
        self.records.get(key).map(|r| r.sequence_number)
    }

    /// True when `seq` is strictly greater than the remembered value, or
    /// nothing is remembered.
    pub fn has_increased(&self, key: &PayloadHash, seq: u64) -> bool {
        match self.records.get(key) {
            Some(record) => seq > record.sequence_number,
            None => true,
        }
    }

    /// The next number a local owner should use for `key`.
    pub fn next_for(&self, key: &PayloadHash) -> u64 {
        self.get(key).map_or(1, |seq| seq.saturating_add(1))
    }

    pub fn record(&mut self, key: PayloadHash, sequence_number: u64, now_ms: i64) {
        self.records.insert(
            key,
            SequenceRecord {
                sequence_number,
                recorded_at: now_ms,
            },
        );
    }

    /// Drop records written before `now_ms - max_age_ms`. Returns how many went.
    pub fn purge_older_than(&mut self, now_ms: i64, max_age_ms: i64) -> usize {
        let cutoff = now_ms - max_age_ms;
        let before = self.records.len();
        self.records.retain(|_, r| r.recorded_at > cutoff);
        before - self.records.len()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn snapshot(&self) -> Vec<(PayloadHash, SequenceRecord)> {
        self.records.iter().map(|(k, v)| (*k, *v)).collect()
    }

    /// Merge persisted records, keeping the higher sequence number per key.
    pub fn restore(&mut self, records: impl IntoIterator<Item = (PayloadHash, SequenceRecord)>) {
        for (key, record) in records {
            match self.records.get(&key) {
                Some(existing) if existing.sequence_number >= record.sequence_number => {}
                _ => {
                    self.records.insert(key, record);
                }
            }
        }
    }
}
