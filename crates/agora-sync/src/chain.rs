//! The locally accepted accounting chain.
//!
//! Blocks are held contiguously from the configured earliest height. A block
//! is appended only if it sits exactly one above the tip and its
//! `previous_hash` equals the tip's hash. Blocks from further ahead are
//! buffered until the gap is filled.

use std::collections::{BTreeMap, BTreeSet};

use thiserror::Error;

use agora_core::{AccountingBlock, Blake3Hash, ValidationError};

/// First accounting height on mainnet.
pub const MAINNET_EARLIEST_HEIGHT: u64 = 656_035;
/// First accounting height on regtest.
pub const REGTEST_EARLIEST_HEIGHT: u64 = 111;
/// Default number of blocks dropped by [`AccountingChain::purge_last`].
pub const DEFAULT_PURGE_COUNT: usize = 10;

/// Why a block could not be appended. Recoverable: both variants mean
/// "fetch the missing range", never "stop".
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChainError {
    #[error("block height {got} does not connect, expected {expected}")]
    BlockHeightNotConnecting { expected: u64, got: u64 },

    #[error("block {height} previous hash {got} does not match tip {expected}")]
    BlockHashNotConnecting {
        height: u64,
        expected: Blake3Hash,
        got: Blake3Hash,
    },

    #[error("invalid block: {0}")]
    InvalidBlock(#[from] ValidationError),
}

/// Where a height stands locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeightState {
    Unknown,
    /// Buffered, or covered by a request in flight.
    Pending,
    Accepted,
    /// A block was offered for this height and did not link.
    Rejected,
}

#[derive(Debug)]
pub struct AccountingChain {
    earliest_height: u64,
    blocks: Vec<AccountingBlock>,
    buffered: BTreeMap<u64, AccountingBlock>,
    max_buffered: usize,
    rejected: BTreeSet<u64>,
    requested_from: Option<u64>,
}

impl AccountingChain {
    pub fn new(earliest_height: u64, max_buffered: usize) -> Self {
        Self {
            earliest_height,
            blocks: Vec::new(),
            buffered: BTreeMap::new(),
            max_buffered,
            rejected: BTreeSet::new(),
            requested_from: None,
        }
    }

    /// Rebuild from persisted blocks. Stops at the first block that does not
    /// link; returns how many were loaded.
    pub fn load(&mut self, blocks: impl IntoIterator<Item = AccountingBlock>) -> usize {
        let mut loaded = 0;
        for block in blocks {
            if let Err(e) = self.try_append(block) {
                tracing::warn!(error = %e, "persisted accounting chain broken, stopping load");
                break;
            }
            loaded += 1;
        }
        loaded
    }

    pub fn earliest_height(&self) -> u64 {
        self.earliest_height
    }

    /// Height of the tip, or `earliest_height - 1` when empty.
    pub fn last_height(&self) -> u64 {
        self.blocks
            .last()
            .map_or(self.earliest_height.saturating_sub(1), |b| b.height)
    }

    pub fn last_block(&self) -> Option<&AccountingBlock> {
        self.blocks.last()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn blocks(&self) -> &[AccountingBlock] {
        &self.blocks
    }

    pub fn block_at(&self, height: u64) -> Option<&AccountingBlock> {
        let index = height.checked_sub(self.earliest_height)?;
        self.blocks.get(usize::try_from(index).ok()?)
    }

    /// Every accepted block at or above `height`, ascending.
    pub fn blocks_from(&self, height: u64) -> Vec<AccountingBlock> {
        let start = height.saturating_sub(self.earliest_height) as usize;
        self.blocks.get(start..).map(<[_]>::to_vec).unwrap_or_default()
    }

    /// Append `block` if it links onto the tip.
    pub fn try_append(&mut self, block: AccountingBlock) -> Result<(), ChainError> {
        block.verify_hash()?;

        let expected = self.last_height() + 1;
        if block.height != expected {
            return Err(ChainError::BlockHeightNotConnecting {
                expected,
                got: block.height,
            });
        }
        if let Some(tip) = self.blocks.last() {
            if block.previous_hash != tip.hash {
                return Err(ChainError::BlockHashNotConnecting {
                    height: block.height,
                    expected: tip.hash,
                    got: block.previous_hash,
                });
            }
        }

        self.rejected.remove(&block.height);
        self.buffered.remove(&block.height);
        if self.requested_from.map_or(false, |from| from <= block.height) {
            self.requested_from = Some(block.height + 1);
        }
        self.blocks.push(block);
        Ok(())
    }

    /// Hold a block from beyond the tip. Returns false if it is not ahead of
    /// the tip or the buffer is full.
    pub fn buffer(&mut self, block: AccountingBlock) -> bool {
        if block.height <= self.last_height() + 1 || self.buffered.len() >= self.max_buffered {
            return false;
        }
        self.buffered.insert(block.height, block);
        true
    }

    /// Append buffered blocks that now link. Returns the appended blocks.
    /// A buffered block that fails to link is dropped along with everything
    /// above it.
    pub fn drain_buffered(&mut self) -> Vec<AccountingBlock> {
        let mut appended = Vec::new();
        loop {
            let next = self.last_height() + 1;
            let Some(block) = self.buffered.remove(&next) else {
                break;
            };
            match self.try_append(block.clone()) {
                Ok(()) => appended.push(block),
                Err(e) => {
                    tracing::debug!(error = %e, "dropping buffered blocks that do not link");
                    self.buffered.clear();
                    break;
                }
            }
        }
        appended
    }

    pub fn buffered_len(&self) -> usize {
        self.buffered.len()
    }

    pub fn mark_rejected(&mut self, height: u64) {
        self.rejected.insert(height);
    }

    pub fn set_requested_from(&mut self, from: Option<u64>) {
        self.requested_from = from;
    }

    pub fn height_state(&self, height: u64) -> HeightState {
        if height >= self.earliest_height && height <= self.last_height() {
            HeightState::Accepted
        } else if self.rejected.contains(&height) {
            HeightState::Rejected
        } else if self.buffered.contains_key(&height)
            || self.requested_from.map_or(false, |from| height >= from)
        {
            HeightState::Pending
        } else {
            HeightState::Unknown
        }
    }

    /// Drop the top `count` blocks and the buffer. Returns what was removed,
    /// lowest first.
    pub fn purge_last(&mut self, count: usize) -> Vec<AccountingBlock> {
        let keep = self.blocks.len().saturating_sub(count);
        self.buffered.clear();
        self.rejected.clear();
        self.blocks.split_off(keep)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain_of(from: u64, to: u64) -> Vec<AccountingBlock> {
        let mut prev = Blake3Hash::ZERO;
        (from..=to)
            .map(|h| {
                let block = AccountingBlock::new(h, prev, h as i64 * 600_000, vec![]);
                prev = block.hash;
                block
            })
            .collect()
    }

    fn accepted(from: u64, to: u64) -> AccountingChain {
        let mut chain = AccountingChain::new(from, 100);
        assert_eq!(chain.load(chain_of(from, to)), (to - from + 1) as usize);
        chain
    }

    #[test]
    fn test_empty_chain_last_height() {
        let chain = AccountingChain::new(REGTEST_EARLIEST_HEIGHT, 10);
        assert_eq!(chain.last_height(), REGTEST_EARLIEST_HEIGHT - 1);
        assert!(chain.last_block().is_none());
    }

    #[test]
    fn test_hash_not_connecting_leaves_chain_unchanged() {
        let mut chain = accepted(100, 100);
        let tip = chain.last_block().unwrap().hash;
        let rogue = AccountingBlock::new(101, Blake3Hash::hash(b"other"), 0, vec![]);

        let err = chain.try_append(rogue).unwrap_err();
        assert_eq!(
            err,
            ChainError::BlockHashNotConnecting {
                height: 101,
                expected: tip,
                got: Blake3Hash::hash(b"other"),
            }
        );
        assert_eq!(chain.last_height(), 100);
    }

    #[test]
    fn test_height_gap_rejected() {
        let mut chain = accepted(100, 101);
        let blocks = chain_of(100, 104);
        assert!(matches!(
            chain.try_append(blocks[3].clone()),
            Err(ChainError::BlockHeightNotConnecting { expected: 102, got: 103 })
        ));
    }

    #[test]
    fn test_tampered_block_invalid() {
        let mut chain = AccountingChain::new(100, 10);
        let mut block = chain_of(100, 100).remove(0);
        block.timestamp += 1;
        assert!(matches!(chain.try_append(block), Err(ChainError::InvalidBlock(_))));
    }

    #[test]
    fn test_blocks_from_and_block_at() {
        let chain = accepted(100, 105);
        let heights: Vec<u64> = chain.blocks_from(103).iter().map(|b| b.height).collect();
        assert_eq!(heights, vec![103, 104, 105]);
        assert!(chain.blocks_from(106).is_empty());
        assert_eq!(chain.blocks_from(50).len(), 6);
        assert_eq!(chain.block_at(104).map(|b| b.height), Some(104));
        assert!(chain.block_at(99).is_none());
    }

    #[test]
    fn test_buffered_blocks_drain_after_gap_filled() {
        let all = chain_of(100, 104);
        let mut chain = AccountingChain::new(100, 10);
        chain.load(all[..2].to_vec());

        assert!(chain.buffer(all[3].clone()));
        assert!(chain.buffer(all[4].clone()));
        assert!(!chain.buffer(all[1].clone()));
        assert_eq!(chain.height_state(103), HeightState::Pending);
        assert!(chain.drain_buffered().is_empty());

        chain.try_append(all[2].clone()).unwrap();
        let drained: Vec<u64> = chain.drain_buffered().iter().map(|b| b.height).collect();
        assert_eq!(drained, vec![103, 104]);
        assert_eq!(chain.last_height(), 104);
        assert_eq!(chain.buffered_len(), 0);
    }

    #[test]
    fn test_buffer_is_bounded() {
        let all = chain_of(100, 110);
        let mut chain = AccountingChain::new(100, 2);
        assert!(chain.buffer(all[5].clone()));
        assert!(chain.buffer(all[6].clone()));
        assert!(!chain.buffer(all[7].clone()));
    }

    #[test]
    fn test_height_states() {
        let mut chain = accepted(100, 102);
        assert_eq!(chain.height_state(101), HeightState::Accepted);
        assert_eq!(chain.height_state(103), HeightState::Unknown);
        chain.mark_rejected(103);
        assert_eq!(chain.height_state(103), HeightState::Rejected);
        chain.set_requested_from(Some(104));
        assert_eq!(chain.height_state(105), HeightState::Pending);
    }

    #[test]
    fn test_purge_last() {
        let mut chain = accepted(100, 114);
        let purged = chain.purge_last(DEFAULT_PURGE_COUNT);
        assert_eq!(purged.len(), 10);
        assert_eq!(purged[0].height, 105);
        assert_eq!(chain.last_height(), 104);

        let mut small = accepted(100, 102);
        assert_eq!(small.purge_last(10).len(), 3);
        assert_eq!(small.last_height(), 99);
    }

    mod prop {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// Whatever order blocks arrive in, buffering plus draining
            /// yields the same contiguous chain.
            #[test]
            fn prop_any_arrival_order_converges(order in Just((0..12usize).collect::<Vec<_>>()).prop_shuffle()) {
                let all = chain_of(100, 111);
                let mut chain = AccountingChain::new(100, 64);
                for i in order {
                    let block = all[i].clone();
                    if chain.try_append(block.clone()).is_ok() {
                        chain.drain_buffered();
                    } else {
                        chain.buffer(block);
                    }
                }
                prop_assert_eq!(chain.last_height(), 111);
                prop_assert_eq!(chain.blocks(), &all[..]);
            }
        }
    }
}
