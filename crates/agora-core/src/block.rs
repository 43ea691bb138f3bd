//! Accounting blocks minted by the oracle.

use serde::{Deserialize, Serialize};

use crate::canonical;
use crate::crypto::Blake3Hash;
use crate::error::ValidationError;

/// Kind of an accounting transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccountingTxType {
    /// BTC trade fees paid to a receiver.
    BtcTradeFee,
    /// Delayed payout distributed to receivers.
    DistributedPayout,
}

impl AccountingTxType {
    pub fn to_u8(self) -> u8 {
        match self {
            AccountingTxType::BtcTradeFee => 0,
            AccountingTxType::DistributedPayout => 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
    pub recipient_name: String,
    pub value_sats: u64,
}

impl TxOutput {
    pub fn new(recipient_name: impl Into<String>, value_sats: u64) -> Self {
        Self {
            recipient_name: recipient_name.into(),
            value_sats,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountingTx {
    /// Hex transaction id.
    pub tx_id: String,
    pub tx_type: AccountingTxType,
    pub outputs: Vec<TxOutput>,
}

impl AccountingTx {
    pub fn new(tx_id: impl Into<String>, tx_type: AccountingTxType, outputs: Vec<TxOutput>) -> Self {
        Self {
            tx_id: tx_id.into(),
            tx_type,
            outputs,
        }
    }

    /// First 8 hex characters of the tx id, enough to tell entries apart in a ledger.
    pub fn truncated_tx_id(&self) -> &str {
        let end = self
            .tx_id
            .char_indices()
            .nth(8)
            .map(|(i, _)| i)
            .unwrap_or(self.tx_id.len());
        &self.tx_id[..end]
    }
}

/// One block of the oracle's accounting chain.
///
/// `hash` covers every other field, so a block at height `h + 1` is linked to
/// its predecessor through `previous_hash`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountingBlock {
    pub height: u64,
    pub hash: Blake3Hash,
    pub previous_hash: Blake3Hash,
    /// Unix milliseconds.
    pub timestamp: i64,
    pub txs: Vec<AccountingTx>,
}

impl AccountingBlock {
    /// Build a block and compute its hash.
    pub fn new(height: u64, previous_hash: Blake3Hash, timestamp: i64, txs: Vec<AccountingTx>) -> Self {
        let mut block = Self {
            height,
            hash: Blake3Hash::ZERO,
            previous_hash,
            timestamp,
            txs,
        };
        block.hash = block.compute_hash();
        block
    }

    pub fn compute_hash(&self) -> Blake3Hash {
        Blake3Hash::hash(&canonical::block_bytes(self))
    }

    pub fn verify_hash(&self) -> Result<(), ValidationError> {
        if self.compute_hash() != self.hash {
            return Err(ValidationError::BlockHashMismatch { height: self.height });
        }
        Ok(())
    }

    /// Iterate `(tx, output)` pairs in block order.
    pub fn outputs(&self) -> impl Iterator<Item = (&AccountingTx, &TxOutput)> {
        self.txs
            .iter()
            .flat_map(|tx| tx.outputs.iter().map(move |out| (tx, out)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fee_tx(name: &str, sats: u64) -> AccountingTx {
        AccountingTx::new(
            "a1b2c3d4e5f60718",
            AccountingTxType::BtcTradeFee,
            vec![TxOutput::new(name, sats)],
        )
    }

    #[test]
    fn test_block_hash_verifies() {
        let block = AccountingBlock::new(100, Blake3Hash::ZERO, 1_667_300_000_000, vec![fee_tx("alice", 5)]);
        assert!(block.verify_hash().is_ok());
    }

    #[test]
    fn test_tampered_block_fails() {
        let mut block = AccountingBlock::new(100, Blake3Hash::ZERO, 0, vec![fee_tx("alice", 5)]);
        block.txs[0].outputs[0].value_sats = 5_000;
        assert_eq!(
            block.verify_hash(),
            Err(ValidationError::BlockHashMismatch { height: 100 })
        );
    }

    #[test]
    fn test_hash_covers_previous_hash() {
        let a = AccountingBlock::new(5, Blake3Hash::ZERO, 0, vec![]);
        let b = AccountingBlock::new(5, Blake3Hash::hash(b"x"), 0, vec![]);
        assert_ne!(a.hash, b.hash);
    }

    #[test]
    fn test_truncated_tx_id() {
        assert_eq!(fee_tx("a", 1).truncated_tx_id(), "a1b2c3d4");
        let short = AccountingTx::new("abc", AccountingTxType::DistributedPayout, vec![]);
        assert_eq!(short.truncated_tx_id(), "abc");
    }

    #[test]
    fn test_outputs_iterates_in_order() {
        let block = AccountingBlock::new(
            1,
            Blake3Hash::ZERO,
            0,
            vec![fee_tx("alice", 1), fee_tx("bob", 2)],
        );
        let names: Vec<_> = block.outputs().map(|(_, o)| o.recipient_name.as_str()).collect();
        assert_eq!(names, vec!["alice", "bob"]);
    }
}
