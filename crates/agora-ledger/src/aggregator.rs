//! Reduces the accepted accounting chain into per-recipient balances.
//!
//! The aggregator is derived state. It is fed every accepted block in
//! height order and can always be thrown away and rebuilt from the chain.
//! Two legacy recipients are tracked like any other but left out of the
//! ecosystem-wide totals.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;

use agora_core::AccountingBlock;

use crate::balance::{BalanceEntryType, BalanceModel, ReceivedBalanceEntry};
use crate::error::Result;
use crate::month::YearMonth;
use crate::price::{received_btc_as_bsq, PriceTable};

pub const LEGACY_BURNING_MAN_DPT_NAME: &str = "Legacy Burningman (DPT)";
pub const LEGACY_BURNING_MAN_BTC_FEES_NAME: &str = "Legacy Burningman (BTC fees)";

/// Recipients excluded from aggregate totals.
pub const LEGACY_RECIPIENTS: [&str; 2] = [LEGACY_BURNING_MAN_DPT_NAME, LEGACY_BURNING_MAN_BTC_FEES_NAME];

pub fn is_legacy_recipient(name: &str) -> bool {
    LEGACY_RECIPIENTS.contains(&name)
}

/// Sum the BSQ value of `entries`. Entries whose month has no price are
/// left out of the sum rather than counted as zero.
pub fn convert_to_bsq<'a>(entries: impl IntoIterator<Item = &'a ReceivedBalanceEntry>, prices: &PriceTable) -> u64 {
    entries
        .into_iter()
        .filter_map(|e| prices.get(&e.month).map(|p| received_btc_as_bsq(e.amount_sats, p)))
        .sum()
}

#[derive(Debug, Default)]
struct ExcludingLegacyCache {
    version: u64,
    entries: Option<Arc<Vec<ReceivedBalanceEntry>>>,
}

#[derive(Debug)]
pub struct BalanceAggregator {
    models: BTreeMap<String, BalanceModel>,
    prices: PriceTable,
    last_height: Option<u64>,
    /// Bumped on every change to `models`.
    version: u64,
    cache: Mutex<ExcludingLegacyCache>,
}

impl Default for BalanceAggregator {
    fn default() -> Self {
        Self::new(PriceTable::historical())
    }
}

impl BalanceAggregator {
    pub fn new(prices: PriceTable) -> Self {
        Self {
            models: BTreeMap::new(),
            prices,
            last_height: None,
            version: 0,
            cache: Mutex::new(ExcludingLegacyCache::default()),
        }
    }

    pub fn prices(&self) -> &PriceTable {
        &self.prices
    }

    /// Add or overwrite monthly prices, e.g. averages computed after the
    /// built-in table ends.
    pub fn merge_prices(&mut self, newer: &PriceTable) {
        self.prices.merge(newer);
    }

    pub fn last_height(&self) -> Option<u64> {
        self.last_height
    }

    /// Append one entry per output of `block` to the named recipient's
    /// model. Blocks at or below the last applied height are skipped.
    /// Returns the number of entries added.
    pub fn apply_block(&mut self, block: &AccountingBlock) -> Result<usize> {
        if self.last_height.map_or(false, |h| block.height <= h) {
            tracing::debug!(height = block.height, "block already applied to balances");
            return Ok(0);
        }
        let month = YearMonth::from_timestamp_ms(block.timestamp)?;

        let mut added = 0;
        for (tx, output) in block.outputs() {
            self.models
                .entry(output.recipient_name.clone())
                .or_default()
                .add(ReceivedBalanceEntry {
                    truncated_tx_id: tx.truncated_tx_id().to_string(),
                    amount_sats: output.value_sats,
                    month,
                    entry_type: tx.tx_type.into(),
                });
            added += 1;
        }
        self.last_height = Some(block.height);
        self.version += 1;
        Ok(added)
    }

    /// Drop every model and replay `blocks`, which must be in height order.
    pub fn rebuild_from_genesis<'a>(&mut self, blocks: impl IntoIterator<Item = &'a AccountingBlock>) -> Result<usize> {
        self.models.clear();
        self.last_height = None;
        self.version += 1;

        let mut added = 0;
        for block in blocks {
            added += self.apply_block(block)?;
        }
        tracing::info!(
            recipients = self.models.len(),
            entries = added,
            last_height = ?self.last_height,
            "balances rebuilt"
        );
        Ok(added)
    }

    pub fn balance_model(&self, recipient: &str) -> Option<&BalanceModel> {
        self.models.get(recipient)
    }

    /// Every recipient, legacy ones included, by name.
    pub fn balance_models(&self) -> &BTreeMap<String, BalanceModel> {
        &self.models
    }

    // ─── Totals (legacy recipients excluded) ─────────────────────────────────

    fn entries_excluding_legacy(&self) -> Arc<Vec<ReceivedBalanceEntry>> {
        let mut cache = self.cache.lock();
        if cache.version == self.version {
            if let Some(entries) = &cache.entries {
                return Arc::clone(entries);
            }
        }
        let entries: Arc<Vec<_>> = Arc::new(
            self.models
                .iter()
                .filter(|(name, _)| !is_legacy_recipient(name))
                .flat_map(|(_, model)| model.entries().iter().cloned())
                .collect(),
        );
        cache.version = self.version;
        cache.entries = Some(Arc::clone(&entries));
        entries
    }

    fn sum_sats(&self, entry_type: Option<BalanceEntryType>) -> u64 {
        self.entries_excluding_legacy()
            .iter()
            .filter(|e| entry_type.map_or(true, |t| e.entry_type == t))
            .map(|e| e.amount_sats)
            .sum()
    }

    fn sum_bsq(&self, entry_type: Option<BalanceEntryType>) -> u64 {
        let entries = self.entries_excluding_legacy();
        convert_to_bsq(
            entries.iter().filter(|e| entry_type.map_or(true, |t| e.entry_type == t)),
            &self.prices,
        )
    }

    pub fn total_distributed_btc(&self) -> u64 {
        self.sum_sats(None)
    }

    pub fn total_distributed_btc_fees(&self) -> u64 {
        self.sum_sats(Some(BalanceEntryType::BtcTradeFee))
    }

    pub fn total_distributed_btc_fees_as_bsq(&self) -> u64 {
        self.sum_bsq(Some(BalanceEntryType::BtcTradeFee))
    }

    pub fn total_distributed_dpt(&self) -> u64 {
        self.sum_sats(Some(BalanceEntryType::Dpt))
    }

    pub fn total_distributed_dpt_as_bsq(&self) -> u64 {
        self.sum_bsq(Some(BalanceEntryType::Dpt))
    }

    /// BSQ value of everything distributed, over months with a known price.
    pub fn total_distributed_bsq(&self) -> u64 {
        self.sum_bsq(None)
    }

    /// Entries received in `month`, legacy recipients excluded.
    pub fn distributed_by_month(&self, month: YearMonth) -> Vec<ReceivedBalanceEntry> {
        self.models
            .iter()
            .filter(|(name, _)| !is_legacy_recipient(name))
            .flat_map(|(_, model)| model.entries_by_month(month).cloned())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agora_core::{AccountingTx, AccountingTxType, Blake3Hash, TxOutput};

    fn block(height: u64, prev: Blake3Hash, month: YearMonth, txs: Vec<AccountingTx>) -> AccountingBlock {
        AccountingBlock::new(height, prev, month.start_ms() + 3_600_000, txs)
    }

    fn fee_to(name: &str, sats: u64, tx: &str) -> AccountingTx {
        AccountingTx::new(tx, AccountingTxType::BtcTradeFee, vec![TxOutput::new(name, sats)])
    }

    fn ym(year: i32, month: u32) -> YearMonth {
        YearMonth::new(year, month).unwrap()
    }

    #[test]
    fn test_fee_entries_by_month_and_bsq_partiality() {
        let months = [ym(2022, 4), ym(2022, 5), ym(2022, 6), ym(2024, 1)];
        let mut prev = Blake3Hash::ZERO;
        let mut blocks = Vec::new();
        for (i, month) in months.iter().enumerate() {
            let b = block(100 + i as u64, prev, *month, vec![fee_to("Alice", 50_000, &format!("{i:064x}"))]);
            prev = b.hash;
            blocks.push(b);
        }

        let mut agg = BalanceAggregator::default();
        for b in &blocks[..3] {
            agg.apply_block(b).unwrap();
        }
        let alice = agg.balance_model("Alice").unwrap();
        for month in &months[..3] {
            let in_month: Vec<_> = alice.entries_by_month(*month).collect();
            assert_eq!(in_month.len(), 1);
            assert_eq!(in_month[0].amount_sats, 50_000);
        }
        assert_eq!(agg.total_distributed_btc(), 150_000);

        let prices = agg.prices().clone();
        let expected: u64 = months[..3]
            .iter()
            .map(|m| received_btc_as_bsq(50_000, prices.get(m).unwrap()))
            .sum();
        assert_eq!(agg.total_distributed_bsq(), expected);
        assert_eq!(agg.total_distributed_btc_fees_as_bsq(), expected);

        // No price for 2024-01: counted in sats, not in BSQ.
        agg.apply_block(&blocks[3]).unwrap();
        assert_eq!(agg.total_distributed_btc(), 200_000);
        assert_eq!(agg.total_distributed_bsq(), expected);
    }

    #[test]
    fn test_legacy_recipients_tracked_but_not_totalled() {
        let month = ym(2021, 3);
        let b = block(
            100,
            Blake3Hash::ZERO,
            month,
            vec![
                fee_to(LEGACY_BURNING_MAN_BTC_FEES_NAME, 10_000, "aa"),
                AccountingTx::new(
                    "bb",
                    AccountingTxType::DistributedPayout,
                    vec![TxOutput::new(LEGACY_BURNING_MAN_DPT_NAME, 20_000), TxOutput::new("Bob", 5_000)],
                ),
            ],
        );
        let mut agg = BalanceAggregator::default();
        assert_eq!(agg.apply_block(&b).unwrap(), 3);

        assert_eq!(agg.balance_model(LEGACY_BURNING_MAN_DPT_NAME).unwrap().total_sats(), 20_000);
        assert_eq!(agg.balance_model(LEGACY_BURNING_MAN_BTC_FEES_NAME).unwrap().total_sats(), 10_000);
        assert_eq!(agg.total_distributed_btc(), 5_000);
        assert_eq!(agg.total_distributed_dpt(), 5_000);
        assert_eq!(agg.total_distributed_btc_fees(), 0);
        assert_eq!(agg.distributed_by_month(month).len(), 1);
    }

    #[test]
    fn test_cache_invalidated_by_new_block() {
        let mut agg = BalanceAggregator::default();
        let first = block(100, Blake3Hash::ZERO, ym(2022, 1), vec![fee_to("Carol", 1_000, "01")]);
        agg.apply_block(&first).unwrap();
        assert_eq!(agg.total_distributed_btc(), 1_000);

        let second = block(101, first.hash, ym(2022, 1), vec![fee_to("Carol", 2_000, "02")]);
        agg.apply_block(&second).unwrap();
        assert_eq!(agg.total_distributed_btc(), 3_000);
    }

    #[test]
    fn test_reapplying_block_is_ignored() {
        let mut agg = BalanceAggregator::default();
        let b = block(100, Blake3Hash::ZERO, ym(2022, 1), vec![fee_to("Dave", 1_000, "01")]);
        assert_eq!(agg.apply_block(&b).unwrap(), 1);
        assert_eq!(agg.apply_block(&b).unwrap(), 0);
        assert_eq!(agg.total_distributed_btc(), 1_000);
    }

    #[test]
    fn test_rebuild_matches_incremental() {
        let mut prev = Blake3Hash::ZERO;
        let blocks: Vec<_> = (0..6u64)
            .map(|i| {
                let b = block(
                    100 + i,
                    prev,
                    ym(2021, 1 + i as u32),
                    vec![fee_to(if i % 2 == 0 { "Eve" } else { "Frank" }, 1_000 * (i + 1), &format!("{i:02}"))],
                );
                prev = b.hash;
                b
            })
            .collect();

        let mut incremental = BalanceAggregator::default();
        for b in &blocks {
            incremental.apply_block(b).unwrap();
        }
        let mut rebuilt = BalanceAggregator::default();
        rebuilt.apply_block(&blocks[0]).unwrap();
        rebuilt.rebuild_from_genesis(&blocks).unwrap();

        assert_eq!(rebuilt.balance_models(), incremental.balance_models());
        assert_eq!(rebuilt.total_distributed_bsq(), incremental.total_distributed_bsq());
        assert_eq!(rebuilt.last_height(), Some(105));
    }

    #[test]
    fn test_convert_skips_unpriced_months() {
        let mut prices = PriceTable::new();
        prices.insert(ym(2023, 1), 4_000).unwrap();
        let entries = [
            ReceivedBalanceEntry {
                truncated_tx_id: "a".into(),
                amount_sats: 4_000,
                month: ym(2023, 1),
                entry_type: BalanceEntryType::Dpt,
            },
            ReceivedBalanceEntry {
                truncated_tx_id: "b".into(),
                amount_sats: 4_000,
                month: ym(2023, 2),
                entry_type: BalanceEntryType::Dpt,
            },
        ];
        assert_eq!(convert_to_bsq(&entries, &prices), 100);
    }
}
