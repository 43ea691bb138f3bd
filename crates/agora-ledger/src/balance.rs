//! Per-recipient ledgers of received BTC.

use serde::{Deserialize, Serialize};

use agora_core::AccountingTxType;

use crate::month::YearMonth;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BalanceEntryType {
    BtcTradeFee,
    /// Delayed payout transaction.
    Dpt,
}

impl From<AccountingTxType> for BalanceEntryType {
    fn from(tx_type: AccountingTxType) -> Self {
        match tx_type {
            AccountingTxType::BtcTradeFee => BalanceEntryType::BtcTradeFee,
            AccountingTxType::DistributedPayout => BalanceEntryType::Dpt,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceivedBalanceEntry {
    pub truncated_tx_id: String,
    pub amount_sats: u64,
    pub month: YearMonth,
    pub entry_type: BalanceEntryType,
}

/// Everything one recipient received, in block order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceModel {
    entries: Vec<ReceivedBalanceEntry>,
}

impl BalanceModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, entry: ReceivedBalanceEntry) {
        self.entries.push(entry);
    }

    pub fn entries(&self) -> &[ReceivedBalanceEntry] {
        &self.entries
    }

    pub fn entries_by_month(&self, month: YearMonth) -> impl Iterator<Item = &ReceivedBalanceEntry> {
        self.entries.iter().filter(move |e| e.month == month)
    }

    pub fn total_sats(&self) -> u64 {
        self.entries.iter().map(|e| e.amount_sats).sum()
    }

    pub fn total_sats_of(&self, entry_type: BalanceEntryType) -> u64 {
        self.entries
            .iter()
            .filter(|e| e.entry_type == entry_type)
            .map(|e| e.amount_sats)
            .sum()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(amount_sats: u64, month: u32, entry_type: BalanceEntryType) -> ReceivedBalanceEntry {
        ReceivedBalanceEntry {
            truncated_tx_id: "deadbeef".into(),
            amount_sats,
            month: YearMonth::new(2022, month).unwrap(),
            entry_type,
        }
    }

    #[test]
    fn test_totals_by_type_and_month() {
        let mut model = BalanceModel::new();
        model.add(entry(1_000, 1, BalanceEntryType::BtcTradeFee));
        model.add(entry(2_000, 1, BalanceEntryType::Dpt));
        model.add(entry(4_000, 2, BalanceEntryType::BtcTradeFee));

        assert_eq!(model.total_sats(), 7_000);
        assert_eq!(model.total_sats_of(BalanceEntryType::BtcTradeFee), 5_000);
        assert_eq!(model.entries_by_month(YearMonth::new(2022, 1).unwrap()).count(), 2);
    }

    #[test]
    fn test_entry_type_from_tx_type() {
        assert_eq!(BalanceEntryType::from(AccountingTxType::DistributedPayout), BalanceEntryType::Dpt);
    }
}
