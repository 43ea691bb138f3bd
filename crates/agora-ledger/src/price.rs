//! BSQ prices by month and BTC to BSQ conversion.
//!
//! A [`BsqPrice`] is the BTC value of one BSQ in satoshis, i.e. a price with
//! 8 decimals. BSQ amounts are in its base unit of 2 decimals.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{LedgerError, Result};
use crate::month::YearMonth;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BsqPrice(u64);

impl BsqPrice {
    pub fn new(sats_per_bsq: u64) -> Option<Self> {
        (sats_per_bsq > 0).then_some(Self(sats_per_bsq))
    }

    pub fn sats_per_bsq(&self) -> u64 {
        self.0
    }
}

/// Convert received satoshis to BSQ base units at `price`.
///
/// The intermediate volume has 8 decimals and is truncated; scaling down to
/// 2 decimals rounds half up.
pub fn received_btc_as_bsq(amount_sats: u64, price: BsqPrice) -> u64 {
    let volume = u128::from(amount_sats) * 100_000_000 / u128::from(price.0);
    let bsq = (volume + 500_000) / 1_000_000;
    u64::try_from(bsq).unwrap_or(u64::MAX)
}

/// Average 30-day BSQ price taken on the first of each month, so the entry
/// for 2022-11 is the October average.
const HISTORICAL_PRICES: &[(i32, u32, u64)] = &[
    (2019, 5, 24094),
    (2019, 6, 13139),
    (2019, 7, 10882),
    (2019, 8, 8788),
    (2019, 9, 9885),
    (2019, 10, 10445),
    (2019, 11, 9058),
    (2019, 12, 9571),
    (2020, 1, 9034),
    (2020, 2, 5094),
    (2020, 3, 7578),
    (2020, 4, 7994),
    (2020, 5, 7986),
    (2020, 6, 7411),
    (2020, 7, 6153),
    (2020, 8, 6514),
    (2020, 9, 6032),
    (2020, 10, 5648),
    (2020, 11, 5642),
    (2020, 12, 4946),
    (2021, 1, 4199),
    (2021, 2, 6235),
    (2021, 3, 5052),
    (2021, 4, 4024),
    (2021, 5, 3956),
    (2021, 6, 3918),
    (2021, 7, 3791),
    (2021, 8, 3465),
    (2021, 9, 3376),
    (2021, 10, 3196),
    (2021, 11, 3065),
    (2021, 12, 3015),
    (2022, 1, 3052),
    (2022, 2, 3021),
    (2022, 3, 2824),
    (2022, 4, 2735),
    (2022, 5, 2908),
    (2022, 6, 3207),
    (2022, 7, 3311),
    (2022, 8, 3609),
    (2022, 9, 3756),
    (2022, 10, 3820),
    (2022, 11, 3794),
];

/// Monthly average prices. Months without a price are simply absent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceTable {
    by_month: BTreeMap<YearMonth, BsqPrice>,
}

impl PriceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in table, May 2019 through November 2022.
    pub fn historical() -> Self {
        let by_month = HISTORICAL_PRICES
            .iter()
            .filter_map(|&(year, month, sats)| Some((YearMonth::new(year, month).ok()?, BsqPrice::new(sats)?)))
            .collect();
        Self { by_month }
    }

    pub fn get(&self, month: &YearMonth) -> Option<BsqPrice> {
        self.by_month.get(month).copied()
    }

    pub fn insert(&mut self, month: YearMonth, sats_per_bsq: u64) -> Result<()> {
        let price = BsqPrice::new(sats_per_bsq).ok_or_else(|| LedgerError::InvalidPrice {
            month: month.to_string(),
            value: sats_per_bsq,
        })?;
        self.by_month.insert(month, price);
        Ok(())
    }

    /// Add or overwrite months from `other`.
    pub fn merge(&mut self, other: &PriceTable) {
        self.by_month.extend(other.by_month.iter().map(|(m, p)| (*m, *p)));
    }

    pub fn len(&self) -> usize {
        self.by_month.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_month.is_empty()
    }

    pub fn last_month(&self) -> Option<YearMonth> {
        self.by_month.keys().next_back().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn prop_whole_bsq_converts_exactly(price in 1u64..1_000_000, bsq in 0u64..1_000_000) {
            let price = BsqPrice::new(price).unwrap();
            prop_assert_eq!(received_btc_as_bsq(bsq * price.sats_per_bsq(), price), bsq * 100);
        }

        #[test]
        fn prop_conversion_monotonic(price in 1u64..1_000_000, a in 0u64..u64::MAX / 2, b in 0u64..u64::MAX / 2) {
            let price = BsqPrice::new(price).unwrap();
            let (low, high) = if a <= b { (a, b) } else { (b, a) };
            prop_assert!(received_btc_as_bsq(low, price) <= received_btc_as_bsq(high, price));
        }
    }

    #[test]
    fn test_conversion_rounds_half_up() {
        let price = BsqPrice::new(2735).unwrap();
        // 50_000 * 1e8 / 2735 = 1_828_153_564 (truncated), / 1e6 = 1828.15 -> 1828
        assert_eq!(received_btc_as_bsq(50_000, price), 1828);
        // 1 BSQ exactly
        assert_eq!(received_btc_as_bsq(2735, price), 100);
        let half = BsqPrice::new(4).unwrap();
        // 1 * 1e8 / 4 = 25_000_000 -> 25.0
        assert_eq!(received_btc_as_bsq(1, half), 25);
        let third = BsqPrice::new(3).unwrap();
        // 1 * 1e8 / 3 = 33_333_333 -> 33.33 -> 33
        assert_eq!(received_btc_as_bsq(1, third), 33);
        let tiny = BsqPrice::new(200).unwrap();
        // 1 * 1e8 / 200 = 500_000 -> 0.5 rounds to 1
        assert_eq!(received_btc_as_bsq(1, tiny), 1);
    }

    #[test]
    fn test_large_amounts_do_not_overflow() {
        let price = BsqPrice::new(1).unwrap();
        assert_eq!(received_btc_as_bsq(21_000_000 * 100_000_000, price), 210_000_000_000_000_000);
    }

    #[test]
    fn test_historical_table() {
        let table = PriceTable::historical();
        assert_eq!(table.len(), 43);
        assert_eq!(table.get(&YearMonth::new(2019, 5).unwrap()), BsqPrice::new(24094));
        assert_eq!(table.get(&YearMonth::new(2022, 4).unwrap()), BsqPrice::new(2735));
        assert_eq!(table.last_month(), Some(YearMonth::new(2022, 11).unwrap()));
        assert!(table.get(&YearMonth::new(2019, 4).unwrap()).is_none());
    }

    #[test]
    fn test_merge_and_reject_zero() {
        let mut table = PriceTable::historical();
        let mut newer = PriceTable::new();
        newer.insert(YearMonth::new(2022, 12).unwrap(), 4000).unwrap();
        assert!(newer.insert(YearMonth::new(2023, 1).unwrap(), 0).is_err());
        table.merge(&newer);
        assert_eq!(table.len(), 44);
    }
}
