//! # Agora Ledger
//!
//! Balances derived from the oracle's accounting chain.
//!
//! ## Key Types
//!
//! - [`BalanceAggregator`] - Folds accepted blocks into per-recipient [`BalanceModel`]s
//! - [`ReceivedBalanceEntry`] - One output received by a recipient, bucketed by month
//! - [`PriceTable`] - Average BSQ price per month, for BTC to BSQ conversion
//! - [`YearMonth`] - A calendar month in UTC
//!
//! ## Partial conversion
//!
//! BSQ totals only cover months with a known price. An entry in a month
//! without one still counts towards the satoshi totals.
//!
//! ```rust,no_run
//! use agora_ledger::BalanceAggregator;
//!
//! # fn example(blocks: &[agora_core::AccountingBlock]) -> agora_ledger::Result<()> {
//! let mut aggregator = BalanceAggregator::default();
//! aggregator.rebuild_from_genesis(blocks)?;
//! println!(
//!     "{} sats distributed, {} BSQ base units",
//!     aggregator.total_distributed_btc(),
//!     aggregator.total_distributed_bsq()
//! );
//! # Ok(())
//! # }
//! ```

pub mod aggregator;
pub mod balance;
pub mod error;
pub mod month;
pub mod price;

pub use aggregator::{
    convert_to_bsq, is_legacy_recipient, BalanceAggregator, LEGACY_BURNING_MAN_BTC_FEES_NAME,
    LEGACY_BURNING_MAN_DPT_NAME, LEGACY_RECIPIENTS,
};
pub use balance::{BalanceEntryType, BalanceModel, ReceivedBalanceEntry};
pub use error::{LedgerError, Result};
pub use month::YearMonth;
pub use price::{received_btc_as_bsq, BsqPrice, PriceTable};
