//! Error types for the ledger crate.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    #[error("invalid month {year}-{month}")]
    InvalidMonth { year: i32, month: u32 },

    /// Block timestamp outside the range chrono can represent.
    #[error("timestamp out of range: {0}")]
    InvalidTimestamp(i64),

    #[error("cannot parse month: {0}")]
    ParseMonth(String),

    /// A price must be strictly positive.
    #[error("invalid price for {month}: {value}")]
    InvalidPrice { month: String, value: u64 },
}

pub type Result<T> = std::result::Result<T, LedgerError>;
