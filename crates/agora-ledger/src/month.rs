//! Calendar months in UTC, the unit balances and prices are bucketed by.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{LedgerError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct YearMonth {
    year: i32,
    month: u32,
}

impl YearMonth {
    pub fn new(year: i32, month: u32) -> Result<Self> {
        if !(1..=12).contains(&month) || NaiveDate::from_ymd_opt(year, month, 1).is_none() {
            return Err(LedgerError::InvalidMonth { year, month });
        }
        Ok(Self { year, month })
    }

    /// The UTC month containing `millis` since the epoch.
    pub fn from_timestamp_ms(millis: i64) -> Result<Self> {
        let at = DateTime::<Utc>::from_timestamp_millis(millis).ok_or(LedgerError::InvalidTimestamp(millis))?;
        Ok(Self {
            year: at.year(),
            month: at.month(),
        })
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    pub fn month(&self) -> u32 {
        self.month
    }

    /// Milliseconds at 00:00 UTC on the first day of the month.
    pub fn start_ms(&self) -> i64 {
        NaiveDate::from_ymd_opt(self.year, self.month, 1)
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map_or(0, |dt| dt.and_utc().timestamp_millis())
    }

    pub fn next(&self) -> Self {
        if self.month == 12 {
            Self {
                year: self.year + 1,
                month: 1,
            }
        } else {
            Self {
                year: self.year,
                month: self.month + 1,
            }
        }
    }
}

impl fmt::Display for YearMonth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl FromStr for YearMonth {
    type Err = LedgerError;

    /// Parses `YYYY-MM`.
    fn from_str(s: &str) -> Result<Self> {
        let (year, month) = s
            .split_once('-')
            .ok_or_else(|| LedgerError::ParseMonth(s.to_string()))?;
        let year = year.parse().map_err(|_| LedgerError::ParseMonth(s.to_string()))?;
        let month = month.parse().map_err(|_| LedgerError::ParseMonth(s.to_string()))?;
        Self::new(year, month)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_timestamp_is_utc() {
        // 2022-04-01T00:30:00Z, still March in any timezone west of UTC.
        let month = YearMonth::from_timestamp_ms(1_648_773_000_000).unwrap();
        assert_eq!(month, YearMonth::new(2022, 4).unwrap());
        assert_eq!(month.to_string(), "2022-04");
    }

    #[test]
    fn test_start_ms_round_trips() {
        let month = YearMonth::new(2020, 11).unwrap();
        assert_eq!(YearMonth::from_timestamp_ms(month.start_ms()).unwrap(), month);
        assert_eq!(YearMonth::from_timestamp_ms(month.start_ms() - 1).unwrap(), YearMonth::new(2020, 10).unwrap());
    }

    #[test]
    fn test_parse_and_reject() {
        assert_eq!("2019-05".parse::<YearMonth>().unwrap(), YearMonth::new(2019, 5).unwrap());
        assert!("2019-13".parse::<YearMonth>().is_err());
        assert!("201905".parse::<YearMonth>().is_err());
        assert!(YearMonth::new(2020, 0).is_err());
    }

    #[test]
    fn test_next_wraps_year() {
        assert_eq!(YearMonth::new(2021, 12).unwrap().next(), YearMonth::new(2022, 1).unwrap());
    }
}
