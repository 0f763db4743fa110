//! Billing periods
//!
//! A period is the half-open window `[start, end)`. Daily periods are aligned
//! to UTC midnight.

use std::fmt;

use time::{Date, Duration, OffsetDateTime};

use crate::error::{BillingError, BillingResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BillingPeriod {
    pub start: OffsetDateTime,
    pub end: OffsetDateTime,
}

impl BillingPeriod {
    pub fn new(start: OffsetDateTime, end: OffsetDateTime) -> BillingResult<Self> {
        if start >= end {
            return Err(BillingError::InvalidPeriod(format!(
                "start {} is not before end {}",
                start, end
            )));
        }
        Ok(Self { start, end })
    }

    /// The 24h period starting at midnight UTC on `date`
    pub fn day(date: Date) -> Self {
        let start = date.midnight().assume_utc();
        Self {
            start,
            end: start + Duration::DAY,
        }
    }

    /// `days` consecutive daily periods starting on `begin`
    pub fn daily(begin: Date, days: u32) -> BillingResult<Vec<Self>> {
        (0..days)
            .map(|offset| {
                begin
                    .checked_add(Duration::days(offset as i64))
                    .map(Self::day)
                    .ok_or_else(|| {
                        BillingError::InvalidPeriod(format!("{} + {} days overflows", begin, offset))
                    })
            })
            .collect()
    }

    /// Yesterday, relative to `now`: `[yesterday 00:00 UTC, today 00:00 UTC)`
    pub fn previous_day(now: OffsetDateTime) -> BillingResult<Self> {
        let today = now.to_offset(time::UtcOffset::UTC).date();
        let yesterday = today
            .previous_day()
            .ok_or_else(|| BillingError::InvalidPeriod(format!("no day before {}", today)))?;
        Ok(Self::day(yesterday))
    }

    /// Timestamp given to debits covering this period
    pub fn debit_timestamp(&self) -> OffsetDateTime {
        self.end - Duration::milliseconds(1)
    }

    pub fn contains(&self, at: OffsetDateTime) -> bool {
        self.start <= at && at < self.end
    }

    pub fn length(&self) -> Duration {
        self.end - self.start
    }
}

impl fmt::Display for BillingPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}
