//! Billing configuration
//!
//! Read from environment variables. Binaries load `.env` with `dotenvy`
//! before calling [`BillingConfig::from_env`].

use std::str::FromStr;
use std::time::Duration;

use tokio_retry::strategy::{jitter, ExponentialBackoff};

use crate::error::{BillingError, BillingResult};

/// 1.5 cents per GB-month spread over 730 hours
pub const DEFAULT_STORAGE_CENTS_PER_GB_HOUR: f64 = 1.5 / 730.0;
pub const DEFAULT_BANDWIDTH_CENTS_PER_GB: f64 = 5.0;
pub const DEFAULT_MAX_IN_FLIGHT: usize = 16;
pub const DEFAULT_RETRY_ATTEMPTS: usize = 3;
pub const DEFAULT_RETRY_BASE_MS: u64 = 200;
pub const DEFAULT_LEDGER_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_INVARIANT_LOOKBACK_DAYS: i64 = 7;

/// Per-unit prices
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rates {
    pub storage_cents_per_gb_hour: f64,
    pub bandwidth_cents_per_gb: f64,
}

impl Default for Rates {
    fn default() -> Self {
        Self {
            storage_cents_per_gb_hour: DEFAULT_STORAGE_CENTS_PER_GB_HOUR,
            bandwidth_cents_per_gb: DEFAULT_BANDWIDTH_CENTS_PER_GB,
        }
    }
}

/// Bounded retry for ledger submissions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub attempts: usize,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_RETRY_ATTEMPTS,
            base_delay: Duration::from_millis(DEFAULT_RETRY_BASE_MS),
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            attempts: 1,
            base_delay: Duration::ZERO,
        }
    }

    /// Delays between attempts: base, 2x base, 4x base... capped at 30s, jittered
    pub fn delays(&self) -> impl Iterator<Item = Duration> {
        let half_base_ms = (self.base_delay.as_millis() as u64 / 2).max(1);
        ExponentialBackoff::from_millis(2)
            .factor(half_base_ms)
            .max_delay(Duration::from_secs(30))
            .map(jitter)
            .take(self.attempts.saturating_sub(1))
    }
}

/// Remote ledger connection settings
#[derive(Clone)]
pub struct LedgerConfig {
    pub url: String,
    pub private_key_hex: String,
    pub timeout: Duration,
}

impl std::fmt::Debug for LedgerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedgerConfig")
            .field("url", &self.url)
            .field("private_key_hex", &"<redacted>")
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct BillingConfig {
    pub database_url: String,
    pub rates: Rates,
    /// `None` writes debits and credits straight to the database
    pub ledger: Option<LedgerConfig>,
    pub max_in_flight: usize,
    pub retry: RetryPolicy,
    pub invariant_lookback_days: i64,
}

impl BillingConfig {
    pub fn from_env() -> BillingResult<Self> {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> BillingResult<Self> {
        let database_url = var("DATABASE_URL")
            .filter(|v| !v.is_empty())
            .ok_or_else(|| BillingError::Config("DATABASE_URL must be set".to_string()))?;

        let rates = Rates {
            storage_cents_per_gb_hour: parse_or(
                &var,
                "STORAGE_CENTS_PER_GB_HOUR",
                DEFAULT_STORAGE_CENTS_PER_GB_HOUR,
            )?,
            bandwidth_cents_per_gb: parse_or(
                &var,
                "BANDWIDTH_CENTS_PER_GB",
                DEFAULT_BANDWIDTH_CENTS_PER_GB,
            )?,
        };
        if rates.storage_cents_per_gb_hour < 0.0 || rates.bandwidth_cents_per_gb < 0.0 {
            return Err(BillingError::Config("rates must not be negative".to_string()));
        }

        let ledger = match var("LEDGER_URL").filter(|v| !v.is_empty()) {
            Some(url) => Some(LedgerConfig {
                url,
                private_key_hex: var("LEDGER_PRIVATE_KEY")
                    .filter(|v| !v.is_empty())
                    .ok_or_else(|| {
                        BillingError::Config(
                            "LEDGER_PRIVATE_KEY must be set when LEDGER_URL is".to_string(),
                        )
                    })?,
                timeout: Duration::from_secs(parse_or(
                    &var,
                    "LEDGER_TIMEOUT_SECS",
                    DEFAULT_LEDGER_TIMEOUT_SECS,
                )?),
            }),
            None => None,
        };

        let max_in_flight = parse_or(&var, "BILLING_MAX_IN_FLIGHT", DEFAULT_MAX_IN_FLIGHT)?;
        if max_in_flight == 0 {
            return Err(BillingError::Config(
                "BILLING_MAX_IN_FLIGHT must be at least 1".to_string(),
            ));
        }

        let retry = RetryPolicy {
            attempts: parse_or(&var, "BILLING_RETRY_ATTEMPTS", DEFAULT_RETRY_ATTEMPTS)?.max(1),
            base_delay: Duration::from_millis(parse_or(
                &var,
                "BILLING_RETRY_BASE_MS",
                DEFAULT_RETRY_BASE_MS,
            )?),
        };

        Ok(Self {
            database_url,
            rates,
            ledger,
            max_in_flight,
            retry,
            invariant_lookback_days: parse_or(
                &var,
                "INVARIANT_LOOKBACK_DAYS",
                DEFAULT_INVARIANT_LOOKBACK_DAYS,
            )?,
        })
    }
}

fn parse_or<T: FromStr>(
    var: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: T,
) -> BillingResult<T>
where
    T::Err: std::fmt::Display,
{
    match var(name).filter(|v| !v.is_empty()) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| BillingError::Config(format!("{} is invalid ({}): {}", name, raw, e))),
        None => Ok(default),
    }
}
