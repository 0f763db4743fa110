// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::float_cmp))]

//! Stormeter Billing Module
//!
//! Turns metered storage and bandwidth usage into ledger debits, and pays out
//! referral credits once a referred user has spent enough.
//!
//! ## Features
//!
//! - **Usage Aggregation**: Per-user GB-hours and bytes downloaded per period
//! - **Debit Generation**: Bounded-concurrency submission with retry
//! - **Billing Runs**: Day-by-day backfills with optional removal of old debits
//! - **Referral Credits**: One credit per converted referral
//! - **Signed Ledger Client**: secp256k1-signed requests to a remote ledger
//! - **Invariants**: Read-only consistency checks over recent records

pub mod config;
pub mod debits;
pub mod driver;
pub mod error;
pub mod invariants;
pub mod ledger;
pub mod models;
pub mod period;
pub mod referrals;
pub mod signing;
pub mod store;
pub mod usage;


use std::sync::Arc;

use sqlx::PgPool;
use time::{Date, Duration, OffsetDateTime};
use tokio::sync::watch;

// Config
pub use config::{BillingConfig, LedgerConfig, Rates, RetryPolicy};

// Debits
pub use debits::{DebitCalculator, DebitReport, PassOutcome, SubmissionFailure};

// Driver
pub use driver::{BillingRunDriver, RunOptions, RunSummary, WindowReport};

// Error
pub use error::{BillingError, BillingResult};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Ledger
pub use ledger::{Ledger, LedgerClient, MirroredLedger};

// Models
pub use models::{
    BandwidthUsage, Credit, CreditReason, Debit, DebitKind, Referral, StorageUsage, UsageEvent,
    UsageKind, UserId,
};

// Period
pub use period::BillingPeriod;

// Referrals
pub use referrals::{ReferralCreditGenerator, ReferralReport};

// Signing
pub use signing::RequestSigner;

// Store
pub use store::{BillingStore, MemoryStore, PgStore};

// Usage
pub use usage::UsageAggregator;

/// Main billing service that combines the run driver, referral generator and
/// invariant checker over one store and ledger
pub struct BillingService {
    pub driver: BillingRunDriver,
    pub referrals: ReferralCreditGenerator,
    pub invariants: InvariantChecker,
    config: BillingConfig,
}

impl BillingService {
    /// Wire the service against Postgres. Debits go to the remote ledger
    /// when one is configured, otherwise straight into the database.
    pub fn from_config(config: BillingConfig, pool: PgPool) -> BillingResult<Self> {
        let pg = Arc::new(PgStore::new(pool));

        match config.ledger.clone() {
            Some(ledger) => {
                let signer = RequestSigner::from_hex(&ledger.private_key_hex)?;
                let client = LedgerClient::new(&ledger.url, signer, ledger.timeout)?;
                tracing::info!(
                    url = %ledger.url,
                    pubkey = %client.public_key_hex(),
                    "Using remote ledger"
                );
                Ok(Self::with_remote_ledger(config, pg, client))
            }
            None => {
                tracing::info!("No LEDGER_URL set, writing debits to the database");
                Ok(Self::new(config, pg.clone(), pg))
            }
        }
    }

    /// Submit to `client` and mirror every accepted record into `store`, so
    /// referral totals, removals and invariant checks see what was billed
    pub fn with_remote_ledger<S>(config: BillingConfig, store: Arc<S>, client: LedgerClient) -> Self
    where
        S: BillingStore + Ledger + 'static,
    {
        let ledger = MirroredLedger::new(Arc::new(client), store.clone());
        Self::new(config, store, Arc::new(ledger))
    }

    pub fn new(config: BillingConfig, store: Arc<dyn BillingStore>, ledger: Arc<dyn Ledger>) -> Self {
        let calculator = DebitCalculator::new(
            UsageAggregator::new(store.clone()),
            ledger.clone(),
            config.max_in_flight,
            config.retry,
        );

        Self {
            driver: BillingRunDriver::new(store.clone(), calculator, config.rates),
            referrals: ReferralCreditGenerator::new(store.clone(), ledger, config.retry),
            invariants: InvariantChecker::new(store),
            config,
        }
    }

    /// Stop billing runs at the next safe point once `shutdown` flips to true
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.driver = self.driver.with_shutdown(shutdown);
        self
    }

    pub fn config(&self) -> &BillingConfig {
        &self.config
    }

    /// Bill `days` UTC days starting at `begin`
    pub async fn run_debits(
        &self,
        begin: Date,
        days: u32,
        options: &RunOptions,
    ) -> BillingResult<RunSummary> {
        self.driver.run(begin, days, options).await
    }

    /// Bill the full UTC day before `now`
    pub async fn run_previous_day(&self, now: OffsetDateTime) -> BillingResult<WindowReport> {
        let period = BillingPeriod::previous_day(now)?;
        self.driver.run_window(&period, &RunOptions::default()).await
    }

    pub async fn generate_referral_credits(&self) -> BillingResult<ReferralReport> {
        self.referrals.generate().await
    }

    /// Check invariants over the configured lookback window ending at `now`
    pub async fn check_invariants(&self, now: OffsetDateTime) -> BillingResult<InvariantCheckSummary> {
        let since = now - Duration::days(self.config.invariant_lookback_days);
        self.invariants.run_all_checks(since, now).await
    }
}
