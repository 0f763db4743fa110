//! Billing run driver
//!
//! Walks consecutive UTC days one at a time. Within a day the storage and
//! bandwidth passes run side by side; the next day starts only after both
//! have settled.

use std::sync::Arc;

use serde::Serialize;
use time::{Date, OffsetDateTime};
use tokio::sync::watch;

use crate::config::Rates;
use crate::debits::{DebitCalculator, DebitReport, PassOutcome};
use crate::error::{BillingError, BillingResult};
use crate::period::BillingPeriod;
use crate::store::BillingStore;

#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Delete existing storage/bandwidth debits in each window first
    pub remove_existing: bool,
    /// Treat any per-user submission failure as fatal for the run
    pub fail_on_submission_errors: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct WindowReport {
    #[serde(with = "time::serde::rfc3339")]
    pub period_start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub period_end: OffsetDateTime,
    pub removed: u64,
    pub storage: DebitReport,
    pub bandwidth: DebitReport,
}

impl WindowReport {
    pub fn failed_submissions(&self) -> usize {
        self.storage.failures.len() + self.bandwidth.failures.len()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub windows: Vec<WindowReport>,
}

impl RunSummary {
    pub fn submitted(&self) -> usize {
        self.windows
            .iter()
            .map(|w| w.storage.submitted + w.bandwidth.submitted)
            .sum()
    }

    pub fn failed_submissions(&self) -> usize {
        self.windows.iter().map(WindowReport::failed_submissions).sum()
    }

    pub fn total_cents(&self) -> f64 {
        self.windows
            .iter()
            .map(|w| w.storage.total_cents + w.bandwidth.total_cents)
            .sum()
    }
}

pub struct BillingRunDriver {
    store: Arc<dyn BillingStore>,
    calculator: DebitCalculator,
    rates: Rates,
    shutdown: Option<watch::Receiver<bool>>,
}

impl BillingRunDriver {
    pub fn new(store: Arc<dyn BillingStore>, calculator: DebitCalculator, rates: Rates) -> Self {
        Self {
            store,
            calculator,
            rates,
            shutdown: None,
        }
    }

    /// Stop between windows, and drain the current one, once `shutdown` flips
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.calculator = self.calculator.with_shutdown(shutdown.clone());
        self.shutdown = Some(shutdown);
        self
    }

    fn shutdown_requested(&self) -> bool {
        self.shutdown.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Bill `days` consecutive days starting at midnight UTC on `begin`
    pub async fn run(&self, begin: Date, days: u32, options: &RunOptions) -> BillingResult<RunSummary> {
        let periods = BillingPeriod::daily(begin, days)?;
        tracing::info!(
            begin = %begin,
            days = days,
            remove_existing = options.remove_existing,
            "Starting billing run"
        );

        let mut summary = RunSummary::default();
        for period in periods {
            if self.shutdown_requested() {
                tracing::warn!(next_period = %period, "Billing run stopped by shutdown");
                return Err(BillingError::Interrupted);
            }
            let window = self.run_window(&period, options).await?;
            summary.windows.push(window);
        }

        tracing::info!(
            windows = summary.windows.len(),
            submitted = summary.submitted(),
            failed = summary.failed_submissions(),
            total_cents = summary.total_cents(),
            "Billing run complete"
        );
        Ok(summary)
    }

    /// Bill a single period
    pub async fn run_window(
        &self,
        period: &BillingPeriod,
        options: &RunOptions,
    ) -> BillingResult<WindowReport> {
        let removed = if options.remove_existing {
            let removed = self.store.remove_debits(*period).await?;
            tracing::warn!(period = %period, removed = removed, "Removed existing debits");
            removed
        } else {
            0
        };

        let (storage, bandwidth) = tokio::join!(
            self.calculator
                .for_storage(period, self.rates.storage_cents_per_gb_hour),
            self.calculator
                .for_bandwidth(period, self.rates.bandwidth_cents_per_gb),
        );

        for report in [&storage, &bandwidth] {
            match &report.outcome {
                PassOutcome::Completed => {}
                PassOutcome::Interrupted => return Err(BillingError::Interrupted),
                PassOutcome::AggregationFailed(reason) => {
                    return Err(BillingError::Aggregation(format!(
                        "{} usage for {}: {}",
                        report.kind.as_str(),
                        period,
                        reason
                    )))
                }
            }
        }

        let window = WindowReport {
            period_start: period.start,
            period_end: period.end,
            removed,
            storage,
            bandwidth,
        };

        if options.fail_on_submission_errors && window.failed_submissions() > 0 {
            return Err(BillingError::SubmissionsFailed {
                failed: window.failed_submissions(),
                period: period.to_string(),
            });
        }

        Ok(window)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryPolicy;
    use crate::ledger::Ledger;
    use crate::models::{
        BandwidthUsage, Credit, Debit, DebitKind, Referral, StorageUsage, UsageEvent, UsageKind,
    };
    use crate::store::MemoryStore;
    use crate::usage::UsageAggregator;
    use async_trait::async_trait;
    use futures::stream::{self, BoxStream};
    use futures::StreamExt;
    use time::macros::{date, datetime};
    use uuid::Uuid;

    const GB: i64 = 1_000_000_000;

    fn driver(store: &Arc<MemoryStore>) -> BillingRunDriver {
        let calculator = DebitCalculator::new(
            UsageAggregator::new(store.clone()),
            store.clone(),
            4,
            RetryPolicy::none(),
        );
        BillingRunDriver::new(
            store.clone(),
            calculator,
            Rates {
                storage_cents_per_gb_hour: 0.2,
                bandwidth_cents_per_gb: 5.0,
            },
        )
    }

    async fn seed(store: &MemoryStore) {
        for day in 1..=3u8 {
            let at = Date::from_calendar_date(2024, time::Month::March, day)
                .unwrap()
                .with_hms(12, 0, 0)
                .unwrap()
                .assume_utc();
            store
                .record_usage(UsageEvent {
                    user: Some("a@example.com".to_string()),
                    kind: UsageKind::Bandwidth,
                    success: true,
                    size_bytes: GB,
                    occurred_at: at,
                    ended_at: None,
                })
                .await;
        }
        store
            .record_usage(UsageEvent {
                user: Some("a@example.com".to_string()),
                kind: UsageKind::Storage,
                success: true,
                size_bytes: GB,
                occurred_at: datetime!(2024-03-01 00:00 UTC),
                ended_at: Some(datetime!(2024-03-02 23:00 UTC)),
            })
            .await;
    }

    #[tokio::test]
    async fn test_runs_each_day_in_order() {
        let store = Arc::new(MemoryStore::new());
        seed(&store).await;

        let summary = driver(&store)
            .run(date!(2024 - 03 - 01), 3, &RunOptions::default())
            .await
            .unwrap();

        assert_eq!(summary.windows.len(), 3);
        for pair in summary.windows.windows(2) {
            assert_eq!(pair[0].period_end, pair[1].period_start);
        }
        // storage on the first two days only, bandwidth every day
        assert_eq!(summary.submitted(), 5);
        let debits = store.debits().await;
        assert_eq!(debits.len(), 5);
        assert!(debits
            .iter()
            .all(|d| d.created_at == d.period_end - time::Duration::milliseconds(1)));
    }

    #[tokio::test]
    async fn test_rerun_same_window_keeps_one_debit_per_kind() {
        let store = Arc::new(MemoryStore::new());
        seed(&store).await;
        let driver = driver(&store);

        driver
            .run(date!(2024 - 03 - 01), 1, &RunOptions::default())
            .await
            .unwrap();
        driver
            .run(date!(2024 - 03 - 01), 1, &RunOptions::default())
            .await
            .unwrap();

        let debits = store.debits().await;
        assert_eq!(debits.len(), 2);
        assert_eq!(
            debits.iter().filter(|d| d.kind == DebitKind::Storage).count(),
            1
        );
    }

    #[tokio::test]
    async fn test_remove_existing_clears_window_first() {
        let store = Arc::new(MemoryStore::new());
        seed(&store).await;
        let period = BillingPeriod::day(date!(2024 - 03 - 01));
        // stale debit from an old rate, different period bounds
        store
            .create_debit(&Debit {
                user: "a@example.com".to_string(),
                kind: DebitKind::Storage,
                amount_cents: 99.0,
                created_at: datetime!(2024-03-01 06:00 UTC),
                period_start: datetime!(2024-03-01 00:00 UTC),
                period_end: datetime!(2024-03-01 12:00 UTC),
            })
            .await
            .unwrap();

        let report = driver(&store)
            .run_window(
                &period,
                &RunOptions {
                    remove_existing: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(report.removed, 1);
        assert!(store.debits().await.iter().all(|d| d.amount_cents != 99.0));
    }

    #[tokio::test]
    async fn test_zero_days_is_a_no_op() {
        let store = Arc::new(MemoryStore::new());
        seed(&store).await;

        let summary = driver(&store)
            .run(date!(2024 - 03 - 01), 0, &RunOptions::default())
            .await
            .unwrap();
        assert!(summary.windows.is_empty());
        assert!(store.debits().await.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_before_first_window() {
        let store = Arc::new(MemoryStore::new());
        seed(&store).await;
        let (tx, rx) = watch::channel(false);
        let driver = driver(&store).with_shutdown(rx);
        tx.send(true).unwrap();

        let result = driver
            .run(date!(2024 - 03 - 01), 3, &RunOptions::default())
            .await;
        assert!(matches!(result, Err(BillingError::Interrupted)));
        assert!(store.debits().await.is_empty());
    }

    /// Store whose storage aggregation dies after the first user
    struct BrokenStore {
        inner: Arc<MemoryStore>,
    }

    #[async_trait]
    impl BillingStore for BrokenStore {
        fn storage_usage(
            &self,
            _period: BillingPeriod,
            _now: OffsetDateTime,
        ) -> BoxStream<'_, BillingResult<StorageUsage>> {
            stream::iter(vec![
                Ok(StorageUsage {
                    user: "a@example.com".to_string(),
                    gb_hours: 10.0,
                }),
                Err(BillingError::Aggregation("connection reset".to_string())),
                Ok(StorageUsage {
                    user: "b@example.com".to_string(),
                    gb_hours: 10.0,
                }),
            ])
            .boxed()
        }

        fn bandwidth_usage(
            &self,
            period: BillingPeriod,
        ) -> BoxStream<'_, BillingResult<BandwidthUsage>> {
            self.inner.bandwidth_usage(period)
        }

        async fn remove_debits(&self, period: BillingPeriod) -> BillingResult<u64> {
            self.inner.remove_debits(period).await
        }

        async fn pending_referrals(&self) -> BillingResult<Vec<Referral>> {
            self.inner.pending_referrals().await
        }

        async fn total_billed_cents(&self, user: &str) -> BillingResult<f64> {
            self.inner.total_billed_cents(user).await
        }

        async fn mark_referral_converted(
            &self,
            id: Uuid,
            at: OffsetDateTime,
        ) -> BillingResult<bool> {
            self.inner.mark_referral_converted(id, at).await
        }

        async fn referral(&self, id: Uuid) -> BillingResult<Option<Referral>> {
            self.inner.referral(id).await
        }

        async fn referrals_converted_between(
            &self,
            since: OffsetDateTime,
            until: OffsetDateTime,
        ) -> BillingResult<Vec<Referral>> {
            self.inner.referrals_converted_between(since, until).await
        }

        async fn debits_between(
            &self,
            since: OffsetDateTime,
            until: OffsetDateTime,
        ) -> BillingResult<Vec<Debit>> {
            self.inner.debits_between(since, until).await
        }

        async fn credits_between(
            &self,
            since: OffsetDateTime,
            until: OffsetDateTime,
        ) -> BillingResult<Vec<Credit>> {
            self.inner.credits_between(since, until).await
        }
    }

    #[tokio::test]
    async fn test_aggregation_failure_is_fatal_but_keeps_partial_work() {
        let memory = Arc::new(MemoryStore::new());
        seed(&memory).await;
        let store: Arc<dyn BillingStore> = Arc::new(BrokenStore {
            inner: memory.clone(),
        });
        let ledger: Arc<dyn Ledger> = memory.clone();
        let calculator = DebitCalculator::new(
            UsageAggregator::new(store.clone()),
            ledger,
            4,
            RetryPolicy::none(),
        );
        let driver = BillingRunDriver::new(store, calculator, Rates::default());

        let result = driver
            .run(date!(2024 - 03 - 01), 2, &RunOptions::default())
            .await;

        assert!(matches!(result, Err(BillingError::Aggregation(_))));
        let debits = memory.debits().await;
        // a@ storage from before the failure, plus the bandwidth pass; day 2 never ran
        assert_eq!(debits.len(), 2);
        assert!(debits.iter().all(|d| d.user == "a@example.com"));
        assert!(debits
            .iter()
            .all(|d| d.period_start == datetime!(2024-03-01 00:00 UTC)));
    }

    #[tokio::test]
    async fn test_submission_failures_fatal_when_requested() {
        struct RejectingLedger;

        #[async_trait]
        impl Ledger for RejectingLedger {
            async fn create_debit(&self, _debit: &Debit) -> BillingResult<()> {
                Err(BillingError::LedgerRejected {
                    status: 400,
                    body: "rejected".to_string(),
                })
            }

            async fn create_credit(&self, _credit: &Credit) -> BillingResult<()> {
                Ok(())
            }
        }

        let store = Arc::new(MemoryStore::new());
        seed(&store).await;
        let calculator = DebitCalculator::new(
            UsageAggregator::new(store.clone()),
            Arc::new(RejectingLedger),
            4,
            RetryPolicy::none(),
        );
        let driver = BillingRunDriver::new(store.clone(), calculator, Rates::default());
        let period = BillingPeriod::day(date!(2024 - 03 - 01));

        let lenient = driver
            .run_window(&period, &RunOptions::default())
            .await
            .unwrap();
        assert_eq!(lenient.failed_submissions(), 2);

        let strict = driver
            .run_window(
                &period,
                &RunOptions {
                    fail_on_submission_errors: true,
                    ..Default::default()
                },
            )
            .await;
        assert!(matches!(
            strict,
            Err(BillingError::SubmissionsFailed { failed: 2, .. })
        ));
    }
}
