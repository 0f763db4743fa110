//! Debit generation
//!
//! Turns aggregated usage into debits and submits them to the ledger. Each
//! pass streams usage from the store and keeps at most `max_in_flight`
//! submissions running; a user's submission is retried on transient errors
//! and, if it still fails, recorded in the report without stopping the pass.

use std::sync::Arc;

use futures::{Stream, StreamExt};
use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinSet};
use tokio_retry::RetryIf;

use crate::config::RetryPolicy;
use crate::error::{BillingError, BillingResult};
use crate::ledger::Ledger;
use crate::models::{Debit, DebitKind, UserId};
use crate::period::BillingPeriod;
use crate::usage::UsageAggregator;

/// How a debit pass ended
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum PassOutcome {
    /// Every aggregated record was submitted (successfully or not)
    Completed,
    /// The store failed mid-stream; records before the failure were submitted
    AggregationFailed(String),
    /// Shutdown was requested; in-flight submissions were drained
    Interrupted,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubmissionFailure {
    pub user: UserId,
    pub error: String,
}

/// Result of one storage or bandwidth pass over a period
#[derive(Debug, Clone, Serialize)]
pub struct DebitReport {
    pub kind: DebitKind,
    #[serde(with = "time::serde::rfc3339")]
    pub period_start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub period_end: OffsetDateTime,
    pub submitted: usize,
    pub total_cents: f64,
    pub failures: Vec<SubmissionFailure>,
    pub outcome: PassOutcome,
}

impl DebitReport {
    fn new(kind: DebitKind, period: &BillingPeriod) -> Self {
        Self {
            kind,
            period_start: period.start,
            period_end: period.end,
            submitted: 0,
            total_cents: 0.0,
            failures: Vec::new(),
            outcome: PassOutcome::Completed,
        }
    }

    /// Users whose debit was attempted
    pub fn attempted(&self) -> usize {
        self.submitted + self.failures.len()
    }

    pub fn is_complete(&self) -> bool {
        self.outcome == PassOutcome::Completed
    }

    fn record(&mut self, joined: Result<(Debit, BillingResult<()>), JoinError>) {
        match joined {
            Ok((debit, Ok(()))) => {
                self.submitted += 1;
                self.total_cents += debit.amount_cents;
            }
            Ok((debit, Err(e))) => {
                tracing::error!(
                    user = %debit.user,
                    kind = debit.kind.as_str(),
                    amount_cents = debit.amount_cents,
                    error = %e,
                    "Failed to submit debit"
                );
                self.failures.push(SubmissionFailure {
                    user: debit.user,
                    error: e.to_string(),
                });
            }
            Err(e) => {
                tracing::error!(kind = self.kind.as_str(), error = %e, "Debit submission task failed");
                self.failures.push(SubmissionFailure {
                    user: "<unknown>".to_string(),
                    error: e.to_string(),
                });
            }
        }
    }
}

/// Converts per-user usage into debits
#[derive(Clone)]
pub struct DebitCalculator {
    aggregator: UsageAggregator,
    ledger: Arc<dyn Ledger>,
    max_in_flight: usize,
    retry: RetryPolicy,
    shutdown: Option<watch::Receiver<bool>>,
}

impl DebitCalculator {
    pub fn new(
        aggregator: UsageAggregator,
        ledger: Arc<dyn Ledger>,
        max_in_flight: usize,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            aggregator,
            ledger,
            max_in_flight: max_in_flight.max(1),
            retry,
            shutdown: None,
        }
    }

    /// Stop pulling usage once `shutdown` flips to true
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Storage debits for `period`: GB-hours × `cents_per_gb_hour`
    pub async fn for_storage(&self, period: &BillingPeriod, cents_per_gb_hour: f64) -> DebitReport {
        let now = OffsetDateTime::now_utc();
        let usage = self
            .aggregator
            .storage(period, now)
            .map(|item| item.map(|usage| (usage.user, usage.gb_hours)));
        self.submit_all(DebitKind::Storage, period, cents_per_gb_hour, usage)
            .await
    }

    /// Bandwidth debits for `period`: GB downloaded × `cents_per_gb`
    pub async fn for_bandwidth(&self, period: &BillingPeriod, cents_per_gb: f64) -> DebitReport {
        let usage = self
            .aggregator
            .bandwidth(period)
            .map(|item| {
                item.map(|usage| {
                    let gigabytes = usage.gigabytes();
                    (usage.user, gigabytes)
                })
            });
        self.submit_all(DebitKind::Bandwidth, period, cents_per_gb, usage)
            .await
    }

    async fn submit_all(
        &self,
        kind: DebitKind,
        period: &BillingPeriod,
        rate_cents: f64,
        usage: impl Stream<Item = BillingResult<(UserId, f64)>>,
    ) -> DebitReport {
        let mut report = DebitReport::new(kind, period);
        let mut in_flight = JoinSet::new();
        let mut usage = std::pin::pin!(usage);

        let mut shutdown = self.shutdown.clone();

        loop {
            let next = match shutdown.as_mut() {
                Some(rx) => tokio::select! {
                    biased;
                    _ = shutdown_signal(rx) => None,
                    item = usage.next() => Some(item),
                },
                None => Some(usage.next().await),
            };

            let Some(next) = next else {
                tracing::warn!(kind = kind.as_str(), period = %period, "Shutdown requested, draining debit submissions");
                report.outcome = PassOutcome::Interrupted;
                break;
            };

            let (user, quantity) = match next {
                Some(Ok(record)) => record,
                Some(Err(e)) => {
                    report.outcome = PassOutcome::AggregationFailed(e.to_string());
                    break;
                }
                None => break,
            };

            // Zero amounts are still submitted so a re-run at a zero rate
            // overwrites the debit an earlier run left for the same period
            let amount_cents = quantity * rate_cents;
            if !amount_cents.is_finite() || amount_cents < 0.0 {
                tracing::warn!(user = %user, kind = kind.as_str(), amount_cents, "Skipping invalid debit amount");
                continue;
            }

            while in_flight.len() >= self.max_in_flight {
                if let Some(joined) = in_flight.join_next().await {
                    report.record(joined);
                }
            }

            let debit = Debit::for_period(user, kind, amount_cents, period);
            let ledger = self.ledger.clone();
            let retry = self.retry;
            in_flight.spawn(async move {
                let result = submit_debit(ledger.as_ref(), &debit, retry).await;
                (debit, result)
            });
        }

        while let Some(joined) = in_flight.join_next().await {
            report.record(joined);
        }

        tracing::info!(
            kind = kind.as_str(),
            period = %period,
            submitted = report.submitted,
            failed = report.failures.len(),
            total_cents = report.total_cents,
            outcome = ?report.outcome,
            "Debit pass complete"
        );

        report
    }
}

/// Resolves once shutdown is requested. Never resolves if the sender is gone.
async fn shutdown_signal(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Submit one debit, retrying transient ledger errors
pub async fn submit_debit(ledger: &dyn Ledger, debit: &Debit, retry: RetryPolicy) -> BillingResult<()> {
    RetryIf::spawn(
        retry.delays(),
        || ledger.create_debit(debit),
        |e: &BillingError| {
            let retryable = e.is_retryable();
            if retryable {
                tracing::warn!(user = %debit.user, error = %e, "Retrying debit submission");
            }
            retryable
        },
    )
    .await
}
