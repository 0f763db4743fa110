//! Usage aggregation
//!
//! Reduces raw usage events to per-user totals for a billing period. The
//! Postgres store runs the same arithmetic server side; the functions here are
//! the reference used by the in-memory store and by tests.
//!
//! Storage is billed per event on the closed-interval intersection of the
//! event's lifetime with the period, so data created or deleted mid-period is
//! pro-rated:
//!
//! ```text
//! effective_end = min(ended_at, now)            (now if still stored)
//! overlap_ms    = max(0, min(effective_end, period.end) - max(occurred_at, period.start) + 1)
//! gb_hours      = size_bytes / 1e9 * overlap_ms / 3_600_000
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::stream::BoxStream;
use futures::StreamExt;
use time::OffsetDateTime;

use crate::error::BillingResult;
use crate::models::{BandwidthUsage, StorageUsage, UsageEvent, UsageKind, BYTES_PER_GB};
use crate::period::BillingPeriod;
use crate::store::BillingStore;

pub const MS_PER_HOUR: f64 = 3_600_000.0;

/// Milliseconds of `[occurred_at, effective_end]` inside `period`, never negative
pub fn billable_overlap_ms(
    occurred_at: OffsetDateTime,
    ended_at: Option<OffsetDateTime>,
    period: &BillingPeriod,
    now: OffsetDateTime,
) -> i64 {
    let effective_end = match ended_at {
        Some(ended_at) => ended_at.min(now),
        None => now,
    };
    let start = occurred_at.max(period.start);
    let end = effective_end.min(period.end);
    let overlap = (end - start).whole_milliseconds() + 1;
    overlap.max(0) as i64
}

/// GB-hours one event contributes to `period`
pub fn storage_gb_hours(event: &UsageEvent, period: &BillingPeriod, now: OffsetDateTime) -> f64 {
    if event.kind != UsageKind::Storage || !event.is_billable() {
        return 0.0;
    }
    let overlap_ms = billable_overlap_ms(event.occurred_at, event.ended_at, period, now);
    (event.size_bytes as f64 / BYTES_PER_GB) * (overlap_ms as f64 / MS_PER_HOUR)
}

/// Per-user GB-hours, ordered by user; users with nothing billable are omitted
pub fn aggregate_storage<'a>(
    events: impl IntoIterator<Item = &'a UsageEvent>,
    period: &BillingPeriod,
    now: OffsetDateTime,
) -> Vec<StorageUsage> {
    let mut totals: BTreeMap<&str, f64> = BTreeMap::new();
    for event in events {
        let gb_hours = storage_gb_hours(event, period, now);
        if gb_hours <= 0.0 {
            continue;
        }
        if let Some(user) = event.user.as_deref() {
            *totals.entry(user).or_default() += gb_hours;
        }
    }
    totals
        .into_iter()
        .map(|(user, gb_hours)| StorageUsage {
            user: user.to_string(),
            gb_hours,
        })
        .collect()
}

/// Per-user bytes downloaded with `occurred_at` inside `period`
pub fn aggregate_bandwidth<'a>(
    events: impl IntoIterator<Item = &'a UsageEvent>,
    period: &BillingPeriod,
) -> Vec<BandwidthUsage> {
    let mut totals: BTreeMap<&str, i64> = BTreeMap::new();
    for event in events {
        if event.kind != UsageKind::Bandwidth
            || !event.is_billable()
            || !period.contains(event.occurred_at)
        {
            continue;
        }
        if let Some(user) = event.user.as_deref() {
            *totals.entry(user).or_default() += event.size_bytes;
        }
    }
    totals
        .into_iter()
        .map(|(user, bytes)| BandwidthUsage {
            user: user.to_string(),
            bytes,
        })
        .collect()
}

/// Streams per-user usage out of the aggregation store
#[derive(Clone)]
pub struct UsageAggregator {
    store: Arc<dyn BillingStore>,
}

impl UsageAggregator {
    pub fn new(store: Arc<dyn BillingStore>) -> Self {
        Self { store }
    }

    /// Per-user GB-hours for `period`; events still stored are billed up to `now`
    pub fn storage(
        &self,
        period: &BillingPeriod,
        now: OffsetDateTime,
    ) -> BoxStream<'_, BillingResult<StorageUsage>> {
        let period = *period;
        self.store
            .storage_usage(period, now)
            .inspect(move |item| {
                if let Err(e) = item {
                    tracing::error!(period = %period, error = %e, "Storage aggregation failed");
                }
            })
            .boxed()
    }

    /// Per-user bytes downloaded during `period`
    pub fn bandwidth(&self, period: &BillingPeriod) -> BoxStream<'_, BillingResult<BandwidthUsage>> {
        let period = *period;
        self.store
            .bandwidth_usage(period)
            .inspect(move |item| {
                if let Err(e) = item {
                    tracing::error!(period = %period, error = %e, "Bandwidth aggregation failed");
                }
            })
            .boxed()
    }
}
