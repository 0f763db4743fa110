//! Store wrapper for exercising failure paths in tests

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use time::OffsetDateTime;
use uuid::Uuid;

use super::{BillingStore, MemoryStore};
use crate::error::{BillingError, BillingResult};
use crate::models::{BandwidthUsage, Credit, Debit, Referral, StorageUsage};
use crate::period::BillingPeriod;

/// Delegates to a [MemoryStore], except that usage streams can be made to
/// hang and conversion marks can be made to fail
pub(crate) struct FaultyStore {
    pub inner: Arc<MemoryStore>,
    /// Usage streams never yield
    pub stall_usage: bool,
    /// Number of upcoming `mark_referral_converted` calls that fail
    pub failing_marks: AtomicUsize,
}

impl FaultyStore {
    pub fn new(inner: Arc<MemoryStore>) -> Self {
        Self {
            inner,
            stall_usage: false,
            failing_marks: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl BillingStore for FaultyStore {
    fn storage_usage(
        &self,
        period: BillingPeriod,
        now: OffsetDateTime,
    ) -> BoxStream<'_, BillingResult<StorageUsage>> {
        if self.stall_usage {
            return stream::pending().boxed();
        }
        self.inner.storage_usage(period, now)
    }

    fn bandwidth_usage(&self, period: BillingPeriod) -> BoxStream<'_, BillingResult<BandwidthUsage>> {
        if self.stall_usage {
            return stream::pending().boxed();
        }
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

    async fn mark_referral_converted(&self, id: Uuid, at: OffsetDateTime) -> BillingResult<bool> {
        if self
            .failing_marks
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(BillingError::Database(sqlx::Error::PoolTimedOut));
        }
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
