//! Aggregation store
//!
//! Everything the billing engine reads: usage events reduced to per-user
//! totals, debits and credits already in the ledger, and referral state.

mod memory;
mod postgres;
#[cfg(test)]
pub(crate) mod testing;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use futures::stream::BoxStream;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::models::{BandwidthUsage, Credit, Debit, Referral, StorageUsage};
use crate::period::BillingPeriod;

#[async_trait]
pub trait BillingStore: Send + Sync {
    /// Per-user GB-hours for `period`, computed by the store. An `Err` item
    /// ends the stream; items before it are valid.
    fn storage_usage(
        &self,
        period: BillingPeriod,
        now: OffsetDateTime,
    ) -> BoxStream<'_, BillingResult<StorageUsage>>;

    /// Per-user bytes downloaded during `period`
    fn bandwidth_usage(&self, period: BillingPeriod) -> BoxStream<'_, BillingResult<BandwidthUsage>>;

    /// Delete storage and bandwidth debits stamped inside `period`
    async fn remove_debits(&self, period: BillingPeriod) -> BillingResult<u64>;

    /// Referrals whose recipient signed up, that have not converted, and for
    /// which the sender holds no credit yet
    async fn pending_referrals(&self) -> BillingResult<Vec<Referral>>;

    /// Sum of every debit ever billed to `user`
    async fn total_billed_cents(&self, user: &str) -> BillingResult<f64>;

    /// Mark a referral converted. Returns false when it was already converted.
    async fn mark_referral_converted(&self, id: Uuid, at: OffsetDateTime) -> BillingResult<bool>;

    async fn referral(&self, id: Uuid) -> BillingResult<Option<Referral>>;

    /// Referrals converted in `[since, until)`
    async fn referrals_converted_between(
        &self,
        since: OffsetDateTime,
        until: OffsetDateTime,
    ) -> BillingResult<Vec<Referral>>;

    /// Debits created in `[since, until)`
    async fn debits_between(
        &self,
        since: OffsetDateTime,
        until: OffsetDateTime,
    ) -> BillingResult<Vec<Debit>>;

    /// Credits created in `[since, until)`
    async fn credits_between(
        &self,
        since: OffsetDateTime,
        until: OffsetDateTime,
    ) -> BillingResult<Vec<Credit>>;
}
