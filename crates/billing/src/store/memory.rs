use std::collections::HashSet;

use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::BillingStore;
use crate::error::BillingResult;
use crate::ledger::Ledger;
use crate::models::{
    BandwidthUsage, Credit, CreditReason, Debit, DebitKind, Referral, StorageUsage, UsageEvent,
};
use crate::period::BillingPeriod;
use crate::usage::{aggregate_bandwidth, aggregate_storage};

#[derive(Debug, Default)]
struct MemoryState {
    events: Vec<UsageEvent>,
    debits: Vec<Debit>,
    credits: Vec<Credit>,
    referrals: Vec<Referral>,
}

/// Store and ledger held in process memory, for development and tests.
///
/// Debits are upserted on their idempotency key, like the Postgres ledger.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record_usage(&self, event: UsageEvent) {
        self.state.write().await.events.push(event);
    }

    pub async fn add_referral(&self, referral: Referral) {
        self.state.write().await.referrals.push(referral);
    }

    pub async fn debits(&self) -> Vec<Debit> {
        self.state.read().await.debits.clone()
    }

    pub async fn credits(&self) -> Vec<Credit> {
        self.state.read().await.credits.clone()
    }

    pub async fn referrals(&self) -> Vec<Referral> {
        self.state.read().await.referrals.clone()
    }
}

#[async_trait]
impl BillingStore for MemoryStore {
    fn storage_usage(
        &self,
        period: BillingPeriod,
        now: OffsetDateTime,
    ) -> BoxStream<'_, BillingResult<StorageUsage>> {
        stream::once(async move {
            let state = self.state.read().await;
            aggregate_storage(&state.events, &period, now)
        })
        .flat_map(|rows| stream::iter(rows.into_iter().map(Ok)))
        .boxed()
    }

    fn bandwidth_usage(&self, period: BillingPeriod) -> BoxStream<'_, BillingResult<BandwidthUsage>> {
        stream::once(async move {
            let state = self.state.read().await;
            aggregate_bandwidth(&state.events, &period)
        })
        .flat_map(|rows| stream::iter(rows.into_iter().map(Ok)))
        .boxed()
    }

    async fn remove_debits(&self, period: BillingPeriod) -> BillingResult<u64> {
        let mut state = self.state.write().await;
        let before = state.debits.len();
        state.debits.retain(|debit| {
            !(period.contains(debit.created_at)
                && matches!(debit.kind, DebitKind::Storage | DebitKind::Bandwidth))
        });
        Ok((before - state.debits.len()) as u64)
    }

    async fn pending_referrals(&self) -> BillingResult<Vec<Referral>> {
        let state = self.state.read().await;
        let credited: HashSet<(Uuid, &str)> = state
            .credits
            .iter()
            .filter_map(|credit| {
                credit
                    .referral_id
                    .map(|referral_id| (referral_id, credit.user.as_str()))
            })
            .collect();

        Ok(state
            .referrals
            .iter()
            .filter(|referral| referral.is_pending())
            .filter(|referral| !credited.contains(&(referral.id, referral.sender.as_str())))
            .cloned()
            .collect())
    }

    async fn total_billed_cents(&self, user: &str) -> BillingResult<f64> {
        let state = self.state.read().await;
        Ok(state
            .debits
            .iter()
            .filter(|debit| debit.user == user)
            .map(|debit| debit.amount_cents)
            .sum())
    }

    async fn mark_referral_converted(&self, id: Uuid, at: OffsetDateTime) -> BillingResult<bool> {
        let mut state = self.state.write().await;
        match state
            .referrals
            .iter_mut()
            .find(|referral| referral.id == id && referral.converted_at.is_none())
        {
            Some(referral) => {
                referral.converted_at = Some(at);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn referral(&self, id: Uuid) -> BillingResult<Option<Referral>> {
        let state = self.state.read().await;
        Ok(state.referrals.iter().find(|r| r.id == id).cloned())
    }

    async fn referrals_converted_between(
        &self,
        since: OffsetDateTime,
        until: OffsetDateTime,
    ) -> BillingResult<Vec<Referral>> {
        let state = self.state.read().await;
        Ok(state
            .referrals
            .iter()
            .filter(|r| r.converted_at.is_some_and(|at| since <= at && at < until))
            .cloned()
            .collect())
    }

    async fn debits_between(
        &self,
        since: OffsetDateTime,
        until: OffsetDateTime,
    ) -> BillingResult<Vec<Debit>> {
        let state = self.state.read().await;
        Ok(state
            .debits
            .iter()
            .filter(|d| since <= d.created_at && d.created_at < until)
            .cloned()
            .collect())
    }

    async fn credits_between(
        &self,
        since: OffsetDateTime,
        until: OffsetDateTime,
    ) -> BillingResult<Vec<Credit>> {
        let state = self.state.read().await;
        Ok(state
            .credits
            .iter()
            .filter(|c| since <= c.created_at && c.created_at < until)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl Ledger for MemoryStore {
    async fn create_debit(&self, debit: &Debit) -> BillingResult<()> {
        let mut state = self.state.write().await;
        let key = debit.idempotency_key();
        match state
            .debits
            .iter_mut()
            .find(|existing| existing.idempotency_key() == key)
        {
            Some(existing) => *existing = debit.clone(),
            None => state.debits.push(debit.clone()),
        }
        Ok(())
    }

    async fn create_credit(&self, credit: &Credit) -> BillingResult<()> {
        let mut state = self.state.write().await;
        let duplicate_referral_credit = credit.reason == CreditReason::Referral
            && credit.referral_id.is_some()
            && state
                .credits
                .iter()
                .any(|c| c.referral_id == credit.referral_id && c.user == credit.user);
        if !duplicate_referral_credit {
            state.credits.push(credit.clone());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::{date, datetime};

    fn debit(user: &str, kind: DebitKind, amount: f64, period: &BillingPeriod) -> Debit {
        Debit::for_period(user.to_string(), kind, amount, period)
    }

    #[tokio::test]
    async fn test_create_debit_upserts_per_period() {
        let store = MemoryStore::new();
        let period = BillingPeriod::day(date!(2024 - 03 - 01));

        store
            .create_debit(&debit("a@example.com", DebitKind::Storage, 1.0, &period))
            .await
            .unwrap();
        store
            .create_debit(&debit("a@example.com", DebitKind::Storage, 2.5, &period))
            .await
            .unwrap();
        store
            .create_debit(&debit("a@example.com", DebitKind::Bandwidth, 4.0, &period))
            .await
            .unwrap();

        let debits = store.debits().await;
        assert_eq!(debits.len(), 2);
        assert_eq!(store.total_billed_cents("a@example.com").await.unwrap(), 6.5);
    }

    #[tokio::test]
    async fn test_remove_debits_only_touches_period() {
        let store = MemoryStore::new();
        let day1 = BillingPeriod::day(date!(2024 - 03 - 01));
        let day2 = BillingPeriod::day(date!(2024 - 03 - 02));

        for period in [&day1, &day2] {
            store
                .create_debit(&debit("a@example.com", DebitKind::Storage, 1.0, period))
                .await
                .unwrap();
        }
        store
            .create_debit(&debit("a@example.com", DebitKind::Other, 1.0, &day1))
            .await
            .unwrap();

        assert_eq!(store.remove_debits(day1).await.unwrap(), 1);
        let remaining = store.debits().await;
        assert_eq!(remaining.len(), 2);
        assert!(remaining
            .iter()
            .all(|d| d.kind == DebitKind::Other || day2.contains(d.created_at)));
    }

    #[tokio::test]
    async fn test_mark_converted_once() {
        let store = MemoryStore::new();
        let id = Uuid::new_v4();
        store
            .add_referral(Referral {
                id,
                sender: "sender@example.com".into(),
                recipient: "recipient@example.com".into(),
                min_spend_requirement_cents: 1000.0,
                amount_to_credit_cents: 1000.0,
                recipient_signed_up_at: Some(datetime!(2024-03-01 00:00 UTC)),
                converted_at: None,
            })
            .await;

        let at = datetime!(2024-03-10 00:00 UTC);
        assert!(store.mark_referral_converted(id, at).await.unwrap());
        assert!(!store.mark_referral_converted(id, at).await.unwrap());
        assert!(!store
            .mark_referral_converted(Uuid::new_v4(), at)
            .await
            .unwrap());
        assert_eq!(
            store.referral(id).await.unwrap().unwrap().converted_at,
            Some(at)
        );
    }
}
