//! Referral credits
//!
//! A referral converts once the recipient has been billed at least the
//! referral's minimum spend. The sender then receives one credit and the
//! referral is marked converted. The credit is written before the mark, and
//! referrals whose sender already holds a credit for them are never picked
//! up again, so a crash between the two steps cannot double-credit.

use std::sync::Arc;

use serde::Serialize;
use time::OffsetDateTime;
use tokio_retry::RetryIf;
use uuid::Uuid;

use crate::config::RetryPolicy;
use crate::error::{BillingError, BillingResult};
use crate::ledger::Ledger;
use crate::models::{Credit, CreditReason, Referral};
use crate::store::BillingStore;

#[derive(Debug, Clone, Serialize)]
pub struct ReferralFailure {
    pub referral_id: Uuid,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReferralReport {
    pub examined: usize,
    pub credited: usize,
    pub below_threshold: usize,
    pub failures: Vec<ReferralFailure>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReferralOutcome {
    Credited,
    BelowThreshold,
}

pub struct ReferralCreditGenerator {
    store: Arc<dyn BillingStore>,
    ledger: Arc<dyn Ledger>,
    retry: RetryPolicy,
}

impl ReferralCreditGenerator {
    pub fn new(store: Arc<dyn BillingStore>, ledger: Arc<dyn Ledger>, retry: RetryPolicy) -> Self {
        Self {
            store,
            ledger,
            retry,
        }
    }

    /// Credit every pending referral whose recipient crossed the spend requirement.
    ///
    /// Fails only when pending referrals cannot be listed; individual
    /// referral failures are collected in the report.
    pub async fn generate(&self) -> BillingResult<ReferralReport> {
        let pending = self.store.pending_referrals().await?;
        let mut report = ReferralReport {
            examined: pending.len(),
            ..Default::default()
        };

        for referral in pending {
            match self.process(&referral).await {
                Ok(ReferralOutcome::Credited) => report.credited += 1,
                Ok(ReferralOutcome::BelowThreshold) => report.below_threshold += 1,
                Err(e) => {
                    tracing::error!(
                        referral_id = %referral.id,
                        sender = %referral.sender,
                        error = %e,
                        "Failed to process referral"
                    );
                    report.failures.push(ReferralFailure {
                        referral_id: referral.id,
                        error: e.to_string(),
                    });
                }
            }
        }

        tracing::info!(
            examined = report.examined,
            credited = report.credited,
            below_threshold = report.below_threshold,
            failed = report.failures.len(),
            "Referral credit run complete"
        );

        Ok(report)
    }

    async fn process(&self, referral: &Referral) -> BillingResult<ReferralOutcome> {
        let billed = self.store.total_billed_cents(&referral.recipient).await?;
        if billed < referral.min_spend_requirement_cents {
            tracing::debug!(
                referral_id = %referral.id,
                billed_cents = billed,
                required_cents = referral.min_spend_requirement_cents,
                "Referral below spend requirement"
            );
            return Ok(ReferralOutcome::BelowThreshold);
        }

        let now = OffsetDateTime::now_utc();
        let credit = Credit {
            user: referral.sender.clone(),
            amount_cents: referral.amount_to_credit_cents,
            reason: CreditReason::Referral,
            referral_id: Some(referral.id),
            created_at: now,
        };

        RetryIf::spawn(
            self.retry.delays(),
            || self.ledger.create_credit(&credit),
            |e: &BillingError| e.is_retryable(),
        )
        .await?;

        if !self.store.mark_referral_converted(referral.id, now).await? {
            tracing::warn!(
                referral_id = %referral.id,
                "Referral was converted concurrently"
            );
        }

        tracing::info!(
            referral_id = %referral.id,
            sender = %referral.sender,
            recipient = %referral.recipient,
            amount_cents = referral.amount_to_credit_cents,
            "Referral converted"
        );

        Ok(ReferralOutcome::Credited)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Debit, DebitKind};
    use crate::period::BillingPeriod;
    use crate::ledger::{LedgerClient, MirroredLedger};
    use crate::signing::RequestSigner;
    use crate::store::testing::FaultyStore;
    use crate::store::MemoryStore;
    use mockito::Matcher;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use time::macros::{date, datetime};

    fn referral(min_spend: f64) -> Referral {
        Referral {
            id: Uuid::new_v4(),
            sender: "sender@example.com".to_string(),
            recipient: "recipient@example.com".to_string(),
            min_spend_requirement_cents: min_spend,
            amount_to_credit_cents: 1000.0,
            recipient_signed_up_at: Some(datetime!(2024-02-01 00:00 UTC)),
            converted_at: None,
        }
    }

    async fn bill(store: &MemoryStore, user: &str, cents: f64) {
        store
            .create_debit(&Debit::for_period(
                user.to_string(),
                DebitKind::Storage,
                cents,
                &BillingPeriod::day(date!(2024 - 03 - 01)),
            ))
            .await
            .unwrap();
    }

    fn generator(store: &Arc<MemoryStore>) -> ReferralCreditGenerator {
        ReferralCreditGenerator::new(store.clone(), store.clone(), RetryPolicy::none())
    }

    #[tokio::test]
    async fn test_below_threshold_not_credited() {
        let store = Arc::new(MemoryStore::new());
        store.add_referral(referral(1000.0)).await;
        bill(&store, "recipient@example.com", 999.0).await;

        let report = generator(&store).generate().await.unwrap();

        assert_eq!(report.below_threshold, 1);
        assert_eq!(report.credited, 0);
        assert!(store.credits().await.is_empty());
        assert!(store.referrals().await[0].converted_at.is_none());
    }

    #[tokio::test]
    async fn test_threshold_is_inclusive() {
        let store = Arc::new(MemoryStore::new());
        store.add_referral(referral(1000.0)).await;
        bill(&store, "recipient@example.com", 1000.0).await;

        let report = generator(&store).generate().await.unwrap();
        assert_eq!(report.credited, 1);
    }

    #[tokio::test]
    async fn test_unsigned_up_recipient_ignored() {
        let store = Arc::new(MemoryStore::new());
        store
            .add_referral(Referral {
                recipient_signed_up_at: None,
                ..referral(0.0)
            })
            .await;

        let report = generator(&store).generate().await.unwrap();
        assert_eq!(report.examined, 0);
    }

    #[tokio::test]
    async fn test_second_run_does_not_double_credit() {
        let store = Arc::new(MemoryStore::new());
        store.add_referral(referral(1000.0)).await;
        bill(&store, "recipient@example.com", 1200.0).await;

        let generator = generator(&store);
        assert_eq!(generator.generate().await.unwrap().credited, 1);
        let second = generator.generate().await.unwrap();

        assert_eq!(second.examined, 0);
        assert_eq!(store.credits().await.len(), 1);
    }

    #[tokio::test]
    async fn test_prior_credit_excludes_referral() {
        let store = Arc::new(MemoryStore::new());
        let referral = referral(0.0);
        store.add_referral(referral.clone()).await;
        // credited earlier but the conversion mark never landed
        store
            .create_credit(&Credit {
                user: referral.sender.clone(),
                amount_cents: 1000.0,
                reason: CreditReason::Referral,
                referral_id: Some(referral.id),
                created_at: datetime!(2024-03-01 00:00 UTC),
            })
            .await
            .unwrap();

        let report = generator(&store).generate().await.unwrap();
        assert_eq!(report.examined, 0);
        assert_eq!(store.credits().await.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_mark_does_not_resend_remote_credit() {
        let mut server = mockito::Server::new_async().await;
        let referral = referral(1000.0);
        let credits_mock = server
            .mock("POST", "/credits")
            .match_body(Matcher::PartialJson(serde_json::json!({
                "idempotency_key": format!("{}:sender@example.com", referral.id),
            })))
            .with_status(201)
            .with_body(r#"{"id":"credit-1"}"#)
            .expect(1)
            .create_async()
            .await;

        let memory = Arc::new(MemoryStore::new());
        memory.add_referral(referral.clone()).await;
        bill(&memory, "recipient@example.com", 1200.0).await;
        let store = Arc::new(FaultyStore {
            failing_marks: AtomicUsize::new(1),
            ..FaultyStore::new(memory.clone())
        });
        let client = LedgerClient::new(
            &server.url(),
            RequestSigner::from_hex("0707070707070707070707070707070707070707070707070707070707070707")
                .unwrap(),
            Duration::from_secs(5),
        )
        .unwrap();
        let ledger = MirroredLedger::new(Arc::new(client), memory.clone());
        let generator = ReferralCreditGenerator::new(store, Arc::new(ledger), RetryPolicy::none());

        let first = generator.generate().await.unwrap();
        assert_eq!(first.failures.len(), 1);
        assert!(memory.referrals().await[0].converted_at.is_none());

        let second = generator.generate().await.unwrap();
        assert_eq!(second.examined, 0);
        assert_eq!(second.credited, 0);

        credits_mock.assert_async().await;
        assert_eq!(memory.credits().await.len(), 1);
    }
}
