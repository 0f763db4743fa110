//! Billing ledger
//!
//! Where debits and credits end up. The HTTP client talks to a remote
//! ledger service with signed requests; [`crate::store::PgStore`] and
//! [`crate::store::MemoryStore`] write directly. [`MirroredLedger`] pairs
//! the two so the store sees every record the remote ledger accepted.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::models::{Credit, Debit};
use crate::signing::{RequestSigner, NONCE_HEADER, PUBKEY_HEADER, SIGNATURE_HEADER};

#[async_trait]
pub trait Ledger: Send + Sync {
    /// Record a debit. Submitting the same user/kind/period twice replaces
    /// the earlier amount.
    async fn create_debit(&self, debit: &Debit) -> BillingResult<()>;

    async fn create_credit(&self, credit: &Credit) -> BillingResult<()>;
}

#[derive(Debug, Serialize)]
struct DebitRequest<'a> {
    user: &'a str,
    #[serde(rename = "type")]
    kind: &'static str,
    amount: f64,
    #[serde(with = "time::serde::rfc3339")]
    created: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    period_start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    period_end: OffsetDateTime,
    idempotency_key: String,
    #[serde(rename = "__nonce")]
    nonce: u64,
}

#[derive(Debug, Serialize)]
struct CreditRequest<'a> {
    user: &'a str,
    #[serde(rename = "type")]
    reason: &'static str,
    amount: f64,
    referral_id: Option<Uuid>,
    #[serde(with = "time::serde::rfc3339")]
    created: OffsetDateTime,
    idempotency_key: String,
    #[serde(rename = "__nonce")]
    nonce: u64,
}

/// What the ledger answers for an accepted record
#[derive(Debug, Deserialize)]
struct LedgerAck {
    id: String,
}

/// HTTP client for the remote ledger service
pub struct LedgerClient {
    http: reqwest::Client,
    base_url: String,
    signer: RequestSigner,
}

impl LedgerClient {
    pub fn new(base_url: &str, signer: RequestSigner, timeout: Duration) -> BillingResult<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            signer,
        })
    }

    pub fn public_key_hex(&self) -> &str {
        self.signer.public_key_hex()
    }

    async fn post<T: Serialize>(&self, path: &str, payload: &T, nonce: u64) -> BillingResult<String> {
        let body = serde_json::to_string(payload)
            .map_err(|e| BillingError::Signing(format!("failed to encode request: {}", e)))?;
        let signature = self.signer.sign("POST", path, &body)?;

        let response = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .header(CONTENT_TYPE, "application/json")
            .header(PUBKEY_HEADER, self.signer.public_key_hex())
            .header(SIGNATURE_HEADER, signature)
            .header(NONCE_HEADER, nonce.to_string())
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BillingError::LedgerRejected {
                status: status.as_u16(),
                body,
            });
        }

        let ack: LedgerAck = response
            .json()
            .await
            .map_err(|e| BillingError::MalformedResponse(e.to_string()))?;
        Ok(ack.id)
    }
}

#[async_trait]
impl Ledger for LedgerClient {
    async fn create_debit(&self, debit: &Debit) -> BillingResult<()> {
        let nonce = self.signer.next_nonce();
        let request = DebitRequest {
            user: &debit.user,
            kind: debit.kind.as_str(),
            amount: debit.amount_cents,
            created: debit.created_at,
            period_start: debit.period_start,
            period_end: debit.period_end,
            idempotency_key: debit.idempotency_key(),
            nonce,
        };
        let id = self.post("/debits", &request, nonce).await?;
        tracing::debug!(
            user = %debit.user,
            kind = debit.kind.as_str(),
            debit_id = %id,
            "Ledger accepted debit"
        );
        Ok(())
    }

    async fn create_credit(&self, credit: &Credit) -> BillingResult<()> {
        let nonce = self.signer.next_nonce();
        let request = CreditRequest {
            user: &credit.user,
            reason: credit.reason.as_str(),
            amount: credit.amount_cents,
            referral_id: credit.referral_id,
            created: credit.created_at,
            idempotency_key: credit.idempotency_key(),
            nonce,
        };
        let id = self.post("/credits", &request, nonce).await?;
        tracing::debug!(user = %credit.user, credit_id = %id, "Ledger accepted credit");
        Ok(())
    }
}

/// Submits to a remote ledger, then records what it accepted in a local one.
///
/// Billed totals, prior referral credits, debit removal and the invariant
/// checks all read the local copy. A local write that fails after the remote
/// ack surfaces as an error; retrying is safe because both sides dedupe on
/// the record's idempotency key.
pub struct MirroredLedger {
    remote: Arc<dyn Ledger>,
    local: Arc<dyn Ledger>,
}

impl MirroredLedger {
    pub fn new(remote: Arc<dyn Ledger>, local: Arc<dyn Ledger>) -> Self {
        Self { remote, local }
    }
}

#[async_trait]
impl Ledger for MirroredLedger {
    async fn create_debit(&self, debit: &Debit) -> BillingResult<()> {
        self.remote.create_debit(debit).await?;
        self.local.create_debit(debit).await
    }

    async fn create_credit(&self, credit: &Credit) -> BillingResult<()> {
        self.remote.create_credit(credit).await?;
        self.local.create_credit(credit).await
    }
}
