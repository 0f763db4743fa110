use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use super::BillingStore;
use crate::error::{BillingError, BillingResult};
use crate::ledger::Ledger;
use crate::models::{
    BandwidthUsage, Credit, CreditReason, Debit, DebitKind, Referral, StorageUsage,
};
use crate::period::BillingPeriod;

/// Per-event closed-interval overlap in milliseconds, clipped at zero and
/// converted to GB-hours. `LEAST` skips NULLs, so an open event runs to `$3`.
const STORAGE_USAGE_SQL: &str = r#"
    SELECT user_id, gb_hours
    FROM (
        SELECT
            user_id,
            SUM(
                (size_bytes::DOUBLE PRECISION / 1e9)
                * GREATEST(
                    0,
                    EXTRACT(EPOCH FROM (
                        LEAST(ended_at, $3, $2) - GREATEST(occurred_at, $1)
                    ))::DOUBLE PRECISION * 1000 + 1
                  ) / 3600000.0
            ) AS gb_hours
        FROM usage_events
        WHERE kind = 'storage'
          AND success
          AND user_id IS NOT NULL
          AND size_bytes > 0
          AND occurred_at <= $2
          AND (ended_at IS NULL OR ended_at >= $1)
        GROUP BY user_id
    ) per_user
    WHERE gb_hours > 0
    ORDER BY user_id
"#;

const BANDWIDTH_USAGE_SQL: &str = r#"
    SELECT user_id, SUM(size_bytes)::BIGINT AS bytes
    FROM usage_events
    WHERE kind = 'bandwidth'
      AND success
      AND user_id IS NOT NULL
      AND size_bytes > 0
      AND occurred_at >= $1
      AND occurred_at < $2
    GROUP BY user_id
    ORDER BY user_id
"#;

#[derive(Debug, sqlx::FromRow)]
struct StorageUsageRow {
    user_id: String,
    gb_hours: f64,
}

#[derive(Debug, sqlx::FromRow)]
struct BandwidthUsageRow {
    user_id: String,
    bytes: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct DebitRow {
    user_id: String,
    kind: String,
    amount_cents: f64,
    created_at: OffsetDateTime,
    period_start: OffsetDateTime,
    period_end: OffsetDateTime,
}

impl From<DebitRow> for Debit {
    fn from(row: DebitRow) -> Self {
        Debit {
            user: row.user_id,
            kind: DebitKind::parse(&row.kind),
            amount_cents: row.amount_cents,
            created_at: row.created_at,
            period_start: row.period_start,
            period_end: row.period_end,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct CreditRow {
    user_id: String,
    amount_cents: f64,
    reason: String,
    referral_id: Option<Uuid>,
    created_at: OffsetDateTime,
}

impl From<CreditRow> for Credit {
    fn from(row: CreditRow) -> Self {
        Credit {
            user: row.user_id,
            amount_cents: row.amount_cents,
            reason: CreditReason::parse(&row.reason),
            referral_id: row.referral_id,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ReferralRow {
    id: Uuid,
    sender_id: String,
    recipient_id: String,
    min_spend_requirement_cents: f64,
    amount_to_credit_cents: f64,
    recipient_signed_up_at: Option<OffsetDateTime>,
    converted_at: Option<OffsetDateTime>,
}

impl From<ReferralRow> for Referral {
    fn from(row: ReferralRow) -> Self {
        Referral {
            id: row.id,
            sender: row.sender_id,
            recipient: row.recipient_id,
            min_spend_requirement_cents: row.min_spend_requirement_cents,
            amount_to_credit_cents: row.amount_to_credit_cents,
            recipient_signed_up_at: row.recipient_signed_up_at,
            converted_at: row.converted_at,
        }
    }
}

const REFERRAL_COLUMNS: &str = "id, sender_id, recipient_id, min_spend_requirement_cents, \
     amount_to_credit_cents, recipient_signed_up_at, converted_at";

/// Postgres-backed aggregation store and ledger
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl BillingStore for PgStore {
    fn storage_usage(
        &self,
        period: BillingPeriod,
        now: OffsetDateTime,
    ) -> BoxStream<'_, BillingResult<StorageUsage>> {
        sqlx::query_as::<_, StorageUsageRow>(STORAGE_USAGE_SQL)
            .bind(period.start)
            .bind(period.end)
            .bind(now)
            .fetch(&self.pool)
            .map(|row| {
                row.map(|row| StorageUsage {
                    user: row.user_id,
                    gb_hours: row.gb_hours,
                })
                .map_err(BillingError::from)
            })
            .boxed()
    }

    fn bandwidth_usage(&self, period: BillingPeriod) -> BoxStream<'_, BillingResult<BandwidthUsage>> {
        sqlx::query_as::<_, BandwidthUsageRow>(BANDWIDTH_USAGE_SQL)
            .bind(period.start)
            .bind(period.end)
            .fetch(&self.pool)
            .map(|row| {
                row.map(|row| BandwidthUsage {
                    user: row.user_id,
                    bytes: row.bytes,
                })
                .map_err(BillingError::from)
            })
            .boxed()
    }

    async fn remove_debits(&self, period: BillingPeriod) -> BillingResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM debits
            WHERE kind IN ('storage', 'bandwidth')
              AND created_at >= $1
              AND created_at < $2
            "#,
        )
        .bind(period.start)
        .bind(period.end)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn pending_referrals(&self) -> BillingResult<Vec<Referral>> {
        let rows: Vec<ReferralRow> = sqlx::query_as(&format!(
            r#"
            SELECT {REFERRAL_COLUMNS}
            FROM referrals r
            WHERE r.recipient_signed_up_at IS NOT NULL
              AND r.converted_at IS NULL
              AND NOT EXISTS (
                  SELECT 1 FROM credits c
                  WHERE c.referral_id = r.id
                    AND c.user_id = r.sender_id
              )
            ORDER BY r.recipient_signed_up_at
            "#
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Referral::from).collect())
    }

    async fn total_billed_cents(&self, user: &str) -> BillingResult<f64> {
        let total: Option<f64> =
            sqlx::query_scalar("SELECT SUM(amount_cents) FROM debits WHERE user_id = $1")
                .bind(user)
                .fetch_one(&self.pool)
                .await?;

        Ok(total.unwrap_or(0.0))
    }

    async fn mark_referral_converted(&self, id: Uuid, at: OffsetDateTime) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE referrals
            SET converted_at = $2
            WHERE id = $1
              AND converted_at IS NULL
            "#,
        )
        .bind(id)
        .bind(at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn referral(&self, id: Uuid) -> BillingResult<Option<Referral>> {
        let row: Option<ReferralRow> = sqlx::query_as(&format!(
            "SELECT {REFERRAL_COLUMNS} FROM referrals WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Referral::from))
    }

    async fn referrals_converted_between(
        &self,
        since: OffsetDateTime,
        until: OffsetDateTime,
    ) -> BillingResult<Vec<Referral>> {
        let rows: Vec<ReferralRow> = sqlx::query_as(&format!(
            r#"
            SELECT {REFERRAL_COLUMNS}
            FROM referrals
            WHERE converted_at >= $1 AND converted_at < $2
            "#
        ))
        .bind(since)
        .bind(until)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Referral::from).collect())
    }

    async fn debits_between(
        &self,
        since: OffsetDateTime,
        until: OffsetDateTime,
    ) -> BillingResult<Vec<Debit>> {
        let rows: Vec<DebitRow> = sqlx::query_as(
            r#"
            SELECT user_id, kind, amount_cents, created_at, period_start, period_end
            FROM debits
            WHERE created_at >= $1 AND created_at < $2
            ORDER BY created_at
            "#,
        )
        .bind(since)
        .bind(until)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Debit::from).collect())
    }

    async fn credits_between(
        &self,
        since: OffsetDateTime,
        until: OffsetDateTime,
    ) -> BillingResult<Vec<Credit>> {
        let rows: Vec<CreditRow> = sqlx::query_as(
            r#"
            SELECT user_id, amount_cents, reason, referral_id, created_at
            FROM credits
            WHERE created_at >= $1 AND created_at < $2
            ORDER BY created_at
            "#,
        )
        .bind(since)
        .bind(until)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Credit::from).collect())
    }
}

#[async_trait]
impl Ledger for PgStore {
    async fn create_debit(&self, debit: &Debit) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO debits (user_id, kind, amount_cents, created_at, period_start, period_end)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (user_id, kind, period_start, period_end)
            DO UPDATE SET amount_cents = EXCLUDED.amount_cents,
                          created_at = EXCLUDED.created_at
            "#,
        )
        .bind(&debit.user)
        .bind(debit.kind.as_str())
        .bind(debit.amount_cents)
        .bind(debit.created_at)
        .bind(debit.period_start)
        .bind(debit.period_end)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn create_credit(&self, credit: &Credit) -> BillingResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO credits (user_id, amount_cents, reason, referral_id, created_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (referral_id, user_id) WHERE referral_id IS NOT NULL
            DO NOTHING
            "#,
        )
        .bind(&credit.user)
        .bind(credit.amount_cents)
        .bind(credit.reason.as_str())
        .bind(credit.referral_id)
        .bind(credit.created_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            tracing::warn!(
                user = %credit.user,
                referral_id = ?credit.referral_id,
                "Referral credit already recorded, skipped"
            );
        }

        Ok(())
    }
}
