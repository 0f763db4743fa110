//! Billing domain records
//!
//! Usage events are produced by the storage network and only read here.
//! Debits and credits are append-only ledger entries; referrals are mutated
//! once, when they convert.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::period::BillingPeriod;

/// Users are identified by their account email on the storage network.
pub type UserId = String;

/// Decimal gigabyte, as billed.
pub const BYTES_PER_GB: f64 = 1e9;

/// Kind of metered usage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageKind {
    /// Bytes resident on the network over time
    Storage,
    /// Bytes downloaded from the network
    Bandwidth,
}

impl UsageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            UsageKind::Storage => "storage",
            UsageKind::Bandwidth => "bandwidth",
        }
    }
}

/// A raw usage record from the storage network
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageEvent {
    pub user: Option<UserId>,
    pub kind: UsageKind,
    pub success: bool,
    pub size_bytes: i64,
    pub occurred_at: OffsetDateTime,
    /// `None` while the data is still stored
    pub ended_at: Option<OffsetDateTime>,
}

impl UsageEvent {
    /// Whether this event takes part in aggregation at all
    pub fn is_billable(&self) -> bool {
        self.success && self.size_bytes > 0 && self.user.is_some()
    }
}

/// Debit categories as stored in the ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DebitKind {
    Storage,
    Bandwidth,
    Other,
}

impl DebitKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DebitKind::Storage => "storage",
            DebitKind::Bandwidth => "bandwidth",
            DebitKind::Other => "other",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "storage" => DebitKind::Storage,
            "bandwidth" => DebitKind::Bandwidth,
            _ => DebitKind::Other,
        }
    }
}

impl From<UsageKind> for DebitKind {
    fn from(kind: UsageKind) -> Self {
        match kind {
            UsageKind::Storage => DebitKind::Storage,
            UsageKind::Bandwidth => DebitKind::Bandwidth,
        }
    }
}

/// A charge owed by a user for one billing period
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Debit {
    pub user: UserId,
    pub kind: DebitKind,
    pub amount_cents: f64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub period_start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub period_end: OffsetDateTime,
}

impl Debit {
    /// Debit for usage in `period`, stamped 1ms before the period closes so
    /// it never lands on the boundary shared with the next period.
    pub fn for_period(
        user: UserId,
        kind: DebitKind,
        amount_cents: f64,
        period: &BillingPeriod,
    ) -> Self {
        Self {
            user,
            kind,
            amount_cents,
            created_at: period.debit_timestamp(),
            period_start: period.start,
            period_end: period.end,
        }
    }

    /// Key under which the ledger upserts this debit
    pub fn idempotency_key(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.user,
            self.kind.as_str(),
            self.period_start.unix_timestamp(),
            self.period_end.unix_timestamp()
        )
    }
}

/// Why a credit was issued
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreditReason {
    Referral,
    Promo,
    Manual,
}

impl CreditReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CreditReason::Referral => "referral",
            CreditReason::Promo => "promo",
            CreditReason::Manual => "manual",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "referral" => CreditReason::Referral,
            "promo" => CreditReason::Promo,
            _ => CreditReason::Manual,
        }
    }
}

/// An amount reducing a user's balance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Credit {
    pub user: UserId,
    pub amount_cents: f64,
    pub reason: CreditReason,
    /// Set for referral credits
    pub referral_id: Option<Uuid>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl Credit {
    /// Key under which the ledger deduplicates this credit. Referral credits
    /// key on the referral so a sender is credited at most once per referral.
    pub fn idempotency_key(&self) -> String {
        match self.referral_id {
            Some(referral_id) => format!("{}:{}", referral_id, self.user),
            None => format!(
                "{}:{}:{}",
                self.user,
                self.reason.as_str(),
                self.created_at.unix_timestamp_nanos()
            ),
        }
    }
}

/// A referral link redeemed by `recipient` on behalf of `sender`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Referral {
    pub id: Uuid,
    pub sender: UserId,
    pub recipient: UserId,
    pub min_spend_requirement_cents: f64,
    pub amount_to_credit_cents: f64,
    pub recipient_signed_up_at: Option<OffsetDateTime>,
    /// Set once the recipient's spend crossed the requirement and the sender was credited
    pub converted_at: Option<OffsetDateTime>,
}

impl Referral {
    /// Signed up but not yet converted
    pub fn is_pending(&self) -> bool {
        self.recipient_signed_up_at.is_some() && self.converted_at.is_none()
    }
}

/// Per-user storage total for a period
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StorageUsage {
    pub user: UserId,
    pub gb_hours: f64,
}

/// Per-user download total for a period
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BandwidthUsage {
    pub user: UserId,
    pub bytes: i64,
}

impl BandwidthUsage {
    pub fn gigabytes(&self) -> f64 {
        self.bytes as f64 / BYTES_PER_GB
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn test_debit_stamped_inside_period() {
        let period = BillingPeriod::new(
            datetime!(2024-03-01 00:00 UTC),
            datetime!(2024-03-02 00:00 UTC),
        )
        .unwrap();
        let debit = Debit::for_period("a@example.com".into(), DebitKind::Storage, 1.0, &period);

        assert_eq!(debit.created_at, datetime!(2024-03-01 23:59:59.999 UTC));
        assert!(period.contains(debit.created_at));
    }

    #[test]
    fn test_idempotency_key_distinguishes_kind_and_period() {
        let day1 = BillingPeriod::new(
            datetime!(2024-03-01 00:00 UTC),
            datetime!(2024-03-02 00:00 UTC),
        )
        .unwrap();
        let day2 = BillingPeriod::new(
            datetime!(2024-03-02 00:00 UTC),
            datetime!(2024-03-03 00:00 UTC),
        )
        .unwrap();

        let storage = Debit::for_period("a@example.com".into(), DebitKind::Storage, 1.0, &day1);
        let bandwidth = Debit::for_period("a@example.com".into(), DebitKind::Bandwidth, 1.0, &day1);
        let next_day = Debit::for_period("a@example.com".into(), DebitKind::Storage, 1.0, &day2);

        assert_ne!(storage.idempotency_key(), bandwidth.idempotency_key());
        assert_ne!(storage.idempotency_key(), next_day.idempotency_key());
        assert_eq!(
            storage.idempotency_key(),
            Debit::for_period("a@example.com".into(), DebitKind::Storage, 9.0, &day1)
                .idempotency_key()
        );
    }

    #[test]
    fn test_unknown_kinds_fall_back() {
        assert_eq!(DebitKind::parse("storage"), DebitKind::Storage);
        assert_eq!(DebitKind::parse("adjustment"), DebitKind::Other);
        assert_eq!(CreditReason::parse("referral"), CreditReason::Referral);
        assert_eq!(CreditReason::parse("goodwill"), CreditReason::Manual);
    }

    #[test]
    fn test_unattributed_events_are_not_billable() {
        let event = UsageEvent {
            user: None,
            kind: UsageKind::Storage,
            success: true,
            size_bytes: 10,
            occurred_at: datetime!(2024-03-01 00:00 UTC),
            ended_at: None,
        };
        assert!(!event.is_billable());
        assert!(UsageEvent {
            user: Some("a@example.com".into()),
            ..event.clone()
        }
        .is_billable());
        assert!(!UsageEvent {
            user: Some("a@example.com".into()),
            success: false,
            ..event
        }
        .is_billable());
    }
}
