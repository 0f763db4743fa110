//! Billing Invariants Module
//!
//! Read-only consistency checks over recent debits, credits and referrals.
//! The worker runs them on a schedule; they can also be run by hand after a
//! backfill or a `--remove-existing` re-run.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::models::{Credit, CreditReason, Debit, DebitKind, Referral, UserId};
use crate::store::BillingStore;

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// User(s) affected
    pub users: Vec<UserId>,
    /// Human-readable description of the violation
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

/// Severity of an invariant violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Critical - users may be charged incorrectly
    Critical,
    /// High - data inconsistency that needs attention
    High,
    /// Medium - potential issue, should investigate
    Medium,
    /// Low - informational
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

/// Summary of all invariant checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    #[serde(with = "time::serde::rfc3339")]
    pub checked_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub since: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub until: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

impl InvariantCheckSummary {
    pub fn worst_severity(&self) -> Option<ViolationSeverity> {
        self.violations
            .iter()
            .map(|v| v.severity)
            .min_by_key(|s| *s as u8)
    }
}

pub const DUPLICATE_DEBITS: &str = "single_debit_per_period";
pub const NEGATIVE_DEBITS: &str = "debit_amount_not_negative";
pub const DEBIT_OUTSIDE_PERIOD: &str = "debit_stamped_inside_period";
pub const CONVERTED_WITHOUT_CREDIT: &str = "converted_referral_credited";
pub const CREDIT_WITHOUT_CONVERSION: &str = "referral_credit_converted";

/// Service for running billing invariant checks
pub struct InvariantChecker {
    store: Arc<dyn BillingStore>,
}

impl InvariantChecker {
    pub fn new(store: Arc<dyn BillingStore>) -> Self {
        Self { store }
    }

    /// Run all invariant checks over records created in `[since, until)`
    pub async fn run_all_checks(
        &self,
        since: OffsetDateTime,
        until: OffsetDateTime,
    ) -> BillingResult<InvariantCheckSummary> {
        let debits = self.store.debits_between(since, until).await?;
        let credits = self.store.credits_between(since, until).await?;
        let converted = self.store.referrals_converted_between(since, until).await?;

        let mut referrals = HashMap::new();
        for id in credits.iter().filter_map(|c| c.referral_id) {
            if !referrals.contains_key(&id) {
                let referral = self.store.referral(id).await?;
                referrals.insert(id, referral);
            }
        }

        let mut violations = Vec::new();
        violations.extend(check_single_debit_per_period(&debits));
        violations.extend(check_debit_amounts(&debits));
        violations.extend(check_debit_timestamps(&debits));
        violations.extend(check_converted_referrals_credited(&converted, &credits));
        violations.extend(check_referral_credits_converted(&credits, &referrals));

        let checks_run = Self::available_checks().len();
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<HashSet<_>>()
            .len();

        let summary = InvariantCheckSummary {
            checked_at: OffsetDateTime::now_utc(),
            since,
            until,
            checks_run,
            checks_passed: checks_run - checks_failed,
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        };

        if summary.healthy {
            tracing::info!(checks = checks_run, "Billing invariants hold");
        } else {
            for violation in &summary.violations {
                tracing::error!(
                    invariant = %violation.invariant,
                    severity = %violation.severity,
                    users = ?violation.users,
                    "{}",
                    violation.description
                );
            }
        }

        Ok(summary)
    }

    pub fn available_checks() -> Vec<&'static str> {
        vec![
            DUPLICATE_DEBITS,
            NEGATIVE_DEBITS,
            DEBIT_OUTSIDE_PERIOD,
            CONVERTED_WITHOUT_CREDIT,
            CREDIT_WITHOUT_CONVERSION,
        ]
    }
}

/// At most one debit per user, kind and period
pub fn check_single_debit_per_period(debits: &[Debit]) -> Vec<InvariantViolation> {
    let mut counts: BTreeMap<(&str, &'static str, OffsetDateTime, OffsetDateTime), usize> =
        BTreeMap::new();
    for debit in debits.iter().filter(|d| d.kind != DebitKind::Other) {
        *counts
            .entry((
                debit.user.as_str(),
                debit.kind.as_str(),
                debit.period_start,
                debit.period_end,
            ))
            .or_default() += 1;
    }

    counts
        .into_iter()
        .filter(|(_, count)| *count > 1)
        .map(|((user, kind, start, end), count)| InvariantViolation {
            invariant: DUPLICATE_DEBITS.to_string(),
            users: vec![user.to_string()],
            description: format!(
                "User has {} {} debits for one period (expected 1)",
                count, kind
            ),
            context: serde_json::json!({
                "kind": kind,
                "period_start": start.unix_timestamp(),
                "period_end": end.unix_timestamp(),
                "debit_count": count,
            }),
            severity: ViolationSeverity::Critical,
        })
        .collect()
}

pub fn check_debit_amounts(debits: &[Debit]) -> Vec<InvariantViolation> {
    debits
        .iter()
        .filter(|d| d.amount_cents < 0.0 || !d.amount_cents.is_finite())
        .map(|d| InvariantViolation {
            invariant: NEGATIVE_DEBITS.to_string(),
            users: vec![d.user.clone()],
            description: format!("Debit has invalid amount {} cents", d.amount_cents),
            context: serde_json::json!({
                "kind": d.kind.as_str(),
                "amount_cents": d.amount_cents.to_string(),
                "period_start": d.period_start.unix_timestamp(),
            }),
            severity: ViolationSeverity::Critical,
        })
        .collect()
}

/// Usage debits are stamped at the last millisecond of their period
pub fn check_debit_timestamps(debits: &[Debit]) -> Vec<InvariantViolation> {
    debits
        .iter()
        .filter(|d| d.kind != DebitKind::Other)
        .filter(|d| d.created_at < d.period_start || d.created_at >= d.period_end)
        .map(|d| InvariantViolation {
            invariant: DEBIT_OUTSIDE_PERIOD.to_string(),
            users: vec![d.user.clone()],
            description: format!("{} debit created outside its billing period", d.kind.as_str()),
            context: serde_json::json!({
                "created_at": d.created_at.unix_timestamp(),
                "period_start": d.period_start.unix_timestamp(),
                "period_end": d.period_end.unix_timestamp(),
            }),
            severity: ViolationSeverity::High,
        })
        .collect()
}

pub fn check_converted_referrals_credited(
    converted: &[Referral],
    credits: &[Credit],
) -> Vec<InvariantViolation> {
    let credited: HashSet<(Uuid, &str)> = credits
        .iter()
        .filter(|c| c.reason == CreditReason::Referral)
        .filter_map(|c| c.referral_id.map(|id| (id, c.user.as_str())))
        .collect();

    converted
        .iter()
        .filter(|r| !credited.contains(&(r.id, r.sender.as_str())))
        .map(|r| InvariantViolation {
            invariant: CONVERTED_WITHOUT_CREDIT.to_string(),
            users: vec![r.sender.clone(), r.recipient.clone()],
            description: "Referral marked converted but sender holds no credit for it"
                .to_string(),
            context: serde_json::json!({
                "referral_id": r.id,
                "amount_to_credit_cents": r.amount_to_credit_cents,
            }),
            severity: ViolationSeverity::High,
        })
        .collect()
}

/// Every referral credit points at a converted referral
pub fn check_referral_credits_converted(
    credits: &[Credit],
    referrals: &HashMap<Uuid, Option<Referral>>,
) -> Vec<InvariantViolation> {
    credits
        .iter()
        .filter_map(|c| c.referral_id.map(|id| (c, id)))
        .filter_map(|(credit, id)| {
            let description = match referrals.get(&id) {
                Some(Some(referral)) if referral.converted_at.is_some() => return None,
                Some(Some(_)) => "Referral credit issued but referral is not converted",
                Some(None) | None => "Referral credit points at a missing referral",
            };
            Some(InvariantViolation {
                invariant: CREDIT_WITHOUT_CONVERSION.to_string(),
                users: vec![credit.user.clone()],
                description: description.to_string(),
                context: serde_json::json!({
                    "referral_id": id,
                    "credited_at": credit.created_at.unix_timestamp(),
                }),
                severity: ViolationSeverity::Medium,
            })
        })
        .collect()
}
