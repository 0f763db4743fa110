//! Stormeter Background Worker
//!
//! Handles scheduled jobs including:
//! - Storage and bandwidth debits for the previous UTC day (daily at 00:15 UTC)
//! - Referral credits (hourly)
//! - Billing invariant checks (daily at 3:00 AM UTC)
//! - Heartbeat (every 5 minutes)
//!
//! Cron expressions can be overridden with `DEBIT_SCHEDULE`,
//! `REFERRAL_SCHEDULE` and `INVARIANT_SCHEDULE`.

use std::sync::Arc;

use stormeter_billing::{BillingConfig, BillingService, ViolationSeverity, WindowReport};
use time::OffsetDateTime;
use tokio::sync::{watch, Mutex};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

const DEFAULT_DEBIT_SCHEDULE: &str = "0 15 0 * * *";
const DEFAULT_REFERRAL_SCHEDULE: &str = "0 0 * * * *";
const DEFAULT_INVARIANT_SCHEDULE: &str = "0 0 3 * * *";

struct Schedules {
    debits: String,
    referrals: String,
    invariants: String,
}

impl Schedules {
    fn from_env() -> Self {
        let read = |name: &str, default: &str| {
            std::env::var(name)
                .ok()
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| default.to_string())
        };
        Self {
            debits: read("DEBIT_SCHEDULE", DEFAULT_DEBIT_SCHEDULE),
            referrals: read("REFERRAL_SCHEDULE", DEFAULT_REFERRAL_SCHEDULE),
            invariants: read("INVARIANT_SCHEDULE", DEFAULT_INVARIANT_SCHEDULE),
        }
    }
}

/// Log results of a daily debit run
fn log_window(window: &WindowReport) {
    info!(
        period_start = %window.period_start,
        storage_debits = window.storage.submitted,
        bandwidth_debits = window.bandwidth.submitted,
        total_cents = window.storage.total_cents + window.bandwidth.total_cents,
        failed = window.failed_submissions(),
        "Daily debit run complete"
    );

    for failure in window
        .storage
        .failures
        .iter()
        .chain(window.bandwidth.failures.iter())
    {
        error!(user = %failure.user, error = %failure.error, "Debit not recorded");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    stormeter_shared::init_tracing("info");

    info!("Starting Stormeter Worker v{}", env!("CARGO_PKG_VERSION"));

    let config = BillingConfig::from_env()?;
    let schedules = Schedules::from_env();

    let pool = stormeter_shared::create_pool(&config.database_url).await?;
    stormeter_shared::run_migrations(&pool).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let billing = Arc::new(BillingService::from_config(config, pool)?.with_shutdown(shutdown_rx));

    // Held for the duration of any billing job; overlapping ticks are skipped
    let run_lock = Arc::new(Mutex::new(()));

    let mut scheduler = JobScheduler::new().await?;

    // Job 1: Bill yesterday's storage and bandwidth
    let debit_billing = billing.clone();
    let debit_lock = run_lock.clone();
    scheduler
        .add(Job::new_async(schedules.debits.as_str(), move |_uuid, _l| {
            let billing = debit_billing.clone();
            let lock = debit_lock.clone();
            Box::pin(async move {
                let Ok(_guard) = lock.try_lock() else {
                    warn!("Previous billing job still running, skipping debit run");
                    return;
                };
                info!("Running daily debit job");
                match billing.run_previous_day(OffsetDateTime::now_utc()).await {
                    Ok(window) => log_window(&window),
                    Err(e) => error!(error = %e, "Daily debit run failed"),
                }
            })
        })?)
        .await?;
    info!(cron = %schedules.debits, "Scheduled: Daily debits");

    // Job 2: Referral credits
    let referral_billing = billing.clone();
    let referral_lock = run_lock.clone();
    scheduler
        .add(Job::new_async(schedules.referrals.as_str(), move |_uuid, _l| {
            let billing = referral_billing.clone();
            let lock = referral_lock.clone();
            Box::pin(async move {
                let Ok(_guard) = lock.try_lock() else {
                    warn!("Previous billing job still running, skipping referral run");
                    return;
                };
                if let Err(e) = billing.generate_referral_credits().await {
                    error!(error = %e, "Referral credit run failed");
                }
            })
        })?)
        .await?;
    info!(cron = %schedules.referrals, "Scheduled: Referral credits");

    // Job 3: Billing invariants over the lookback window
    let invariant_billing = billing.clone();
    scheduler
        .add(Job::new_async(schedules.invariants.as_str(), move |_uuid, _l| {
            let billing = invariant_billing.clone();
            Box::pin(async move {
                info!("Running billing invariant checks");
                match billing.check_invariants(OffsetDateTime::now_utc()).await {
                    Ok(summary) if summary.healthy => {}
                    Ok(summary) => {
                        let critical = summary.worst_severity() == Some(ViolationSeverity::Critical);
                        error!(
                            violations = summary.violations.len(),
                            checks_failed = summary.checks_failed,
                            critical = critical,
                            "Billing invariants violated"
                        );
                    }
                    Err(e) => error!(error = %e, "Invariant check failed"),
                }
            })
        })?)
        .await?;
    info!(cron = %schedules.invariants, "Scheduled: Billing invariants");

    // Job 4: Health check heartbeat (every 5 minutes)
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    info!("Scheduled: Health check heartbeat (every 5 minutes)");

    info!("Starting job scheduler");
    scheduler.start().await?;

    info!("Stormeter Worker started successfully with {} scheduled jobs", 4);

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested, waiting for in-flight billing work");

    let _ = shutdown_tx.send(true);
    let _drained = run_lock.lock().await;
    scheduler.shutdown().await?;

    info!("Stormeter Worker stopped");
    Ok(())
}
