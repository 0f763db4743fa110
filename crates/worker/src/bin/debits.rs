//! One-off billing runs
//!
//! Bills a range of UTC days, e.g. to backfill after an outage or to re-bill
//! after a rate change:
//!
//! ```text
//! stormeter-debits --begin-date 2024-03-01 --days 7 --remove-existing
//! ```

use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use dialoguer::{theme::ColorfulTheme, Confirm};
use stormeter_billing::{BillingConfig, BillingService, RunOptions};
use time::macros::format_description;
use time::{Date, OffsetDateTime};
use tokio::sync::watch;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(author, version, about = "Generate storage and bandwidth debits", long_about = None)]
struct Cli {
    /// First UTC day to bill (YYYY-MM-DD), defaults to today
    #[arg(long, value_parser = parse_date)]
    begin_date: Option<Date>,

    /// Number of consecutive days to bill
    #[arg(long, default_value_t = 1)]
    days: u32,

    /// Delete existing storage and bandwidth debits in each day before billing it
    #[arg(long)]
    remove_existing: bool,

    /// Skip the confirmation prompt
    #[arg(long, short)]
    yes: bool,

    /// Run the referral credit generator after the debits
    #[arg(long)]
    referrals: bool,

    /// Exit non-zero if any user's debit could not be recorded
    #[arg(long)]
    fail_on_submission_errors: bool,
}

fn parse_date(raw: &str) -> Result<Date, String> {
    Date::parse(raw, format_description!("[year]-[month]-[day]"))
        .map_err(|e| format!("expected YYYY-MM-DD: {}", e))
}

fn confirm(cli: &Cli, begin: Date) -> Result<bool> {
    let removal = if cli.remove_existing {
        ", deleting existing debits first"
    } else {
        ""
    };
    let prompt = format!(
        "Bill {} day(s) starting {} UTC{}?",
        cli.days, begin, removal
    );

    Ok(Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .default(false)
        .interact()?)
}

/// Returns false when the operator declined
async fn run(cli: Cli) -> Result<bool> {
    let begin = cli
        .begin_date
        .unwrap_or_else(|| OffsetDateTime::now_utc().date());
    let config = BillingConfig::from_env()?;

    if !cli.yes && !confirm(&cli, begin)? {
        warn!("Billing run declined");
        return Ok(false);
    }

    let pool = stormeter_shared::create_pool(&config.database_url).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let billing = BillingService::from_config(config, pool)?.with_shutdown(shutdown_rx);

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, finishing in-flight debits");
            let _ = shutdown_tx.send(true);
        }
    });

    let options = RunOptions {
        remove_existing: cli.remove_existing,
        fail_on_submission_errors: cli.fail_on_submission_errors,
    };
    let summary = billing.run_debits(begin, cli.days, &options).await?;
    println!("{}", serde_json::to_string_pretty(&summary)?);

    if cli.referrals {
        let report = billing.generate_referral_credits().await?;
        println!("{}", serde_json::to_string_pretty(&report)?);
    }

    Ok(true)
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    stormeter_shared::init_tracing("info");

    let cli = Cli::parse();
    match run(cli).await {
        Ok(true) => {
            info!("Billing run finished");
            ExitCode::SUCCESS
        }
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!(error = %e, "Billing run failed");
            eprintln!("error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
