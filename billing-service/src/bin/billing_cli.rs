//! billing-cli: operator entry points for the scheduled billing passes.
//!
//! Reads the same environment as `billing-service`. Every pass prints a
//! summary table, even when individual items fail.

use anyhow::Context;
use billing_service::config::BillingConfig;
use billing_service::services::scheduler::{BatchSummary, ChargeOptions, RetryOptions};
use billing_service::services::init_metrics;
use billing_service::startup::BillingEngine;
use chrono::Utc;
use clap::{Parser, Subcommand};
use service_core::observability::init_cli_tracing;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "billing-cli", about = "Recurring billing operator commands")]
struct Cli {
    /// Print the summary as JSON instead of a table
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Charge subscriptions whose period has ended
    ChargeSubscriptions {
        /// Price and report without persisting or charging
        #[arg(long)]
        dry_run: bool,
        /// Charge only this subscription, even if it is not yet due
        #[arg(long)]
        subscription_id: Option<Uuid>,
    },
    /// Re-drive failed payments whose backoff has elapsed
    RetryFailedPayments {
        /// Only attempts created within this many days
        #[arg(long)]
        window_days: Option<i64>,
        /// Retry ceiling before the subscription is cancelled
        #[arg(long)]
        max_retries: Option<i32>,
        #[arg(long)]
        dry_run: bool,
    },
    /// Warn customers whose default card expires soon
    NotifyExpiringCards,
    /// Fail attempts the gateway never confirmed
    SweepStaleAttempts,
}

fn print_summary(title: &str, summary: &BatchSummary) {
    println!();
    println!("{}{}", title, if summary.dry_run { " (dry run)" } else { "" });
    println!(
        "{:<38} {:<10} {:<24} {:>14}  {}",
        "subscription", "outcome", "error", "amount", "message"
    );
    println!("{}", "-".repeat(110));
    for item in &summary.items {
        println!(
            "{:<38} {:<10} {:<24} {:>14}  {}",
            item.subscription_id
                .map(|id| id.to_string())
                .unwrap_or_else(|| "-".to_string()),
            item.outcome.as_str(),
            item.error.map(|e| e.as_str()).unwrap_or("-"),
            item.amount
                .map(|a| a.to_string())
                .unwrap_or_else(|| "-".to_string()),
            item.message,
        );
    }
    println!("{}", "-".repeat(110));
    println!(
        "total: {}  success: {}  pending: {}  failed: {}  skipped: {}  cancelled: {}",
        summary.total,
        summary.success,
        summary.pending,
        summary.failed,
        summary.skipped,
        summary.cancelled
    );
}

fn report(title: &str, summary: &BatchSummary, json: bool) -> anyhow::Result<()> {
    if json {
        let out = serde_json::to_string_pretty(summary).context("Serialize summary")?;
        println!("{}", out);
    } else {
        print_summary(title, summary);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = BillingConfig::from_env().context("Failed to load configuration")?;
    init_cli_tracing(&config.log_level);
    init_metrics();

    let engine = BillingEngine::from_config(&config, false)
        .await
        .context("Failed to initialise billing engine")?;
    let scheduler = &engine.scheduler;
    let now = Utc::now();

    match cli.command {
        Commands::ChargeSubscriptions {
            dry_run,
            subscription_id,
        } => {
            let summary = scheduler
                .charge_due_subscriptions(&ChargeOptions {
                    dry_run,
                    subscription_id,
                    now,
                })
                .await
                .context("Charge pass failed")?;
            report("Subscription charges", &summary, cli.json)?;
        }
        Commands::RetryFailedPayments {
            window_days,
            max_retries,
            dry_run,
        } => {
            let settings = scheduler.settings();
            let summary = scheduler
                .retry_failed_payments(&RetryOptions {
                    window_days: window_days.unwrap_or(settings.retry_window_days),
                    max_retries: max_retries.unwrap_or(settings.max_retries),
                    dry_run,
                    now,
                })
                .await
                .context("Retry pass failed")?;
            report("Payment retries", &summary, cli.json)?;
        }
        Commands::NotifyExpiringCards => {
            let summary = scheduler
                .notify_expiring_cards(now)
                .await
                .context("Card expiry scan failed")?;
            report("Expiring cards", &summary, cli.json)?;
        }
        Commands::SweepStaleAttempts => {
            let summary = scheduler
                .sweep_stale_attempts(now)
                .await
                .context("Stale attempt sweep failed")?;
            report("Stale attempts", &summary, cli.json)?;
        }
    }

    Ok(())
}
