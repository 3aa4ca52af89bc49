use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use jad_core::StoredRecord;
use jad_storage::{PgStore, PostingStore};
use jad_sync::{digest_source_counts, report_summary_lines, DeliveryOutcome, JadService, SyncConfig};
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "jad")]
#[command(about = "Job aggregation and digest")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch every enabled source once and store new postings.
    Aggregate,
    /// Send the digest of undelivered postings.
    Digest {
        /// Print what would be sent without notifying or marking anything.
        #[arg(long)]
        dry_run: bool,
    },
    /// List undelivered postings, or everything one source has observed.
    Pending {
        #[arg(long)]
        source: Option<String>,
    },
    Migrate,
    /// Run the cron jobs until Ctrl-C.
    Schedule,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info,sqlx=warn".into()))
        .with(fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Aggregate) {
        Commands::Aggregate => {
            let report = JadService::connect(config).await?.aggregate_once().await?;
            for line in report_summary_lines(&report) {
                println!("{line}");
            }
        }
        Commands::Digest { dry_run: true } => {
            let service = JadService::connect(config).await?;
            let pending = service.tracker().pending_digest().await?;
            print_records(&pending);
            for (source_id, count) in digest_source_counts(&pending) {
                println!("{source_id}: {count}");
            }
        }
        Commands::Digest { dry_run: false } => {
            let outcome = JadService::connect(config).await?.digest_once().await;
            println!("{}", describe(&outcome));
            if let DeliveryOutcome::NotificationFailed { .. }
            | DeliveryOutcome::ConfirmFailed { .. }
            | DeliveryOutcome::StoreUnavailable { .. } = outcome
            {
                anyhow::bail!("digest delivery did not complete");
            }
        }
        Commands::Pending { source } => {
            let service = JadService::connect(config).await?;
            let store = service.store();
            let records = match source {
                Some(source_id) => store.records_for_source(&source_id).await?,
                None => store.undelivered().await?,
            };
            print_records(&records);
            let stats = store.stats().await?;
            println!("{} stored, {} undelivered", stats.total, stats.undelivered);
        }
        Commands::Migrate => {
            let store = PgStore::connect(&config.database_url)
                .await
                .context("connecting to postgres")?;
            store.migrate().await.context("running migrations")?;
            println!("migrations applied");
        }
        Commands::Schedule => {
            let service = Arc::new(JadService::connect(config).await?);
            let Some(mut sched) = service.maybe_build_scheduler().await? else {
                anyhow::bail!("scheduler disabled; set JAD_SCHEDULER_ENABLED=true");
            };
            sched.start().await.context("starting scheduler")?;
            info!(
                aggregate = %service.config().aggregate_cron,
                digest = %service.config().digest_cron,
                "scheduler running; Ctrl-C to stop"
            );
            tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}

fn print_records(records: &[StoredRecord]) {
    for record in records {
        let posting = &record.posting;
        let status = if record.delivered { "sent" } else { "new" };
        println!(
            "[{status}] {} | {} at {} ({}) {}",
            posting.source_id, posting.title, posting.company, posting.location, posting.url
        );
    }
}

fn describe(outcome: &DeliveryOutcome) -> String {
    match outcome {
        DeliveryOutcome::NothingPending => "nothing pending".to_string(),
        DeliveryOutcome::Busy => "another delivery is in progress".to_string(),
        DeliveryOutcome::Delivered { count } => format!("delivered {count} postings"),
        DeliveryOutcome::NotificationFailed { pending, reason } => {
            format!("notification failed, {pending} postings still pending: {reason}")
        }
        DeliveryOutcome::ConfirmFailed { pending, reason } => {
            format!("digest sent but {pending} postings not marked: {reason}")
        }
        DeliveryOutcome::StoreUnavailable { reason } => format!("store unavailable: {reason}"),
    }
}
