use std::sync::Arc;

use ainews_adapters::ImageResolver;
use ainews_storage::{Datastore, HttpFetcher};
use ainews_sync::{
    build_scheduler, datastore_status, memory_store, report, ImageRepair, RepairOptions,
    RunSummary, SyncConfig, SyncPipeline,
};
use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "ainews-cli")]
#[command(about = "AI news ingestion command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run every enabled source once and reconcile into the datastore.
    Sync {
        /// Use an in-memory datastore; nothing is persisted.
        #[arg(long)]
        dry_run: bool,
    },
    /// Run syncs on the configured cron schedule until interrupted.
    Schedule,
    /// Fill in or replace missing article and enrichment images.
    RepairImages {
        /// Also probe stored images and replace unreachable ones.
        #[arg(long)]
        verify_existing: bool,
    },
    /// Show stored article counts.
    Status,
    /// Summarize recent run reports.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync { dry_run: false }) {
        Commands::Sync { dry_run } => {
            let store: Arc<dyn Datastore> = if dry_run {
                Arc::new(memory_store())
            } else {
                Arc::new(config.connect_datastore()?)
            };
            let summary = SyncPipeline::new(config, store)?.run_once().await?;
            print_summary(&summary);
            if !summary.is_success() {
                bail!("sync run {} did not finish before its deadline", summary.run_id);
            }
        }
        Commands::Schedule => {
            let store = Arc::new(config.connect_datastore()?);
            let cron = config.schedule_cron.clone();
            let pipeline = Arc::new(SyncPipeline::new(config, store)?);
            let sched = build_scheduler(pipeline).await?;
            sched.start().await.context("starting scheduler")?;
            info!(%cron, "scheduler running; press ctrl-c to stop");
            tokio::signal::ctrl_c()
                .await
                .context("waiting for shutdown signal")?;
        }
        Commands::RepairImages { verify_existing } => {
            let store = Arc::new(config.connect_datastore()?);
            let http = Arc::new(HttpFetcher::new(config.http_config())?);
            let report = ImageRepair::new(store, ImageResolver::new(http))
                .run(RepairOptions { verify_existing })
                .await
                .context("repairing images")?;
            for (table, tally) in [("articles", report.articles), ("enrichments", report.enrichments)] {
                println!(
                    "{table}: checked={} broken={} fixed={} unresolved={} failed={}",
                    tally.checked, tally.broken, tally.fixed, tally.unresolved, tally.failed
                );
            }
        }
        Commands::Status => {
            let store = config.connect_datastore()?;
            let status = datastore_status(&store, config.recency(), Utc::now())
                .await
                .context("reading datastore status")?;
            println!(
                "articles: total={} since {}={}",
                status.total_articles, status.cutoff, status.recent_articles
            );
        }
        Commands::Report { runs } => {
            println!("{}", report::report_recent_runs(&config.reports_dir, runs)?);
        }
    }

    Ok(())
}

fn print_summary(summary: &RunSummary) {
    println!(
        "sync {:?}: run_id={} inserted={} updated={} failed={} enrichments={} issues={}",
        summary.status,
        summary.run_id,
        summary.articles.inserted,
        summary.articles.updated,
        summary.articles.failed,
        summary.enrichments.inserted,
        summary.issues.len()
    );
    for stats in &summary.sources {
        println!(
            "  {}: seen={} accepted={} stale={} skipped={}{}",
            stats.source,
            stats.seen,
            stats.accepted,
            stats.stale,
            stats.skipped,
            stats
                .error
                .as_deref()
                .map(|e| format!(" error={e}"))
                .unwrap_or_default()
        );
    }
}
