use std::path::PathBuf;
use std::time::Duration;

use adwatch_almanac::BirthdayEntry;
use adwatch_core::Record;
use adwatch_engine::{
    load_watch_registry, BirthdayPipeline, WatchConfig, WatchEntry, WatchPipeline,
};
use adwatch_notify::{NoopNotifier, Notifier, TelegramNotifier};
use adwatch_source::{JsonBundleSource, ListingSelectors, PagedHtmlSource};
use adwatch_store::{HttpClient, HttpClientConfig, JsonTableStore};
use anyhow::Result;
use chrono::{Duration as ChronoDuration, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "adwatch")]
#[command(about = "Listing and birthday watcher: reconcile, persist, notify")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one reconciliation pass over every enabled watch.
    Scan {
        /// Replay a captured observation bundle instead of fetching pages.
        #[arg(long)]
        bundle: Option<PathBuf>,
    },
    /// Check today's and tomorrow's birthdays and send the digest.
    Birthdays {
        /// Override "today" (defaults to the current date in the configured timezone).
        #[arg(long)]
        date: Option<NaiveDate>,
    },
}

fn http_client(config: &WatchConfig) -> Result<HttpClient> {
    HttpClient::new(HttpClientConfig {
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: Some(config.user_agent.clone()),
        ..Default::default()
    })
}

fn notifier_from(config: &WatchConfig) -> Result<Box<dyn Notifier>> {
    match (&config.telegram_bot_token, &config.telegram_chat_id) {
        (Some(token), Some(chat_id)) => Ok(Box::new(TelegramNotifier::new(
            http_client(config)?,
            token.clone(),
            chat_id.clone(),
        ))),
        _ => {
            warn!("telegram credentials missing; alerts will be dropped");
            Ok(Box::new(NoopNotifier))
        }
    }
}

fn snapshot_path_for(config: &WatchConfig, watch: &WatchEntry) -> PathBuf {
    config
        .snapshot_path
        .with_file_name(format!("{}.json", watch.watch_id))
}

fn local_today(config: &WatchConfig) -> NaiveDate {
    (Utc::now() + ChronoDuration::minutes((config.tz_hours * 60.0) as i64)).date_naive()
}

async fn run_scan(config: &WatchConfig, bundle: Option<PathBuf>) -> Result<()> {
    if let Some(bundle_path) = bundle {
        let pipeline = WatchPipeline::new(
            Box::new(JsonTableStore::<Record>::new(config.snapshot_path.clone())),
            Box::new(JsonBundleSource::new("bundle-replay", bundle_path)),
            notifier_from(config)?,
        );
        let summary = pipeline.run_scan().await?;
        println!(
            "scan complete: run_id={} new={} updated={} stale={} skipped={} rows={}",
            summary.run_id, summary.new, summary.updated, summary.stale, summary.skipped,
            summary.total_rows
        );
        return Ok(());
    }

    let registry = load_watch_registry(&config.registry_path).await?;
    for watch in registry.watches.into_iter().filter(|w| w.enabled) {
        let selectors = watch.selectors.clone().unwrap_or_else(ListingSelectors::default);
        let source = PagedHtmlSource::new(
            watch.watch_id.clone(),
            watch.start_url.clone(),
            selectors,
            config.max_pages,
            config.max_consecutive_empty,
            http_client(config)?,
        );
        let pipeline = WatchPipeline::new(
            Box::new(JsonTableStore::<Record>::new(snapshot_path_for(config, &watch))),
            Box::new(source),
            notifier_from(config)?,
        );
        let summary = pipeline.run_scan().await?;
        println!(
            "scan {} complete: run_id={} new={} updated={} stale={} skipped={} rows={}",
            watch.watch_id, summary.run_id, summary.new, summary.updated, summary.stale,
            summary.skipped, summary.total_rows
        );
    }
    Ok(())
}

async fn run_birthdays(config: &WatchConfig, date: Option<NaiveDate>) -> Result<()> {
    let today = date.unwrap_or_else(|| local_today(config));
    let pipeline = BirthdayPipeline::new(
        Box::new(JsonTableStore::<BirthdayEntry>::new(
            config.birthday_book_path.clone(),
        )),
        notifier_from(config)?,
        config.tz_hours,
    );
    let summary = pipeline.run(today).await?;
    println!(
        "birthday check complete: date={} today={} tomorrow={} rewritten={} notified={}",
        summary.date, summary.today_matches, summary.tomorrow_matches, summary.book_rewritten,
        summary.notified
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = WatchConfig::from_env();

    match cli.command {
        Commands::Scan { bundle } => run_scan(&config, bundle).await,
        Commands::Birthdays { date } => run_birthdays(&config, date).await,
    }
}
