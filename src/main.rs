use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;

use podcast_ingest::config::{Settings, StoreCredentials};
use podcast_ingest::feed::{build_client, load_feed_entries, FeedEntry};
use podcast_ingest::run::{Orchestrator, RunOptions, RunSummary};
use podcast_ingest::storage::{DryRunStore, PodcastStore, RestStore};

#[derive(Parser, Debug)]
#[command(
    name = "podcast-ingest",
    version,
    about = "Ingest podcast RSS feeds into a REST-fronted podcast store"
)]
struct Args {
    /// Settings file (TOML). A missing file means defaults.
    #[arg(long, value_name = "FILE", default_value = "podcast-ingest.toml")]
    config: PathBuf,

    /// Feed list (JSON), overriding `feeds_path` from the settings file
    #[arg(long, value_name = "FILE")]
    feeds: Option<PathBuf>,

    /// Feeds processed at once, overriding `concurrency`
    #[arg(long, value_name = "N")]
    concurrency: Option<usize>,

    /// Fetch, parse and normalize, but write nothing to the store
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr; stdout carries the run report.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let mut settings = Settings::load(&args.config)
        .with_context(|| format!("Failed to load settings from {}", args.config.display()))?;
    if let Some(feeds) = args.feeds {
        settings.feeds_path = feeds;
    }
    if let Some(concurrency) = args.concurrency {
        settings.concurrency = concurrency;
    }
    settings.validate().context("Invalid settings")?;

    // Credentials and feed list are checked before any network activity.
    let credentials = if args.dry_run {
        None
    } else {
        Some(StoreCredentials::from_env().context("Store credentials are not configured")?)
    };

    let entries = load_feed_entries(&settings.feeds_path)
        .await
        .with_context(|| {
            format!(
                "Failed to load feed list from {}",
                settings.feeds_path.display()
            )
        })?;

    let client = build_client(&settings.user_agent).context("Failed to build HTTP client")?;
    let options = RunOptions::from_settings(&settings);

    let summary = match credentials {
        Some(credentials) => {
            let store = RestStore::new(client.clone(), credentials, settings.store_timeout());
            run(client, store, options, &entries).await
        }
        None => {
            tracing::info!("Dry run: nothing will be written to the store");
            run(client, DryRunStore, options, &entries).await
        }
    };

    for outcome in &summary.outcomes {
        println!("{}", outcome.status_line());
    }
    println!("{}", summary.summary_line());

    if !summary.is_success(settings.failure_policy) {
        std::process::exit(1);
    }
    Ok(())
}

async fn run<S: PodcastStore>(
    client: reqwest::Client,
    store: S,
    options: RunOptions,
    entries: &[FeedEntry],
) -> RunSummary {
    Orchestrator::new(client, store, options).run(entries).await
}
