use anyhow::{Context, Result, bail};
use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;

use screening_ingest::cleanup::sweep_past_screenings;
use screening_ingest::config::{Config, DEFAULT_CONFIG_PATH};
use screening_ingest::enrich::enrich_missing_metadata;
use screening_ingest::logging::init_logging;
use screening_ingest::matching::TmdbClient;
use screening_ingest::pipeline::Pipeline;
use screening_ingest::store::{JsonFileStore, ScreeningStore};

#[derive(Parser)]
#[command(name = "screening-ingest", about = "Scrape, match and reconcile cinema listings")]
struct Cli {
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Emit logs as JSON lines on stderr.
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one or more venues through the full pipeline.
    Run {
        #[arg(long = "venue")]
        venues: Vec<String>,
        /// Run every enabled venue.
        #[arg(long, conflicts_with = "venues")]
        all: bool,
        #[arg(long, default_value = "manual")]
        triggered_by: String,
    },
    /// Probe a venue's site without scraping it.
    HealthCheck {
        #[arg(long)]
        venue: String,
    },
    ListVenues,
    /// Delete screenings that are already over.
    Cleanup {
        /// Defaults to `pipeline.cleanup_grace_hours`.
        #[arg(long)]
        grace_hours: Option<i64>,
    },
    /// Fill missing film metadata from the provider.
    Enrich {
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();
    init_logging(cli.json_logs);

    let config = Config::load(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;
    let store: Arc<dyn ScreeningStore> = Arc::new(
        JsonFileStore::open(&config.pipeline.store_path)
            .with_context(|| format!("failed to open store at {}", config.pipeline.store_path))?,
    );

    match cli.command {
        Command::Run {
            venues,
            all,
            triggered_by,
        } => {
            let pipeline = Pipeline::new(config, store)?;
            let ids = if all { pipeline.enabled_venues() } else { venues };
            if ids.is_empty() {
                bail!("nothing to run: pass --venue <ID> or --all");
            }
            let results = pipeline.run_batch(&ids, &triggered_by).await;
            print_json(&results)?;
            let failed = results.iter().filter(|r| !r.success).count();
            if failed > 0 {
                bail!("{failed} of {} venue runs failed", results.len());
            }
        }
        Command::HealthCheck { venue } => {
            let pipeline = Pipeline::new(config, store)?;
            let healthy = pipeline.health_check(&venue).await?;
            print_json(&json!({ "venue": venue, "healthy": healthy }))?;
            if !healthy {
                bail!("venue {venue} failed its health check");
            }
        }
        Command::ListVenues => {
            print_json(&config.venues)?;
        }
        Command::Cleanup { grace_hours } => {
            let grace = Duration::hours(grace_hours.unwrap_or(config.pipeline.cleanup_grace_hours));
            let removed = sweep_past_screenings(store.as_ref(), Utc::now(), grace).await?;
            print_json(&json!({ "removed": removed }))?;
        }
        Command::Enrich { limit } => {
            let provider = TmdbClient::from_config(&config.tmdb).context("enrichment needs the metadata provider")?;
            let report = enrich_missing_metadata(store.as_ref(), &provider, limit, Utc::now()).await?;
            print_json(&report)?;
        }
    }
    Ok(())
}
