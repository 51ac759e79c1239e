use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use streamdims_core::{CancelSignal, ProcessedSnapshot};
use streamdims_storage::{DatasetStore, StoreError, STALE_STAGING_AGE};
use streamdims_sync::{build_scheduler, Pipeline, PipelineConfig, RunSummary};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "streamdims")]
#[command(about = "Ad-saturation ETL over video platform metadata")]
struct Cli {
    #[command(flatten)]
    overrides: Overrides,
    #[command(subcommand)]
    command: Option<Commands>,
}

/// Flags layered over environment and config file values.
#[derive(Debug, Args)]
struct Overrides {
    /// YAML file overlaid on the environment configuration.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Dataset store root.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
    /// Comma-separated category ids, e.g. `10,20`.
    #[arg(long, value_delimiter = ',', global = true)]
    categories: Option<Vec<String>>,
    /// Maximum videos to fetch.
    #[arg(long, global = true)]
    limit: Option<usize>,
    /// Quota units the run may spend.
    #[arg(long, global = true)]
    quota: Option<u64>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch, normalize, compute and publish one snapshot.
    Run {
        /// Continue the newest incomplete raw snapshot instead of starting over.
        #[arg(long)]
        resume: bool,
        /// Print the run summary as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Show the latest processed snapshot.
    Latest {
        #[arg(long)]
        json: bool,
    },
    /// Run on the configured cron schedule until interrupted.
    Schedule,
    /// Delete staging directories left by interrupted runs.
    SweepStaging {
        /// Only remove directories idle for at least this many seconds.
        #[arg(long, default_value_t = STALE_STAGING_AGE.as_secs())]
        idle_secs: u64,
    },
}

fn init_tracing() -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("STREAMDIMS_LOG_JSON")
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(false);

    // Logs go to stderr; stdout carries command output.
    let registry = tracing_subscriber::registry().with(env_filter);
    let installed = if json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(true)
                    .with_writer(std::io::stderr),
            )
            .try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init()
    };
    installed.context("installing tracing subscriber")
}

fn load_config(overrides: &Overrides) -> Result<PipelineConfig> {
    let mut config = PipelineConfig::from_env();
    if let Some(path) = &overrides.config {
        config = config.with_overlay_file(path)?;
    }
    if let Some(dir) = &overrides.data_dir {
        config.data_dir = dir.clone();
    }
    if let Some(categories) = &overrides.categories {
        config.categories = categories
            .iter()
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .collect();
    }
    if let Some(limit) = overrides.limit {
        config.item_limit = limit;
    }
    if let Some(quota) = overrides.quota {
        config.quota_budget = quota;
    }
    config.validate()?;
    Ok(config)
}

/// Cancel `signal` on the first Ctrl-C.
fn cancel_on_ctrl_c(signal: CancelSignal) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; stopping at the next page or batch boundary");
            signal.cancel();
        }
    });
}

fn print_summary(summary: &RunSummary) {
    println!(
        "run {} {}: videos={} channels={} rejected={} raw_items={} quota_spent={} fetch_attempts={}",
        summary.run_id,
        summary.state.as_str(),
        summary.videos,
        summary.channels,
        summary.rejected.len(),
        summary.raw_items,
        summary.quota_spent,
        summary.fetch_attempts,
    );
    if let Some(path) = &summary.processed_snapshot {
        println!("processed snapshot: {}", path.display());
    }
    if let Some(point) = &summary.resume_point {
        println!(
            "resumable at category #{} page {} after {} videos (use `run --resume`)",
            point.category_index,
            point.page_token.as_deref().unwrap_or("<first>"),
            point.videos_emitted,
        );
    }
}

fn print_snapshot(snapshot: &ProcessedSnapshot) {
    println!(
        "snapshot {}: {} videos, {} rejected records",
        snapshot.run_id,
        snapshot.rows.len(),
        snapshot.rejected.len()
    );
    println!(
        "{:<6} {:<24} {:>7} {:>13} {:>13} {:>11}",
        "cat", "name", "videos", "ads/min", "ad ratio", "engagement"
    );
    for r in &snapshot.rollups {
        let density = r
            .mean_ad_density
            .map(|d| format!("{d:.3}"))
            .unwrap_or_else(|| "n/a".to_string());
        println!(
            "{:<6} {:<24} {:>7} {:>13} {:>13.3} {:>11.4}",
            r.category_id, r.category_name, r.video_count, density, r.mean_ad_ratio, r.mean_engagement_rate
        );
    }
}

async fn run_once(config: PipelineConfig, resume: bool, json: bool) -> Result<()> {
    let pipeline = Pipeline::from_config(config)?;
    let resume_from = if resume {
        let pending = pipeline.pending_resume().await?;
        if pending.is_none() {
            info!("no incomplete raw snapshot; starting a fresh fetch");
        }
        pending
    } else {
        None
    };

    let cancel = CancelSignal::new();
    cancel_on_ctrl_c(cancel.clone());
    let summary = pipeline.run_with(cancel, resume_from).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print_summary(&summary);
    }
    if !summary.succeeded() {
        bail!("run {} did not complete", summary.run_id);
    }
    Ok(())
}

async fn show_latest(config: &PipelineConfig, json: bool) -> Result<()> {
    let store = DatasetStore::new(config.data_dir.clone());
    match store.read_latest_processed().await {
        Ok(snapshot) if json => println!("{}", serde_json::to_string_pretty(&snapshot)?),
        Ok(snapshot) => print_snapshot(&snapshot),
        Err(StoreError::NoDataAvailable) => {
            println!("no processed snapshot yet under {}", config.data_dir.display())
        }
        Err(err) => return Err(err.into()),
    }
    Ok(())
}

async fn schedule(config: PipelineConfig) -> Result<()> {
    let pipeline = Arc::new(Pipeline::from_config(config)?);
    let cancel = CancelSignal::new();
    let mut sched = build_scheduler(Arc::clone(&pipeline), cancel.clone()).await?;
    sched.start().await.context("starting scheduler")?;
    info!(crons = ?pipeline.config().scheduler_crons, "scheduler running; Ctrl-C to stop");

    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    cancel.cancel();
    sched.shutdown().await.context("stopping scheduler")?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing()?;
    let cli = Cli::parse();
    let config = load_config(&cli.overrides)?;

    match cli.command.unwrap_or(Commands::Run {
        resume: false,
        json: false,
    }) {
        Commands::Run { resume, json } => run_once(config, resume, json).await?,
        Commands::Latest { json } => show_latest(&config, json).await?,
        Commands::Schedule => schedule(config).await?,
        Commands::SweepStaging { idle_secs } => {
            let removed = DatasetStore::new(config.data_dir.clone())
                .sweep_staging_older_than(Duration::from_secs(idle_secs))
                .await?;
            println!("removed {removed} staging directories");
        }
    }

    Ok(())
}
