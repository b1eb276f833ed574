//! Tidepool: trajectory collection and retraining orchestration.
//!
//! Provides subcommands for operating the pipeline:
//!
//! - `run`       -- Run the automation loop until Ctrl-C
//! - `status`    -- Print the aggregated status report
//! - `health`    -- Check store connectivity and collection rate
//! - `readiness` -- Check whether the corpus is ready for training
//! - `trigger`   -- Attempt a single trigger now
//! - `monitor`   -- Show progress of a training batch
//! - `windows`   -- List recent windows with enough agents, with statistics
//! - `start`     -- Executor write-back: a batch started training
//! - `complete`  -- Executor write-back: a batch finished, record its model
//! - `fail`      -- Executor write-back: a batch failed
//! - `deploy`    -- Promote the newest ready model

use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use tidepool::config::PipelineConfig;
use tidepool::store::TrainingOutcome;
use tidepool::training::AutomationPipeline;
use tidepool::trajectory::window::{parse_window_id, window_id_hours_ago};

// ---------------------------------------------------------------------------
// CLI definition
// ---------------------------------------------------------------------------

/// Tidepool: trajectory collection and retraining orchestration
#[derive(Parser)]
#[command(name = "tidepool", version, about)]
struct Cli {
    /// Path to a JSON configuration file (uses defaults if not provided).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the SQLite database path.
    #[arg(long, global = true)]
    database: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the automation loop until interrupted.
    Run,

    /// Print the aggregated status report.
    Status,

    /// Check store connectivity and the trailing collection rate.
    Health,

    /// Check training readiness.
    Readiness,

    /// Attempt to trigger a training batch now.
    Trigger,

    /// Show progress of a training batch.
    Monitor {
        /// Batch id returned by `trigger`.
        batch_id: String,
    },

    /// List windows with enough distinct agents, with statistics.
    Windows {
        /// Minimum distinct agents per window.
        #[arg(long, default_value_t = 5)]
        min_agents: u64,

        /// How many whole windows back to look.
        #[arg(long, default_value_t = 24)]
        lookback_hours: u32,

        /// Show one window (`YYYY-MM-DDTHH:00`) instead of searching.
        #[arg(long)]
        window: Option<String>,
    },

    /// Mark a queued batch as training.
    Start { batch_id: String },

    /// Record a completed batch and the model it produced.
    Complete {
        batch_id: String,

        /// Opaque reference the model registry resolves for inference.
        #[arg(long)]
        artifact: String,

        /// Mean reward reported by the executor.
        #[arg(long)]
        avg_reward: f64,

        /// Optional benchmark score.
        #[arg(long)]
        benchmark_score: Option<f64>,
    },

    /// Record a failed batch.
    Fail { batch_id: String, error: String },

    /// Promote the newest ready model to deployed.
    Deploy,
}

// ---------------------------------------------------------------------------
// Entrypoint
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // Initialise tracing (reads RUST_LOG env var, defaults to info).
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => PipelineConfig::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => PipelineConfig::default(),
    };
    config.apply_env_overrides();
    if let Some(path) = cli.database {
        config.store.database_path = path;
    }

    let pipeline =
        AutomationPipeline::from_config(config).context("Failed to initialise pipeline")?;

    match cli.command {
        Commands::Run => cmd_run(&pipeline).await,
        Commands::Status => print_json(&pipeline.get_status().await),
        Commands::Health => print_json(&pipeline.check_health().await),
        Commands::Readiness => print_json(&pipeline.check_readiness().await?),
        Commands::Trigger => print_json(&pipeline.trigger().await?),
        Commands::Monitor { batch_id } => print_json(&pipeline.monitor(&batch_id).await?),
        Commands::Windows {
            min_agents,
            lookback_hours,
            window,
        } => cmd_windows(&pipeline, min_agents, lookback_hours, window).await,
        Commands::Start { batch_id } => print_json(&pipeline.mark_training(&batch_id).await?),
        Commands::Complete {
            batch_id,
            artifact,
            avg_reward,
            benchmark_score,
        } => {
            let outcome = TrainingOutcome {
                avg_reward,
                benchmark_score,
                artifact_ref: artifact,
            };
            print_json(&pipeline.record_completion(&batch_id, outcome).await?)
        }
        Commands::Fail { batch_id, error } => {
            print_json(&pipeline.record_failure(&batch_id, &error).await?)
        }
        Commands::Deploy => print_json(&pipeline.deploy_latest().await?),
    }
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_run(pipeline: &AutomationPipeline) -> Result<()> {
    tracing::info!("Starting automation loop (Ctrl-C to stop)");

    pipeline
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            }
        })
        .await;

    tracing::info!("Automation loop stopped");
    Ok(())
}

async fn cmd_windows(
    pipeline: &AutomationPipeline,
    min_agents: u64,
    lookback_hours: u32,
    window: Option<String>,
) -> Result<()> {
    let store = pipeline.store();
    let window_ids = match window {
        Some(window_id) => {
            parse_window_id(&window_id)?;
            vec![window_id]
        }
        None => {
            let since = parse_window_id(&window_id_hours_ago(Utc::now(), lookback_hours))?;
            store.ready_windows(min_agents, since).await?
        }
    };

    let mut stats = Vec::new();
    for window_id in window_ids {
        if let Some(window) = store.window_stats(&window_id).await? {
            stats.push(window);
        }
    }

    tracing::info!(windows = stats.len(), min_agents, "Ready windows");
    print_json(&stats)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("Failed to render output")?;
    println!("{json}");
    Ok(())
}
