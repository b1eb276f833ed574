use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Error, Result};

/// Complete configuration for the collection and retraining pipeline.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub readiness: ReadinessConfig,
    pub training: TrainingConfig,
    pub store: StoreConfig,
    pub executor: ExecutorConfig,
    pub automation: AutomationConfig,
}

/// Thresholds for the readiness gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadinessConfig {
    /// Eligible trajectories required before training (default: 100).
    pub min_trajectories_for_training: u64,
    /// Members a scenario group needs to count as usable (default: 4).
    pub min_group_size: u64,
    /// Usable scenario groups required (default: 10).
    pub min_scenario_groups: u64,
    /// Minimum average data quality in `[0, 1]` (default: 0.95).
    pub data_quality_threshold: f64,
    /// Trajectories sampled when scoring quality (default: 50).
    pub quality_sample_size: usize,
}

/// Hyperparameters forwarded to the external training executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Hyperparameters {
    /// Learning rate (default: 1e-6).
    pub learning_rate: f64,
    /// Passes over the manifest (default: 1).
    pub epochs: u32,
    /// Optimiser batch size (default: 64).
    pub batch_size: u32,
    /// Trajectories per scenario group for group-relative scoring (default: 8).
    pub group_size: u32,
}

/// Trigger and model-registry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// Minimum seconds between the last completed batch and the next trigger
    /// (default: 6 hours).
    pub training_interval_secs: u64,
    /// Base model the executor fine-tunes (e.g. "Qwen/Qwen2.5-7B-Instruct").
    pub base_model: String,
    /// Upper bound on manifest size (default: 1000).
    pub max_trajectories_per_batch: usize,
    pub hyperparameters: Hyperparameters,
    /// Promote the newest ready model to deployed on each tick (default: true).
    pub auto_deploy: bool,
    /// Seconds a batch may sit `queued` before the trigger fails it so a new
    /// batch can open (default: 1 hour, 0 disables).
    pub unclaimed_batch_timeout_secs: u64,
}

/// Durable store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// SQLite database file.
    pub database_path: PathBuf,
    /// Upper bound for any single store call, in milliseconds (default: 5000).
    pub operation_timeout_ms: u64,
    /// Read-only connections serving status and readiness queries, so reads
    /// proceed while a write holds the writer (default: 4).
    pub read_pool_size: usize,
}

/// Which executor receives new batches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorKind {
    /// Leave the queued batch in the store for a polling worker.
    Queue,
    /// POST the manifest to a worker's `/train` endpoint.
    Http,
}

/// External training executor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub kind: ExecutorKind,
    /// Base URL of the training worker (required for `http`).
    pub worker_url: Option<String>,
    /// HTTP hand-off timeout in seconds (default: 30).
    pub request_timeout_secs: u64,
}

/// Control loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutomationConfig {
    /// Seconds between ticks (default: 300).
    pub tick_interval_secs: u64,
    /// Trajectories per hour over the trailing day below which the status
    /// report carries a warning (default: 1.0).
    pub min_hourly_collection_rate: f64,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            min_trajectories_for_training: 100,
            min_group_size: 4,
            min_scenario_groups: 10,
            data_quality_threshold: 0.95,
            quality_sample_size: 50,
        }
    }
}

impl Default for Hyperparameters {
    fn default() -> Self {
        Self {
            learning_rate: 1e-6,
            epochs: 1,
            batch_size: 64,
            group_size: 8,
        }
    }
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            training_interval_secs: 6 * 60 * 60,
            base_model: "Qwen/Qwen2.5-7B-Instruct".into(),
            max_trajectories_per_batch: 1000,
            hyperparameters: Hyperparameters::default(),
            auto_deploy: true,
            unclaimed_batch_timeout_secs: 60 * 60,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("data/tidepool.db"),
            operation_timeout_ms: 5000,
            read_pool_size: crate::store::DEFAULT_READ_POOL_SIZE,
        }
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            kind: ExecutorKind::Queue,
            worker_url: None,
            request_timeout_secs: 30,
        }
    }
}

impl Default for AutomationConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: 300,
            min_hourly_collection_rate: 1.0,
        }
    }
}

impl TrainingConfig {
    pub fn training_interval(&self) -> Duration {
        Duration::from_secs(self.training_interval_secs)
    }

    /// `None` when reaping of unclaimed batches is disabled.
    pub fn unclaimed_batch_timeout(&self) -> Option<Duration> {
        (self.unclaimed_batch_timeout_secs > 0)
            .then(|| Duration::from_secs(self.unclaimed_batch_timeout_secs))
    }
}

impl StoreConfig {
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }
}

impl AutomationConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs.max(1))
    }
}

impl PipelineConfig {
    /// Load a JSON configuration file. Missing fields take their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::InvalidArgument(format!("failed to read config {}: {e}", path.display()))
        })?;
        let config: PipelineConfig = serde_json::from_str(&text)?;
        info!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    /// Fill store and executor locations from the environment when set.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var("TIDEPOOL_DATABASE_PATH") {
            if !path.is_empty() {
                self.store.database_path = PathBuf::from(path);
            }
        }
        if let Ok(url) = std::env::var("TIDEPOOL_WORKER_URL") {
            if !url.is_empty() {
                self.executor.worker_url = Some(url);
            }
        }
    }
}
