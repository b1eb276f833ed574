//! Hand-off of training manifests to the external executor.
//!
//! The executor owns everything after hand-off: it reports progress back
//! through the pipeline's write-back calls (`mark_training`,
//! `record_completion`, `record_failure`).
//!
//! - [`QueueExecutor`] -- the queued batch row *is* the hand-off; a worker
//!   polls the store for queued batches.
//! - [`HttpExecutor`] -- POSTs the manifest to a training worker.
//! - [`AnyExecutor`] -- enum dispatch for runtime selection from config.

use std::time::Duration;

use tracing::{debug, info};

use crate::config::{ExecutorConfig, ExecutorKind};
use crate::error::{Error, Result};
use crate::store::BatchManifest;

/// Something that accepts a training manifest.
///
/// `submit` returns once the executor has accepted the job, not when training
/// finishes.
#[allow(async_fn_in_trait)]
pub trait TrainingExecutor: Send + Sync {
    async fn submit(&self, manifest: &BatchManifest) -> Result<()>;

    /// Short label used in logs.
    fn name(&self) -> &'static str;
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

/// Leaves the batch queued in the store for a polling worker to claim.
#[derive(Debug, Clone, Default)]
pub struct QueueExecutor;

impl TrainingExecutor for QueueExecutor {
    async fn submit(&self, manifest: &BatchManifest) -> Result<()> {
        debug!(batch_id = %manifest.batch_id, "batch left queued for polling worker");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "queue"
    }
}

// ---------------------------------------------------------------------------
// HTTP
// ---------------------------------------------------------------------------

/// Submits manifests to `POST {worker_url}/train`.
#[derive(Debug, Clone)]
pub struct HttpExecutor {
    worker_url: String,
    http: reqwest::Client,
}

impl HttpExecutor {
    pub fn new(worker_url: &str, timeout: Duration) -> Result<Self> {
        if worker_url.trim().is_empty() {
            return Err(Error::InvalidArgument("executor worker_url is required".into()));
        }
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Executor(format!("failed to build http client: {e}")))?;

        Ok(Self {
            worker_url: worker_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    pub fn worker_url(&self) -> &str {
        &self.worker_url
    }
}

impl TrainingExecutor for HttpExecutor {
    async fn submit(&self, manifest: &BatchManifest) -> Result<()> {
        let url = format!("{}/train", self.worker_url);
        debug!(batch_id = %manifest.batch_id, url = %url, "submitting training manifest");

        let resp = self
            .http
            .post(&url)
            .json(manifest)
            .send()
            .await
            .map_err(|e| Error::Executor(format!("failed to reach training worker: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(Error::Executor(format!(
                "training worker returned {status}: {text}"
            )));
        }

        info!(
            batch_id = %manifest.batch_id,
            trajectories = manifest.trajectory_ids.len(),
            "training worker accepted batch"
        );
        Ok(())
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

// ---------------------------------------------------------------------------
// AnyExecutor: enum dispatch for config-driven selection
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum AnyExecutor {
    Queue(QueueExecutor),
    Http(HttpExecutor),
}

impl AnyExecutor {
    pub fn from_config(config: &ExecutorConfig) -> Result<Self> {
        match config.kind {
            ExecutorKind::Queue => Ok(Self::Queue(QueueExecutor)),
            ExecutorKind::Http => {
                let url = config.worker_url.as_deref().ok_or_else(|| {
                    Error::InvalidArgument("executor kind \"http\" needs worker_url".into())
                })?;
                Ok(Self::Http(HttpExecutor::new(
                    url,
                    Duration::from_secs(config.request_timeout_secs),
                )?))
            }
        }
    }
}

impl TrainingExecutor for AnyExecutor {
    async fn submit(&self, manifest: &BatchManifest) -> Result<()> {
        match self {
            Self::Queue(e) => e.submit(manifest).await,
            Self::Http(e) => e.submit(manifest).await,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::Queue(e) => e.name(),
            Self::Http(e) => e.name(),
        }
    }
}
