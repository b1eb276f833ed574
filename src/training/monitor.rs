//! Coarse progress view of a training batch.
//!
//! The external executor reports no intermediate telemetry, so an in-flight
//! batch shows a fixed placeholder progress and ETA.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::store::{BatchStatus, TrainingBatch, TrajectoryStore};

/// Progress reported for any batch in `Training`.
pub const TRAINING_PROGRESS_PLACEHOLDER: f64 = 0.5;

/// Minutes ahead of the observation time reported as the ETA of a training
/// batch.
pub const TRAINING_ETA_PLACEHOLDER_MINUTES: i64 = 30;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchProgress {
    pub batch_id: String,
    pub status: BatchStatus,
    /// In `[0, 1]`.
    pub progress: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BatchProgress {
    /// Project a batch row into its progress view as of `now`.
    pub fn from_batch(batch: &TrainingBatch, now: DateTime<Utc>) -> Self {
        let (progress, eta) = match batch.status {
            BatchStatus::Queued => (0.0, None),
            BatchStatus::Training => (
                TRAINING_PROGRESS_PLACEHOLDER,
                Some(now + Duration::minutes(TRAINING_ETA_PLACEHOLDER_MINUTES)),
            ),
            BatchStatus::Completed => (1.0, None),
            BatchStatus::Failed => (0.0, None),
        };
        Self {
            batch_id: batch.batch_id.clone(),
            status: batch.status,
            progress,
            eta,
            error: batch.error.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TrainingMonitor {
    store: TrajectoryStore,
}

impl TrainingMonitor {
    pub fn new(store: TrajectoryStore) -> Self {
        Self { store }
    }

    /// Progress for `batch_id`; `NotFound` for unknown ids.
    pub async fn monitor(&self, batch_id: &str) -> Result<BatchProgress> {
        let batch = self
            .store
            .get_batch(batch_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("training batch {batch_id}")))?;
        Ok(BatchProgress::from_batch(&batch, Utc::now()))
    }

    /// Progress of the batch currently queued or training, if any.
    pub async fn in_flight(&self) -> Result<Option<BatchProgress>> {
        let now = Utc::now();
        Ok(self
            .store
            .active_batch()
            .await?
            .map(|batch| BatchProgress::from_batch(&batch, now)))
    }
}
