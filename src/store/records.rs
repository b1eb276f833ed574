//! Row types for training batches, trained models and window aggregates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::Hyperparameters;
use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Training batches
// ---------------------------------------------------------------------------

/// Lifecycle of one training attempt: `Queued -> Training -> Completed | Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    Queued,
    Training,
    Completed,
    Failed,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Training => "training",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "queued" => Ok(Self::Queued),
            "training" => Ok(Self::Training),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(Error::Persistence(format!("unknown batch status {other:?}"))),
        }
    }

    /// `Completed` and `Failed` are final.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the executor reports when a batch completes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrainingOutcome {
    pub avg_reward: f64,
    #[serde(default)]
    pub benchmark_score: Option<f64>,
    /// Opaque reference the model registry resolves for inference.
    pub artifact_ref: String,
}

impl TrainingOutcome {
    /// Reject scores that would not survive a JSON round trip.
    pub fn validate(&self) -> Result<()> {
        let scores = std::iter::once(("avgReward", self.avg_reward))
            .chain(self.benchmark_score.map(|v| ("benchmarkScore", v)));
        for (field, value) in scores {
            if !value.is_finite() {
                return Err(Error::InvalidArgument(format!(
                    "{field} must be finite, got {value}"
                )));
            }
        }
        Ok(())
    }
}

/// One triggered training attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrainingBatch {
    pub batch_id: String,
    pub status: BatchStatus,
    pub error: Option<String>,
    pub trajectory_ids: Vec<String>,
    pub base_model: String,
    pub hyperparameters: Hyperparameters,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub outcome: Option<TrainingOutcome>,
}

impl TrainingBatch {
    /// A fresh `Queued` batch over `trajectory_ids`.
    pub fn queued(
        trajectory_ids: Vec<String>,
        base_model: impl Into<String>,
        hyperparameters: Hyperparameters,
    ) -> Self {
        Self {
            batch_id: uuid::Uuid::new_v4().to_string(),
            status: BatchStatus::Queued,
            error: None,
            trajectory_ids,
            base_model: base_model.into(),
            hyperparameters,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            outcome: None,
        }
    }

    /// The hand-off document for the external executor.
    pub fn manifest(&self) -> BatchManifest {
        BatchManifest {
            batch_id: self.batch_id.clone(),
            trajectory_ids: self.trajectory_ids.clone(),
            base_model: self.base_model.clone(),
            hyperparameters: self.hyperparameters.clone(),
        }
    }
}

/// What the external training executor receives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchManifest {
    pub batch_id: String,
    pub trajectory_ids: Vec<String>,
    pub base_model: String,
    pub hyperparameters: Hyperparameters,
}

// ---------------------------------------------------------------------------
// Trained models
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelStatus {
    Ready,
    Deployed,
}

impl ModelStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::Deployed => "deployed",
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "ready" => Ok(Self::Ready),
            "deployed" => Ok(Self::Deployed),
            other => Err(Error::Persistence(format!("unknown model status {other:?}"))),
        }
    }
}

/// A model produced by a completed batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrainedModel {
    pub model_id: String,
    /// `vMAJOR.MINOR.PATCH`, unique and monotonic.
    pub version: String,
    pub base_model: String,
    pub batch_id: String,
    pub avg_reward: f64,
    pub benchmark_score: Option<f64>,
    pub artifact_ref: String,
    pub status: ModelStatus,
    pub trained_at: DateTime<Utc>,
    pub deployed_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Window aggregates
// ---------------------------------------------------------------------------

/// Collection statistics for one window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowStats {
    pub window_id: String,
    pub agent_count: u64,
    pub trajectory_count: u64,
    /// Sum of episode lengths.
    pub total_actions: u64,
    pub avg_pnl: f64,
    pub min_pnl: f64,
    pub max_pnl: f64,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_status_round_trips_through_text() {
        for status in [
            BatchStatus::Queued,
            BatchStatus::Training,
            BatchStatus::Completed,
            BatchStatus::Failed,
        ] {
            assert_eq!(BatchStatus::parse(status.as_str()).unwrap(), status);
            assert_eq!(
                serde_json::to_value(status).unwrap(),
                serde_json::json!(status.as_str())
            );
        }
        assert!(BatchStatus::parse("pending").is_err());
    }

    #[test]
    fn only_completed_and_failed_are_terminal() {
        assert!(!BatchStatus::Queued.is_terminal());
        assert!(!BatchStatus::Training.is_terminal());
        assert!(BatchStatus::Completed.is_terminal());
        assert!(BatchStatus::Failed.is_terminal());
    }

    #[test]
    fn queued_batch_manifest_carries_ids() {
        let batch = TrainingBatch::queued(
            vec!["t1".into(), "t2".into()],
            "base",
            Hyperparameters::default(),
        );
        assert_eq!(batch.status, BatchStatus::Queued);
        let manifest = batch.manifest();
        assert_eq!(manifest.batch_id, batch.batch_id);
        assert_eq!(manifest.trajectory_ids, vec!["t1", "t2"]);

        let json = serde_json::to_value(&manifest).unwrap();
        assert!(json.get("batchId").is_some());
        assert!(json.get("trajectoryIds").is_some());
    }
}
