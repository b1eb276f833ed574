//! Aggregated, read-only pipeline status.
//!
//! Every field is read independently. A failed read is logged and the field
//! falls back to a safe default, so `get_status` always returns a report.

use std::future::Future;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::health::{HealthChecker, HealthReport};
use crate::error::Result;
use crate::store::{BatchStatus, ModelStatus, TrajectoryStore};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionStatus {
    pub last_24h: u64,
    pub last_7d: u64,
    /// Trajectories per hour over the trailing 24 hours.
    pub hourly_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrainingStatus {
    pub last_completed_at: Option<DateTime<Utc>>,
    pub latest_version: Option<String>,
    pub deployed_models: u64,
    /// Batches currently queued or training (0 or 1).
    pub training_models: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub generated_at: DateTime<Utc>,
    pub collection: CollectionStatus,
    pub training: TrainingStatus,
    pub health: HealthReport,
}

/// Await `read`, logging and substituting `default` on failure.
async fn or_default<T>(field: &'static str, read: impl Future<Output = Result<T>>, default: T) -> T {
    match read.await {
        Ok(value) => value,
        Err(e) => {
            warn!(field, error = %e, "status field degraded");
            default
        }
    }
}

#[derive(Debug, Clone)]
pub struct StatusReporter {
    store: TrajectoryStore,
    health: HealthChecker,
}

impl StatusReporter {
    pub fn new(store: TrajectoryStore, min_hourly_rate: f64) -> Self {
        Self {
            health: HealthChecker::new(store.clone(), min_hourly_rate),
            store,
        }
    }

    /// Connectivity and trailing collection rate only.
    pub async fn check_health(&self) -> HealthReport {
        self.health.check().await
    }

    pub async fn get_status(&self) -> StatusReport {
        let now = Utc::now();
        let store = &self.store;

        // `None` keeps an unreadable count from looking like a low rate.
        let last_24h = or_default(
            "last_24h",
            async {
                store
                    .count_created_since(now - Duration::hours(24))
                    .await
                    .map(Some)
            },
            None,
        )
        .await;
        let last_7d = or_default(
            "last_7d",
            store.count_created_since(now - Duration::days(7)),
            0,
        )
        .await;
        let hourly_rate = last_24h.map(|n| n as f64 / 24.0);

        let last_completed_at =
            or_default("last_completed_at", store.last_completed_at(), None).await;
        let latest_version = or_default("latest_version", store.latest_model(), None)
            .await
            .map(|m| m.version);
        let deployed_models = or_default(
            "deployed_models",
            store.count_models(ModelStatus::Deployed),
            0,
        )
        .await;
        let queued = or_default("queued_batches", store.count_batches(BatchStatus::Queued), 0).await;
        let training =
            or_default("training_batches", store.count_batches(BatchStatus::Training), 0).await;

        let health = self.health.check_with_rate(hourly_rate).await;

        StatusReport {
            generated_at: now,
            collection: CollectionStatus {
                last_24h: last_24h.unwrap_or(0),
                last_7d,
                hourly_rate: hourly_rate.unwrap_or(0.0),
            },
            training: TrainingStatus {
                last_completed_at,
                latest_version,
                deployed_models,
                training_models: queued + training,
            },
            health,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Hyperparameters;
    use crate::store::{TrainingBatch, TrainingOutcome};
    use crate::training::versioner::next_version;
    use crate::trajectory::types::fixtures::trajectory;

    #[tokio::test]
    async fn empty_store_reports_defaults() {
        let store = TrajectoryStore::in_memory().unwrap();
        let report = StatusReporter::new(store, 1.0).get_status().await;

        assert_eq!(report.collection.last_24h, 0);
        assert_eq!(report.collection.hourly_rate, 0.0);
        assert!(report.training.latest_version.is_none());
        assert!(report.training.last_completed_at.is_none());
        assert!(report.health.database);
        assert!(!report.health.warnings.is_empty());
    }

    #[tokio::test]
    async fn reports_collection_and_models() {
        let store = TrajectoryStore::in_memory().unwrap();
        for i in 0..48 {
            store
                .save_trajectory(trajectory(&format!("t{i}"), "a", "w", 1))
                .await
                .unwrap();
        }
        let batch = TrainingBatch::queued(vec!["t0".into()], "base", Hyperparameters::default());
        let id = batch.batch_id.clone();
        store.create_batch(batch).await.unwrap();

        let reporter = StatusReporter::new(store.clone(), 1.0);
        let report = reporter.get_status().await;
        assert_eq!(report.collection.last_24h, 48);
        assert_eq!(report.collection.last_7d, 48);
        assert!((report.collection.hourly_rate - 2.0).abs() < 1e-12);
        assert_eq!(report.training.training_models, 1);
        assert!(report.health.healthy);

        store
            .complete_batch(
                &id,
                TrainingOutcome {
                    avg_reward: 0.3,
                    benchmark_score: None,
                    artifact_ref: "ref".into(),
                },
                next_version,
            )
            .await
            .unwrap();
        store.deploy_latest_ready().await.unwrap();

        let report = reporter.get_status().await;
        assert_eq!(report.training.training_models, 0);
        assert_eq!(report.training.deployed_models, 1);
        assert_eq!(report.training.latest_version.as_deref(), Some("v1.0.0"));
        assert!(report.training.last_completed_at.is_some());
    }

    #[tokio::test]
    async fn status_reads_finish_during_a_long_write() {
        let dir = tempfile::tempdir().unwrap();
        let store =
            TrajectoryStore::open(dir.path().join("status.db"), std::time::Duration::from_secs(5))
                .unwrap();
        for i in 0..48 {
            store
                .save_trajectory(trajectory(&format!("t{i}"), "a", "w", 1))
                .await
                .unwrap();
        }
        let store = store.with_timeout(std::time::Duration::from_millis(100));

        let writer = store.clone();
        let write = tokio::spawn(async move {
            writer
                .run("long_write", |conn| {
                    let tx = conn.transaction()?;
                    tx.execute("DELETE FROM llm_call_logs", [])?;
                    std::thread::sleep(std::time::Duration::from_millis(400));
                    tx.commit()?;
                    Ok(())
                })
                .await
                .unwrap();
        });
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;

        let reporter = StatusReporter::new(store.clone(), 1.0);
        let started = std::time::Instant::now();
        let report = reporter.get_status().await;
        let health = reporter.check_health().await;
        assert!(started.elapsed() < std::time::Duration::from_millis(300));
        assert!(!write.is_finished());

        assert!(report.health.database);
        assert!(report.health.healthy);
        assert_eq!(report.collection.last_24h, 48);
        assert!(health.database);
        assert!(health.healthy);
        write.await.unwrap();
    }

    #[tokio::test]
    async fn broken_store_degrades_without_failing() {
        let store = TrajectoryStore::in_memory().unwrap();
        store
            .run("break", |conn| {
                conn.execute_batch(
                    "DROP TABLE trained_models; DROP TABLE training_batches; \
                     DROP TABLE llm_call_logs; DROP TABLE trajectories;",
                )?;
                Ok(())
            })
            .await
            .unwrap();

        let report = StatusReporter::new(store, 1.0).get_status().await;
        assert_eq!(report.collection.last_24h, 0);
        assert_eq!(report.collection.last_7d, 0);
        assert!(report.training.latest_version.is_none());
        assert_eq!(report.training.training_models, 0);
        // The connectivity check needs no tables.
        assert!(report.health.database);
    }
}
