//! Trained model rows, batch completion and deployment promotion.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use tracing::info;

use super::batches::require_status;
use super::{
    decode_opt_ts, decode_ts, encode_ts, BatchStatus, ModelStatus, TrainedModel, TrainingOutcome,
    TrajectoryStore,
};
use crate::error::{Error, Result};

const SELECT_MODEL: &str = "SELECT model_id, version, base_model, batch_id, avg_reward,
        benchmark_score, artifact_ref, status, trained_at, deployed_at
     FROM trained_models";

/// Chooses the version for a new model given every version already issued.
pub type VersionAllocator = fn(&[String]) -> Result<String>;

struct RawModel {
    model_id: String,
    version: String,
    base_model: String,
    batch_id: String,
    avg_reward: f64,
    benchmark_score: Option<f64>,
    artifact_ref: String,
    status: String,
    trained_at: String,
    deployed_at: Option<String>,
}

impl RawModel {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            model_id: row.get(0)?,
            version: row.get(1)?,
            base_model: row.get(2)?,
            batch_id: row.get(3)?,
            avg_reward: row.get(4)?,
            benchmark_score: row.get(5)?,
            artifact_ref: row.get(6)?,
            status: row.get(7)?,
            trained_at: row.get(8)?,
            deployed_at: row.get(9)?,
        })
    }

    fn decode(self) -> Result<TrainedModel> {
        Ok(TrainedModel {
            status: ModelStatus::parse(&self.status)?,
            trained_at: decode_ts(&self.trained_at)?,
            deployed_at: decode_opt_ts(self.deployed_at)?,
            model_id: self.model_id,
            version: self.version,
            base_model: self.base_model,
            batch_id: self.batch_id,
            avg_reward: self.avg_reward,
            benchmark_score: self.benchmark_score,
            artifact_ref: self.artifact_ref,
        })
    }
}

fn query_model(conn: &Connection, clause: &str) -> Result<Option<TrainedModel>> {
    conn.query_row(&format!("{SELECT_MODEL} {clause}"), [], RawModel::from_row)
        .optional()?
        .map(RawModel::decode)
        .transpose()
}

fn all_versions(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT version FROM trained_models")?;
    let rows = stmt.query_map([], |row| row.get(0))?;
    Ok(rows.collect::<rusqlite::Result<Vec<String>>>()?)
}

impl TrajectoryStore {
    /// Complete a batch and record the model it produced.
    ///
    /// Runs as one immediate transaction: the batch transition, the version
    /// read, the model insert and the manifest's `used_in_training` flags
    /// commit together or not at all. Two completions therefore cannot be
    /// issued the same version.
    pub async fn complete_batch(
        &self,
        batch_id: &str,
        outcome: TrainingOutcome,
        allocate: VersionAllocator,
    ) -> Result<TrainedModel> {
        outcome.validate()?;
        let batch_id = batch_id.to_string();
        let metrics = serde_json::to_string(&outcome)?;

        self.run("complete_batch", move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let batch = require_status(
                &tx,
                &batch_id,
                &[BatchStatus::Queued, BatchStatus::Training],
                BatchStatus::Completed,
            )?;

            let version = allocate(&all_versions(&tx)?)?;
            let now = Utc::now();
            let model = TrainedModel {
                model_id: format!("tidepool-{version}"),
                version,
                base_model: batch.base_model.clone(),
                batch_id: batch_id.clone(),
                avg_reward: outcome.avg_reward,
                benchmark_score: outcome.benchmark_score,
                artifact_ref: outcome.artifact_ref.clone(),
                status: ModelStatus::Ready,
                trained_at: now,
                deployed_at: None,
            };

            tx.execute(
                "INSERT INTO trained_models (
                    model_id, version, base_model, batch_id, avg_reward, benchmark_score,
                    artifact_ref, status, trained_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    model.model_id,
                    model.version,
                    model.base_model,
                    model.batch_id,
                    model.avg_reward,
                    model.benchmark_score,
                    model.artifact_ref,
                    model.status.as_str(),
                    encode_ts(now),
                ],
            )?;
            tx.execute(
                "UPDATE training_batches
                 SET status = 'completed', completed_at = ?1, metrics = ?2, artifact_ref = ?3, error = NULL
                 WHERE batch_id = ?4",
                params![encode_ts(now), metrics, model.artifact_ref, batch_id],
            )?;
            {
                let mut mark = tx.prepare(
                    "UPDATE trajectories SET used_in_training = 1 WHERE trajectory_id = ?1",
                )?;
                for id in &batch.trajectory_ids {
                    mark.execute(params![id])?;
                }
            }
            tx.commit()?;

            info!(
                batch_id = %batch_id,
                version = %model.version,
                trajectories = batch.trajectory_ids.len(),
                "trained model recorded"
            );
            Ok(model)
        })
        .await
    }

    /// Every version issued so far, in no particular order.
    pub async fn model_versions(&self) -> Result<Vec<String>> {
        self.read("model_versions", |conn| all_versions(conn)).await
    }

    /// The most recently trained model.
    pub async fn latest_model(&self) -> Result<Option<TrainedModel>> {
        self.read("latest_model", |conn| {
            query_model(conn, "ORDER BY trained_at DESC, rowid DESC LIMIT 1")
        })
        .await
    }

    pub async fn model_for_batch(&self, batch_id: &str) -> Result<Option<TrainedModel>> {
        let batch_id = batch_id.to_string();
        self.read("model_for_batch", move |conn| {
            conn.query_row(
                &format!("{SELECT_MODEL} WHERE batch_id = ?1"),
                params![batch_id],
                RawModel::from_row,
            )
            .optional()?
            .map(RawModel::decode)
            .transpose()
        })
        .await
    }

    pub async fn count_models(&self, status: ModelStatus) -> Result<u64> {
        self.read("count_models", move |conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM trained_models WHERE status = ?1",
                params![status.as_str()],
                |row| row.get(0),
            )?;
            Ok(n as u64)
        })
        .await
    }

    /// Promote the newest model to `deployed` if it is still `ready`.
    ///
    /// At most one model is deployed; the previously deployed model returns
    /// to `ready`. Returns the promoted model, or `None` when there is
    /// nothing newer to deploy.
    pub async fn deploy_latest_ready(&self) -> Result<Option<TrainedModel>> {
        self.run("deploy_latest_ready", |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let newest = match query_model(&tx, "ORDER BY trained_at DESC, rowid DESC LIMIT 1")? {
                Some(model) if model.status == ModelStatus::Ready => model,
                _ => return Ok(None),
            };

            let now = Utc::now();
            tx.execute(
                "UPDATE trained_models SET status = 'ready' WHERE status = 'deployed'",
                [],
            )?;
            tx.execute(
                "UPDATE trained_models SET status = 'deployed', deployed_at = ?1 WHERE model_id = ?2",
                params![encode_ts(now), newest.model_id],
            )?;
            tx.commit()?;

            info!(model_id = %newest.model_id, version = %newest.version, "model deployed");
            Ok(Some(TrainedModel {
                status: ModelStatus::Deployed,
                deployed_at: Some(now),
                ..newest
            }))
        })
        .await
    }
}
