//! Training batch rows and the single-flight lane.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use tracing::{debug, info};

use super::{decode_opt_ts, decode_ts, encode_ts, BatchStatus, TrainingBatch, TrajectoryStore};
use crate::error::{Error, Result};

pub(super) const SELECT_BATCH: &str = "SELECT batch_id, status, error, trajectory_ids, base_model,
        hyperparameters, created_at, started_at, completed_at, metrics
     FROM training_batches";

struct RawBatch {
    batch_id: String,
    status: String,
    error: Option<String>,
    trajectory_ids: String,
    base_model: String,
    hyperparameters: String,
    created_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
    metrics: Option<String>,
}

impl RawBatch {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            batch_id: row.get(0)?,
            status: row.get(1)?,
            error: row.get(2)?,
            trajectory_ids: row.get(3)?,
            base_model: row.get(4)?,
            hyperparameters: row.get(5)?,
            created_at: row.get(6)?,
            started_at: row.get(7)?,
            completed_at: row.get(8)?,
            metrics: row.get(9)?,
        })
    }

    fn decode(self) -> Result<TrainingBatch> {
        Ok(TrainingBatch {
            status: BatchStatus::parse(&self.status)?,
            trajectory_ids: serde_json::from_str(&self.trajectory_ids)?,
            hyperparameters: serde_json::from_str(&self.hyperparameters)?,
            created_at: decode_ts(&self.created_at)?,
            started_at: decode_opt_ts(self.started_at)?,
            completed_at: decode_opt_ts(self.completed_at)?,
            outcome: self
                .metrics
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            batch_id: self.batch_id,
            error: self.error,
            base_model: self.base_model,
        })
    }
}

/// Load one batch inside an existing connection or transaction.
pub(super) fn load_batch(conn: &Connection, batch_id: &str) -> Result<Option<TrainingBatch>> {
    conn.query_row(
        &format!("{SELECT_BATCH} WHERE batch_id = ?1"),
        params![batch_id],
        RawBatch::from_row,
    )
    .optional()?
    .map(RawBatch::decode)
    .transpose()
}

/// Load a batch and check it may leave its current status.
pub(super) fn require_status(
    conn: &Connection,
    batch_id: &str,
    allowed: &[BatchStatus],
    target: BatchStatus,
) -> Result<TrainingBatch> {
    let batch = load_batch(conn, batch_id)?
        .ok_or_else(|| Error::NotFound(format!("training batch {batch_id}")))?;
    if !allowed.contains(&batch.status) {
        return Err(Error::invalid_state(format!(
            "training batch {batch_id} cannot move from {} to {target}",
            batch.status
        )));
    }
    Ok(batch)
}

impl TrajectoryStore {
    /// Insert a new `Queued` batch.
    ///
    /// Fails with `InvalidState` if another batch is already queued or
    /// training. The check is the unique index itself, so concurrent callers
    /// cannot both succeed.
    pub async fn create_batch(&self, batch: TrainingBatch) -> Result<()> {
        let trajectory_ids = serde_json::to_string(&batch.trajectory_ids)?;
        let hyperparameters = serde_json::to_string(&batch.hyperparameters)?;

        self.run("create_batch", move |conn| {
            let inserted = conn.execute(
                "INSERT INTO training_batches (
                    batch_id, status, trajectory_ids, base_model, hyperparameters, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    batch.batch_id,
                    batch.status.as_str(),
                    trajectory_ids,
                    batch.base_model,
                    hyperparameters,
                    encode_ts(batch.created_at),
                ],
            );
            match inserted {
                Ok(_) => {
                    info!(
                        batch_id = %batch.batch_id,
                        trajectories = batch.trajectory_ids.len(),
                        "training batch queued"
                    );
                    Ok(())
                }
                Err(rusqlite::Error::SqliteFailure(e, _))
                    if e.code == ErrorCode::ConstraintViolation =>
                {
                    Err(Error::invalid_state(
                        "a training batch is already queued or training",
                    ))
                }
                Err(e) => Err(e.into()),
            }
        })
        .await
    }

    pub async fn get_batch(&self, batch_id: &str) -> Result<Option<TrainingBatch>> {
        let batch_id = batch_id.to_string();
        self.read("get_batch", move |conn| load_batch(conn, &batch_id))
            .await
    }

    /// The batch currently queued or training, if any.
    pub async fn active_batch(&self) -> Result<Option<TrainingBatch>> {
        self.read("active_batch", |conn| {
            conn.query_row(
                &format!("{SELECT_BATCH} WHERE status IN ('queued', 'training') LIMIT 1"),
                [],
                RawBatch::from_row,
            )
            .optional()?
            .map(RawBatch::decode)
            .transpose()
        })
        .await
    }

    /// Completion time of the most recently completed batch.
    pub async fn last_completed_at(&self) -> Result<Option<DateTime<Utc>>> {
        self.read("last_completed_at", |conn| {
            let raw: Option<String> = conn.query_row(
                "SELECT MAX(completed_at) FROM training_batches WHERE status = 'completed'",
                [],
                |row| row.get(0),
            )?;
            decode_opt_ts(raw)
        })
        .await
    }

    pub async fn count_batches(&self, status: BatchStatus) -> Result<u64> {
        self.read("count_batches", move |conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM training_batches WHERE status = ?1",
                params![status.as_str()],
                |row| row.get(0),
            )?;
            Ok(n as u64)
        })
        .await
    }

    /// Most recent batches, newest first.
    pub async fn recent_batches(&self, limit: usize) -> Result<Vec<TrainingBatch>> {
        self.read("recent_batches", move |conn| {
            let mut stmt =
                conn.prepare(&format!("{SELECT_BATCH} ORDER BY created_at DESC LIMIT ?1"))?;
            let rows = stmt.query_map(params![limit as i64], RawBatch::from_row)?;
            let batches = rows
                .map(|raw| raw.map_err(Error::from).and_then(RawBatch::decode))
                .collect::<Result<Vec<_>>>()?;
            Ok(batches)
        })
        .await
    }

    /// `Queued -> Training`.
    pub async fn mark_batch_training(&self, batch_id: &str) -> Result<TrainingBatch> {
        let batch_id = batch_id.to_string();
        self.run("mark_batch_training", move |conn| {
            let tx = conn.transaction()?;
            require_status(&tx, &batch_id, &[BatchStatus::Queued], BatchStatus::Training)?;
            tx.execute(
                "UPDATE training_batches SET status = 'training', started_at = ?1 WHERE batch_id = ?2",
                params![encode_ts(Utc::now()), batch_id],
            )?;
            let batch = load_batch(&tx, &batch_id)?
                .ok_or_else(|| Error::NotFound(format!("training batch {batch_id}")))?;
            tx.commit()?;
            debug!(batch_id = %batch_id, "training batch started");
            Ok(batch)
        })
        .await
    }

    /// `Queued | Training -> Failed`, recording the executor's error.
    pub async fn fail_batch(&self, batch_id: &str, error: &str) -> Result<TrainingBatch> {
        let batch_id = batch_id.to_string();
        let error = error.to_string();
        self.run("fail_batch", move |conn| {
            let tx = conn.transaction()?;
            require_status(
                &tx,
                &batch_id,
                &[BatchStatus::Queued, BatchStatus::Training],
                BatchStatus::Failed,
            )?;
            tx.execute(
                "UPDATE training_batches SET status = 'failed', error = ?1, completed_at = ?2
                 WHERE batch_id = ?3",
                params![error, encode_ts(Utc::now()), batch_id],
            )?;
            let batch = load_batch(&tx, &batch_id)?
                .ok_or_else(|| Error::NotFound(format!("training batch {batch_id}")))?;
            tx.commit()?;
            info!(batch_id = %batch_id, error = %error, "training batch failed");
            Ok(batch)
        })
        .await
    }
}
