//! Trajectory rows, denormalised call logs and collection aggregates.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use tracing::debug;

use super::{decode_ts, encode_ts, TrajectoryStore, WindowStats};
use crate::error::{Error, Result};
use crate::trajectory::types::PersistedTrajectory;

/// Rows that count toward readiness and manifests.
const ELIGIBLE: &str = "used_in_training = 0 AND episode_length > 0";

const SELECT_TRAJECTORY: &str = "SELECT trajectory_id, agent_id, scenario_id, window_id, window_hours,
        steps_json, metrics_json, metadata_json, start_time, end_time, final_pnl,
        final_balance, total_reward, episode_length, duration_ms, ai_judge_reward
     FROM trajectories";

/// Column values as read, before blob and timestamp decoding.
struct RawTrajectory {
    trajectory_id: String,
    agent_id: String,
    scenario_id: String,
    window_id: String,
    window_hours: u32,
    steps_json: String,
    metrics_json: String,
    metadata_json: String,
    start_time: String,
    end_time: String,
    final_pnl: f64,
    final_balance: Option<f64>,
    total_reward: f64,
    episode_length: u32,
    duration_ms: i64,
    ai_judge_reward: Option<f64>,
}

impl RawTrajectory {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            trajectory_id: row.get(0)?,
            agent_id: row.get(1)?,
            scenario_id: row.get(2)?,
            window_id: row.get(3)?,
            window_hours: row.get(4)?,
            steps_json: row.get(5)?,
            metrics_json: row.get(6)?,
            metadata_json: row.get(7)?,
            start_time: row.get(8)?,
            end_time: row.get(9)?,
            final_pnl: row.get(10)?,
            final_balance: row.get(11)?,
            total_reward: row.get(12)?,
            episode_length: row.get(13)?,
            duration_ms: row.get(14)?,
            ai_judge_reward: row.get(15)?,
        })
    }

    fn decode(self) -> Result<PersistedTrajectory> {
        Ok(PersistedTrajectory {
            steps: serde_json::from_str(&self.steps_json)?,
            metrics: serde_json::from_str(&self.metrics_json)?,
            metadata: serde_json::from_str(&self.metadata_json)?,
            start_time: decode_ts(&self.start_time)?,
            end_time: decode_ts(&self.end_time)?,
            trajectory_id: self.trajectory_id,
            agent_id: self.agent_id,
            scenario_id: self.scenario_id,
            window_id: self.window_id,
            window_hours: self.window_hours,
            final_pnl: self.final_pnl,
            final_balance: self.final_balance,
            total_reward: self.total_reward,
            episode_length: self.episode_length,
            duration_ms: self.duration_ms.max(0) as u64,
            ai_judge_reward: self.ai_judge_reward,
        })
    }
}

impl TrajectoryStore {
    /// Upsert a closed trajectory and its call logs in one transaction.
    ///
    /// Keyed by `trajectory_id`: writing the same trajectory again replaces
    /// the row instead of adding one, so a retried write is harmless.
    pub async fn save_trajectory(&self, trajectory: PersistedTrajectory) -> Result<()> {
        let steps_json = serde_json::to_string(&trajectory.steps)?;
        let metrics_json = serde_json::to_string(&trajectory.metrics)?;
        let metadata_json = serde_json::to_string(&trajectory.metadata)?;

        self.run("save_trajectory", move |conn| {
            let t = &trajectory;
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO trajectories (
                    trajectory_id, agent_id, scenario_id, window_id, window_hours,
                    steps_json, metrics_json, metadata_json, start_time, end_time,
                    final_pnl, final_balance, total_reward, episode_length, duration_ms,
                    ai_judge_reward, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
                 ON CONFLICT(trajectory_id) DO UPDATE SET
                    agent_id = excluded.agent_id,
                    scenario_id = excluded.scenario_id,
                    window_id = excluded.window_id,
                    window_hours = excluded.window_hours,
                    steps_json = excluded.steps_json,
                    metrics_json = excluded.metrics_json,
                    metadata_json = excluded.metadata_json,
                    start_time = excluded.start_time,
                    end_time = excluded.end_time,
                    final_pnl = excluded.final_pnl,
                    final_balance = excluded.final_balance,
                    total_reward = excluded.total_reward,
                    episode_length = excluded.episode_length,
                    duration_ms = excluded.duration_ms,
                    ai_judge_reward = COALESCE(excluded.ai_judge_reward, trajectories.ai_judge_reward)",
                params![
                    t.trajectory_id,
                    t.agent_id,
                    t.scenario_id,
                    t.window_id,
                    t.window_hours,
                    steps_json,
                    metrics_json,
                    metadata_json,
                    encode_ts(t.start_time),
                    encode_ts(t.end_time),
                    t.final_pnl,
                    t.final_balance,
                    t.total_reward,
                    t.episode_length,
                    t.duration_ms as i64,
                    t.ai_judge_reward,
                    encode_ts(Utc::now()),
                ],
            )?;

            {
                let mut insert = tx.prepare(
                    "INSERT OR REPLACE INTO llm_call_logs (
                        id, trajectory_id, step_number, model, purpose, latency_ms,
                        prompt_tokens, completion_tokens, timestamp)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                )?;
                for step in &t.steps {
                    for (idx, call) in step.llm_calls.iter().enumerate() {
                        insert.execute(params![
                            format!("{}:{}:{}", t.trajectory_id, step.step_number, idx),
                            t.trajectory_id,
                            step.step_number,
                            call.model,
                            call.purpose.as_str(),
                            call.latency_ms.map(|v| v as i64),
                            call.prompt_tokens,
                            call.completion_tokens,
                            encode_ts(step.timestamp),
                        ])?;
                    }
                }
            }

            tx.commit()?;
            debug!(trajectory_id = %t.trajectory_id, steps = t.steps.len(), "trajectory row written");
            Ok(())
        })
        .await
    }

    pub async fn get_trajectory(&self, trajectory_id: &str) -> Result<Option<PersistedTrajectory>> {
        let trajectory_id = trajectory_id.to_string();
        self.read("get_trajectory", move |conn| {
            let raw = conn
                .query_row(
                    &format!("{SELECT_TRAJECTORY} WHERE trajectory_id = ?1"),
                    params![trajectory_id],
                    RawTrajectory::from_row,
                )
                .optional()?;
            raw.map(RawTrajectory::decode).transpose()
        })
        .await
    }

    /// All persisted trajectories, eligible or not.
    pub async fn count_trajectories(&self) -> Result<u64> {
        self.count("count_trajectories", "SELECT COUNT(*) FROM trajectories".into())
            .await
    }

    /// Trajectories not yet consumed by a completed batch.
    pub async fn count_eligible(&self) -> Result<u64> {
        self.count(
            "count_eligible",
            format!("SELECT COUNT(*) FROM trajectories WHERE {ELIGIBLE}"),
        )
        .await
    }

    /// Trajectories persisted at or after `since`.
    pub async fn count_created_since(&self, since: DateTime<Utc>) -> Result<u64> {
        let since = encode_ts(since);
        self.read("count_created_since", move |conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM trajectories WHERE created_at >= ?1",
                params![since],
                |row| row.get(0),
            )?;
            Ok(n as u64)
        })
        .await
    }

    /// Eligible member counts per scenario id, largest first.
    pub async fn scenario_group_sizes(&self) -> Result<Vec<(String, u64)>> {
        self.read("scenario_group_sizes", |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT scenario_id, COUNT(*) AS n FROM trajectories
                 WHERE {ELIGIBLE}
                 GROUP BY scenario_id
                 ORDER BY n DESC, scenario_id"
            ))?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
            })?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }

    /// Eligible trajectory ids grouped by scenario id.
    pub async fn eligible_ids_by_scenario(&self) -> Result<BTreeMap<String, Vec<String>>> {
        self.read("eligible_ids_by_scenario", |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT scenario_id, trajectory_id FROM trajectories
                 WHERE {ELIGIBLE}
                 ORDER BY created_at"
            ))?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;
            let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
            for row in rows {
                let (scenario, id) = row?;
                groups.entry(scenario).or_default().push(id);
            }
            Ok(groups)
        })
        .await
    }

    /// The `limit` most recently persisted eligible trajectories.
    pub async fn sample_eligible(&self, limit: usize) -> Result<Vec<PersistedTrajectory>> {
        self.read("sample_eligible", move |conn| {
            let mut stmt = conn.prepare(&format!(
                "{SELECT_TRAJECTORY} WHERE {ELIGIBLE} ORDER BY created_at DESC LIMIT ?1"
            ))?;
            let rows = stmt.query_map(params![limit as i64], RawTrajectory::from_row)?;
            let sample = rows
                .map(|raw| raw.map_err(Error::from).and_then(RawTrajectory::decode))
                .collect::<Result<Vec<_>>>()?;
            Ok(sample)
        })
        .await
    }

    /// Attach a judge-assigned reward to an already persisted trajectory.
    pub async fn set_judge_reward(&self, trajectory_id: &str, reward: f64) -> Result<()> {
        if !reward.is_finite() {
            return Err(Error::InvalidArgument(format!(
                "judge reward must be finite, got {reward}"
            )));
        }
        let trajectory_id = trajectory_id.to_string();
        self.run("set_judge_reward", move |conn| {
            let updated = conn.execute(
                "UPDATE trajectories SET ai_judge_reward = ?1 WHERE trajectory_id = ?2",
                params![reward, trajectory_id],
            )?;
            if updated == 0 {
                return Err(Error::NotFound(format!("trajectory {trajectory_id}")));
            }
            Ok(())
        })
        .await
    }

    /// Call-log rows recorded for a trajectory.
    pub async fn count_llm_calls(&self, trajectory_id: &str) -> Result<u64> {
        let trajectory_id = trajectory_id.to_string();
        self.read("count_llm_calls", move |conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM llm_call_logs WHERE trajectory_id = ?1",
                params![trajectory_id],
                |row| row.get(0),
            )?;
            Ok(n as u64)
        })
        .await
    }

    /// Window ids with at least `min_agents` distinct agents among
    /// trajectories persisted since `since`, newest window first.
    pub async fn ready_windows(&self, min_agents: u64, since: DateTime<Utc>) -> Result<Vec<String>> {
        let since = encode_ts(since);
        self.read("ready_windows", move |conn| {
            let mut stmt = conn.prepare(
                "SELECT window_id FROM trajectories
                 WHERE created_at >= ?1
                 GROUP BY window_id
                 HAVING COUNT(DISTINCT agent_id) >= ?2
                 ORDER BY window_id DESC",
            )?;
            let rows = stmt.query_map(params![since, min_agents as i64], |row| row.get(0))?;
            Ok(rows.collect::<rusqlite::Result<Vec<String>>>()?)
        })
        .await
    }

    /// Aggregate statistics for one window, or `None` if it has no rows.
    pub async fn window_stats(&self, window_id: &str) -> Result<Option<WindowStats>> {
        let window_id = window_id.to_string();
        self.read("window_stats", move |conn| {
            let row = conn
                .query_row(
                    "SELECT COUNT(DISTINCT agent_id), COUNT(*),
                            COALESCE(SUM(episode_length), 0),
                            COALESCE(AVG(final_pnl), 0), COALESCE(MIN(final_pnl), 0),
                            COALESCE(MAX(final_pnl), 0), MIN(start_time), MAX(end_time)
                     FROM trajectories WHERE window_id = ?1
                     GROUP BY window_id",
                    params![window_id],
                    |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, i64>(1)?,
                            row.get::<_, i64>(2)?,
                            row.get::<_, f64>(3)?,
                            row.get::<_, f64>(4)?,
                            row.get::<_, f64>(5)?,
                            row.get::<_, String>(6)?,
                            row.get::<_, String>(7)?,
                        ))
                    },
                )
                .optional()?;

            row.map(|(agents, count, actions, avg, min, max, start, end)| {
                Ok(WindowStats {
                    window_id: window_id.clone(),
                    agent_count: agents as u64,
                    trajectory_count: count as u64,
                    total_actions: actions as u64,
                    avg_pnl: avg,
                    min_pnl: min,
                    max_pnl: max,
                    start_time: decode_ts(&start)?,
                    end_time: decode_ts(&end)?,
                })
            })
            .transpose()
        })
        .await
    }

    async fn count(&self, operation: &'static str, sql: String) -> Result<u64> {
        self.read(operation, move |conn| {
            let n: i64 = conn.query_row(&sql, [], |row| row.get(0))?;
            Ok(n as u64)
        })
        .await
    }
}
