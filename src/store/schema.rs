use rusqlite::Connection;

use crate::error::Result;

/// Create tables and indexes if they do not exist.
///
/// `training_batches.lane` is constant; the unique partial index over it
/// admits at most one batch in `queued`/`training` at any instant.
pub(super) fn init(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r"
        PRAGMA foreign_keys = ON;

        CREATE TABLE IF NOT EXISTS trajectories (
            trajectory_id TEXT PRIMARY KEY,
            agent_id TEXT NOT NULL,
            scenario_id TEXT NOT NULL,
            window_id TEXT NOT NULL,
            window_hours INTEGER NOT NULL DEFAULT 1,
            steps_json TEXT NOT NULL,
            metrics_json TEXT NOT NULL,
            metadata_json TEXT NOT NULL,
            start_time TEXT NOT NULL,
            end_time TEXT NOT NULL,
            final_pnl REAL NOT NULL,
            final_balance REAL,
            total_reward REAL NOT NULL,
            episode_length INTEGER NOT NULL,
            duration_ms INTEGER NOT NULL,
            ai_judge_reward REAL,
            used_in_training INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_trajectories_scenario
            ON trajectories(scenario_id) WHERE used_in_training = 0;
        CREATE INDEX IF NOT EXISTS idx_trajectories_window
            ON trajectories(window_id);
        CREATE INDEX IF NOT EXISTS idx_trajectories_created
            ON trajectories(created_at);

        CREATE TABLE IF NOT EXISTS llm_call_logs (
            id TEXT PRIMARY KEY,
            trajectory_id TEXT NOT NULL REFERENCES trajectories(trajectory_id) ON DELETE CASCADE,
            step_number INTEGER NOT NULL,
            model TEXT NOT NULL,
            purpose TEXT NOT NULL,
            latency_ms INTEGER,
            prompt_tokens INTEGER,
            completion_tokens INTEGER,
            timestamp TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_llm_call_logs_trajectory
            ON llm_call_logs(trajectory_id);

        CREATE TABLE IF NOT EXISTS training_batches (
            batch_id TEXT PRIMARY KEY,
            status TEXT NOT NULL,
            error TEXT,
            trajectory_ids TEXT NOT NULL,
            base_model TEXT NOT NULL,
            hyperparameters TEXT NOT NULL,
            lane TEXT NOT NULL DEFAULT 'training',
            created_at TEXT NOT NULL,
            started_at TEXT,
            completed_at TEXT,
            metrics TEXT,
            artifact_ref TEXT
        );
        CREATE UNIQUE INDEX IF NOT EXISTS idx_training_batches_single_flight
            ON training_batches(lane) WHERE status IN ('queued', 'training');
        CREATE INDEX IF NOT EXISTS idx_training_batches_completed
            ON training_batches(completed_at) WHERE status = 'completed';

        CREATE TABLE IF NOT EXISTS trained_models (
            model_id TEXT PRIMARY KEY,
            version TEXT NOT NULL UNIQUE,
            base_model TEXT NOT NULL,
            batch_id TEXT NOT NULL UNIQUE REFERENCES training_batches(batch_id),
            avg_reward REAL NOT NULL,
            benchmark_score REAL,
            artifact_ref TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'ready',
            trained_at TEXT NOT NULL,
            deployed_at TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_trained_models_status
            ON trained_models(status);
        ",
    )?;
    Ok(())
}
