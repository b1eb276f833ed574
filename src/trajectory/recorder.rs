//! Per-episode recording state machine.
//!
//! Each open trajectory lives in an arena keyed by its id. A trajectory moves
//! through `Recording { open_step: None }` -> `Recording { open_step: Some }`
//! -> back to `None` once per decision, and finally to `Closing` when `end`
//! builds its persisted record. The only durable write happens in `end`.
//!
//! Distinct trajectories never share a lock beyond the brief arena lookup, so
//! recording across agents runs in parallel.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, SubsecRound, Utc};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::types::{
    Action, EnvironmentState, EpisodeOutcome, LlmCall, Metadata, PersistedTrajectory,
    ProviderAccess, Step, TrajectoryMetrics, GROUND_TRUTH_KEY,
};
use crate::error::{Error, Result};
use crate::store::TrajectoryStore;

/// Trajectories are recorded against one-hour windows.
const WINDOW_HOURS: u32 = 1;

/// Timestamps the recorder captures carry the store's millisecond precision,
/// so the record `end` returns equals the row read back.
fn captured_now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

fn require_finite(field: &str, value: f64) -> Result<()> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(Error::InvalidArgument(format!(
            "{field} must be finite, got {value}"
        )))
    }
}

// ---------------------------------------------------------------------------
// Arena entries
// ---------------------------------------------------------------------------

/// A step that has been opened but not yet committed with an action.
#[derive(Debug)]
struct OpenStep {
    timestamp: DateTime<Utc>,
    environment_state: EnvironmentState,
    provider_accesses: Vec<ProviderAccess>,
    llm_calls: Vec<LlmCall>,
}

#[derive(Debug)]
enum Phase {
    Recording { open_step: Option<OpenStep> },
    /// `end` has built the record from `outcome`; the durable write has not
    /// yet succeeded.
    Closing {
        record: PersistedTrajectory,
        outcome: EpisodeOutcome,
    },
}

#[derive(Debug)]
struct ActiveTrajectory {
    agent_id: String,
    scenario_id: String,
    window_id: String,
    metadata: Metadata,
    start_time: DateTime<Utc>,
    steps: Vec<Step>,
    phase: Phase,
}

impl ActiveTrajectory {
    fn open_step_mut(&mut self, trajectory_id: &str) -> Result<&mut OpenStep> {
        match &mut self.phase {
            Phase::Recording {
                open_step: Some(step),
            } => Ok(step),
            Phase::Recording { open_step: None } => Err(Error::invalid_state(format!(
                "trajectory {trajectory_id} has no open step"
            ))),
            Phase::Closing { .. } => Err(closing(trajectory_id)),
        }
    }

    /// Build the persisted record, discarding any step left open.
    fn close(&mut self, trajectory_id: &str, outcome: EpisodeOutcome) -> PersistedTrajectory {
        let end_time = captured_now();
        let duration_ms = (end_time - self.start_time).num_milliseconds().max(0) as u64;
        let metrics = TrajectoryMetrics::compute(&self.steps, duration_ms, &outcome);

        let mut metadata = self.metadata.clone();
        if let Some(ground_truth) = outcome.ground_truth {
            metadata.insert(
                GROUND_TRUTH_KEY.to_string(),
                serde_json::Value::Object(ground_truth),
            );
        }

        PersistedTrajectory {
            trajectory_id: trajectory_id.to_string(),
            agent_id: self.agent_id.clone(),
            scenario_id: self.scenario_id.clone(),
            window_id: self.window_id.clone(),
            window_hours: WINDOW_HOURS,
            steps: std::mem::take(&mut self.steps),
            final_pnl: outcome.final_pnl,
            final_balance: outcome.final_balance,
            total_reward: metrics.total_reward,
            episode_length: metrics.episode_length,
            duration_ms,
            metrics,
            metadata,
            start_time: self.start_time,
            end_time,
            ai_judge_reward: None,
        }
    }
}

fn closing(trajectory_id: &str) -> Error {
    Error::invalid_state(format!("trajectory {trajectory_id} is closing"))
}

// ---------------------------------------------------------------------------
// Recorder
// ---------------------------------------------------------------------------

/// Records agent episodes step by step and persists each one on `end`.
///
/// Calls for one trajectory must be made sequentially by its owner; calls for
/// different trajectories may run concurrently.
#[derive(Debug)]
pub struct TrajectoryRecorder {
    store: TrajectoryStore,
    active: RwLock<HashMap<String, Arc<Mutex<ActiveTrajectory>>>>,
}

impl TrajectoryRecorder {
    pub fn new(store: TrajectoryStore) -> Self {
        Self {
            store,
            active: RwLock::new(HashMap::new()),
        }
    }

    /// Number of trajectories currently open or awaiting a durable write.
    pub fn active_count(&self) -> usize {
        self.active.read().len()
    }

    fn entry(&self, trajectory_id: &str) -> Result<Arc<Mutex<ActiveTrajectory>>> {
        self.active
            .read()
            .get(trajectory_id)
            .cloned()
            .ok_or_else(|| {
                Error::invalid_state(format!("trajectory {trajectory_id} is unknown or closed"))
            })
    }

    /// Open a new trajectory and return its id.
    ///
    /// `scenario_id` defaults to `window_id`.
    pub fn begin(
        &self,
        agent_id: &str,
        window_id: &str,
        scenario_id: Option<&str>,
        metadata: Option<Metadata>,
    ) -> Result<String> {
        if window_id.trim().is_empty() {
            return Err(Error::InvalidArgument("window id is required".into()));
        }

        let trajectory_id = Uuid::new_v4().to_string();
        let scenario_id = scenario_id
            .filter(|s| !s.trim().is_empty())
            .unwrap_or(window_id)
            .to_string();

        let entry = ActiveTrajectory {
            agent_id: agent_id.to_string(),
            scenario_id,
            window_id: window_id.to_string(),
            metadata: metadata.unwrap_or_default(),
            start_time: captured_now(),
            steps: Vec::new(),
            phase: Phase::Recording { open_step: None },
        };

        debug!(
            trajectory_id = %trajectory_id,
            agent_id,
            window_id,
            scenario_id = %entry.scenario_id,
            "trajectory started"
        );
        self.active
            .write()
            .insert(trajectory_id.clone(), Arc::new(Mutex::new(entry)));
        Ok(trajectory_id)
    }

    /// Open a step with the environment as the agent sees it.
    pub fn begin_step(&self, trajectory_id: &str, environment_state: EnvironmentState) -> Result<()> {
        require_finite("agentBalance", environment_state.agent_balance)?;
        require_finite("agentPnL", environment_state.agent_pnl)?;
        let entry = self.entry(trajectory_id)?;
        let mut active = entry.lock();
        match &mut active.phase {
            Phase::Recording { open_step: None } => {}
            Phase::Recording { open_step: Some(_) } => {
                return Err(Error::invalid_state(format!(
                    "trajectory {trajectory_id} already has an open step"
                )))
            }
            Phase::Closing { .. } => return Err(closing(trajectory_id)),
        }

        let step_number = active.steps.len() as u32;
        active.phase = Phase::Recording {
            open_step: Some(OpenStep {
                timestamp: captured_now(),
                environment_state,
                provider_accesses: Vec::new(),
                llm_calls: Vec::new(),
            }),
        };
        debug!(trajectory_id, step = step_number, "step opened");
        Ok(())
    }

    pub fn record_provider_access(&self, trajectory_id: &str, access: ProviderAccess) -> Result<()> {
        let entry = self.entry(trajectory_id)?;
        let mut active = entry.lock();
        let step = active.open_step_mut(trajectory_id)?;
        debug!(trajectory_id, provider = %access.provider_name, "provider access recorded");
        step.provider_accesses.push(access);
        Ok(())
    }

    /// Append a model call to the open step. Retries within one decision are
    /// recorded as separate calls.
    pub fn record_model_call(&self, trajectory_id: &str, call: LlmCall) -> Result<()> {
        require_finite("temperature", call.temperature)?;
        let entry = self.entry(trajectory_id)?;
        let mut active = entry.lock();
        let step = active.open_step_mut(trajectory_id)?;
        debug!(
            trajectory_id,
            model = %call.model,
            purpose = call.purpose.as_str(),
            "model call recorded"
        );
        step.llm_calls.push(call);
        Ok(())
    }

    /// Commit the open step with its action and reward.
    pub fn complete_step(&self, trajectory_id: &str, action: Action, reward: f64) -> Result<()> {
        require_finite("reward", reward)?;
        let entry = self.entry(trajectory_id)?;
        let mut active = entry.lock();
        let open = match &mut active.phase {
            Phase::Recording { open_step } => open_step.take().ok_or_else(|| {
                Error::invalid_state(format!("trajectory {trajectory_id} has no open step"))
            })?,
            Phase::Closing { .. } => return Err(closing(trajectory_id)),
        };

        let step_number = active.steps.len() as u32;
        debug!(
            trajectory_id,
            step = step_number,
            action = %action.action_type,
            success = action.success,
            reward,
            "step completed"
        );
        active.steps.push(Step {
            step_number,
            timestamp: open.timestamp,
            environment_state: open.environment_state,
            provider_accesses: open.provider_accesses,
            llm_calls: open.llm_calls,
            action,
            reward,
        });
        Ok(())
    }

    /// Close the trajectory and persist it.
    ///
    /// Non-finite `final_pnl` or `final_balance` fail `InvalidArgument` and
    /// leave the trajectory open.
    ///
    /// If the write fails the trajectory stays in the arena and `end` may be
    /// called again. The retry writes the record built by the first call: its
    /// `outcome` argument is ignored (with a warning if it differs). The store
    /// upserts by id so no duplicate row appears. Once the write succeeds the
    /// trajectory is gone and further calls fail `InvalidState`.
    pub async fn end(
        &self,
        trajectory_id: &str,
        outcome: EpisodeOutcome,
    ) -> Result<PersistedTrajectory> {
        let entry = self.entry(trajectory_id)?;
        let record = {
            let mut active = entry.lock();
            if let Phase::Closing {
                record,
                outcome: first,
            } = &active.phase
            {
                if *first != outcome {
                    warn!(
                        trajectory_id,
                        "retried end carries a different outcome; keeping the first"
                    );
                }
                record.clone()
            } else {
                require_finite("finalPnL", outcome.final_pnl)?;
                if let Some(balance) = outcome.final_balance {
                    require_finite("finalBalance", balance)?;
                }
                let total: f64 = active.steps.iter().map(|s| s.reward).sum();
                require_finite("totalReward", total)?;

                if matches!(active.phase, Phase::Recording { open_step: Some(_) }) {
                    warn!(trajectory_id, "discarding step left open at end");
                }
                let record = active.close(trajectory_id, outcome.clone());
                active.phase = Phase::Closing {
                    record: record.clone(),
                    outcome,
                };
                record
            }
        };

        self.store.save_trajectory(record.clone()).await?;
        self.active.write().remove(trajectory_id);

        info!(
            trajectory_id,
            agent_id = %record.agent_id,
            scenario_id = %record.scenario_id,
            episode_length = record.episode_length,
            total_reward = record.total_reward,
            "trajectory persisted"
        );
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trajectory::types::fixtures::{action, env_state, llm_call, provider_access};
    use crate::trajectory::types::group_by_scenario;

    fn recorder() -> (TrajectoryRecorder, TrajectoryStore) {
        let store = TrajectoryStore::in_memory().unwrap();
        (TrajectoryRecorder::new(store.clone()), store)
    }

    fn pnl(final_pnl: f64) -> EpisodeOutcome {
        EpisodeOutcome {
            final_pnl,
            ..Default::default()
        }
    }

    fn record_step(rec: &TrajectoryRecorder, id: &str, reward: f64) {
        rec.begin_step(id, env_state()).unwrap();
        rec.record_provider_access(id, provider_access()).unwrap();
        rec.record_model_call(id, llm_call()).unwrap();
        rec.complete_step(id, action(true), reward).unwrap();
    }

    #[tokio::test]
    async fn single_step_episode() {
        let (rec, store) = recorder();
        let id = rec.begin("a1", "2025-01-15T10:00", None, None).unwrap();
        record_step(&rec, &id, 0.5);

        let persisted = rec.end(&id, pnl(100.0)).await.unwrap();

        assert_eq!(persisted.episode_length, 1);
        assert!((persisted.total_reward - 0.5).abs() < 1e-12);
        assert_eq!(persisted.scenario_id, "2025-01-15T10:00");
        assert_eq!(persisted.final_pnl, 100.0);

        assert_eq!(persisted.start_time.timestamp_subsec_nanos() % 1_000_000, 0);
        assert_eq!(persisted.end_time.timestamp_subsec_nanos() % 1_000_000, 0);
        let stored = store.get_trajectory(&id).await.unwrap().unwrap();
        assert_eq!(stored, persisted);
        assert_eq!(store.count_llm_calls(&id).await.unwrap(), 1);
        assert_eq!(rec.active_count(), 0);
    }

    #[tokio::test]
    async fn length_and_reward_follow_completed_steps() {
        let (rec, _) = recorder();
        let id = rec.begin("a1", "2025-01-15T10:00", Some("s1"), None).unwrap();
        let rewards = [0.25, -1.0, 2.0, 0.0];
        for r in rewards {
            record_step(&rec, &id, r);
        }

        let persisted = rec.end(&id, pnl(0.0)).await.unwrap();
        assert_eq!(persisted.episode_length as usize, rewards.len());
        assert!((persisted.total_reward - rewards.iter().sum::<f64>()).abs() < 1e-12);
        assert_eq!(persisted.scenario_id, "s1");
        let numbers: Vec<u32> = persisted.steps.iter().map(|s| s.step_number).collect();
        assert_eq!(numbers, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn default_scenario_groups_agents_by_window() {
        let (rec, store) = recorder();
        let mut persisted = Vec::new();
        for agent in ["a1", "a2", "a3", "a4", "a5"] {
            let id = rec.begin(agent, "2025-01-15T11:00", None, None).unwrap();
            record_step(&rec, &id, 1.0);
            persisted.push(rec.end(&id, pnl(1.0)).await.unwrap());
        }

        let groups = group_by_scenario(&persisted);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups["2025-01-15T11:00"].len(), 5);
        assert_eq!(
            store.scenario_group_sizes().await.unwrap(),
            vec![("2025-01-15T11:00".to_string(), 5)]
        );
    }

    #[test]
    fn empty_window_is_rejected() {
        let (rec, _) = recorder();
        assert!(matches!(
            rec.begin("a1", "", None, None),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            rec.begin("a1", "   ", None, None),
            Err(Error::InvalidArgument(_))
        ));
        assert_eq!(rec.active_count(), 0);
    }

    #[test]
    fn double_begin_step_is_rejected() {
        let (rec, _) = recorder();
        let id = rec.begin("a1", "w", None, None).unwrap();
        rec.begin_step(&id, env_state()).unwrap();
        assert!(matches!(
            rec.begin_step(&id, env_state()),
            Err(Error::InvalidState(_))
        ));
    }

    #[test]
    fn step_calls_need_an_open_step() {
        let (rec, _) = recorder();
        let id = rec.begin("a1", "w", None, None).unwrap();

        assert!(matches!(
            rec.record_provider_access(&id, provider_access()),
            Err(Error::InvalidState(_))
        ));
        assert!(matches!(
            rec.record_model_call(&id, llm_call()),
            Err(Error::InvalidState(_))
        ));
        assert!(matches!(
            rec.complete_step(&id, action(true), 1.0),
            Err(Error::InvalidState(_))
        ));

        record_step(&rec, &id, 1.0);
        assert!(matches!(
            rec.complete_step(&id, action(true), 1.0),
            Err(Error::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn unknown_trajectory_is_rejected() {
        let (rec, _) = recorder();
        assert!(matches!(
            rec.begin_step("nope", env_state()),
            Err(Error::InvalidState(_))
        ));
        assert!(matches!(
            rec.end("nope", pnl(0.0)).await,
            Err(Error::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn second_end_persists_no_extra_row() {
        let (rec, store) = recorder();
        let id = rec.begin("a1", "w", None, None).unwrap();
        record_step(&rec, &id, 1.0);

        rec.end(&id, pnl(5.0)).await.unwrap();
        assert!(matches!(
            rec.end(&id, pnl(5.0)).await,
            Err(Error::InvalidState(_))
        ));
        assert_eq!(store.count_trajectories().await.unwrap(), 1);
        assert!(matches!(
            rec.begin_step(&id, env_state()),
            Err(Error::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn end_retries_after_failed_write() {
        let (rec, store) = recorder();
        let id = rec.begin("a1", "w", None, None).unwrap();
        record_step(&rec, &id, 0.5);

        store
            .run("break", |conn| {
                conn.execute_batch("ALTER TABLE llm_call_logs RENAME TO llm_call_logs_off;")?;
                Ok(())
            })
            .await
            .unwrap();
        let err = rec.end(&id, pnl(10.0)).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(rec.active_count(), 1);
        assert!(matches!(
            rec.begin_step(&id, env_state()),
            Err(Error::InvalidState(_))
        ));

        store
            .run("repair", |conn| {
                conn.execute_batch("ALTER TABLE llm_call_logs_off RENAME TO llm_call_logs;")?;
                Ok(())
            })
            .await
            .unwrap();
        // The record built by the first call wins.
        let persisted = rec.end(&id, pnl(99.0)).await.unwrap();
        assert_eq!(persisted.final_pnl, 10.0);
        assert_eq!(store.get_trajectory(&id).await.unwrap().unwrap().final_pnl, 10.0);
        assert_eq!(store.count_trajectories().await.unwrap(), 1);
        assert_eq!(rec.active_count(), 0);
    }

    #[tokio::test]
    async fn non_finite_values_are_rejected() {
        let (rec, store) = recorder();
        let id = rec.begin("a1", "w", None, None).unwrap();

        let mut state = env_state();
        state.agent_balance = f64::NAN;
        assert!(matches!(
            rec.begin_step(&id, state),
            Err(Error::InvalidArgument(_))
        ));

        rec.begin_step(&id, env_state()).unwrap();
        let mut call = llm_call();
        call.temperature = f64::INFINITY;
        assert!(matches!(
            rec.record_model_call(&id, call),
            Err(Error::InvalidArgument(_))
        ));
        rec.record_model_call(&id, llm_call()).unwrap();
        assert!(matches!(
            rec.complete_step(&id, action(true), f64::INFINITY),
            Err(Error::InvalidArgument(_))
        ));
        // The step is still open and accepts a finite reward.
        rec.complete_step(&id, action(true), 0.5).unwrap();

        assert!(matches!(
            rec.end(&id, pnl(f64::NAN)).await,
            Err(Error::InvalidArgument(_))
        ));
        let bad_balance = EpisodeOutcome {
            final_balance: Some(f64::NEG_INFINITY),
            final_pnl: 1.0,
            ground_truth: None,
        };
        assert!(matches!(
            rec.end(&id, bad_balance).await,
            Err(Error::InvalidArgument(_))
        ));
        assert_eq!(store.count_trajectories().await.unwrap(), 0);
        assert_eq!(rec.active_count(), 1);

        let persisted = rec.end(&id, pnl(1.0)).await.unwrap();
        assert_eq!(persisted.episode_length, 1);
        assert_eq!(persisted.final_pnl, 1.0);
    }

    #[tokio::test]
    async fn overflowing_reward_sum_is_rejected() {
        let (rec, _) = recorder();
        let id = rec.begin("a1", "w", None, None).unwrap();
        record_step(&rec, &id, f64::MAX);
        record_step(&rec, &id, f64::MAX);
        assert!(matches!(
            rec.end(&id, pnl(0.0)).await,
            Err(Error::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn open_step_is_dropped_and_ground_truth_merged() {
        let (rec, _) = recorder();
        let mut meta = Metadata::new();
        meta.insert("archetype".into(), serde_json::json!("momentum"));
        let id = rec.begin("a1", "w", None, Some(meta)).unwrap();
        record_step(&rec, &id, 1.0);
        rec.begin_step(&id, env_state()).unwrap();

        let mut truth = Metadata::new();
        truth.insert("btcUp".into(), serde_json::json!(true));
        let persisted = rec
            .end(
                &id,
                EpisodeOutcome {
                    final_balance: Some(10_050.0),
                    final_pnl: 50.0,
                    ground_truth: Some(truth),
                },
            )
            .await
            .unwrap();

        assert_eq!(persisted.episode_length, 1);
        assert_eq!(persisted.final_balance, Some(10_050.0));
        assert_eq!(persisted.metadata["archetype"], "momentum");
        assert_eq!(persisted.metadata[GROUND_TRUTH_KEY]["btcUp"], true);
    }

    #[tokio::test]
    async fn trajectories_record_concurrently() {
        let (rec, store) = recorder();
        let rec = Arc::new(rec);

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let rec = Arc::clone(&rec);
                tokio::spawn(async move {
                    let id = rec.begin(&format!("agent-{i}"), "w", None, None).unwrap();
                    for _ in 0..3 {
                        record_step(&rec, &id, 1.0);
                    }
                    rec.end(&id, pnl(0.0)).await.unwrap()
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.await.unwrap().episode_length, 3);
        }
        assert_eq!(store.count_trajectories().await.unwrap(), 16);
    }
}
