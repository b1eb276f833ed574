//! Core trajectory data types shared by the recorder, the store and the
//! quality scorer.
//!
//! Steps, actions and model calls are explicit tagged records. Only the
//! trajectory `metadata` field is an untyped map.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Free-form metadata attached to a trajectory.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// Metadata key under which ground-truth knowledge from the episode outcome is
/// merged.
pub const GROUND_TRUTH_KEY: &str = "ground_truth";

// ---------------------------------------------------------------------------
// Step contents
// ---------------------------------------------------------------------------

/// Snapshot of the agent's environment at the start of a decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentState {
    pub agent_balance: f64,
    #[serde(rename = "agentPnL")]
    pub agent_pnl: f64,
    pub open_positions: u32,
    #[serde(default)]
    pub active_markets: u32,
    pub timestamp: DateTime<Utc>,
}

/// One read from a context provider (market feed, news, portfolio...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderAccess {
    pub provider_name: String,
    pub data: serde_json::Value,
    pub purpose: String,
}

/// Why a model was invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmPurpose {
    Action,
    Reasoning,
    Evaluation,
    Response,
}

impl LlmPurpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Action => "action",
            Self::Reasoning => "reasoning",
            Self::Evaluation => "evaluation",
            Self::Response => "response",
        }
    }
}

/// Immutable record of a single model invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LlmCall {
    pub model: String,
    pub system_prompt: String,
    pub user_prompt: String,
    pub response: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    pub temperature: f64,
    pub max_tokens: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_tokens: Option<u32>,
    pub purpose: LlmPurpose,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_type: Option<String>,
}

/// Terminal result of executing an action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ActionOutcome {
    Result(serde_json::Value),
    Error(String),
}

/// The single action committed at the end of a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Action {
    pub action_type: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, serde_json::Value>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<ActionOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
}

impl Action {
    /// Whether the action reported either a result or an error.
    pub fn has_terminal_outcome(&self) -> bool {
        self.outcome.is_some()
    }
}

// ---------------------------------------------------------------------------
// Step
// ---------------------------------------------------------------------------

/// One closed decision point within a trajectory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    /// Zero-based position in the trajectory.
    pub step_number: u32,
    /// When the step was opened.
    pub timestamp: DateTime<Utc>,
    pub environment_state: EnvironmentState,
    #[serde(default)]
    pub provider_accesses: Vec<ProviderAccess>,
    #[serde(default)]
    pub llm_calls: Vec<LlmCall>,
    pub action: Action,
    pub reward: f64,
}

// ---------------------------------------------------------------------------
// Episode outcome and metrics
// ---------------------------------------------------------------------------

/// Caller-supplied terminal outcome passed to `end`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EpisodeOutcome {
    #[serde(default)]
    pub final_balance: Option<f64>,
    #[serde(rename = "finalPnL")]
    pub final_pnl: f64,
    /// Knowledge the agent did not have while deciding (market outcomes...).
    #[serde(default)]
    pub ground_truth: Option<Metadata>,
}

/// Metrics computed when a trajectory closes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrajectoryMetrics {
    pub episode_length: u32,
    pub total_reward: f64,
    pub duration_ms: u64,
    pub final_balance: Option<f64>,
    #[serde(rename = "finalPnL")]
    pub final_pnl: f64,
    pub successful_actions: u32,
    pub failed_actions: u32,
    pub llm_calls: u32,
    pub provider_accesses: u32,
}

impl TrajectoryMetrics {
    /// Derive the metrics for a closed trajectory.
    pub fn compute(steps: &[Step], duration_ms: u64, outcome: &EpisodeOutcome) -> Self {
        let successful_actions = steps.iter().filter(|s| s.action.success).count() as u32;
        Self {
            episode_length: steps.len() as u32,
            total_reward: steps.iter().map(|s| s.reward).sum(),
            duration_ms,
            final_balance: outcome.final_balance,
            final_pnl: outcome.final_pnl,
            successful_actions,
            failed_actions: steps.len() as u32 - successful_actions,
            llm_calls: steps.iter().map(|s| s.llm_calls.len() as u32).sum(),
            provider_accesses: steps.iter().map(|s| s.provider_accesses.len() as u32).sum(),
        }
    }
}

// ---------------------------------------------------------------------------
// Persisted trajectory
// ---------------------------------------------------------------------------

/// A closed, immutable trajectory as written to the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedTrajectory {
    pub trajectory_id: String,
    pub agent_id: String,
    /// Group key for relative scoring; defaults to `window_id`.
    pub scenario_id: String,
    /// Time-bucket key (`YYYY-MM-DDTHH:00`).
    pub window_id: String,
    pub window_hours: u32,
    pub steps: Vec<Step>,
    pub metrics: TrajectoryMetrics,
    pub metadata: Metadata,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    #[serde(rename = "finalPnL")]
    pub final_pnl: f64,
    pub final_balance: Option<f64>,
    pub total_reward: f64,
    pub episode_length: u32,
    pub duration_ms: u64,
    #[serde(default)]
    pub ai_judge_reward: Option<f64>,
}

impl PersistedTrajectory {
    /// Every model call in step order, paired with its step number.
    pub fn llm_calls(&self) -> impl Iterator<Item = (u32, &LlmCall)> {
        self.steps
            .iter()
            .flat_map(|s| s.llm_calls.iter().map(move |c| (s.step_number, c)))
    }
}

/// Group trajectories by scenario id.
pub fn group_by_scenario(
    trajectories: &[PersistedTrajectory],
) -> BTreeMap<String, Vec<&PersistedTrajectory>> {
    let mut groups: BTreeMap<String, Vec<&PersistedTrajectory>> = BTreeMap::new();
    for t in trajectories {
        groups.entry(t.scenario_id.clone()).or_default().push(t);
    }
    groups
}

#[cfg(test)]
pub(crate) mod fixtures {
    //! Builders shared by tests across modules.

    use super::*;
    use chrono::TimeZone;

    pub fn env_state() -> EnvironmentState {
        EnvironmentState {
            agent_balance: 10_000.0,
            agent_pnl: 0.0,
            open_positions: 0,
            active_markets: 12,
            timestamp: Utc.with_ymd_and_hms(2025, 1, 15, 10, 5, 0).unwrap(),
        }
    }

    /// A model call long enough to earn full prompt credit.
    pub fn llm_call() -> LlmCall {
        LlmCall {
            model: "qwen-7b".into(),
            system_prompt: "You are a trading agent in a prediction market. Maximise risk-adjusted PnL.".into(),
            user_prompt: "Balance: $10000. Open positions: 0. Markets: BTC-UP at 0.62, ETH-UP at 0.48, \
                          SOL-UP at 0.51. News: ETF inflows accelerating. Choose your next action."
                .into(),
            response: "BUY BTC-UP 100 shares; momentum and inflows favour YES.".into(),
            reasoning: None,
            temperature: 0.7,
            max_tokens: 512,
            latency_ms: Some(840),
            prompt_tokens: Some(180),
            completion_tokens: Some(24),
            purpose: LlmPurpose::Action,
            action_type: Some("buy".into()),
        }
    }

    pub fn provider_access() -> ProviderAccess {
        ProviderAccess {
            provider_name: "markets".into(),
            data: serde_json::json!({ "count": 3 }),
            purpose: "market snapshot".into(),
        }
    }

    pub fn action(success: bool) -> Action {
        Action {
            action_type: "buy".into(),
            parameters: BTreeMap::from([("ticker".to_string(), serde_json::json!("BTC-UP"))]),
            success,
            outcome: Some(if success {
                ActionOutcome::Result(serde_json::json!({ "filled": 100 }))
            } else {
                ActionOutcome::Error("insufficient liquidity".into())
            }),
            reasoning: Some("momentum".into()),
        }
    }

    pub fn step(step_number: u32, reward: f64) -> Step {
        Step {
            step_number,
            timestamp: Utc.with_ymd_and_hms(2025, 1, 15, 10, 5, 0).unwrap(),
            environment_state: env_state(),
            provider_accesses: vec![provider_access()],
            llm_calls: vec![llm_call()],
            action: action(true),
            reward,
        }
    }

    /// A fully-credited closed trajectory in `scenario`.
    pub fn trajectory(id: &str, agent: &str, scenario: &str, steps: u32) -> PersistedTrajectory {
        let steps: Vec<Step> = (0..steps).map(|i| step(i, 0.5)).collect();
        let outcome = EpisodeOutcome {
            final_balance: Some(10_100.0),
            final_pnl: 100.0,
            ground_truth: None,
        };
        let metrics = TrajectoryMetrics::compute(&steps, 1_000, &outcome);
        let start = Utc::now() - chrono::Duration::seconds(1);
        PersistedTrajectory {
            trajectory_id: id.into(),
            agent_id: agent.into(),
            scenario_id: scenario.into(),
            window_id: scenario.into(),
            window_hours: 1,
            total_reward: metrics.total_reward,
            episode_length: metrics.episode_length,
            duration_ms: metrics.duration_ms,
            final_pnl: outcome.final_pnl,
            final_balance: outcome.final_balance,
            metrics,
            metadata: Metadata::new(),
            start_time: start,
            end_time: start + chrono::Duration::seconds(1),
            steps,
            ai_judge_reward: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn metrics_sum_rewards_and_count_steps() {
        let mut steps = vec![step(0, 0.5), step(1, -0.25), step(2, 1.0)];
        steps[1].action = action(false);
        let outcome = EpisodeOutcome {
            final_balance: Some(9_900.0),
            final_pnl: -100.0,
            ground_truth: None,
        };

        let metrics = TrajectoryMetrics::compute(&steps, 42, &outcome);

        assert_eq!(metrics.episode_length, 3);
        assert!((metrics.total_reward - 1.25).abs() < 1e-12);
        assert_eq!(metrics.duration_ms, 42);
        assert_eq!(metrics.successful_actions, 2);
        assert_eq!(metrics.failed_actions, 1);
        assert_eq!(metrics.llm_calls, 3);
        assert_eq!(metrics.provider_accesses, 3);
        assert_eq!(metrics.final_balance, Some(9_900.0));
    }

    #[test]
    fn metrics_for_empty_trajectory() {
        let metrics = TrajectoryMetrics::compute(&[], 0, &EpisodeOutcome::default());
        assert_eq!(metrics.episode_length, 0);
        assert_eq!(metrics.total_reward, 0.0);
        assert_eq!(metrics.failed_actions, 0);
    }

    #[test]
    fn step_blob_uses_wire_field_names() {
        let json = serde_json::to_value(step(0, 0.5)).unwrap();
        assert_eq!(json["stepNumber"], 0);
        assert_eq!(json["environmentState"]["agentPnL"], 0.0);
        assert!(json["llmCalls"][0]["systemPrompt"].is_string());
        assert_eq!(json["action"]["outcome"]["kind"], "result");
        assert_eq!(json["llmCalls"][0]["purpose"], "action");
    }

    #[test]
    fn outcome_accepts_minimal_payload() {
        let outcome: EpisodeOutcome = serde_json::from_str(r#"{ "finalPnL": 100 }"#).unwrap();
        assert_eq!(outcome.final_pnl, 100.0);
        assert!(outcome.final_balance.is_none());
        assert!(outcome.ground_truth.is_none());
    }

    #[test]
    fn groups_by_scenario() {
        let trajectories = vec![
            trajectory("t1", "a1", "2025-01-15T10:00", 1),
            trajectory("t2", "a2", "2025-01-15T10:00", 1),
            trajectory("t3", "a3", "2025-01-15T11:00", 1),
        ];
        let groups = group_by_scenario(&trajectories);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups["2025-01-15T10:00"].len(), 2);
        assert_eq!(groups["2025-01-15T11:00"].len(), 1);
    }

    #[test]
    fn llm_calls_iterate_in_step_order() {
        let t = trajectory("t1", "a1", "s", 3);
        let steps: Vec<u32> = t.llm_calls().map(|(n, _)| n).collect();
        assert_eq!(steps, vec![0, 1, 2]);
    }
}
