//! Completeness scoring for recorded trajectories.
//!
//! Each step earns partial credit on three checks, averaged:
//! - model calls carry non-trivial prompts and responses,
//! - at least one context provider was read,
//! - the action reported a result or an error.
//!
//! A trajectory scores the mean of its steps; a sample scores the mean of its
//! trajectories.

use tracing::debug;

use crate::error::Result;
use crate::store::TrajectoryStore;
use crate::trajectory::types::{LlmCall, PersistedTrajectory, Step};

const MIN_SYSTEM_PROMPT_CHARS: usize = 50;
const MIN_USER_PROMPT_CHARS: usize = 100;
const MIN_RESPONSE_CHARS: usize = 20;

fn call_is_substantive(call: &LlmCall) -> bool {
    call.system_prompt.chars().count() > MIN_SYSTEM_PROMPT_CHARS
        && call.user_prompt.chars().count() > MIN_USER_PROMPT_CHARS
        && call.response.chars().count() > MIN_RESPONSE_CHARS
}

/// Credit in `[0, 1]` for a single step.
pub fn score_step(step: &Step) -> f64 {
    let calls = if step.llm_calls.is_empty() {
        0.0
    } else {
        let good = step.llm_calls.iter().filter(|c| call_is_substantive(c)).count();
        good as f64 / step.llm_calls.len() as f64
    };
    let context = if step.provider_accesses.is_empty() { 0.0 } else { 1.0 };
    let outcome = if step.action.has_terminal_outcome() { 1.0 } else { 0.0 };
    (calls + context + outcome) / 3.0
}

/// Mean step credit; an empty trajectory scores zero.
pub fn score_trajectory(trajectory: &PersistedTrajectory) -> f64 {
    mean(trajectory.steps.iter().map(score_step))
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, n) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    if n == 0 {
        0.0
    } else {
        sum / n as f64
    }
}

/// Scores a bounded sample of eligible trajectories from the store.
#[derive(Debug, Clone)]
pub struct DataQualityScorer {
    store: TrajectoryStore,
    sample_size: usize,
}

impl DataQualityScorer {
    pub fn new(store: TrajectoryStore, sample_size: usize) -> Self {
        Self { store, sample_size }
    }

    /// Mean quality over the most recent eligible trajectories (0 when none).
    pub async fn score(&self) -> Result<f64> {
        let sample = self.store.sample_eligible(self.sample_size).await?;
        let score = mean(sample.iter().map(score_trajectory));
        debug!(sampled = sample.len(), score, "data quality scored");
        Ok(score)
    }
}
