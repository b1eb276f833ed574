//! The readiness gate: is the eligible corpus large, diverse and clean enough
//! to justify a training run?
//!
//! Checks run cheapest-first and stop at the first failure:
//! 1. eligible trajectory count,
//! 2. usable scenario groups (groups with at least `min_group_size` members),
//! 3. sampled data quality.

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::quality::DataQualityScorer;
use crate::config::ReadinessConfig;
use crate::error::Result;
use crate::store::TrajectoryStore;

/// Measurements taken while checking readiness. Stages that were not reached
/// are `None`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadinessStats {
    pub total_trajectories: u64,
    pub scenario_groups: Option<u64>,
    pub data_quality: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadinessReport {
    pub ready: bool,
    pub reason: String,
    pub stats: ReadinessStats,
}

impl ReadinessReport {
    /// Decide readiness from measurements alone.
    pub fn evaluate(config: &ReadinessConfig, stats: ReadinessStats) -> Self {
        let reason = if stats.total_trajectories < config.min_trajectories_for_training {
            Some(format!(
                "Need more trajectories: {}/{}",
                stats.total_trajectories, config.min_trajectories_for_training
            ))
        } else if stats.scenario_groups.unwrap_or(0) < config.min_scenario_groups {
            Some(format!(
                "Need more scenario groups: {}/{} with at least {} trajectories",
                stats.scenario_groups.unwrap_or(0),
                config.min_scenario_groups,
                config.min_group_size
            ))
        } else if stats.data_quality.unwrap_or(0.0) < config.data_quality_threshold {
            Some(format!(
                "Data quality too low: {:.3} < {:.3}",
                stats.data_quality.unwrap_or(0.0),
                config.data_quality_threshold
            ))
        } else {
            None
        };

        match reason {
            Some(reason) => Self {
                ready: false,
                reason,
                stats,
            },
            None => Self {
                ready: true,
                reason: "Ready to train!".into(),
                stats,
            },
        }
    }
}

/// Reads store aggregates and the quality sample to produce a
/// [`ReadinessReport`].
#[derive(Debug, Clone)]
pub struct ReadinessGate {
    store: TrajectoryStore,
}

impl ReadinessGate {
    pub fn new(store: TrajectoryStore) -> Self {
        Self { store }
    }

    /// Number of scenario groups with at least `min_group_size` eligible members.
    pub async fn usable_groups(&self, min_group_size: u64) -> Result<u64> {
        let sizes = self.store.scenario_group_sizes().await?;
        Ok(sizes.iter().filter(|(_, n)| *n >= min_group_size).count() as u64)
    }

    pub async fn check(&self, config: &ReadinessConfig) -> Result<ReadinessReport> {
        let mut stats = ReadinessStats {
            total_trajectories: self.store.count_eligible().await?,
            ..Default::default()
        };

        if stats.total_trajectories >= config.min_trajectories_for_training {
            let groups = self.usable_groups(config.min_group_size).await?;
            stats.scenario_groups = Some(groups);

            if groups >= config.min_scenario_groups {
                let scorer = DataQualityScorer::new(self.store.clone(), config.quality_sample_size);
                stats.data_quality = Some(scorer.score().await?);
            }
        }

        let report = ReadinessReport::evaluate(config, stats);
        debug!(ready = report.ready, reason = %report.reason, "readiness checked");
        Ok(report)
    }
}
