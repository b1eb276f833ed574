//! Opening training batches.
//!
//! A trigger attempt passes, in order:
//! 1. no batch in flight,
//! 2. the training interval has elapsed since the last completed batch,
//! 3. the readiness gate.
//!
//! It then selects a manifest, inserts a `Queued` batch and hands the
//! manifest to the executor. The in-flight check in step 1 is only a fast
//! path; the store's single-flight index is what rejects a second batch.
//!
//! A batch still `Queued` after `training.unclaimed_batch_timeout_secs` was
//! never picked up by a worker; step 1 fails it instead of reporting it in
//! flight.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::executor::TrainingExecutor;
use super::readiness::ReadinessGate;
use crate::config::PipelineConfig;
use crate::error::{Error, Result};
use crate::store::{BatchStatus, TrainingBatch, TrajectoryStore};

/// Attempts at marking a refused batch `Failed`.
const RELEASE_ATTEMPTS: u32 = 4;
const RELEASE_BACKOFF: std::time::Duration = std::time::Duration::from_millis(100);

/// What a trigger attempt did.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TriggerOutcome {
    Triggered {
        batch_id: String,
        trajectories: usize,
    },
    NotReady {
        reason: String,
    },
    Throttled {
        next_eligible_at: DateTime<Utc>,
    },
    InFlight {
        batch_id: String,
    },
}

// ---------------------------------------------------------------------------
// Manifest selection
// ---------------------------------------------------------------------------

/// Choose trajectory ids from usable scenario groups, at most `cap` of them.
///
/// When the usable pool exceeds `cap`, each group contributes in proportion to
/// its size (rounded down), then the shortfall is topped up one id at a time
/// from the largest groups with spare members. Ids are drawn at random within
/// each group.
pub fn select_manifest<R: Rng + ?Sized>(
    groups: &BTreeMap<String, Vec<String>>,
    min_group_size: usize,
    cap: usize,
    rng: &mut R,
) -> Vec<String> {
    let mut usable: Vec<(&String, &Vec<String>)> = groups
        .iter()
        .filter(|(_, ids)| ids.len() >= min_group_size && !ids.is_empty())
        .collect();
    let total: usize = usable.iter().map(|(_, ids)| ids.len()).sum();

    if cap == 0 || total == 0 {
        return Vec::new();
    }
    if total <= cap {
        return usable.into_iter().flat_map(|(_, ids)| ids.iter().cloned()).collect();
    }

    // Largest first so top-ups favour big groups.
    usable.sort_by(|a, b| b.1.len().cmp(&a.1.len()).then_with(|| a.0.cmp(b.0)));

    let mut allocations: Vec<usize> = usable
        .iter()
        .map(|(_, ids)| (ids.len() as f64 / total as f64 * cap as f64).floor() as usize)
        .collect();
    let mut allocated: usize = allocations.iter().sum();

    while allocated < cap {
        let mut topped = false;
        for (alloc, (_, ids)) in allocations.iter_mut().zip(&usable) {
            if allocated >= cap {
                break;
            }
            if *alloc < ids.len() {
                *alloc += 1;
                allocated += 1;
                topped = true;
            }
        }
        if !topped {
            break;
        }
    }

    let mut manifest = Vec::with_capacity(allocated);
    for (count, (_, ids)) in allocations.into_iter().zip(usable) {
        let mut pool: Vec<&String> = ids.iter().collect();
        pool.shuffle(rng);
        manifest.extend(pool.into_iter().take(count).cloned());
    }
    manifest
}

// ---------------------------------------------------------------------------
// Trigger
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct TrainingTrigger<E> {
    store: TrajectoryStore,
    gate: ReadinessGate,
    executor: E,
}

impl<E: TrainingExecutor> TrainingTrigger<E> {
    pub fn new(store: TrajectoryStore, executor: E) -> Self {
        Self {
            gate: ReadinessGate::new(store.clone()),
            store,
            executor,
        }
    }

    /// Attempt to open a training batch.
    ///
    /// Fails `InvalidState` if another batch won the single-flight race, and
    /// with the executor's error if the hand-off failed (the new batch is then
    /// marked `Failed`).
    pub async fn trigger(&self, config: &PipelineConfig) -> Result<TriggerOutcome> {
        if let Some(active) = self.store.active_batch().await? {
            if !self.reap_unclaimed(&active, config).await? {
                debug!(batch_id = %active.batch_id, "training already in flight");
                return Ok(TriggerOutcome::InFlight {
                    batch_id: active.batch_id,
                });
            }
        }

        if let Some(last) = self.store.last_completed_at().await? {
            let interval = Duration::from_std(config.training.training_interval())
                .map_err(|_| Error::InvalidArgument("training interval out of range".into()))?;
            let next_eligible_at = last + interval;
            if Utc::now() < next_eligible_at {
                debug!(%next_eligible_at, "training throttled");
                return Ok(TriggerOutcome::Throttled { next_eligible_at });
            }
        }

        let readiness = self.gate.check(&config.readiness).await?;
        if !readiness.ready {
            return Ok(TriggerOutcome::NotReady {
                reason: readiness.reason,
            });
        }

        let groups = self.store.eligible_ids_by_scenario().await?;
        let trajectory_ids = select_manifest(
            &groups,
            config.readiness.min_group_size as usize,
            config.training.max_trajectories_per_batch,
            &mut rand::thread_rng(),
        );
        if trajectory_ids.is_empty() {
            return Ok(TriggerOutcome::NotReady {
                reason: "No eligible trajectories in usable scenario groups".into(),
            });
        }

        let batch = TrainingBatch::queued(
            trajectory_ids,
            config.training.base_model.clone(),
            config.training.hyperparameters.clone(),
        );
        let manifest = batch.manifest();
        self.store.create_batch(batch).await?;

        if let Err(e) = self.executor.submit(&manifest).await {
            error!(
                batch_id = %manifest.batch_id,
                executor = self.executor.name(),
                error = %e,
                "training hand-off failed"
            );
            self.release(&manifest.batch_id, &format!("hand-off failed: {e}"))
                .await;
            return Err(e);
        }

        info!(
            batch_id = %manifest.batch_id,
            trajectories = manifest.trajectory_ids.len(),
            executor = self.executor.name(),
            "training triggered"
        );
        Ok(TriggerOutcome::Triggered {
            batch_id: manifest.batch_id,
            trajectories: manifest.trajectory_ids.len(),
        })
    }

    /// Fail `batch` if it has sat `Queued` past the unclaimed timeout.
    /// Returns whether the lane is now free.
    async fn reap_unclaimed(&self, batch: &TrainingBatch, config: &PipelineConfig) -> Result<bool> {
        if batch.status != BatchStatus::Queued {
            return Ok(false);
        }
        let Some(limit) = config.training.unclaimed_batch_timeout() else {
            return Ok(false);
        };
        let waited = Utc::now() - batch.created_at;
        if waited.to_std().map_or(true, |waited| waited < limit) {
            return Ok(false);
        }

        let reason = format!("unclaimed for {}s", waited.num_seconds());
        match self.store.fail_batch(&batch.batch_id, &reason).await {
            Ok(_) => {
                warn!(batch_id = %batch.batch_id, %reason, "unclaimed training batch failed");
                Ok(true)
            }
            // A worker claimed it meanwhile.
            Err(Error::InvalidState(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Mark a refused batch `Failed`, retrying transient store errors. A batch
    /// that still cannot be failed stays `Queued` until the unclaimed timeout
    /// reaps it.
    async fn release(&self, batch_id: &str, reason: &str) {
        let mut delay = RELEASE_BACKOFF;
        for attempt in 1..=RELEASE_ATTEMPTS {
            match self.store.fail_batch(batch_id, reason).await {
                Ok(_) => return,
                Err(e) if e.is_transient() && attempt < RELEASE_ATTEMPTS => {
                    warn!(batch_id, attempt, error = %e, "failed to release batch, retrying");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                Err(e) => {
                    error!(batch_id, error = %e, "refused batch left queued");
                    return;
                }
            }
        }
    }
}
