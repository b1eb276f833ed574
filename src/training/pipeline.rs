//! The automation pipeline: one periodic control loop over the readiness
//! gate, trigger, monitor, versioner and status reporter.
//!
//! Each tick:
//!
//! ```text
//! 1. Observe the in-flight batch (if any) and log its progress
//! 2. If auto-deploy is on, promote the newest ready model
//! 3. Attempt a trigger: Triggered | NotReady | Throttled | InFlight
//! ```
//!
//! A tick never fails. Errors are logged and recorded in the [`TickReport`];
//! an `InvalidState` from the trigger (lost single-flight race) marks the tick
//! as skipped.
//!
//! The pipeline also exposes the write-back calls the external executor uses
//! to move a batch through `Training -> Completed | Failed`.

use std::future::Future;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::executor::{AnyExecutor, TrainingExecutor};
use super::monitor::{BatchProgress, TrainingMonitor};
use super::readiness::{ReadinessGate, ReadinessReport};
use super::trigger::{TrainingTrigger, TriggerOutcome};
use super::versioner::ModelVersioner;
use crate::config::PipelineConfig;
use crate::error::{Error, Result};
use crate::status::{HealthReport, StatusReport, StatusReporter};
use crate::store::{TrainedModel, TrainingBatch, TrainingOutcome, TrajectoryStore};

// ---------------------------------------------------------------------------
// Tick report
// ---------------------------------------------------------------------------

/// What one tick observed and did.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TickReport {
    pub in_flight: Option<BatchProgress>,
    /// Version promoted to deployed during this tick.
    pub deployed: Option<String>,
    pub trigger: Option<TriggerOutcome>,
    /// The trigger lost a single-flight race.
    pub skipped: bool,
    pub errors: Vec<String>,
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// Orchestrates collection-driven retraining.
pub struct AutomationPipeline<E = AnyExecutor> {
    config: PipelineConfig,
    store: TrajectoryStore,
    gate: ReadinessGate,
    trigger: TrainingTrigger<E>,
    monitor: TrainingMonitor,
    versioner: ModelVersioner,
    reporter: StatusReporter,
}

impl AutomationPipeline<AnyExecutor> {
    /// Open the configured store and executor.
    pub fn from_config(config: PipelineConfig) -> Result<Self> {
        let store = TrajectoryStore::from_config(&config.store)?;
        let executor = AnyExecutor::from_config(&config.executor)?;
        Ok(Self::new(config, store, executor))
    }
}

impl<E: TrainingExecutor> AutomationPipeline<E> {
    pub fn new(config: PipelineConfig, store: TrajectoryStore, executor: E) -> Self {
        Self {
            gate: ReadinessGate::new(store.clone()),
            trigger: TrainingTrigger::new(store.clone(), executor),
            monitor: TrainingMonitor::new(store.clone()),
            versioner: ModelVersioner::new(store.clone()),
            reporter: StatusReporter::new(
                store.clone(),
                config.automation.min_hourly_collection_rate,
            ),
            store,
            config,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn store(&self) -> &TrajectoryStore {
        &self.store
    }

    // ------------------------------------------------------------------
    // Direct operations
    // ------------------------------------------------------------------

    pub async fn check_readiness(&self) -> Result<ReadinessReport> {
        self.gate.check(&self.config.readiness).await
    }

    pub async fn trigger(&self) -> Result<TriggerOutcome> {
        self.trigger.trigger(&self.config).await
    }

    pub async fn monitor(&self, batch_id: &str) -> Result<BatchProgress> {
        self.monitor.monitor(batch_id).await
    }

    pub async fn get_next_version(&self) -> Result<String> {
        self.versioner.get_next_version().await
    }

    pub async fn get_status(&self) -> StatusReport {
        self.reporter.get_status().await
    }

    pub async fn check_health(&self) -> HealthReport {
        self.reporter.check_health().await
    }

    /// Promote the newest ready model, if any.
    pub async fn deploy_latest(&self) -> Result<Option<TrainedModel>> {
        self.store.deploy_latest_ready().await
    }

    // ------------------------------------------------------------------
    // Executor write-back
    // ------------------------------------------------------------------

    /// The executor has started training `batch_id`.
    pub async fn mark_training(&self, batch_id: &str) -> Result<TrainingBatch> {
        self.store.mark_batch_training(batch_id).await
    }

    /// The executor gave up on `batch_id`.
    pub async fn record_failure(&self, batch_id: &str, error: &str) -> Result<TrainingBatch> {
        self.store.fail_batch(batch_id, error).await
    }

    /// The executor finished `batch_id`; record the model it produced.
    pub async fn record_completion(
        &self,
        batch_id: &str,
        outcome: TrainingOutcome,
    ) -> Result<TrainedModel> {
        self.versioner.record(batch_id, outcome).await
    }

    // ------------------------------------------------------------------
    // Control loop
    // ------------------------------------------------------------------

    /// Run one pass of the control loop.
    pub async fn tick(&self) -> TickReport {
        let mut report = TickReport::default();

        match self.monitor.in_flight().await {
            Ok(Some(progress)) => {
                info!(
                    batch_id = %progress.batch_id,
                    status = %progress.status,
                    progress = progress.progress,
                    "training in flight"
                );
                report.in_flight = Some(progress);
            }
            Ok(None) => {}
            Err(e) => {
                warn!(error = %e, "could not observe in-flight batch");
                report.errors.push(format!("monitor: {e}"));
            }
        }

        if self.config.training.auto_deploy {
            match self.store.deploy_latest_ready().await {
                Ok(Some(model)) => report.deployed = Some(model.version),
                Ok(None) => {}
                Err(e) => {
                    warn!(error = %e, "auto-deploy failed");
                    report.errors.push(format!("deploy: {e}"));
                }
            }
        }

        match self.trigger.trigger(&self.config).await {
            Ok(outcome) => {
                match &outcome {
                    TriggerOutcome::NotReady { reason } => debug!(%reason, "not ready to train"),
                    TriggerOutcome::Throttled { next_eligible_at } => {
                        debug!(%next_eligible_at, "training throttled")
                    }
                    TriggerOutcome::InFlight { .. } | TriggerOutcome::Triggered { .. } => {}
                }
                report.trigger = Some(outcome);
            }
            Err(Error::InvalidState(msg)) => {
                warn!(reason = %msg, "tick skipped");
                report.skipped = true;
            }
            Err(e) => {
                error!(error = %e, transient = e.is_transient(), "trigger failed");
                report.errors.push(format!("trigger: {e}"));
            }
        }

        report
    }

    /// Tick every `tick_interval_secs` until `shutdown` resolves.
    pub async fn run_until<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let period = self.config.automation.tick_interval();
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        info!(interval_secs = period.as_secs(), "automation loop started");
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("automation loop stopping");
                    break;
                }
                _ = interval.tick() => {
                    let report = self.tick().await;
                    if !report.errors.is_empty() {
                        warn!(errors = report.errors.len(), "tick completed with errors");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use super::*;
    use crate::store::{BatchStatus, ModelStatus};
    use crate::training::trigger::tests::{seed, small_config, RecordingExecutor};

    fn pipeline(config: PipelineConfig) -> (AutomationPipeline<RecordingExecutor>, RecordingExecutor) {
        let executor = RecordingExecutor::default();
        let store = TrajectoryStore::in_memory().unwrap();
        (
            AutomationPipeline::new(config, store, executor.clone()),
            executor,
        )
    }

    fn outcome() -> TrainingOutcome {
        TrainingOutcome {
            avg_reward: 0.8,
            benchmark_score: Some(0.6),
            artifact_ref: "registry://tidepool/1".into(),
        }
    }

    #[tokio::test]
    async fn tick_reports_not_ready_on_empty_store() {
        let (pipeline, executor) = pipeline(small_config());
        let report = pipeline.tick().await;

        assert!(report.in_flight.is_none());
        assert!(matches!(report.trigger, Some(TriggerOutcome::NotReady { .. })));
        assert!(report.errors.is_empty());
        assert_eq!(executor.submitted.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn full_cycle_through_write_back() {
        let mut config = small_config();
        config.training.training_interval_secs = 0;
        let (pipeline, executor) = pipeline(config);
        seed(pipeline.store(), "a", 2, 4).await;

        let report = pipeline.tick().await;
        let Some(TriggerOutcome::Triggered { batch_id, .. }) = report.trigger.clone() else {
            panic!("expected trigger, got {:?}", report.trigger);
        };
        assert_eq!(executor.submitted.load(Ordering::SeqCst), 1);

        let report = pipeline.tick().await;
        assert_eq!(
            report.in_flight.as_ref().map(|p| p.status),
            Some(BatchStatus::Queued)
        );
        assert!(matches!(report.trigger, Some(TriggerOutcome::InFlight { .. })));

        pipeline.mark_training(&batch_id).await.unwrap();
        assert_eq!(pipeline.get_next_version().await.unwrap(), "v1.0.0");
        let model = pipeline.record_completion(&batch_id, outcome()).await.unwrap();
        assert_eq!(model.version, "v1.0.0");
        assert_eq!(pipeline.monitor(&batch_id).await.unwrap().progress, 1.0);

        // Manifest consumed, so the next tick deploys and finds nothing to train.
        let report = pipeline.tick().await;
        assert_eq!(report.deployed.as_deref(), Some("v1.0.0"));
        assert!(matches!(report.trigger, Some(TriggerOutcome::NotReady { .. })));
        assert_eq!(
            pipeline.store().count_models(ModelStatus::Deployed).await.unwrap(),
            1
        );

        let status = pipeline.get_status().await;
        assert_eq!(status.training.latest_version.as_deref(), Some("v1.0.0"));
        assert_eq!(status.training.training_models, 0);
    }

    #[tokio::test]
    async fn executor_failure_is_recorded_and_recoverable() {
        let (pipeline, _) = pipeline(small_config());
        seed(pipeline.store(), "a", 2, 4).await;

        let Some(TriggerOutcome::Triggered { batch_id, .. }) = pipeline.tick().await.trigger else {
            panic!("expected trigger");
        };
        pipeline.mark_training(&batch_id).await.unwrap();
        pipeline.record_failure(&batch_id, "OOM").await.unwrap();

        let progress = pipeline.monitor(&batch_id).await.unwrap();
        assert_eq!(progress.status, BatchStatus::Failed);
        assert_eq!(progress.error.as_deref(), Some("OOM"));

        assert!(matches!(
            pipeline.record_completion(&batch_id, outcome()).await,
            Err(Error::InvalidState(_))
        ));

        // Failed batches do not consume trajectories or throttle.
        assert!(matches!(
            pipeline.tick().await.trigger,
            Some(TriggerOutcome::Triggered { .. })
        ));
    }

    #[tokio::test]
    async fn refused_hand_off_is_logged_not_fatal() {
        let store = TrajectoryStore::in_memory().unwrap();
        seed(&store, "a", 2, 4).await;
        let pipeline = AutomationPipeline::new(
            small_config(),
            store.clone(),
            RecordingExecutor {
                refuse: true,
                ..Default::default()
            },
        );

        let report = pipeline.tick().await;
        assert!(report.trigger.is_none());
        assert_eq!(report.errors.len(), 1);
        assert!(store.active_batch().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn write_back_on_unknown_batch_is_not_found() {
        let (pipeline, _) = pipeline(small_config());
        assert!(matches!(
            pipeline.mark_training("missing").await,
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            pipeline.record_completion("missing", outcome()).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn run_until_stops_on_shutdown() {
        let mut config = small_config();
        config.automation.tick_interval_secs = 1;
        let (pipeline, _) = pipeline(config);

        tokio::time::timeout(
            Duration::from_secs(5),
            pipeline.run_until(tokio::time::sleep(Duration::from_millis(50))),
        )
        .await
        .unwrap();
    }
}
