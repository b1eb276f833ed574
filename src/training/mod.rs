//! Readiness, triggering and tracking of retraining runs.
//!
//! - [`quality`] -- per-step completeness credit and sampled corpus quality.
//! - [`readiness`] -- the quantity / diversity / quality gate.
//! - [`trigger`] -- single-flight, throttled batch creation and manifest selection.
//! - [`executor`] -- hand-off to the external training executor.
//! - [`monitor`] -- coarse progress for a batch.
//! - [`versioner`] -- semantic versions for trained models.
//! - [`pipeline`] -- the periodic control loop tying the above together.

pub mod executor;
pub mod monitor;
pub mod pipeline;
pub mod quality;
pub mod readiness;
pub mod trigger;
pub mod versioner;

pub use executor::{AnyExecutor, HttpExecutor, QueueExecutor, TrainingExecutor};
pub use monitor::{BatchProgress, TrainingMonitor};
pub use pipeline::{AutomationPipeline, TickReport};
pub use quality::DataQualityScorer;
pub use readiness::{ReadinessGate, ReadinessReport, ReadinessStats};
pub use trigger::{TrainingTrigger, TriggerOutcome};
pub use versioner::ModelVersioner;
