//! Tidepool: trajectory collection and retraining orchestration for a fleet
//! of decision-making agents.
//!
//! Agents record each episode through the [`trajectory::TrajectoryRecorder`].
//! The [`training::AutomationPipeline`] periodically checks whether the
//! recorded corpus is large, diverse and clean enough, opens at most one
//! training batch at a time, and versions the models the external executor
//! produces. [`status::StatusReporter`] exposes the merged view.

pub mod config;
pub mod error;
pub mod status;
pub mod store;
pub mod training;
pub mod trajectory;

pub use error::{Error, Result};
