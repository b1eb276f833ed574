//! Trajectory types and recording.
//!
//! This module provides:
//! - [`types::Step`], [`types::PersistedTrajectory`] and friends -- the data
//!   captured for each decision an agent makes during an episode.
//! - [`recorder::TrajectoryRecorder`] -- the per-episode state machine agents
//!   drive (`begin` -> steps -> `end`), persisting each closed episode.
//! - [`window`] -- hour-bucketed window ids used as the default scenario key.

pub mod recorder;
pub mod types;
pub mod window;

pub use recorder::TrajectoryRecorder;
pub use types::{
    Action, ActionOutcome, EnvironmentState, EpisodeOutcome, LlmCall, LlmPurpose, Metadata,
    PersistedTrajectory, ProviderAccess, Step, TrajectoryMetrics,
};
