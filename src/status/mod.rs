//! Read-only status and health reporting.
//!
//! - [`reporter::StatusReporter`] -- collection counts, training history and
//!   the model registry in one report.
//! - [`health::HealthChecker`] -- store connectivity and collection-rate
//!   warnings.

pub mod health;
pub mod reporter;

pub use health::{HealthChecker, HealthReport};
pub use reporter::{CollectionStatus, StatusReport, StatusReporter, TrainingStatus};
