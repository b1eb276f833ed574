//! Store connectivity and collection-rate health checks.
//!
//! Checks never fail: an unreachable store reports `database = false`, and a
//! low trailing collection rate becomes a warning.

use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::store::TrajectoryStore;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    /// Whether the store answered the connectivity check.
    pub database: bool,
    pub healthy: bool,
    #[serde(default)]
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct HealthChecker {
    store: TrajectoryStore,
    min_hourly_rate: f64,
}

impl HealthChecker {
    pub fn new(store: TrajectoryStore, min_hourly_rate: f64) -> Self {
        Self {
            store,
            min_hourly_rate,
        }
    }

    /// Check the store and measure the trailing 24h collection rate.
    pub async fn check(&self) -> HealthReport {
        let rate = match self
            .store
            .count_created_since(Utc::now() - Duration::hours(24))
            .await
        {
            Ok(n) => Some(n as f64 / 24.0),
            Err(e) => {
                warn!(error = %e, "collection rate unavailable");
                None
            }
        };
        self.check_with_rate(rate).await
    }

    /// Check the store, judging an already measured hourly rate.
    /// `None` means the rate could not be read.
    pub async fn check_with_rate(&self, hourly_rate: Option<f64>) -> HealthReport {
        let database = match self.store.ping().await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "store connectivity check failed");
                false
            }
        };

        let mut warnings = Vec::new();
        if !database {
            warnings.push("Database unreachable".to_string());
        }
        if let Some(rate) = hourly_rate {
            if rate < self.min_hourly_rate {
                warn!(
                    hourly_rate = rate,
                    minimum = self.min_hourly_rate,
                    "low trajectory collection rate"
                );
                warnings.push(format!(
                    "Low collection rate: {rate:.2}/hour (minimum {:.2})",
                    self.min_hourly_rate
                ));
            }
        }

        HealthReport {
            database,
            healthy: database && warnings.is_empty(),
            warnings,
        }
    }
}
