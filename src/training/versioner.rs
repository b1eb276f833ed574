//! Semantic version allocation for trained models.
//!
//! Versions look like `vMAJOR.MINOR.PATCH`. Each completed batch bumps PATCH
//! of the highest version issued so far; the first model is `v1.0.0`.

use tracing::warn;

use crate::error::{Error, Result};
use crate::store::{TrainedModel, TrainingOutcome, TrajectoryStore};

pub const INITIAL_VERSION: &str = "v1.0.0";

/// Parse `vMAJOR.MINOR.PATCH` (the `v` is optional).
pub fn parse_version(raw: &str) -> Option<(u64, u64, u64)> {
    let mut parts = raw.strip_prefix('v').unwrap_or(raw).split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    let patch = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some((major, minor, patch))
}

/// The version following the highest parseable entry in `existing`.
pub fn next_version(existing: &[String]) -> Result<String> {
    let latest = existing
        .iter()
        .filter_map(|v| {
            let parsed = parse_version(v);
            if parsed.is_none() {
                warn!(version = %v, "ignoring malformed model version");
            }
            parsed
        })
        .max();

    match latest {
        Some((major, minor, patch)) => {
            let patch = patch.checked_add(1).ok_or_else(|| {
                Error::invalid_state(format!("version space exhausted after v{major}.{minor}.{patch}"))
            })?;
            Ok(format!("v{major}.{minor}.{patch}"))
        }
        None => Ok(INITIAL_VERSION.to_string()),
    }
}

/// Allocates versions and records trained models.
#[derive(Debug, Clone)]
pub struct ModelVersioner {
    store: TrajectoryStore,
}

impl ModelVersioner {
    pub fn new(store: TrajectoryStore) -> Self {
        Self { store }
    }

    /// The version the next completed batch would receive.
    ///
    /// Informational only; [`record`](Self::record) allocates under the
    /// store's transaction.
    pub async fn get_next_version(&self) -> Result<String> {
        next_version(&self.store.model_versions().await?)
    }

    /// Complete `batch_id` and record its model with a freshly allocated
    /// version, atomically.
    pub async fn record(&self, batch_id: &str, outcome: TrainingOutcome) -> Result<TrainedModel> {
        self.store.complete_batch(batch_id, outcome, next_version).await
    }
}
