use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use tributary_types::{Result, Token, TributaryError};

/// Layout version of the serialized pending-group state. Restores require an exact match.
pub const COALESCE_STATE_VERSION: &str = "coalesce-v1";

#[derive(Debug, Clone)]
pub(crate) struct Arrival {
    pub token: Token,
    pub arrived_at: f64,
}

/// Branch tokens buffered for one (coalesce point, correlation key).
#[derive(Debug, Clone)]
pub(crate) struct PendingCoalesce {
    pub created_at: f64,
    pub arrivals: BTreeMap<String, Arrival>,
}

impl PendingCoalesce {
    pub fn new(created_at: f64) -> Self {
        Self {
            created_at,
            arrivals: BTreeMap::new(),
        }
    }

    pub fn age(&self, now: f64) -> f64 {
        (now - self.created_at).max(0.0)
    }
}

// ---------------------------------------------------------------------------
// Serialized form
// ---------------------------------------------------------------------------

/// Checkpoint blob for a [`CoalesceExecutor`](super::CoalesceExecutor).
///
/// Times are stored as ages relative to capture, never as clock readings, so
/// the state can be restored under a different clock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoalesceCheckpointState {
    #[serde(rename = "_version", default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default)]
    pub pending: Vec<PendingSnapshot>,
    /// Recently resolved groups, oldest first.
    #[serde(default)]
    pub completed: Vec<CompletedKey>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingSnapshot {
    pub coalesce_name: String,
    pub correlation_key: String,
    pub elapsed_age_seconds: f64,
    pub arrivals: Vec<ArrivalSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArrivalSnapshot {
    pub branch: String,
    pub token: Token,
    /// Seconds after the group opened.
    pub offset_seconds: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedKey {
    pub coalesce_name: String,
    pub correlation_key: String,
}

impl CoalesceCheckpointState {
    /// Parse a blob, checking its version tag before anything else.
    pub fn from_value(value: &serde_json::Value) -> Result<Self> {
        match value.get("_version").and_then(serde_json::Value::as_str) {
            None => {
                return Err(TributaryError::IncompatibleCheckpoint(format!(
                    "Incompatible checkpoint version: coalesce state has no _version \
                     (pre-versioning format); expected '{COALESCE_STATE_VERSION}'"
                )))
            }
            Some(v) if v != COALESCE_STATE_VERSION => {
                return Err(TributaryError::IncompatibleCheckpoint(format!(
                    "Incompatible checkpoint version: coalesce state is '{v}', \
                     expected '{COALESCE_STATE_VERSION}'"
                )))
            }
            Some(_) => {}
        }
        Ok(serde_json::from_value(value.clone())?)
    }
}
