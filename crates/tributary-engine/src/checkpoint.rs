//! Checkpoint creation and persistence.
//!
//! A [`CheckpointManager`] stamps checkpoints with the hashes the
//! compatibility validator later recomputes. The store functions persist the
//! latest checkpoint to `<dir>/checkpoint.json`.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use tributary_types::{new_id, Checkpoint, Result, TributaryError, CHECKPOINT_FORMAT_VERSION};

use crate::events::{AuditEvent, EventEmitter};
use crate::graph::{ExecutionGraph, NodeType};
use crate::topology::{node_config_hash, upstream_topology_hash};

const CHECKPOINT_FILE: &str = "checkpoint.json";

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointFrequency {
    /// After every source row.
    #[default]
    EveryRow,
    /// After every n-th source row.
    EveryN(u64),
    /// Only when the last node a row reached is an aggregation.
    AggregationOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointSettings {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub frequency: CheckpointFrequency,
}

fn default_enabled() -> bool {
    true
}

impl Default for CheckpointSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            frequency: CheckpointFrequency::EveryRow,
        }
    }
}

impl CheckpointSettings {
    /// Whether to capture a checkpoint once `sequence` source rows are done and
    /// the last one ended at a node of `node_type`.
    pub fn should_checkpoint(&self, sequence: u64, node_type: NodeType) -> bool {
        if !self.enabled {
            return false;
        }
        match self.frequency {
            CheckpointFrequency::EveryRow => true,
            CheckpointFrequency::EveryN(n) => n > 0 && sequence % n == 0,
            CheckpointFrequency::AggregationOnly => node_type == NodeType::Aggregation,
        }
    }
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

/// Where in the run a checkpoint is taken.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointPosition {
    pub run_id: String,
    pub token_id: String,
    pub node_id: String,
    pub sequence_number: u64,
}

#[derive(Debug, Clone, Default)]
pub struct CheckpointManager {
    emitter: EventEmitter,
}

impl CheckpointManager {
    pub fn new(emitter: EventEmitter) -> Self {
        Self { emitter }
    }

    /// Build a checkpoint at `position`, hashing the node's config and the
    /// topology strictly upstream of it.
    pub fn create_checkpoint(
        &self,
        position: CheckpointPosition,
        graph: &ExecutionGraph,
        aggregation_state: Option<serde_json::Value>,
        coalesce_state: Option<serde_json::Value>,
    ) -> Result<Checkpoint> {
        let topology = upstream_topology_hash(graph, &position.node_id)?;
        let config = node_config_hash(graph, &position.node_id)?;
        let checkpoint = Checkpoint {
            checkpoint_id: new_id(),
            run_id: position.run_id,
            token_id: position.token_id,
            node_id: position.node_id,
            sequence_number: position.sequence_number,
            created_at: chrono::Utc::now(),
            upstream_topology_hash: Some(topology),
            checkpoint_node_config_hash: Some(config),
            format_version: CHECKPOINT_FORMAT_VERSION,
            aggregation_state,
            coalesce_state,
        };
        tracing::info!(
            checkpoint = %checkpoint.checkpoint_id,
            node = %checkpoint.node_id,
            sequence = checkpoint.sequence_number,
            "Checkpoint created"
        );
        self.emitter.emit(AuditEvent::CheckpointCreated {
            checkpoint_id: checkpoint.checkpoint_id.clone(),
            node_id: checkpoint.node_id.clone(),
            sequence_number: checkpoint.sequence_number,
        });
        Ok(checkpoint)
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Save a checkpoint to `dir/checkpoint.json`, creating `dir` if needed.
///
/// The file is written to a temporary name and renamed into place so a
/// crash mid-write never leaves a truncated checkpoint.
pub async fn save_checkpoint(checkpoint: &Checkpoint, dir: &Path) -> Result<PathBuf> {
    tokio::fs::create_dir_all(dir).await?;
    let path = dir.join(CHECKPOINT_FILE);
    let tmp = dir.join(format!("{CHECKPOINT_FILE}.tmp"));
    let json = serde_json::to_string_pretty(checkpoint)?;
    tokio::fs::write(&tmp, json).await?;
    tokio::fs::rename(&tmp, &path).await?;
    tracing::debug!(path = %path.display(), "Checkpoint saved");
    Ok(path)
}

/// Load the checkpoint in `dir`, or `None` if there is none.
///
/// A checkpoint stamped with a different non-zero `format_version` is
/// rejected. Unstamped (legacy) checkpoints load so the compatibility
/// validator can explain why they cannot be resumed.
pub async fn load_checkpoint(dir: &Path) -> Result<Option<Checkpoint>> {
    let path = dir.join(CHECKPOINT_FILE);
    if !tokio::fs::try_exists(&path).await? {
        return Ok(None);
    }
    let json = tokio::fs::read_to_string(&path).await?;
    let checkpoint: Checkpoint = serde_json::from_str(&json)?;
    if checkpoint.format_version != 0 && checkpoint.format_version != CHECKPOINT_FORMAT_VERSION {
        return Err(TributaryError::IncompatibleCheckpoint(format!(
            "checkpoint format_version {} is not supported (expected {})",
            checkpoint.format_version, CHECKPOINT_FORMAT_VERSION
        )));
    }
    Ok(Some(checkpoint))
}

/// Delete the checkpoint after a run completes.
pub async fn clear_checkpoint(dir: &Path) -> Result<()> {
    let path = dir.join(CHECKPOINT_FILE);
    if tokio::fs::try_exists(&path).await? {
        tokio::fs::remove_file(&path).await?;
    }
    Ok(())
}
