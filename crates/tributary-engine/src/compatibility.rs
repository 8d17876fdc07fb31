//! Resume compatibility checks.

use tributary_types::{Checkpoint, ResumeCheck};

use crate::canonical::hash_prefix;
use crate::graph::ExecutionGraph;
use crate::topology::{node_config_hash, upstream_topology_hash};

const PREFIX_LEN: usize = 16;

/// Decides whether a checkpoint's view of the pipeline still holds for the
/// current graph.
///
/// Only the checkpoint node's own config and the shape of everything
/// upstream of it are checked. Changes downstream of the checkpoint node
/// cannot affect rows already processed and are allowed.
#[derive(Debug, Clone, Copy, Default)]
pub struct CheckpointCompatibilityValidator;

impl CheckpointCompatibilityValidator {
    pub fn new() -> Self {
        Self
    }

    pub fn validate(&self, checkpoint: &Checkpoint, graph: &ExecutionGraph) -> ResumeCheck {
        let Some(stored_topology) = checkpoint.upstream_topology_hash.as_deref() else {
            return ResumeCheck::reject(format!(
                "legacy checkpoint '{}' has no topology validation data; \
                 restart the run from the beginning",
                checkpoint.checkpoint_id
            ));
        };

        if !graph.has_node(&checkpoint.node_id) {
            return ResumeCheck::reject(format!(
                "checkpoint node '{}' no longer exists in the pipeline (removed or renamed)",
                checkpoint.node_id
            ));
        }

        let current_config = match node_config_hash(graph, &checkpoint.node_id) {
            Ok(hash) => hash,
            Err(e) => {
                return ResumeCheck::reject(format!(
                    "cannot hash config of node '{}': {e}",
                    checkpoint.node_id
                ))
            }
        };
        match checkpoint.checkpoint_node_config_hash.as_deref() {
            Some(stored) if stored == current_config => {}
            Some(stored) => {
                return ResumeCheck::reject(format!(
                    "configuration of checkpoint node '{}' changed since the checkpoint \
                     (stored {}, current {})",
                    checkpoint.node_id,
                    hash_prefix(stored, PREFIX_LEN),
                    hash_prefix(&current_config, PREFIX_LEN),
                ))
            }
            None => {
                return ResumeCheck::reject(format!(
                    "checkpoint has no config hash for node '{}' (current {})",
                    checkpoint.node_id,
                    hash_prefix(&current_config, PREFIX_LEN),
                ))
            }
        }

        let current_topology = match upstream_topology_hash(graph, &checkpoint.node_id) {
            Ok(hash) => hash,
            Err(e) => {
                return ResumeCheck::reject(format!(
                    "cannot hash topology upstream of '{}': {e}",
                    checkpoint.node_id
                ))
            }
        };
        if current_topology != stored_topology {
            return ResumeCheck::reject(format!(
                "pipeline topology upstream of '{}' changed since the checkpoint \
                 (stored {}, current {})",
                checkpoint.node_id,
                hash_prefix(stored_topology, PREFIX_LEN),
                hash_prefix(&current_topology, PREFIX_LEN),
            ));
        }

        ResumeCheck::ok()
    }
}
