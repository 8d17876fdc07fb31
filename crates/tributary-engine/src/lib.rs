//! Fork/coalesce execution engine with checkpoint resume.
//!
//! This crate implements the Tributary row pipeline core: coalescing forked
//! branch tokens back into one row, batch triggers and aggregation buffering,
//! topology-hashed checkpoints and their resume compatibility check, lint
//! validation of pipeline settings, and the orchestrator that drives rows
//! through an [`ExecutionGraph`].

pub mod aggregation;
pub mod canonical;
pub mod checkpoint;
pub mod clock;
pub mod coalesce;
pub mod compatibility;
pub mod events;
pub mod graph;
pub mod orchestrator;
pub mod output;
pub mod registry;
pub mod settings;
pub mod topology;
pub mod trigger;
pub mod validation;

pub use aggregation::{AggregationExecutor, BatchFlush, BatchTrigger, AGGREGATION_STATE_VERSION};
pub use canonical::{finite_f64, hash_prefix, stable_hash, stable_hash_of};
pub use checkpoint::{
    clear_checkpoint, load_checkpoint, save_checkpoint, CheckpointFrequency, CheckpointManager,
    CheckpointPosition, CheckpointSettings,
};
pub use clock::{Clock, MockClock, SharedClock, SystemClock};
pub use coalesce::{
    AcceptResult, AnomalyKind, ArrivalAnomaly, CoalesceExecutor, CoalesceMetadata, CoalesceOutcome,
    FailureKind, ResolutionTrigger, UnionCollision, COALESCE_STATE_VERSION,
};
pub use compatibility::CheckpointCompatibilityValidator;
pub use events::{AuditEvent, EventEmitter};
pub use graph::{EdgeInfo, ExecutionGraph, NodeInfo, NodeType, RoutingMode};
pub use orchestrator::{Orchestrator, RowFailure, RunResult};
pub use output::{OutputLog, ANOMALIES_FILE, FAILURES_FILE};
pub use registry::{
    default_registry, BatchTransform, DynBatchTransform, DynTransform, PluginRegistry, Transform,
    TransformOutcome,
};
pub use settings::{
    AggregationSettings, CoalescePolicy, CoalesceSettings, EdgeSettings, MergeStrategy,
    NodeSettings, PipelineSettings,
};
pub use topology::{branch_entry_edges, node_config_hash, upstream_topology_hash, BranchEntry};
pub use trigger::{TriggerEvaluator, TriggerSettings, TriggerType};
pub use validation::{validate, validate_or_raise, Diagnostic, LintRule, Severity};
