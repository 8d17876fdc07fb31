//! Shared types, errors, tokens, and checkpoint records for the Tributary row pipeline.
//!
//! This crate provides the foundational types used across all other Tributary crates:
//! - `TributaryError`: unified error taxonomy
//! - `RowData` / `Token`: immutable row payloads and their traversal instances
//! - `Checkpoint`: persisted resume point
//! - `ResumeCheck`: verdict of a checkpoint compatibility check

use serde::{Deserialize, Serialize};

/// Unified error type for all Tributary subsystems.
#[derive(Debug, thiserror::Error)]
pub enum TributaryError {
    // === Configuration Errors ===
    #[error("Pipeline validation failed: {0}")]
    ValidationError(String),

    #[error(
        "Branch '{branch}' is not configured for coalesce '{coalesce}' (expected one of: {})",
        expected.join(", ")
    )]
    InvalidBranch {
        coalesce: String,
        branch: String,
        expected: Vec<String>,
    },

    #[error("Token '{token_id}' reached coalesce '{coalesce}' without a branch name")]
    MissingBranchName { coalesce: String, token_id: String },

    #[error("Coalesce point '{0}' is not registered")]
    UnknownCoalescePoint(String),

    #[error("Node '{0}' does not exist in the execution graph")]
    UnknownNode(String),

    // === Expression Errors ===
    #[error("Invalid expression '{expression}' at offset {offset}: {message}")]
    ExpressionError {
        expression: String,
        offset: usize,
        message: String,
    },

    // === Checkpoint Errors ===
    #[error("Incompatible checkpoint: {0}")]
    IncompatibleCheckpoint(String),

    #[error("Cannot resume from checkpoint: {reason}")]
    ResumeRejected { reason: String },

    // === Data Errors ===
    #[error("Non-finite float in {context}: {value}")]
    NonFiniteValue { context: String, value: f64 },

    #[error("Transform '{plugin}' failed on node '{node}': {message}")]
    TransformError {
        plugin: String,
        node: String,
        message: String,
    },

    // === Generic ===
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl TributaryError {
    /// Returns `true` if the error indicates a pipeline-definition defect.
    ///
    /// These abort a run before (or as soon as) any row could be processed
    /// against a wrong definition; they are never retried.
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            TributaryError::ValidationError(_)
                | TributaryError::InvalidBranch { .. }
                | TributaryError::MissingBranchName { .. }
                | TributaryError::UnknownCoalescePoint(_)
                | TributaryError::UnknownNode(_)
                | TributaryError::ExpressionError { .. }
        )
    }

    /// Returns `true` if the error concerns checkpoint format or resumability.
    pub fn is_checkpoint_error(&self) -> bool {
        matches!(
            self,
            TributaryError::IncompatibleCheckpoint(_) | TributaryError::ResumeRejected { .. }
        )
    }
}

/// A convenience alias for `Result<T, TributaryError>`.
pub type Result<T> = std::result::Result<T, TributaryError>;

/// Generate a fresh opaque identifier.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

// ---------------------------------------------------------------------------
// RowData: opaque row payload plus schema contract
// ---------------------------------------------------------------------------

/// The payload of one row at one point in the pipeline.
///
/// `contract` is the schema description attached by the contract layer; it
/// is carried along untouched and never interpreted here.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RowData {
    pub values: serde_json::Map<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contract: Option<serde_json::Value>,
}

impl RowData {
    pub fn new(values: serde_json::Map<String, serde_json::Value>) -> Self {
        Self {
            values,
            contract: None,
        }
    }

    /// Build row data from a JSON value, which must be an object.
    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        match value {
            serde_json::Value::Object(values) => Ok(Self::new(values)),
            other => Err(TributaryError::Other(format!(
                "row data must be a JSON object, got {}",
                json_kind(&other)
            ))),
        }
    }

    pub fn with_contract(mut self, contract: serde_json::Value) -> Self {
        self.contract = Some(contract);
        self
    }

    pub fn get(&self, field: &str) -> Option<&serde_json::Value> {
        self.values.get(field)
    }

    /// Copy of this row with one field inserted or replaced.
    pub fn with_field(&self, field: impl Into<String>, value: serde_json::Value) -> Self {
        let mut values = self.values.clone();
        values.insert(field.into(), value);
        Self {
            values,
            contract: self.contract.clone(),
        }
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// The row values as a JSON object.
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::Value::Object(self.values.clone())
    }
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

// ---------------------------------------------------------------------------
// Token: one traversal instance of a row
// ---------------------------------------------------------------------------

/// Group identifiers linking a token to the fork, join, or expansion that produced it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenLineage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fork_group_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join_group_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expand_group_id: Option<String>,
}

/// A single row's data at a single point in the pipeline.
///
/// Tokens are never mutated: every change of data, branch, or lineage
/// produces a new token with a fresh `token_id`, so the audit trail can link
/// each instance to its parents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Token {
    pub token_id: String,
    pub row_id: String,
    pub row_data: RowData,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_name: Option<String>,
    #[serde(default)]
    pub lineage: TokenLineage,
}

impl Token {
    /// First token of a freshly read source row.
    pub fn from_source(row_id: impl Into<String>, row_data: RowData) -> Self {
        Self {
            token_id: new_id(),
            row_id: row_id.into(),
            row_data,
            branch_name: None,
            lineage: TokenLineage::default(),
        }
    }

    /// Same row, branch, and lineage with new data.
    pub fn with_updated_data(&self, row_data: RowData) -> Self {
        Self {
            token_id: new_id(),
            row_id: self.row_id.clone(),
            row_data,
            branch_name: self.branch_name.clone(),
            lineage: self.lineage.clone(),
        }
    }

    /// A branch token created by a fork.
    pub fn fork(&self, branch_name: impl Into<String>, fork_group_id: impl Into<String>) -> Self {
        Self {
            token_id: new_id(),
            row_id: self.row_id.clone(),
            row_data: self.row_data.clone(),
            branch_name: Some(branch_name.into()),
            lineage: TokenLineage {
                fork_group_id: Some(fork_group_id.into()),
                join_group_id: None,
                expand_group_id: self.lineage.expand_group_id.clone(),
            },
        }
    }

    /// The single token produced by a coalesce merge.
    pub fn joined(row_id: impl Into<String>, row_data: RowData, join_group_id: impl Into<String>) -> Self {
        Self {
            token_id: new_id(),
            row_id: row_id.into(),
            row_data,
            branch_name: None,
            lineage: TokenLineage {
                fork_group_id: None,
                join_group_id: Some(join_group_id.into()),
                expand_group_id: None,
            },
        }
    }

    /// A token produced from a batch or a multi-row expansion.
    pub fn expanded(row_id: impl Into<String>, row_data: RowData, expand_group_id: impl Into<String>) -> Self {
        Self {
            token_id: new_id(),
            row_id: row_id.into(),
            row_data,
            branch_name: None,
            lineage: TokenLineage {
                fork_group_id: None,
                join_group_id: None,
                expand_group_id: Some(expand_group_id.into()),
            },
        }
    }

    pub fn fork_group_id(&self) -> Option<&str> {
        self.lineage.fork_group_id.as_deref()
    }

    pub fn join_group_id(&self) -> Option<&str> {
        self.lineage.join_group_id.as_deref()
    }
}

// ---------------------------------------------------------------------------
// Checkpoint: persisted resume point
// ---------------------------------------------------------------------------

/// Checkpoint record layout version. Bump on any incompatible field change.
pub const CHECKPOINT_FORMAT_VERSION: u32 = 2;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub checkpoint_id: String,
    pub run_id: String,
    /// Last token processed when the checkpoint was captured.
    pub token_id: String,
    /// Node the checkpoint was captured at.
    pub node_id: String,
    /// Number of source rows fully handed to the pipeline.
    pub sequence_number: u64,
    pub created_at: chrono::DateTime<chrono::Utc>,
    /// `None` marks a legacy checkpoint that can never be resumed.
    #[serde(default)]
    pub upstream_topology_hash: Option<String>,
    #[serde(default)]
    pub checkpoint_node_config_hash: Option<String>,
    #[serde(default)]
    pub format_version: u32,
    /// Buffered aggregation batches, versioned by their own `_version` field.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregation_state: Option<serde_json::Value>,
    /// Pending coalesce groups, versioned by their own `_version` field.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coalesce_state: Option<serde_json::Value>,
}

impl Checkpoint {
    /// A checkpoint written before topology validation data existed.
    pub fn is_legacy(&self) -> bool {
        self.upstream_topology_hash.is_none()
    }
}

// ---------------------------------------------------------------------------
// ResumeCheck: verdict of a compatibility check
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeCheck {
    pub can_resume: bool,
    pub reason: Option<String>,
}

impl ResumeCheck {
    pub fn ok() -> Self {
        Self {
            can_resume: true,
            reason: None,
        }
    }

    pub fn reject(reason: impl Into<String>) -> Self {
        Self {
            can_resume: false,
            reason: Some(reason.into()),
        }
    }

    /// Convert a rejection into [`TributaryError::ResumeRejected`].
    pub fn into_result(self) -> Result<()> {
        if self.can_resume {
            Ok(())
        } else {
            Err(TributaryError::ResumeRejected {
                reason: self.reason.unwrap_or_else(|| "unspecified".to_string()),
            })
        }
    }
}
