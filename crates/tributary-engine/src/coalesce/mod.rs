//! Rejoining forked branch tokens.
//!
//! A [`CoalesceExecutor`] buffers branch tokens per (coalesce point,
//! correlation key) until the point's policy is satisfied, a timeout expires,
//! or the source is exhausted. Every group ends in exactly one
//! [`CoalesceOutcome`]; expected failures are outcomes, not errors.

mod executor;
mod merge;
mod state;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use tributary_types::Token;

use crate::settings::{CoalescePolicy, MergeStrategy};

pub use executor::{CoalesceExecutor, DEFAULT_COMPLETED_KEY_CAPACITY};
pub use merge::{merge_rows, MergedRow};
pub use state::{
    ArrivalSnapshot, CoalesceCheckpointState, CompletedKey, PendingSnapshot,
    COALESCE_STATE_VERSION,
};

/// What made a pending group resolve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionTrigger {
    AllArrived,
    FirstArrived,
    QuorumMet,
    Timeout,
    EndOfSource,
}

/// Why a resolved group produced no merged token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    QuorumNotMet,
    IncompleteBranches,
    MissingSelectedBranch,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::QuorumNotMet => "quorum_not_met",
            FailureKind::IncompleteBranches => "incomplete_branches",
            FailureKind::MissingSelectedBranch => "missing_selected_branch",
        }
    }
}

/// A field written by more than one branch of a union merge with differing values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnionCollision {
    pub field: String,
    /// Branches that wrote the field, in declaration order.
    pub branches: Vec<String>,
    /// The branch whose value was kept.
    pub winner: String,
}

/// Everything recorded about a resolution, successful or not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoalesceMetadata {
    pub coalesce_name: String,
    pub correlation_key: String,
    pub policy: CoalescePolicy,
    pub merge: MergeStrategy,
    pub trigger: ResolutionTrigger,
    /// Arrived branches, in declaration order.
    pub branches_present: Vec<String>,
    pub branches_missing: Vec<String>,
    pub parent_token_ids: Vec<String>,
    /// The buffered branch tokens, so failures can be routed with their data.
    pub consumed_tokens: Vec<Token>,
    /// Seconds after the group was opened at which each branch arrived.
    pub arrival_offsets: BTreeMap<String, f64>,
    pub wait_seconds: f64,
    /// Clock reading at resolution.
    pub resolved_at: f64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub union_collisions: Vec<UnionCollision>,
}

/// The terminal result of one pending group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CoalesceOutcome {
    Merged {
        token: Token,
        metadata: CoalesceMetadata,
    },
    QuorumNotMet {
        quorum_count: usize,
        metadata: CoalesceMetadata,
    },
    IncompleteBranches {
        metadata: CoalesceMetadata,
    },
    MissingSelectedBranch {
        select_branch: String,
        metadata: CoalesceMetadata,
    },
}

impl CoalesceOutcome {
    pub fn metadata(&self) -> &CoalesceMetadata {
        match self {
            CoalesceOutcome::Merged { metadata, .. }
            | CoalesceOutcome::QuorumNotMet { metadata, .. }
            | CoalesceOutcome::IncompleteBranches { metadata }
            | CoalesceOutcome::MissingSelectedBranch { metadata, .. } => metadata,
        }
    }

    pub fn is_merged(&self) -> bool {
        matches!(self, CoalesceOutcome::Merged { .. })
    }

    pub fn merged_token(&self) -> Option<&Token> {
        match self {
            CoalesceOutcome::Merged { token, .. } => Some(token),
            _ => None,
        }
    }

    pub fn failure(&self) -> Option<FailureKind> {
        match self {
            CoalesceOutcome::Merged { .. } => None,
            CoalesceOutcome::QuorumNotMet { .. } => Some(FailureKind::QuorumNotMet),
            CoalesceOutcome::IncompleteBranches { .. } => Some(FailureKind::IncompleteBranches),
            CoalesceOutcome::MissingSelectedBranch { .. } => {
                Some(FailureKind::MissingSelectedBranch)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    /// The group for this key already resolved.
    LateArrival,
    /// The group is still pending and already holds this branch.
    DuplicateBranch,
}

/// A branch token the executor refused to buffer.
///
/// The token is handed back so the caller can give it a terminal outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArrivalAnomaly {
    pub kind: AnomalyKind,
    pub coalesce_name: String,
    pub correlation_key: String,
    pub branch: String,
    pub token: Token,
}

/// Result of [`CoalesceExecutor::accept`].
#[derive(Debug, Clone, PartialEq)]
pub struct AcceptResult {
    /// The token is buffered and the group is still waiting.
    pub held: bool,
    pub outcome: Option<CoalesceOutcome>,
    pub anomaly: Option<ArrivalAnomaly>,
}

impl AcceptResult {
    pub(crate) fn held() -> Self {
        Self {
            held: true,
            outcome: None,
            anomaly: None,
        }
    }

    pub(crate) fn resolved(outcome: CoalesceOutcome) -> Self {
        Self {
            held: false,
            outcome: Some(outcome),
            anomaly: None,
        }
    }

    pub(crate) fn anomaly(anomaly: ArrivalAnomaly) -> Self {
        Self {
            held: false,
            outcome: None,
            anomaly: Some(anomaly),
        }
    }
}
