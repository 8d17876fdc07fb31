//! Audit events for the row pipeline.
//!
//! Emits [`AuditEvent`]s via a [`tokio::sync::broadcast`] channel. A
//! recorder subscribes and persists them; the engine never depends on one
//! being present.

use serde::{Deserialize, Serialize};

use crate::aggregation::BatchTrigger;
use crate::coalesce::{AnomalyKind, FailureKind, ResolutionTrigger, UnionCollision};

/// Everything the audit trail needs to reconstruct a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEvent {
    RunStarted {
        run_id: String,
        pipeline_name: String,
        node_count: usize,
        resumed_from: Option<String>,
    },
    RunCompleted {
        run_id: String,
        rows_processed: u64,
        failures: usize,
        duration_ms: u64,
    },
    TokenForked {
        gate: String,
        parent_token_id: String,
        fork_group_id: String,
        branches: Vec<String>,
        child_token_ids: Vec<String>,
    },
    CoalesceResolved {
        coalesce: String,
        correlation_key: String,
        trigger: ResolutionTrigger,
        merged_token_id: String,
        branches_present: Vec<String>,
        branches_missing: Vec<String>,
        parent_token_ids: Vec<String>,
        union_collisions: Vec<UnionCollision>,
    },
    CoalesceFailed {
        coalesce: String,
        correlation_key: String,
        trigger: ResolutionTrigger,
        failure: FailureKind,
        branches_present: Vec<String>,
        branches_missing: Vec<String>,
        parent_token_ids: Vec<String>,
    },
    ArrivalAnomaly {
        coalesce: String,
        correlation_key: String,
        kind: AnomalyKind,
        branch: String,
        token_id: String,
    },
    BatchFlushed {
        node_id: String,
        batch_id: String,
        trigger: BatchTrigger,
        token_ids: Vec<String>,
    },
    CheckpointCreated {
        checkpoint_id: String,
        node_id: String,
        sequence_number: u64,
    },
    ResumeValidated {
        checkpoint_id: String,
        can_resume: bool,
        reason: Option<String>,
    },
    TokenRejected {
        node_id: String,
        token_id: String,
        row_id: String,
        reason: String,
    },
}

/// Event emitter wrapping a broadcast sender.
#[derive(Clone)]
pub struct EventEmitter {
    sender: tokio::sync::broadcast::Sender<AuditEvent>,
}

impl EventEmitter {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = tokio::sync::broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit an event to all current subscribers.
    ///
    /// If there are no active receivers the event is dropped.
    pub fn emit(&self, event: AuditEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<AuditEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl std::fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventEmitter")
            .field("receivers", &self.sender.receiver_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn emitter_sends_and_receives() {
        let emitter = EventEmitter::new(16);
        let mut rx = emitter.subscribe();

        emitter.emit(AuditEvent::RunStarted {
            run_id: "run-1".into(),
            pipeline_name: "orders".into(),
            node_count: 5,
            resumed_from: None,
        });

        match rx.recv().await.unwrap() {
            AuditEvent::RunStarted {
                pipeline_name,
                node_count,
                ..
            } => {
                assert_eq!(pipeline_name, "orders");
                assert_eq!(node_count, 5);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn emit_with_no_subscribers_does_not_panic() {
        let emitter = EventEmitter::new(4);
        emitter.emit(AuditEvent::CheckpointCreated {
            checkpoint_id: "cp".into(),
            node_id: "out".into(),
            sequence_number: 1,
        });
    }

    #[test]
    fn events_serialize_with_a_tag() {
        let event = AuditEvent::ArrivalAnomaly {
            coalesce: "merge".into(),
            correlation_key: "fg-1".into(),
            kind: AnomalyKind::LateArrival,
            branch: "c".into(),
            token_id: "t-3".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "arrival_anomaly");
        assert_eq!(json["kind"], "late_arrival");

        let back: AuditEvent = serde_json::from_value(json).unwrap();
        assert!(matches!(back, AuditEvent::ArrivalAnomaly { ref branch, .. } if branch == "c"));
    }
}
