//! Batch buffering for aggregation nodes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use tributary_types::{new_id, Result, Token, TributaryError};

use crate::canonical::finite_f64;
use crate::clock::SharedClock;
use crate::events::{AuditEvent, EventEmitter};
use crate::settings::AggregationSettings;
use crate::trigger::{TriggerEvaluator, TriggerType};

/// Layout version of the serialized batch state. Restores require an exact match.
pub const AGGREGATION_STATE_VERSION: &str = "aggregation-v1";

/// Why a batch was flushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchTrigger {
    Count,
    Timeout,
    Condition,
    EndOfSource,
}

impl From<TriggerType> for BatchTrigger {
    fn from(t: TriggerType) -> Self {
        match t {
            TriggerType::Count => BatchTrigger::Count,
            TriggerType::Timeout => BatchTrigger::Timeout,
            TriggerType::Condition => BatchTrigger::Condition,
        }
    }
}

/// A completed batch handed back to the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchFlush {
    pub node_id: String,
    pub batch_id: String,
    pub trigger: BatchTrigger,
    pub tokens: Vec<Token>,
}

struct BatchBuffer {
    evaluator: TriggerEvaluator,
    batch_id: String,
    tokens: Vec<Token>,
}

/// Buffers tokens per aggregation node until its trigger fires.
pub struct AggregationExecutor {
    clock: SharedClock,
    emitter: EventEmitter,
    buffers: BTreeMap<String, BatchBuffer>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchSnapshot {
    pub tokens: Vec<Token>,
    pub batch_id: String,
    pub batch_count: usize,
    pub elapsed_age_seconds: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregationCheckpointState {
    #[serde(rename = "_version", default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(flatten)]
    pub nodes: BTreeMap<String, BatchSnapshot>,
}

impl AggregationExecutor {
    pub fn new(clock: SharedClock, emitter: EventEmitter) -> Self {
        Self {
            clock,
            emitter,
            buffers: BTreeMap::new(),
        }
    }

    pub fn register(&mut self, settings: &AggregationSettings) -> Result<()> {
        if self.buffers.contains_key(&settings.name) {
            return Err(TributaryError::ValidationError(format!(
                "aggregation '{}' is already registered",
                settings.name
            )));
        }
        let evaluator = TriggerEvaluator::new(settings.trigger.clone(), self.clock.clone())?;
        self.buffers.insert(
            settings.name.clone(),
            BatchBuffer {
                evaluator,
                batch_id: new_id(),
                tokens: Vec::new(),
            },
        );
        Ok(())
    }

    pub fn buffered_count(&self, node_id: &str) -> usize {
        self.buffers.get(node_id).map_or(0, |b| b.tokens.len())
    }

    /// Add a token to a node's batch, flushing it if a trigger fires.
    pub fn buffer(&mut self, node_id: &str, token: Token) -> Result<Option<BatchFlush>> {
        let buffer = self
            .buffers
            .get_mut(node_id)
            .ok_or_else(|| TributaryError::UnknownNode(node_id.to_string()))?;
        debug!(node = %node_id, token = %token.token_id, batch = %buffer.batch_id, "Buffered token");
        buffer.tokens.push(token);
        buffer.evaluator.record_accept();
        if !buffer.evaluator.should_trigger() {
            return Ok(None);
        }
        let trigger = buffer
            .evaluator
            .which_triggered()
            .map(BatchTrigger::from)
            .unwrap_or(BatchTrigger::Count);
        Ok(Some(flush(node_id, buffer, trigger, &self.emitter)))
    }

    /// Flush non-empty batches whose timeout or condition fires without a new row.
    pub fn check_timeouts(&mut self) -> Vec<BatchFlush> {
        let emitter = &self.emitter;
        self.buffers
            .iter_mut()
            .filter(|(_, b)| !b.tokens.is_empty())
            .filter_map(|(node_id, buffer)| {
                if !buffer.evaluator.should_trigger() {
                    return None;
                }
                let trigger = buffer.evaluator.which_triggered()?.into();
                Some(flush(node_id, buffer, trigger, emitter))
            })
            .collect()
    }

    /// Flush every non-empty batch because the source is exhausted.
    pub fn flush_all(&mut self) -> Vec<BatchFlush> {
        let emitter = &self.emitter;
        self.buffers
            .iter_mut()
            .filter(|(_, b)| !b.tokens.is_empty())
            .map(|(node_id, buffer)| flush(node_id, buffer, BatchTrigger::EndOfSource, emitter))
            .collect()
    }

    pub fn get_checkpoint_state(&self) -> Result<serde_json::Value> {
        let nodes = self
            .buffers
            .iter()
            .map(|(node_id, b)| {
                let age = finite_f64("aggregation batch age", b.evaluator.batch_age_seconds())?;
                Ok((
                    node_id.clone(),
                    BatchSnapshot {
                        tokens: b.tokens.clone(),
                        batch_id: b.batch_id.clone(),
                        batch_count: b.evaluator.batch_count(),
                        elapsed_age_seconds: age,
                    },
                ))
            })
            .collect::<Result<BTreeMap<_, _>>>()?;
        Ok(serde_json::to_value(AggregationCheckpointState {
            version: Some(AGGREGATION_STATE_VERSION.to_string()),
            nodes,
        })?)
    }

    /// Replace buffered batches with a checkpoint blob.
    ///
    /// Nodes absent from the blob start empty.
    pub fn restore_from_checkpoint(&mut self, state: &serde_json::Value) -> Result<()> {
        match state.get("_version").and_then(serde_json::Value::as_str) {
            Some(AGGREGATION_STATE_VERSION) => {}
            Some(other) => {
                return Err(TributaryError::IncompatibleCheckpoint(format!(
                    "Incompatible checkpoint version: aggregation state is '{other}', \
                     expected '{AGGREGATION_STATE_VERSION}'"
                )))
            }
            None => {
                return Err(TributaryError::IncompatibleCheckpoint(format!(
                    "Incompatible checkpoint version: aggregation state has no _version; \
                     expected '{AGGREGATION_STATE_VERSION}'"
                )))
            }
        }
        let state: AggregationCheckpointState = serde_json::from_value(state.clone())?;

        if let Some(unknown) = state.nodes.keys().find(|n| !self.buffers.contains_key(*n)) {
            return Err(TributaryError::UnknownNode(unknown.clone()));
        }
        let mut restored = BTreeMap::new();
        for (node_id, snapshot) in state.nodes {
            let age = finite_f64("restored aggregation batch age", snapshot.elapsed_age_seconds)?;
            if age < 0.0 {
                return Err(TributaryError::IncompatibleCheckpoint(format!(
                    "aggregation batch of '{node_id}' has negative age {age}"
                )));
            }
            if snapshot.batch_count != snapshot.tokens.len() {
                return Err(TributaryError::IncompatibleCheckpoint(format!(
                    "aggregation batch of '{node_id}' counts {} rows but holds {} tokens",
                    snapshot.batch_count,
                    snapshot.tokens.len()
                )));
            }
            restored.insert(node_id, (snapshot, age));
        }

        for (node_id, buffer) in self.buffers.iter_mut() {
            buffer.evaluator.reset();
            match restored.remove(node_id) {
                Some((snapshot, age)) => {
                    buffer.evaluator.restore_batch(snapshot.batch_count, age);
                    buffer.tokens = snapshot.tokens;
                    buffer.batch_id = snapshot.batch_id;
                }
                None => {
                    buffer.tokens.clear();
                    buffer.batch_id = new_id();
                }
            }
        }
        info!(nodes = self.buffers.len(), "Restored aggregation state from checkpoint");
        Ok(())
    }
}

fn flush(node_id: &str, buffer: &mut BatchBuffer, trigger: BatchTrigger, emitter: &EventEmitter) -> BatchFlush {
    let tokens = std::mem::take(&mut buffer.tokens);
    let batch_id = std::mem::replace(&mut buffer.batch_id, new_id());
    buffer.evaluator.reset();

    info!(node = %node_id, batch = %batch_id, trigger = ?trigger, rows = tokens.len(), "Batch flushed");
    emitter.emit(AuditEvent::BatchFlushed {
        node_id: node_id.to_string(),
        batch_id: batch_id.clone(),
        trigger,
        token_ids: tokens.iter().map(|t| t.token_id.clone()).collect(),
    });
    BatchFlush {
        node_id: node_id.to_string(),
        batch_id,
        trigger,
        tokens,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use crate::trigger::TriggerSettings;
    use serde_json::json;
    use std::sync::Arc;
    use tributary_types::RowData;

    fn token(n: i64) -> Token {
        Token::from_source(format!("row-{n}"), RowData::from_value(json!({"n": n})).unwrap())
    }

    fn executor(trigger: TriggerSettings) -> (Arc<MockClock>, AggregationExecutor) {
        let clock = Arc::new(MockClock::new(50.0));
        let mut exec = AggregationExecutor::new(clock.clone(), EventEmitter::default());
        exec.register(&AggregationSettings {
            name: "batch".into(),
            trigger,
            plugin_config: serde_json::Value::Null,
        })
        .unwrap();
        (clock, exec)
    }

    #[test]
    fn count_trigger_flushes_and_starts_new_batch() {
        let (_clock, mut exec) = executor(TriggerSettings::count(2));
        assert!(exec.buffer("batch", token(1)).unwrap().is_none());
        let flush = exec.buffer("batch", token(2)).unwrap().unwrap();
        assert_eq!(flush.trigger, BatchTrigger::Count);
        assert_eq!(flush.tokens.len(), 2);
        assert_eq!(exec.buffered_count("batch"), 0);

        exec.buffer("batch", token(3)).unwrap();
        let next = exec.buffer("batch", token(4)).unwrap().unwrap();
        assert_ne!(next.batch_id, flush.batch_id);
    }

    #[test]
    fn timeout_flush_without_new_rows() {
        let (clock, mut exec) = executor(TriggerSettings::timeout(5.0));
        exec.buffer("batch", token(1)).unwrap();
        clock.advance(4.0);
        assert!(exec.check_timeouts().is_empty());
        clock.advance(1.0);
        let flushes = exec.check_timeouts();
        assert_eq!(flushes.len(), 1);
        assert_eq!(flushes[0].trigger, BatchTrigger::Timeout);

        clock.advance(100.0);
        assert!(exec.check_timeouts().is_empty(), "empty batch must not age");
        exec.buffer("batch", token(2)).unwrap();
        clock.advance(4.0);
        assert!(exec.check_timeouts().is_empty(), "age must restart with the new batch");
    }

    #[test]
    fn flush_all_marks_end_of_source() {
        let (_clock, mut exec) = executor(TriggerSettings::count(10));
        exec.buffer("batch", token(1)).unwrap();
        let flushes = exec.flush_all();
        assert_eq!(flushes.len(), 1);
        assert_eq!(flushes[0].trigger, BatchTrigger::EndOfSource);
        assert!(exec.flush_all().is_empty());
    }

    #[test]
    fn unknown_node_is_an_error() {
        let (_clock, mut exec) = executor(TriggerSettings::count(1));
        assert!(matches!(
            exec.buffer("nope", token(1)),
            Err(TributaryError::UnknownNode(_))
        ));
    }

    #[test]
    fn checkpoint_restores_batch_and_age() {
        let (clock, mut exec) = executor(TriggerSettings::timeout(10.0));
        exec.buffer("batch", token(1)).unwrap();
        exec.buffer("batch", token(2)).unwrap();
        clock.advance(6.0);
        let state = exec.get_checkpoint_state().unwrap();
        assert_eq!(state["_version"], AGGREGATION_STATE_VERSION);
        assert_eq!(state["batch"]["batch_count"], 2);
        assert_eq!(state["batch"]["elapsed_age_seconds"], 6.0);

        let (clock2, mut restored) = executor(TriggerSettings::timeout(10.0));
        clock2.set(7_000.0);
        restored.restore_from_checkpoint(&state).unwrap();
        assert_eq!(restored.buffered_count("batch"), 2);
        clock2.advance(3.0);
        assert!(restored.check_timeouts().is_empty());
        clock2.advance(1.0);
        let flushes = restored.check_timeouts();
        assert_eq!(flushes[0].tokens.len(), 2);
        assert_eq!(flushes[0].batch_id, state["batch"]["batch_id"]);
    }

    #[test]
    fn restore_requires_exact_version() {
        let (_clock, mut exec) = executor(TriggerSettings::count(1));
        assert!(matches!(
            exec.restore_from_checkpoint(&json!({})),
            Err(TributaryError::IncompatibleCheckpoint(_))
        ));
        assert!(matches!(
            exec.restore_from_checkpoint(&json!({"_version": "aggregation-v0"})),
            Err(TributaryError::IncompatibleCheckpoint(_))
        ));
        assert!(exec
            .restore_from_checkpoint(&json!({"_version": AGGREGATION_STATE_VERSION}))
            .is_ok());
    }

    #[test]
    fn rejected_restore_leaves_buffers_untouched() {
        let (_clock, mut exec) = executor(TriggerSettings::count(10));
        exec.register(&AggregationSettings {
            name: "totals".into(),
            trigger: TriggerSettings::count(10),
            plugin_config: serde_json::Value::Null,
        })
        .unwrap();
        exec.buffer("batch", token(1)).unwrap();
        exec.buffer("totals", token(2)).unwrap();
        let before = exec.get_checkpoint_state().unwrap();

        let mut state = before.clone();
        state["batch"]["tokens"] = json!([]);
        state["batch"]["batch_count"] = json!(0);
        state["totals"]["elapsed_age_seconds"] = json!(-1.0);
        assert!(matches!(
            exec.restore_from_checkpoint(&state),
            Err(TributaryError::IncompatibleCheckpoint(_))
        ));
        assert_eq!(exec.buffered_count("batch"), 1);
        assert_eq!(exec.buffered_count("totals"), 1);
        assert_eq!(exec.get_checkpoint_state().unwrap(), before);

        let mut miscounted = before.clone();
        miscounted["totals"]["batch_count"] = json!(3);
        assert!(exec.restore_from_checkpoint(&miscounted).is_err());
        assert_eq!(exec.get_checkpoint_state().unwrap(), before);
    }
}
