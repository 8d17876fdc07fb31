//! Row-by-row pipeline execution with fork/coalesce, batching, and checkpoints.
//!
//! The orchestrator drives each source row through the frozen
//! [`ExecutionGraph`] with a work queue, polls timeouts between rows, captures
//! checkpoints per [`CheckpointSettings`](crate::checkpoint::CheckpointSettings),
//! and flushes every buffered group at end of source.
//!
//! With an output directory set, sink rows, failures, and anomalies are
//! appended to disk before each checkpoint is saved. A resumed run skips the
//! rows that checkpoint covers and appends to the same files, so every row is
//! delivered once across the crash.

use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;

use serde::Serialize;
use tracing::{debug, info, warn};

use tributary_types::{new_id, Checkpoint, Result, ResumeCheck, RowData, Token, TributaryError};

use crate::aggregation::{AggregationExecutor, BatchFlush};
use crate::checkpoint::{clear_checkpoint, save_checkpoint, CheckpointManager, CheckpointPosition};
use crate::clock::SharedClock;
use crate::coalesce::{ArrivalAnomaly, CoalesceExecutor, CoalesceOutcome};
use crate::compatibility::CheckpointCompatibilityValidator;
use crate::events::{AuditEvent, EventEmitter};
use crate::graph::{ExecutionGraph, NodeInfo, NodeType, RoutingMode};
use crate::output::OutputLog;
use crate::registry::{PluginRegistry, TransformOutcome};
use crate::settings::PipelineSettings;
use crate::validation::validate_or_raise;

type WorkQueue = VecDeque<(String, Token)>;

// ---------------------------------------------------------------------------
// Run results
// ---------------------------------------------------------------------------

/// A row (or group of branch rows) that reached a terminal failure.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RowFailure {
    Coalesce {
        node_id: String,
        outcome: CoalesceOutcome,
    },
    Rejected {
        node_id: String,
        token: Token,
        reason: String,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub run_id: String,
    /// Tokens collected per sink node, in arrival order.
    pub sink_outputs: BTreeMap<String, Vec<Token>>,
    pub failures: Vec<RowFailure>,
    pub anomalies: Vec<ArrivalAnomaly>,
    /// Source rows handled by this invocation; rows skipped on resume are not counted.
    pub rows_processed: u64,
    pub last_checkpoint: Option<Checkpoint>,
}

impl RunResult {
    pub fn sink(&self, node_id: &str) -> &[Token] {
        self.sink_outputs.get(node_id).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Mutable state of one run.
struct RunState {
    run_id: String,
    coalesce: CoalesceExecutor,
    aggregation: AggregationExecutor,
    sink_outputs: BTreeMap<String, Vec<Token>>,
    failures: Vec<RowFailure>,
    anomalies: Vec<ArrivalAnomaly>,
    rows_processed: u64,
    last_checkpoint: Option<Checkpoint>,
    persisted: Persisted,
}

/// How much of each output list is already on disk.
#[derive(Default)]
struct Persisted {
    sinks: BTreeMap<String, usize>,
    failures: usize,
    anomalies: usize,
}

/// The last node and token a row reached; where its checkpoint is taken.
struct Position {
    node_id: String,
    token_id: String,
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct Orchestrator {
    settings: PipelineSettings,
    graph: ExecutionGraph,
    registry: PluginRegistry,
    clock: SharedClock,
    emitter: EventEmitter,
    checkpoints: CheckpointManager,
    validator: CheckpointCompatibilityValidator,
    checkpoint_dir: Option<PathBuf>,
    output: Option<OutputLog>,
    source_id: String,
}

impl Orchestrator {
    /// Validate the pipeline, freeze its graph, and check every plugin it names is registered.
    pub fn new(
        settings: PipelineSettings,
        registry: PluginRegistry,
        clock: SharedClock,
        emitter: EventEmitter,
    ) -> Result<Self> {
        validate_or_raise(&settings)?;
        let graph = settings.build_graph()?;

        for node in graph.nodes() {
            let known = match node.node_type {
                NodeType::Transform => registry.has_transform(&node.plugin_name),
                NodeType::Aggregation => registry.has_batch_transform(&node.plugin_name),
                _ => true,
            };
            if !known {
                return Err(TributaryError::ValidationError(format!(
                    "{} node '{}' uses unregistered plugin '{}'",
                    node.node_type, node.node_id, node.plugin_name
                )));
            }
        }

        let source_id = graph
            .source_nodes()
            .first()
            .map(|n| n.node_id.clone())
            .ok_or_else(|| TributaryError::ValidationError("pipeline has no source node".into()))?;

        Ok(Self {
            settings,
            graph,
            registry,
            clock,
            checkpoints: CheckpointManager::new(emitter.clone()),
            emitter,
            validator: CheckpointCompatibilityValidator::new(),
            checkpoint_dir: None,
            output: None,
            source_id,
        })
    }

    /// Persist checkpoints to `dir` and clear them when a run completes.
    pub fn with_checkpoint_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.checkpoint_dir = Some(dir.into());
        self
    }

    /// Append sink rows, failures, and anomalies under `dir` as JSON Lines.
    ///
    /// A fresh [`run`](Self::run) truncates the files; [`resume_from`](Self::resume_from)
    /// appends to them.
    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output = Some(OutputLog::new(dir));
        self
    }

    pub fn output(&self) -> Option<&OutputLog> {
        self.output.as_ref()
    }

    pub fn graph(&self) -> &ExecutionGraph {
        &self.graph
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Check a checkpoint against this pipeline and record the verdict.
    pub fn check_resume(&self, checkpoint: &Checkpoint) -> ResumeCheck {
        let check = self.validator.validate(checkpoint, &self.graph);
        if let Some(reason) = &check.reason {
            warn!(checkpoint = %checkpoint.checkpoint_id, reason = %reason, "Checkpoint rejected for resume");
        }
        self.emitter.emit(AuditEvent::ResumeValidated {
            checkpoint_id: checkpoint.checkpoint_id.clone(),
            can_resume: check.can_resume,
            reason: check.reason.clone(),
        });
        check
    }

    /// Process every row from the beginning under a new run id.
    pub async fn run(&self, rows: impl IntoIterator<Item = RowData>) -> Result<RunResult> {
        let (coalesce, aggregation) = self.executors()?;
        if let Some(output) = &self.output {
            let sinks = self.graph.sink_nodes();
            output.reset(sinks.iter().map(|n| n.node_id.as_str())).await?;
        }
        self.execute(RunState::new(new_id(), coalesce, aggregation), rows, 0, None)
            .await
    }

    /// Continue the run that wrote `checkpoint`.
    ///
    /// `rows` is the full source again; the first `sequence_number` rows are
    /// skipped. Fails with [`TributaryError::ResumeRejected`] carrying the
    /// validator's reason if the pipeline changed incompatibly.
    pub async fn resume_from(
        &self,
        checkpoint: &Checkpoint,
        rows: impl IntoIterator<Item = RowData>,
    ) -> Result<RunResult> {
        self.check_resume(checkpoint).into_result()?;

        let (mut coalesce, mut aggregation) = self.executors()?;
        if let Some(state) = &checkpoint.coalesce_state {
            coalesce.restore_from_checkpoint(state)?;
        }
        if let Some(state) = &checkpoint.aggregation_state {
            aggregation.restore_from_checkpoint(state)?;
        }
        info!(
            run = %checkpoint.run_id,
            checkpoint = %checkpoint.checkpoint_id,
            skip = checkpoint.sequence_number,
            pending_groups = coalesce.pending_count(),
            "Resuming run"
        );

        let run = RunState::new(checkpoint.run_id.clone(), coalesce, aggregation);
        self.execute(
            run,
            rows,
            checkpoint.sequence_number,
            Some(checkpoint.checkpoint_id.clone()),
        )
        .await
    }

    fn executors(&self) -> Result<(CoalesceExecutor, AggregationExecutor)> {
        let mut coalesce = CoalesceExecutor::new(self.clock.clone(), self.emitter.clone());
        for settings in &self.settings.coalesce {
            coalesce.register_point(settings.clone())?;
        }
        let mut aggregation = AggregationExecutor::new(self.clock.clone(), self.emitter.clone());
        for settings in &self.settings.aggregations {
            aggregation.register(settings)?;
        }
        Ok((coalesce, aggregation))
    }

    async fn execute(
        &self,
        mut run: RunState,
        rows: impl IntoIterator<Item = RowData>,
        skip: u64,
        resumed_from: Option<String>,
    ) -> Result<RunResult> {
        let started = self.clock.now();
        info!(run = %run.run_id, pipeline = %self.settings.name, "Run started");
        self.emitter.emit(AuditEvent::RunStarted {
            run_id: run.run_id.clone(),
            pipeline_name: self.settings.name.clone(),
            node_count: self.graph.node_count(),
            resumed_from,
        });

        let mut sequence = 0u64;
        for row in rows {
            sequence += 1;
            if sequence <= skip {
                continue;
            }
            let token = Token::from_source(format!("row-{sequence}"), row);
            debug!(row = %token.row_id, token = %token.token_id, "Source row");
            let mut position = Position {
                node_id: self.source_id.clone(),
                token_id: token.token_id.clone(),
            };

            let mut queue = WorkQueue::new();
            queue.push_back((self.source_id.clone(), token));
            self.drain(&mut run, &mut queue, &mut position).await?;
            run.rows_processed += 1;

            self.poll_timeouts(&mut run, &mut queue).await?;
            self.drain(&mut run, &mut queue, &mut position).await?;

            self.maybe_checkpoint(&mut run, sequence, &position).await?;
        }

        self.flush_end_of_source(&mut run).await?;
        self.persist_outputs(&mut run).await?;

        if let Some(dir) = &self.checkpoint_dir {
            clear_checkpoint(dir).await?;
        }

        let duration_ms = ((self.clock.now() - started).max(0.0) * 1000.0) as u64;
        info!(
            run = %run.run_id,
            rows = run.rows_processed,
            failures = run.failures.len(),
            anomalies = run.anomalies.len(),
            "Run completed"
        );
        self.emitter.emit(AuditEvent::RunCompleted {
            run_id: run.run_id.clone(),
            rows_processed: run.rows_processed,
            failures: run.failures.len(),
            duration_ms,
        });

        Ok(RunResult {
            run_id: run.run_id,
            sink_outputs: run.sink_outputs,
            failures: run.failures,
            anomalies: run.anomalies,
            rows_processed: run.rows_processed,
            last_checkpoint: run.last_checkpoint,
        })
    }

    /// Process queued tokens until none are left.
    async fn drain(&self, run: &mut RunState, queue: &mut WorkQueue, position: &mut Position) -> Result<()> {
        while let Some((node_id, token)) = queue.pop_front() {
            position.node_id.clone_from(&node_id);
            position.token_id.clone_from(&token.token_id);

            let node = self.graph.get_node_info(&node_id)?;
            match node.node_type {
                NodeType::Source => self.forward(&node_id, token, queue),
                NodeType::Transform => self.transform(node, token, run, queue).await?,
                NodeType::Gate => self.gate(node, token, queue),
                NodeType::Coalesce => {
                    let key = token
                        .fork_group_id()
                        .unwrap_or(&token.row_id)
                        .to_string();
                    let result = run.coalesce.accept(token, &node_id, &key)?;
                    if let Some(outcome) = result.outcome {
                        self.coalesce_outcome(outcome, run, queue);
                    }
                    if let Some(anomaly) = result.anomaly {
                        run.anomalies.push(anomaly);
                    }
                }
                NodeType::Aggregation => {
                    if let Some(flush) = run.aggregation.buffer(&node_id, token)? {
                        self.batch(flush, queue).await?;
                    }
                }
                NodeType::Sink => {
                    debug!(sink = %node_id, token = %token.token_id, row = %token.row_id, "Token reached sink");
                    run.sink_outputs.entry(node_id).or_default().push(token);
                }
            }
        }
        Ok(())
    }

    /// Hand a token to the node's single successor.
    fn forward(&self, from: &str, token: Token, queue: &mut WorkQueue) {
        match self.graph.outgoing_edges(from).first() {
            Some(edge) => queue.push_back((edge.to_node_id.clone(), token)),
            None => warn!(node = %from, token = %token.token_id, "Node has no successor; token dropped"),
        }
    }

    async fn transform(
        &self,
        node: &NodeInfo,
        token: Token,
        run: &mut RunState,
        queue: &mut WorkQueue,
    ) -> Result<()> {
        let plugin = self.registry.transform(&node.plugin_name).ok_or_else(|| {
            TributaryError::ValidationError(format!("unregistered transform plugin '{}'", node.plugin_name))
        })?;
        match plugin.process(&token.row_data, node).await? {
            TransformOutcome::Row(data) => {
                self.forward(&node.node_id, token.with_updated_data(data), queue);
            }
            TransformOutcome::Rejected { reason } => {
                warn!(node = %node.node_id, row = %token.row_id, reason = %reason, "Row rejected");
                self.emitter.emit(AuditEvent::TokenRejected {
                    node_id: node.node_id.clone(),
                    token_id: token.token_id.clone(),
                    row_id: token.row_id.clone(),
                    reason: reason.clone(),
                });
                run.failures.push(RowFailure::Rejected {
                    node_id: node.node_id.clone(),
                    token,
                    reason,
                });
            }
        }
        Ok(())
    }

    /// Fork over COPY edges, or pass through the single MOVE edge.
    fn gate(&self, node: &NodeInfo, token: Token, queue: &mut WorkQueue) {
        let copies: Vec<_> = self
            .graph
            .outgoing_edges(&node.node_id)
            .into_iter()
            .filter(|e| e.mode == RoutingMode::Copy)
            .collect();
        if copies.is_empty() {
            self.forward(&node.node_id, token, queue);
            return;
        }

        let fork_group_id = new_id();
        let mut branches = Vec::with_capacity(copies.len());
        let mut children = Vec::with_capacity(copies.len());
        for edge in copies {
            let branch = edge.label.clone().unwrap_or_default();
            let child = token.fork(branch.clone(), fork_group_id.clone());
            children.push(child.token_id.clone());
            branches.push(branch);
            queue.push_back((edge.to_node_id.clone(), child));
        }
        debug!(gate = %node.node_id, row = %token.row_id, fork_group = %fork_group_id, branches = ?branches, "Forked token");
        self.emitter.emit(AuditEvent::TokenForked {
            gate: node.node_id.clone(),
            parent_token_id: token.token_id,
            fork_group_id,
            branches,
            child_token_ids: children,
        });
    }

    fn coalesce_outcome(&self, outcome: CoalesceOutcome, run: &mut RunState, queue: &mut WorkQueue) {
        let node_id = outcome.metadata().coalesce_name.clone();
        match outcome {
            CoalesceOutcome::Merged { token, .. } => self.forward(&node_id, token, queue),
            failed => run.failures.push(RowFailure::Coalesce {
                node_id,
                outcome: failed,
            }),
        }
    }

    /// Run the node's batch plugin and forward the single output token.
    async fn batch(&self, flush: BatchFlush, queue: &mut WorkQueue) -> Result<()> {
        let Some(first) = flush.tokens.first() else {
            return Ok(());
        };
        let node = self.graph.get_node_info(&flush.node_id)?;
        let plugin = self.registry.batch_transform(&node.plugin_name).ok_or_else(|| {
            TributaryError::ValidationError(format!("unregistered batch plugin '{}'", node.plugin_name))
        })?;
        let rows: Vec<RowData> = flush.tokens.iter().map(|t| t.row_data.clone()).collect();
        let data = plugin.process_batch(&rows, node).await?;
        let token = Token::expanded(first.row_id.clone(), data, flush.batch_id.clone());
        self.forward(&flush.node_id, token, queue);
        Ok(())
    }

    async fn poll_timeouts(&self, run: &mut RunState, queue: &mut WorkQueue) -> Result<()> {
        for outcome in run.coalesce.check_timeouts_now() {
            self.coalesce_outcome(outcome, run, queue);
        }
        for flush in run.aggregation.check_timeouts() {
            self.batch(flush, queue).await?;
        }
        Ok(())
    }

    /// Resolve everything still buffered. A flushed batch may feed a
    /// coalesce point downstream (and vice versa), so repeat until both
    /// executors are empty.
    async fn flush_end_of_source(&self, run: &mut RunState) -> Result<()> {
        let mut position = Position {
            node_id: self.source_id.clone(),
            token_id: String::new(),
        };
        loop {
            let outcomes = run.coalesce.flush_pending();
            let flushes = run.aggregation.flush_all();
            if outcomes.is_empty() && flushes.is_empty() {
                return Ok(());
            }
            let mut queue = WorkQueue::new();
            for outcome in outcomes {
                self.coalesce_outcome(outcome, run, &mut queue);
            }
            for flush in flushes {
                self.batch(flush, &mut queue).await?;
            }
            self.drain(run, &mut queue, &mut position).await?;
        }
    }

    async fn maybe_checkpoint(&self, run: &mut RunState, sequence: u64, position: &Position) -> Result<()> {
        let node_type = self.graph.get_node_info(&position.node_id)?.node_type;
        if !self.settings.checkpoint.should_checkpoint(sequence, node_type) {
            return Ok(());
        }
        // Output covered by this checkpoint must be on disk before it is.
        self.persist_outputs(run).await?;
        let checkpoint = self.checkpoints.create_checkpoint(
            CheckpointPosition {
                run_id: run.run_id.clone(),
                token_id: position.token_id.clone(),
                node_id: position.node_id.clone(),
                sequence_number: sequence,
            },
            &self.graph,
            Some(run.aggregation.get_checkpoint_state()?),
            Some(run.coalesce.get_checkpoint_state()?),
        )?;
        if let Some(dir) = &self.checkpoint_dir {
            save_checkpoint(&checkpoint, dir).await?;
        }
        run.last_checkpoint = Some(checkpoint);
        Ok(())
    }
}

impl Orchestrator {
    /// Append everything produced since the last call to the output files.
    async fn persist_outputs(&self, run: &mut RunState) -> Result<()> {
        let Some(output) = &self.output else {
            return Ok(());
        };
        for (sink, tokens) in &run.sink_outputs {
            let done = run.persisted.sinks.entry(sink.clone()).or_default();
            let rows: Vec<serde_json::Value> =
                tokens[*done..].iter().map(|t| t.row_data.to_value()).collect();
            output.append(&output.sink_path(sink), &rows).await?;
            *done = tokens.len();
        }
        output
            .append(&output.failures_path(), &run.failures[run.persisted.failures..])
            .await?;
        run.persisted.failures = run.failures.len();
        output
            .append(&output.anomalies_path(), &run.anomalies[run.persisted.anomalies..])
            .await?;
        run.persisted.anomalies = run.anomalies.len();
        Ok(())
    }
}

impl RunState {
    fn new(run_id: String, coalesce: CoalesceExecutor, aggregation: AggregationExecutor) -> Self {
        Self {
            run_id,
            coalesce,
            aggregation,
            sink_outputs: BTreeMap::new(),
            failures: Vec::new(),
            anomalies: Vec::new(),
            rows_processed: 0,
            last_checkpoint: None,
            persisted: Persisted::default(),
        }
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("pipeline", &self.settings.name)
            .field("nodes", &self.graph.node_count())
            .field("checkpoint_dir", &self.checkpoint_dir)
            .field("output", &self.output)
            .finish()
    }
}
