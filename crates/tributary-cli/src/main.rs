//! CLI binary for validating, running, and resuming Tributary pipelines.

use std::path::{Path, PathBuf};

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use tracing::{debug, warn};

use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use tributary_engine::{
    default_registry, load_checkpoint, validate, EventEmitter, NodeType, Orchestrator,
    PipelineSettings, RowFailure, RunResult, Severity, SystemClock,
};
use tributary_types::RowData;

const EVENTS_PER_ROW: usize = 16;
const MIN_EVENT_CAPACITY: usize = 1024;
const MAX_EVENT_CAPACITY: usize = 1 << 16;

#[derive(Parser)]
#[command(name = "tributary", version, about = "Row pipeline runner with fork/coalesce and checkpoint resume")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a pipeline over a JSON Lines input file
    Run {
        /// Path to the pipeline .json file
        pipeline: PathBuf,

        /// Source rows, one JSON object per line
        #[arg(short, long)]
        input: PathBuf,

        /// Directory for <sink>.jsonl, failures.jsonl, and anomalies.jsonl (appended on --resume)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Directory holding checkpoint.json
        #[arg(long)]
        checkpoint_dir: Option<PathBuf>,

        /// Resume from the checkpoint in --checkpoint-dir
        #[arg(long, requires = "checkpoint_dir")]
        resume: bool,
    },

    /// Validate a pipeline .json file
    Validate {
        /// Path to the pipeline .json file
        pipeline: PathBuf,
    },

    /// Show information about a pipeline
    Info {
        /// Path to the pipeline .json file
        pipeline: PathBuf,
    },

    /// Check whether a stored checkpoint can resume against a pipeline
    CheckResume {
        /// Path to the pipeline .json file
        pipeline: PathBuf,

        /// Directory holding checkpoint.json
        #[arg(long)]
        checkpoint_dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Run {
            pipeline,
            input,
            output,
            checkpoint_dir,
            resume,
        } => {
            cmd_run(&pipeline, &input, output.as_deref(), checkpoint_dir.as_deref(), resume).await?;
        }
        Commands::Validate { pipeline } => {
            cmd_validate(&pipeline)?;
        }
        Commands::Info { pipeline } => {
            cmd_info(&pipeline)?;
        }
        Commands::CheckResume {
            pipeline,
            checkpoint_dir,
        } => {
            cmd_check_resume(&pipeline, &checkpoint_dir).await?;
        }
    }

    Ok(())
}

fn load_pipeline(path: &Path) -> anyhow::Result<PipelineSettings> {
    PipelineSettings::load(path).with_context(|| format!("loading pipeline {}", path.display()))
}

/// Build the orchestrator and a task logging its audit events.
///
/// The task ends once the orchestrator (and with it the emitter) is dropped;
/// await the handle to flush the trailing events.
fn build_orchestrator(
    settings: PipelineSettings,
    event_capacity: usize,
) -> anyhow::Result<(Orchestrator, JoinHandle<()>)> {
    let emitter = EventEmitter::new(event_capacity);
    let mut events = emitter.subscribe();
    let audit = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(json) => debug!(target: "tributary::audit", "{json}"),
                    Err(e) => warn!("Unserializable audit event: {e}"),
                },
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Audit log lagged behind the run");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });
    let orchestrator = Orchestrator::new(settings, default_registry(), SystemClock::shared(), emitter)?;
    Ok((orchestrator, audit))
}

/// Room for the events of a run: a handful per row, within sane bounds.
fn event_capacity(rows: usize) -> usize {
    rows.saturating_mul(EVENTS_PER_ROW).clamp(MIN_EVENT_CAPACITY, MAX_EVENT_CAPACITY)
}

fn read_rows(path: &Path) -> anyhow::Result<Vec<RowData>> {
    let source = std::fs::read_to_string(path)
        .with_context(|| format!("reading input {}", path.display()))?;
    source
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| {
            let value: serde_json::Value = serde_json::from_str(line)
                .with_context(|| format!("{}:{}: invalid JSON", path.display(), i + 1))?;
            RowData::from_value(value)
                .with_context(|| format!("{}:{}: invalid row", path.display(), i + 1))
        })
        .collect()
}

fn cmd_validate(path: &Path) -> anyhow::Result<()> {
    let settings = load_pipeline(path)?;
    let diagnostics = validate(&settings);

    if diagnostics.is_empty() {
        println!("Pipeline is valid");
        return Ok(());
    }

    let mut has_error = false;
    for diag in &diagnostics {
        let severity = match diag.severity {
            Severity::Error => {
                has_error = true;
                "ERROR"
            }
            Severity::Warning => "WARN",
            Severity::Info => "INFO",
        };
        println!("[{}] {}: {}", severity, diag.rule, diag.message);
        if let Some(fix) = &diag.fix {
            println!("        fix: {fix}");
        }
    }

    if has_error {
        std::process::exit(1);
    }
    Ok(())
}

fn cmd_info(path: &Path) -> anyhow::Result<()> {
    let settings = load_pipeline(path)?;
    let graph = settings.build_graph()?;

    println!("Pipeline: {}", settings.name);
    println!("Nodes: {}", graph.node_count());
    println!("Edges: {}", graph.edges().len());

    println!("\nNodes:");
    for node_id in graph.topological_order() {
        let node = graph.get_node_info(node_id)?;
        println!("  {} [{}] plugin={}", node.node_id, node.node_type, node.plugin_name);
    }

    println!("\nEdges:");
    for edge in graph.edges() {
        let label = edge.label.as_deref().unwrap_or("-");
        println!(
            "  {} -> {} label={} mode={:?}",
            edge.from_node_id, edge.to_node_id, label, edge.mode
        );
    }

    let coalesce_nodes: Vec<_> = graph.nodes_of_type(NodeType::Coalesce).collect();
    if !coalesce_nodes.is_empty() {
        println!("\nCoalesce points:");
        for node in coalesce_nodes {
            match settings.coalesce_settings(&node.node_id) {
                Some(c) => println!(
                    "  {} branches=[{}] policy={:?} merge={:?}",
                    c.name,
                    c.branches.join(", "),
                    c.policy,
                    c.merge
                ),
                None => println!("  {} (no settings)", node.node_id),
            }
        }
    }

    Ok(())
}

async fn cmd_run(
    path: &Path,
    input: &Path,
    output: Option<&Path>,
    checkpoint_dir: Option<&Path>,
    resume: bool,
) -> anyhow::Result<()> {
    let settings = load_pipeline(path)?;
    let rows = read_rows(input)?;
    println!("Running pipeline: {}", settings.name);
    println!("Input rows: {}", rows.len());

    let (mut orchestrator, audit) = build_orchestrator(settings, event_capacity(rows.len()))?;
    if let Some(dir) = checkpoint_dir {
        orchestrator = orchestrator.with_checkpoint_dir(dir);
    }
    if let Some(dir) = output {
        orchestrator = orchestrator.with_output_dir(dir);
    }

    let result = match checkpoint_dir {
        Some(dir) if resume => {
            let checkpoint = load_checkpoint(dir)
                .await?
                .with_context(|| format!("no checkpoint found in {}", dir.display()))?;
            println!(
                "Resuming run {} after row {} (checkpoint at '{}')",
                checkpoint.run_id, checkpoint.sequence_number, checkpoint.node_id
            );
            orchestrator.resume_from(&checkpoint, rows).await
        }
        _ => orchestrator.run(rows).await,
    };
    drop(orchestrator);
    audit.await?;
    let result = result?;

    print_summary(&result);
    if let Some(dir) = output {
        println!("Output written to {}", dir.display());
    }
    Ok(())
}

fn print_summary(result: &RunResult) {
    println!("\nRun {} completed", result.run_id);
    println!("Rows processed: {}", result.rows_processed);
    for (sink, tokens) in &result.sink_outputs {
        println!("Sink {}: {} rows", sink, tokens.len());
    }
    if !result.failures.is_empty() {
        println!("Failures: {}", result.failures.len());
        for failure in &result.failures {
            match failure {
                RowFailure::Coalesce { node_id, outcome } => {
                    let meta = outcome.metadata();
                    println!(
                        "  coalesce '{}': missing branches [{}]",
                        node_id,
                        meta.branches_missing.join(", ")
                    );
                }
                RowFailure::Rejected {
                    node_id,
                    token,
                    reason,
                } => println!("  rejected at '{}' ({}): {}", node_id, token.row_id, reason),
            }
        }
    }
    if !result.anomalies.is_empty() {
        println!("Arrival anomalies: {}", result.anomalies.len());
    }
}

async fn cmd_check_resume(path: &Path, checkpoint_dir: &Path) -> anyhow::Result<()> {
    let settings = load_pipeline(path)?;
    let (orchestrator, audit) = build_orchestrator(settings, MIN_EVENT_CAPACITY)?;
    let Some(checkpoint) = load_checkpoint(checkpoint_dir).await? else {
        anyhow::bail!("no checkpoint found in {}", checkpoint_dir.display());
    };

    let check = orchestrator.check_resume(&checkpoint);
    drop(orchestrator);
    audit.await?;
    if check.can_resume {
        println!(
            "Checkpoint {} can resume after row {}",
            checkpoint.checkpoint_id, checkpoint.sequence_number
        );
        return Ok(());
    }
    println!(
        "Checkpoint {} cannot resume: {}",
        checkpoint.checkpoint_id,
        check.reason.as_deref().unwrap_or("unknown reason")
    );
    std::process::exit(1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    #[test]
    fn event_capacity_scales_with_input() {
        assert_eq!(event_capacity(0), MIN_EVENT_CAPACITY);
        assert_eq!(event_capacity(1_000), 16_000);
        assert_eq!(event_capacity(usize::MAX), MAX_EVENT_CAPACITY);
    }

    #[tokio::test]
    async fn audit_task_drains_once_orchestrator_is_dropped() {
        let settings = PipelineSettings::from_json_str(
            &json!({
                "name": "passthrough",
                "nodes": [
                    {"id": "source", "node_type": "source"},
                    {"id": "out", "node_type": "sink"}
                ],
                "edges": [{"from": "source", "to": "out"}]
            })
            .to_string(),
        )
        .unwrap();
        let (orchestrator, audit) = build_orchestrator(settings, event_capacity(2)).unwrap();
        let rows = vec![
            RowData::from_value(json!({"id": 1})).unwrap(),
            RowData::from_value(json!({"id": 2})).unwrap(),
        ];
        let result = orchestrator.run(rows).await.unwrap();
        assert_eq!(result.sink("out").len(), 2);

        drop(orchestrator);
        tokio::time::timeout(Duration::from_secs(5), audit)
            .await
            .expect("audit task should end when the emitter is gone")
            .unwrap();
    }
}
