//! Pipeline validation: lint rules and diagnostics.
//!
//! Rules check the structure of the execution graph and the consistency of
//! the coalesce and aggregation settings against it. Call [`validate`] for
//! advisory diagnostics or [`validate_or_raise`] to fail on any
//! `Error`-severity issue.

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};

use tributary_types::{Result, TributaryError};

use crate::graph::{ExecutionGraph, NodeType, RoutingMode};
use crate::settings::{MergeStrategy, PipelineSettings};
use crate::topology::branch_entry_edges;

/// Branch names must be usable as field names in a nested merge.
pub const BRANCH_NAME_PATTERN: &str = r"^[A-Za-z_][A-Za-z0-9_]*$";

// ---------------------------------------------------------------------------
// Diagnostic types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct Diagnostic {
    pub rule: String,
    pub severity: Severity,
    pub message: String,
    pub node_id: Option<String>,
    pub edge: Option<(String, String)>,
    pub fix: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
    Info,
}

impl Diagnostic {
    fn new(rule: &str, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            rule: rule.to_string(),
            severity,
            message: message.into(),
            node_id: None,
            edge: None,
            fix: None,
        }
    }

    fn at_node(mut self, node_id: &str) -> Self {
        self.node_id = Some(node_id.to_string());
        self
    }

    fn at_edge(mut self, from: &str, to: &str) -> Self {
        self.edge = Some((from.to_string(), to.to_string()));
        self
    }

    fn with_fix(mut self, fix: impl Into<String>) -> Self {
        self.fix = Some(fix.into());
        self
    }
}

/// The message of a settings error without the `ValidationError` prefix.
fn error_message(e: &TributaryError) -> String {
    match e {
        TributaryError::ValidationError(msg) => msg.clone(),
        other => other.to_string(),
    }
}

// ---------------------------------------------------------------------------
// LintRule trait
// ---------------------------------------------------------------------------

/// What a rule sees: the raw settings and the graph built from them.
pub struct LintContext<'a> {
    pub settings: &'a PipelineSettings,
    pub graph: &'a ExecutionGraph,
}

pub trait LintRule: Send + Sync {
    fn name(&self) -> &str;
    fn apply(&self, ctx: &LintContext<'_>) -> Vec<Diagnostic>;
}

// ---------------------------------------------------------------------------
// Structural rules
// ---------------------------------------------------------------------------

struct SingleSourceRule;
impl LintRule for SingleSourceRule {
    fn name(&self) -> &str { "single_source" }
    fn apply(&self, ctx: &LintContext<'_>) -> Vec<Diagnostic> {
        let sources = ctx.graph.source_nodes();
        match sources.len() {
            1 => vec![],
            0 => vec![Diagnostic::new(self.name(), Severity::Error, "Pipeline has no source node")
                .with_fix("Add a node with node_type \"source\"")],
            n => vec![Diagnostic::new(
                self.name(),
                Severity::Error,
                format!(
                    "Pipeline has {n} source nodes: {}; expected exactly one",
                    sources.iter().map(|s| s.node_id.as_str()).collect::<Vec<_>>().join(", ")
                ),
            )],
        }
    }
}

struct SinkPresentRule;
impl LintRule for SinkPresentRule {
    fn name(&self) -> &str { "sink_present" }
    fn apply(&self, ctx: &LintContext<'_>) -> Vec<Diagnostic> {
        if ctx.graph.sink_nodes().is_empty() {
            vec![Diagnostic::new(self.name(), Severity::Error, "Pipeline has no sink node")
                .with_fix("Add a node with node_type \"sink\"")]
        } else {
            vec![]
        }
    }
}

struct SourceNoIncomingRule;
impl LintRule for SourceNoIncomingRule {
    fn name(&self) -> &str { "source_no_incoming" }
    fn apply(&self, ctx: &LintContext<'_>) -> Vec<Diagnostic> {
        ctx.graph
            .source_nodes()
            .into_iter()
            .flat_map(|s| ctx.graph.incoming_edges(&s.node_id))
            .map(|e| {
                Diagnostic::new(
                    self.name(),
                    Severity::Error,
                    format!("Source '{}' has an incoming edge from '{}'", e.to_node_id, e.from_node_id),
                )
                .at_edge(&e.from_node_id, &e.to_node_id)
            })
            .collect()
    }
}

struct SinkNoOutgoingRule;
impl LintRule for SinkNoOutgoingRule {
    fn name(&self) -> &str { "sink_no_outgoing" }
    fn apply(&self, ctx: &LintContext<'_>) -> Vec<Diagnostic> {
        ctx.graph
            .sink_nodes()
            .into_iter()
            .flat_map(|s| ctx.graph.outgoing_edges(&s.node_id))
            .map(|e| {
                Diagnostic::new(
                    self.name(),
                    Severity::Error,
                    format!("Sink '{}' has an outgoing edge to '{}'", e.from_node_id, e.to_node_id),
                )
                .at_edge(&e.from_node_id, &e.to_node_id)
            })
            .collect()
    }
}

/// Every non-sink node routes somewhere; only gates may route to several places.
struct SuccessorRule;
impl LintRule for SuccessorRule {
    fn name(&self) -> &str { "successors" }
    fn apply(&self, ctx: &LintContext<'_>) -> Vec<Diagnostic> {
        let mut out = Vec::new();
        for node in ctx.graph.nodes() {
            if node.node_type == NodeType::Sink {
                continue;
            }
            let outgoing = ctx.graph.outgoing_edges(&node.node_id);
            if outgoing.is_empty() {
                out.push(
                    Diagnostic::new(
                        self.name(),
                        Severity::Error,
                        format!("Node '{}' has no outgoing edge; rows would be dropped", node.node_id),
                    )
                    .at_node(&node.node_id)
                    .with_fix("Route it to a downstream node or a sink"),
                );
            } else if outgoing.len() > 1 && node.node_type != NodeType::Gate {
                out.push(
                    Diagnostic::new(
                        self.name(),
                        Severity::Error,
                        format!(
                            "{} node '{}' has {} outgoing edges; only gates may fork",
                            node.node_type, node.node_id, outgoing.len()
                        ),
                    )
                    .at_node(&node.node_id)
                    .with_fix("Insert a gate and use labelled COPY edges"),
                );
            }
        }
        out
    }
}

/// COPY edges are gate fork edges: labelled, unique per gate, never mixed with MOVE.
struct CopyEdgeRule;
impl LintRule for CopyEdgeRule {
    fn name(&self) -> &str { "copy_edges" }
    fn apply(&self, ctx: &LintContext<'_>) -> Vec<Diagnostic> {
        let mut out = Vec::new();
        for node in ctx.graph.nodes() {
            let outgoing = ctx.graph.outgoing_edges(&node.node_id);
            let copies: Vec<_> = outgoing.iter().filter(|e| e.mode == RoutingMode::Copy).collect();
            if copies.is_empty() {
                if node.node_type == NodeType::Gate && outgoing.len() > 1 {
                    out.push(
                        Diagnostic::new(
                            self.name(),
                            Severity::Error,
                            format!("Gate '{}' has several MOVE edges; a fork needs COPY edges", node.node_id),
                        )
                        .at_node(&node.node_id),
                    );
                }
                continue;
            }
            if node.node_type != NodeType::Gate {
                for e in &copies {
                    out.push(
                        Diagnostic::new(
                            self.name(),
                            Severity::Error,
                            format!("COPY edge {} -> {} leaves a non-gate node", e.from_node_id, e.to_node_id),
                        )
                        .at_edge(&e.from_node_id, &e.to_node_id),
                    );
                }
                continue;
            }
            if copies.len() != outgoing.len() {
                out.push(
                    Diagnostic::new(
                        self.name(),
                        Severity::Error,
                        format!("Gate '{}' mixes COPY and MOVE edges", node.node_id),
                    )
                    .at_node(&node.node_id)
                    .with_fix("Make every edge of a forking gate a labelled COPY edge"),
                );
            }
            let mut seen = HashSet::new();
            for e in &copies {
                match e.label.as_deref() {
                    None => out.push(
                        Diagnostic::new(
                            self.name(),
                            Severity::Error,
                            format!("COPY edge {} -> {} has no branch label", e.from_node_id, e.to_node_id),
                        )
                        .at_edge(&e.from_node_id, &e.to_node_id),
                    ),
                    Some(label) if !seen.insert(label) => out.push(
                        Diagnostic::new(
                            self.name(),
                            Severity::Error,
                            format!("Gate '{}' opens branch '{label}' more than once", node.node_id),
                        )
                        .at_edge(&e.from_node_id, &e.to_node_id),
                    ),
                    Some(_) => {}
                }
            }
        }
        out
    }
}

struct ReachabilityRule;
impl LintRule for ReachabilityRule {
    fn name(&self) -> &str { "reachability" }
    fn apply(&self, ctx: &LintContext<'_>) -> Vec<Diagnostic> {
        let sources = ctx.graph.source_nodes();
        let Some(source) = sources.first() else {
            return vec![]; // SingleSourceRule reports this
        };

        let mut visited = HashSet::new();
        let mut queue = VecDeque::new();
        visited.insert(source.node_id.clone());
        queue.push_back(source.node_id.clone());
        while let Some(current) = queue.pop_front() {
            for edge in ctx.graph.outgoing_edges(&current) {
                if visited.insert(edge.to_node_id.clone()) {
                    queue.push_back(edge.to_node_id.clone());
                }
            }
        }

        ctx.graph
            .nodes()
            .filter(|n| n.node_type != NodeType::Source && !visited.contains(&n.node_id))
            .map(|n| {
                Diagnostic::new(
                    self.name(),
                    Severity::Error,
                    format!("Node '{}' is not reachable from the source", n.node_id),
                )
                .at_node(&n.node_id)
                .with_fix(format!("Add an edge leading to '{}' or remove it", n.node_id))
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Coalesce rules
// ---------------------------------------------------------------------------

struct CoalesceSettingsRule;
impl LintRule for CoalesceSettingsRule {
    fn name(&self) -> &str { "coalesce_settings" }
    fn apply(&self, ctx: &LintContext<'_>) -> Vec<Diagnostic> {
        let mut out = Vec::new();
        for node in ctx.graph.nodes_of_type(NodeType::Coalesce) {
            if ctx.settings.coalesce_settings(&node.node_id).is_none() {
                out.push(
                    Diagnostic::new(
                        self.name(),
                        Severity::Error,
                        format!("Coalesce node '{}' has no coalesce settings", node.node_id),
                    )
                    .at_node(&node.node_id)
                    .with_fix(format!("Add a coalesce entry named '{}'", node.node_id)),
                );
            }
        }
        let mut names = HashSet::new();
        for c in &ctx.settings.coalesce {
            if !names.insert(c.name.as_str()) {
                out.push(Diagnostic::new(
                    self.name(),
                    Severity::Error,
                    format!("Coalesce settings '{}' are declared more than once", c.name),
                ));
            }
            match ctx.graph.get_node_info(&c.name) {
                Ok(info) if info.node_type == NodeType::Coalesce => {}
                _ => out.push(Diagnostic::new(
                    self.name(),
                    Severity::Error,
                    format!("Coalesce settings '{}' do not name a coalesce node", c.name),
                )),
            }
            if let Err(e) = c.validate() {
                out.push(Diagnostic::new(self.name(), Severity::Error, error_message(&e)).at_node(&c.name));
            }
        }
        out
    }
}

struct BranchNameRule;
impl LintRule for BranchNameRule {
    fn name(&self) -> &str { "branch_name_format" }
    fn apply(&self, ctx: &LintContext<'_>) -> Vec<Diagnostic> {
        let pattern = match regex::Regex::new(BRANCH_NAME_PATTERN) {
            Ok(p) => p,
            Err(e) => return vec![Diagnostic::new(self.name(), Severity::Error, e.to_string())],
        };
        let mut out = Vec::new();
        for e in ctx.graph.edges().iter().filter(|e| e.mode == RoutingMode::Copy) {
            if let Some(label) = e.label.as_deref().filter(|l| !pattern.is_match(l)) {
                out.push(
                    Diagnostic::new(
                        self.name(),
                        Severity::Error,
                        format!("Branch label '{label}' must match {BRANCH_NAME_PATTERN}"),
                    )
                    .at_edge(&e.from_node_id, &e.to_node_id),
                );
            }
        }
        for c in &ctx.settings.coalesce {
            for branch in c.branches.iter().filter(|b| !pattern.is_match(b)) {
                out.push(
                    Diagnostic::new(
                        self.name(),
                        Severity::Error,
                        format!("Coalesce '{}' branch '{branch}' must match {BRANCH_NAME_PATTERN}", c.name),
                    )
                    .at_node(&c.name),
                );
            }
        }
        out
    }
}

/// The branches configured on a coalesce point are exactly the branches routed to it.
struct CoalesceBranchRoutingRule;
impl LintRule for CoalesceBranchRoutingRule {
    fn name(&self) -> &str { "coalesce_branch_routing" }
    fn apply(&self, ctx: &LintContext<'_>) -> Vec<Diagnostic> {
        let mut out = Vec::new();
        for c in &ctx.settings.coalesce {
            let Ok(entries) = branch_entry_edges(ctx.graph, &c.name) else {
                continue; // CoalesceSettingsRule reports unknown nodes
            };
            let routed: BTreeMap<&str, &str> =
                entries.iter().map(|e| (e.branch.as_str(), e.gate.as_str())).collect();
            let configured: BTreeSet<&str> = c.branches.iter().map(String::as_str).collect();

            for branch in configured.iter().filter(|b| !routed.contains_key(*b)) {
                out.push(
                    Diagnostic::new(
                        self.name(),
                        Severity::Error,
                        format!(
                            "Coalesce '{}' expects branch '{branch}' but no gate routes a COPY edge labelled '{branch}' to it",
                            c.name
                        ),
                    )
                    .at_node(&c.name)
                    .with_fix(format!("Add a COPY edge labelled '{branch}' from an upstream gate")),
                );
            }
            for (branch, gate) in routed.iter().filter(|(b, _)| !configured.contains(*b)) {
                out.push(
                    Diagnostic::new(
                        self.name(),
                        Severity::Error,
                        format!(
                            "Gate '{gate}' routes branch '{branch}' to coalesce '{}' which does not list it",
                            c.name
                        ),
                    )
                    .at_node(&c.name)
                    .with_fix(format!("Add '{branch}' to the branches of coalesce '{}'", c.name)),
                );
            }
        }
        out
    }
}

struct UnionCollisionRule;
impl LintRule for UnionCollisionRule {
    fn name(&self) -> &str { "union_field_collision" }
    fn apply(&self, ctx: &LintContext<'_>) -> Vec<Diagnostic> {
        ctx.settings
            .coalesce
            .iter()
            .filter(|c| c.merge == MergeStrategy::Union)
            .flat_map(|c| {
                c.union_field_collisions().into_iter().map(move |(field, branches)| {
                    let winner = branches.last().cloned().unwrap_or_default();
                    Diagnostic::new(
                        self.name(),
                        Severity::Warning,
                        format!(
                            "Coalesce '{}' union merge: field '{field}' is produced by branches {}; '{winner}' wins on conflict",
                            c.name,
                            branches.join(", ")
                        ),
                    )
                    .at_node(&c.name)
                    .with_fix("Use a nested merge or rename the field on one branch")
                })
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Aggregation rules
// ---------------------------------------------------------------------------

struct AggregationSettingsRule;
impl LintRule for AggregationSettingsRule {
    fn name(&self) -> &str { "aggregation_settings" }
    fn apply(&self, ctx: &LintContext<'_>) -> Vec<Diagnostic> {
        let mut out = Vec::new();
        for node in ctx.graph.nodes_of_type(NodeType::Aggregation) {
            if ctx.settings.aggregation_settings(&node.node_id).is_none() {
                out.push(
                    Diagnostic::new(
                        self.name(),
                        Severity::Error,
                        format!("Aggregation node '{}' has no aggregation settings", node.node_id),
                    )
                    .at_node(&node.node_id),
                );
            }
        }
        for a in &ctx.settings.aggregations {
            match ctx.graph.get_node_info(&a.name) {
                Ok(info) if info.node_type == NodeType::Aggregation => {}
                _ => out.push(Diagnostic::new(
                    self.name(),
                    Severity::Error,
                    format!("Aggregation settings '{}' do not name an aggregation node", a.name),
                )),
            }
            if let Err(e) = a.trigger.compile() {
                out.push(Diagnostic::new(self.name(), Severity::Error, error_message(&e)).at_node(&a.name));
            }
            let t = &a.trigger;
            if t.count.is_none() && t.timeout_seconds.is_none() && t.condition.is_none() {
                out.push(
                    Diagnostic::new(
                        self.name(),
                        Severity::Warning,
                        format!("Aggregation '{}' has no trigger; it only flushes at end of source", a.name),
                    )
                    .at_node(&a.name),
                );
            }
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Run all built-in lint rules and return collected diagnostics.
///
/// A definition that cannot even be built into a graph yields a single
/// `graph_structure` error.
pub fn validate(settings: &PipelineSettings) -> Vec<Diagnostic> {
    let graph = match settings.build_graph() {
        Ok(g) => g,
        Err(e) => {
            return vec![Diagnostic::new("graph_structure", Severity::Error, error_message(&e))];
        }
    };
    let ctx = LintContext {
        settings,
        graph: &graph,
    };

    let rules: Vec<Box<dyn LintRule>> = vec![
        Box::new(SingleSourceRule),
        Box::new(SinkPresentRule),
        Box::new(SourceNoIncomingRule),
        Box::new(SinkNoOutgoingRule),
        Box::new(SuccessorRule),
        Box::new(CopyEdgeRule),
        Box::new(ReachabilityRule),
        Box::new(CoalesceSettingsRule),
        Box::new(BranchNameRule),
        Box::new(CoalesceBranchRoutingRule),
        Box::new(UnionCollisionRule),
        Box::new(AggregationSettingsRule),
    ];

    let mut diagnostics = Vec::new();
    for rule in &rules {
        diagnostics.extend(rule.apply(&ctx));
    }
    diagnostics
}

/// Run all lint rules; return `Err` if any `Error`-severity diagnostic found.
pub fn validate_or_raise(settings: &PipelineSettings) -> Result<Vec<Diagnostic>> {
    let diagnostics = validate(settings);
    let errors: Vec<_> = diagnostics
        .iter()
        .filter(|d| d.severity == Severity::Error)
        .collect();
    if !errors.is_empty() {
        let messages: Vec<_> = errors.iter().map(|d| d.message.clone()).collect();
        return Err(TributaryError::ValidationError(messages.join("; ")));
    }
    for d in diagnostics.iter().filter(|d| d.severity == Severity::Warning) {
        tracing::warn!(rule = %d.rule, "{}", d.message);
    }
    Ok(diagnostics)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::tests::fork_join_settings;
    use crate::settings::{CoalescePolicy, CoalesceSettings, EdgeSettings};

    fn require_all() -> CoalesceSettings {
        CoalesceSettings::new("merge", &["a", "b"], CoalescePolicy::RequireAll, MergeStrategy::Union)
    }

    fn errors(diags: &[Diagnostic]) -> Vec<&Diagnostic> {
        diags.iter().filter(|d| d.severity == Severity::Error).collect()
    }

    fn rules_hit(diags: &[Diagnostic]) -> Vec<&str> {
        diags.iter().map(|d| d.rule.as_str()).collect()
    }

    #[test]
    fn valid_pipeline_passes() {
        let diags = validate(&fork_join_settings(require_all()));
        assert!(errors(&diags).is_empty(), "Expected no errors, got: {diags:?}");
        assert!(validate_or_raise(&fork_join_settings(require_all())).is_ok());
    }

    #[test]
    fn cycle_is_reported_as_graph_structure() {
        let mut s = fork_join_settings(require_all());
        s.edges.push(EdgeSettings {
            from: "merge".into(),
            to: "fork".into(),
            label: None,
            mode: RoutingMode::Move,
        });
        let diags = validate(&s);
        assert_eq!(rules_hit(&diags), vec!["graph_structure"]);
        assert!(diags[0].message.contains("cycle"));
    }

    #[test]
    fn configured_branch_without_route_is_error() {
        let s = fork_join_settings(CoalesceSettings::new(
            "merge",
            &["a", "b", "c"],
            CoalescePolicy::RequireAll,
            MergeStrategy::Union,
        ));
        let diags = validate(&s);
        let routing: Vec<_> = diags
            .iter()
            .filter(|d| d.rule == "coalesce_branch_routing")
            .collect();
        assert_eq!(routing.len(), 1);
        assert!(routing[0].message.contains("branch 'c'"));
    }

    #[test]
    fn routed_branch_not_configured_is_error() {
        let mut s = fork_join_settings(require_all());
        s.edges.retain(|e| e.label.as_deref() != Some("b"));
        s.edges.push(EdgeSettings {
            from: "fork".into(),
            to: "merge".into(),
            label: Some("z".into()),
            mode: RoutingMode::Copy,
        });
        let diags = validate(&s);
        let msgs: Vec<_> = diags
            .iter()
            .filter(|d| d.rule == "coalesce_branch_routing")
            .map(|d| d.message.clone())
            .collect();
        assert_eq!(msgs.len(), 2, "{msgs:?}");
        assert!(msgs.iter().any(|m| m.contains("expects branch 'b'")));
        assert!(msgs.iter().any(|m| m.contains("routes branch 'z'")));
    }

    #[test]
    fn missing_coalesce_settings_is_error() {
        let mut s = fork_join_settings(require_all());
        s.coalesce.clear();
        let diags = validate(&s);
        assert!(diags
            .iter()
            .any(|d| d.rule == "coalesce_settings" && d.node_id.as_deref() == Some("merge")));
        assert!(validate_or_raise(&s).is_err());
    }

    #[test]
    fn invalid_coalesce_settings_surface_as_diagnostics() {
        let s = fork_join_settings(CoalesceSettings::new(
            "merge",
            &["a", "b"],
            CoalescePolicy::Quorum,
            MergeStrategy::Union,
        ));
        let err = validate_or_raise(&s).unwrap_err();
        assert!(err.to_string().contains("quorum"));
    }

    #[test]
    fn union_collision_is_a_warning() {
        let s = fork_join_settings(
            require_all()
                .with_branch_fields("a", &["id", "score"])
                .with_branch_fields("b", &["id", "label"]),
        );
        let diags = validate(&s);
        let warn: Vec<_> = diags
            .iter()
            .filter(|d| d.rule == "union_field_collision")
            .collect();
        assert_eq!(warn.len(), 1);
        assert_eq!(warn[0].severity, Severity::Warning);
        assert!(warn[0].message.contains("'id'"));
        assert!(warn[0].message.contains("'b' wins"));
        assert!(validate_or_raise(&s).is_ok());
    }

    #[test]
    fn bad_branch_label_is_error() {
        let mut s = fork_join_settings(require_all());
        for e in s.edges.iter_mut().filter(|e| e.label.as_deref() == Some("a")) {
            e.label = Some("a-1".into());
        }
        let diags = validate(&s);
        assert!(rules_hit(&diags).contains(&"branch_name_format"));
    }

    #[test]
    fn non_gate_fan_out_is_error() {
        let mut s = fork_join_settings(require_all());
        s.edges.push(EdgeSettings {
            from: "enrich".into(),
            to: "out".into(),
            label: None,
            mode: RoutingMode::Move,
        });
        let diags = validate(&s);
        assert!(diags
            .iter()
            .any(|d| d.rule == "successors" && d.node_id.as_deref() == Some("enrich")));
    }

    #[test]
    fn copy_edge_rules() {
        let mut s = fork_join_settings(require_all());
        for e in s.edges.iter_mut().filter(|e| e.label.as_deref() == Some("a")) {
            e.label = None;
        }
        let diags = validate(&s);
        assert!(diags
            .iter()
            .any(|d| d.rule == "copy_edges" && d.message.contains("no branch label")));

        let mut mixed = fork_join_settings(require_all());
        for e in mixed.edges.iter_mut().filter(|e| e.label.as_deref() == Some("a")) {
            e.mode = RoutingMode::Move;
        }
        assert!(validate(&mixed)
            .iter()
            .any(|d| d.rule == "copy_edges" && d.message.contains("mixes")));
    }

    #[test]
    fn missing_source_and_sink() {
        let mut s = fork_join_settings(require_all());
        s.nodes.retain(|n| n.id != "out");
        s.edges.retain(|e| e.to != "out");
        let diags = validate(&s);
        assert!(rules_hit(&diags).contains(&"sink_present"));
        assert!(diags
            .iter()
            .any(|d| d.rule == "successors" && d.node_id.as_deref() == Some("merge")));
    }

    #[test]
    fn aggregation_rules() {
        let json = serde_json::json!({
            "name": "batching",
            "nodes": [
                {"id": "src", "node_type": "source"},
                {"id": "batch", "node_type": "aggregation", "plugin": "collect"},
                {"id": "out", "node_type": "sink"}
            ],
            "edges": [{"from": "src", "to": "batch"}, {"from": "batch", "to": "out"}],
            "aggregations": [
                {"name": "batch", "trigger": {"condition": "batch_count >"}}
            ]
        });
        let s = PipelineSettings::from_json_str(&json.to_string()).unwrap();
        let diags = validate(&s);
        let agg: Vec<_> = diags.iter().filter(|d| d.rule == "aggregation_settings").collect();
        assert_eq!(agg.len(), 1);
        assert_eq!(agg[0].severity, Severity::Error);

        let mut ok = s.clone();
        ok.aggregations[0].trigger = crate::trigger::TriggerSettings::default();
        let diags = validate(&ok);
        assert!(errors(&diags).is_empty(), "{diags:?}");
        assert!(diags
            .iter()
            .any(|d| d.rule == "aggregation_settings" && d.severity == Severity::Warning));
    }

    #[test]
    fn unreachable_node_is_error() {
        let mut s = fork_join_settings(require_all());
        s.nodes.push(crate::settings::NodeSettings {
            id: "orphan".into(),
            node_type: NodeType::Sink,
            plugin: None,
            config: serde_json::Value::Null,
        });
        let diags = validate(&s);
        assert!(diags
            .iter()
            .any(|d| d.rule == "reachability" && d.node_id.as_deref() == Some("orphan")));
    }
}
