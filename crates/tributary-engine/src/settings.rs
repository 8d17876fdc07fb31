//! JSON pipeline definition and per-node settings.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use tributary_types::{Result, TributaryError};

use crate::canonical::finite_f64;
use crate::checkpoint::CheckpointSettings;
use crate::graph::{EdgeInfo, ExecutionGraph, NodeInfo, NodeType, RoutingMode};
use crate::trigger::TriggerSettings;

// ---------------------------------------------------------------------------
// Coalesce settings
// ---------------------------------------------------------------------------

/// When a pending coalesce group resolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoalescePolicy {
    RequireAll,
    First,
    Quorum,
    BestEffort,
}

/// How the row data of the arrived branches is combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    Union,
    Nested,
    Select,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoalesceSettings {
    /// Id of the coalesce node these settings apply to.
    pub name: String,
    /// Expected branch names, in declaration order.
    pub branches: Vec<String>,
    pub policy: CoalescePolicy,
    pub merge: MergeStrategy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quorum_count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub select_branch: Option<String>,
    /// Fields each branch is declared to produce; used to detect union collisions.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub branch_fields: BTreeMap<String, Vec<String>>,
}

impl CoalesceSettings {
    pub fn new(
        name: impl Into<String>,
        branches: &[&str],
        policy: CoalescePolicy,
        merge: MergeStrategy,
    ) -> Self {
        Self {
            name: name.into(),
            branches: branches.iter().map(|b| b.to_string()).collect(),
            policy,
            merge,
            timeout_seconds: None,
            quorum_count: None,
            select_branch: None,
            branch_fields: BTreeMap::new(),
        }
    }

    pub fn with_timeout(mut self, seconds: f64) -> Self {
        self.timeout_seconds = Some(seconds);
        self
    }

    pub fn with_quorum(mut self, count: usize) -> Self {
        self.quorum_count = Some(count);
        self
    }

    pub fn with_select_branch(mut self, branch: impl Into<String>) -> Self {
        self.select_branch = Some(branch.into());
        self
    }

    pub fn with_branch_fields(mut self, branch: impl Into<String>, fields: &[&str]) -> Self {
        self.branch_fields
            .insert(branch.into(), fields.iter().map(|f| f.to_string()).collect());
        self
    }

    pub fn has_branch(&self, branch: &str) -> bool {
        self.branches.iter().any(|b| b == branch)
    }

    /// Reject impossible policy/merge combinations.
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| {
            Err(TributaryError::ValidationError(format!(
                "coalesce '{}': {msg}",
                self.name
            )))
        };

        if self.name.trim().is_empty() {
            return Err(TributaryError::ValidationError(
                "coalesce settings must have a name".into(),
            ));
        }
        if self.branches.len() < 2 {
            return fail(format!(
                "needs at least 2 branches, got {}",
                self.branches.len()
            ));
        }
        let unique: BTreeSet<&str> = self.branches.iter().map(String::as_str).collect();
        if unique.len() != self.branches.len() {
            return fail("branch names must be unique".into());
        }

        match (self.policy, self.quorum_count) {
            (CoalescePolicy::Quorum, None) => {
                return fail("policy 'quorum' requires quorum_count".into())
            }
            (CoalescePolicy::Quorum, Some(q)) if q == 0 || q > self.branches.len() => {
                return fail(format!(
                    "quorum_count {q} must be between 1 and {}",
                    self.branches.len()
                ))
            }
            (CoalescePolicy::Quorum, Some(_)) => {}
            (_, Some(_)) => return fail("quorum_count is only valid with policy 'quorum'".into()),
            (_, None) => {}
        }

        match (self.merge, self.select_branch.as_deref()) {
            (MergeStrategy::Select, None) => {
                return fail("merge 'select' requires select_branch".into())
            }
            (MergeStrategy::Select, Some(b)) if !self.has_branch(b) => {
                return fail(format!("select_branch '{b}' is not one of the branches"))
            }
            (MergeStrategy::Select, Some(_)) => {}
            (_, Some(_)) => return fail("select_branch is only valid with merge 'select'".into()),
            (_, None) => {}
        }

        if self.policy == CoalescePolicy::BestEffort && self.timeout_seconds.is_none() {
            return fail("policy 'best_effort' requires timeout_seconds".into());
        }
        if let Some(t) = self.timeout_seconds {
            let t = finite_f64(&format!("coalesce '{}' timeout_seconds", self.name), t)?;
            if t <= 0.0 {
                return fail(format!("timeout_seconds must be positive, got {t}"));
            }
        }

        if let Some(unknown) = self.branch_fields.keys().find(|b| !self.has_branch(b)) {
            return fail(format!("branch_fields names unknown branch '{unknown}'"));
        }
        Ok(())
    }

    /// Fields declared by more than one branch of a union merge, with the
    /// declaring branches in declaration order.
    pub fn union_field_collisions(&self) -> Vec<(String, Vec<String>)> {
        if self.merge != MergeStrategy::Union {
            return Vec::new();
        }
        let mut writers: BTreeMap<&str, Vec<String>> = BTreeMap::new();
        for branch in &self.branches {
            let Some(fields) = self.branch_fields.get(branch) else {
                continue;
            };
            let distinct: BTreeSet<&str> = fields.iter().map(String::as_str).collect();
            for field in distinct {
                writers.entry(field).or_default().push(branch.clone());
            }
        }
        writers
            .into_iter()
            .filter(|(_, branches)| branches.len() > 1)
            .map(|(field, branches)| (field.to_string(), branches))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Aggregation settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregationSettings {
    /// Id of the aggregation node these settings apply to.
    pub name: String,
    pub trigger: TriggerSettings,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub plugin_config: serde_json::Value,
}

// ---------------------------------------------------------------------------
// Pipeline definition
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSettings {
    pub id: String,
    pub node_type: NodeType,
    /// Plugin implementing the node; defaults to the node type's name.
    #[serde(default)]
    pub plugin: Option<String>,
    #[serde(default)]
    pub config: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeSettings {
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub mode: RoutingMode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineSettings {
    pub name: String,
    pub nodes: Vec<NodeSettings>,
    #[serde(default)]
    pub edges: Vec<EdgeSettings>,
    #[serde(default)]
    pub coalesce: Vec<CoalesceSettings>,
    #[serde(default)]
    pub aggregations: Vec<AggregationSettings>,
    #[serde(default)]
    pub checkpoint: CheckpointSettings,
}

impl PipelineSettings {
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let settings = Self::from_json_str(&json)?;
        tracing::debug!(path = %path.display(), pipeline = %settings.name, "Loaded pipeline settings");
        Ok(settings)
    }

    pub fn coalesce_settings(&self, name: &str) -> Option<&CoalesceSettings> {
        self.coalesce.iter().find(|c| c.name == name)
    }

    pub fn aggregation_settings(&self, name: &str) -> Option<&AggregationSettings> {
        self.aggregations.iter().find(|a| a.name == name)
    }

    /// Freeze the definition into an [`ExecutionGraph`].
    ///
    /// A coalesce or aggregation node's effective config includes its
    /// settings block, so changing a policy or trigger changes that node's
    /// config hash.
    pub fn build_graph(&self) -> Result<ExecutionGraph> {
        let nodes = self
            .nodes
            .iter()
            .map(|n| {
                Ok(NodeInfo {
                    node_id: n.id.clone(),
                    node_type: n.node_type,
                    plugin_name: n
                        .plugin
                        .clone()
                        .unwrap_or_else(|| n.node_type.as_str().to_string()),
                    config: self.effective_config(n)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let edges = self
            .edges
            .iter()
            .map(|e| EdgeInfo {
                from_node_id: e.from.clone(),
                to_node_id: e.to.clone(),
                label: e.label.clone(),
                mode: e.mode,
            })
            .collect();
        ExecutionGraph::new(nodes, edges)
    }

    fn effective_config(&self, node: &NodeSettings) -> Result<serde_json::Value> {
        let block = match node.node_type {
            NodeType::Coalesce => match self.coalesce_settings(&node.id) {
                Some(c) => {
                    if let Some(t) = c.timeout_seconds {
                        finite_f64(&format!("coalesce '{}' timeout_seconds", c.name), t)?;
                    }
                    Some(("coalesce", serde_json::to_value(c)?))
                }
                None => None,
            },
            NodeType::Aggregation => match self.aggregation_settings(&node.id) {
                Some(a) => {
                    if let Some(t) = a.trigger.timeout_seconds {
                        finite_f64(&format!("aggregation '{}' timeout_seconds", a.name), t)?;
                    }
                    Some(("aggregation", serde_json::to_value(a)?))
                }
                None => None,
            },
            _ => None,
        };

        let Some((key, value)) = block else {
            return Ok(node.config.clone());
        };
        let mut merged = match &node.config {
            serde_json::Value::Object(map) => map.clone(),
            serde_json::Value::Null => serde_json::Map::new(),
            other => {
                let mut map = serde_json::Map::new();
                map.insert("value".into(), other.clone());
                map
            }
        };
        merged.insert(key.into(), value);
        Ok(serde_json::Value::Object(merged))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;

    /// source -> fork =(a)=> enrich -> merge, fork =(b)=> merge, merge -> out
    pub(crate) fn fork_join_settings(coalesce: CoalesceSettings) -> PipelineSettings {
        PipelineSettings::from_json_str(
            &json!({
                "name": "fork-join",
                "nodes": [
                    {"id": "source", "node_type": "source"},
                    {"id": "fork", "node_type": "gate"},
                    {"id": "enrich", "node_type": "transform", "plugin": "add_fields",
                     "config": {"fields": {"score": 7}}},
                    {"id": "merge", "node_type": "coalesce"},
                    {"id": "out", "node_type": "sink"}
                ],
                "edges": [
                    {"from": "source", "to": "fork"},
                    {"from": "fork", "to": "enrich", "label": "a", "mode": "COPY"},
                    {"from": "fork", "to": "merge", "label": "b", "mode": "COPY"},
                    {"from": "enrich", "to": "merge"},
                    {"from": "merge", "to": "out"}
                ],
                "coalesce": [coalesce]
            })
            .to_string(),
        )
        .unwrap()
    }

    fn require_all() -> CoalesceSettings {
        CoalesceSettings::new("merge", &["a", "b"], CoalescePolicy::RequireAll, MergeStrategy::Union)
    }

    #[test]
    fn valid_settings_pass() {
        assert!(require_all().validate().is_ok());
        assert!(require_all().with_timeout(30.0).validate().is_ok());
        let quorum = CoalesceSettings::new("m", &["a", "b", "c"], CoalescePolicy::Quorum, MergeStrategy::Nested)
            .with_quorum(2);
        assert!(quorum.validate().is_ok());
    }

    #[test]
    fn too_few_or_duplicate_branches_rejected() {
        let one = CoalesceSettings::new("m", &["a"], CoalescePolicy::First, MergeStrategy::Union);
        assert!(one.validate().unwrap_err().to_string().contains("at least 2 branches"));
        let dup = CoalesceSettings::new("m", &["a", "a"], CoalescePolicy::First, MergeStrategy::Union);
        assert!(dup.validate().unwrap_err().to_string().contains("unique"));
    }

    #[test]
    fn quorum_count_bounds() {
        let base = CoalesceSettings::new("m", &["a", "b"], CoalescePolicy::Quorum, MergeStrategy::Union);
        assert!(base.clone().validate().is_err());
        assert!(base.clone().with_quorum(0).validate().is_err());
        assert!(base.clone().with_quorum(3).validate().is_err());
        assert!(base.with_quorum(2).validate().is_ok());
        assert!(require_all().with_quorum(1).validate().is_err());
    }

    #[test]
    fn select_branch_must_be_configured() {
        let select = CoalesceSettings::new("m", &["a", "b"], CoalescePolicy::RequireAll, MergeStrategy::Select);
        assert!(select.clone().validate().is_err());
        assert!(select.clone().with_select_branch("z").validate().is_err());
        assert!(select.with_select_branch("b").validate().is_ok());
        assert!(require_all().with_select_branch("a").validate().is_err());
    }

    #[test]
    fn best_effort_needs_finite_positive_timeout() {
        let be = CoalesceSettings::new("m", &["a", "b"], CoalescePolicy::BestEffort, MergeStrategy::Union);
        assert!(be.clone().validate().is_err());
        assert!(be.clone().with_timeout(0.0).validate().is_err());
        assert!(matches!(
            be.clone().with_timeout(f64::NAN).validate(),
            Err(TributaryError::NonFiniteValue { .. })
        ));
        assert!(be.with_timeout(5.0).validate().is_ok());
    }

    #[test]
    fn union_collisions_follow_declaration_order() {
        let s = CoalesceSettings::new("m", &["b", "a", "c"], CoalescePolicy::RequireAll, MergeStrategy::Union)
            .with_branch_fields("a", &["id", "score"])
            .with_branch_fields("b", &["id", "label"])
            .with_branch_fields("c", &["extra"]);
        assert_eq!(
            s.union_field_collisions(),
            vec![("id".to_string(), vec!["b".to_string(), "a".to_string()])]
        );

        let nested = CoalesceSettings { merge: MergeStrategy::Nested, ..s };
        assert!(nested.union_field_collisions().is_empty());
    }

    #[test]
    fn build_graph_merges_coalesce_settings_into_config() {
        let settings = fork_join_settings(require_all());
        let graph = settings.build_graph().unwrap();
        let merge = graph.get_node_info("merge").unwrap();
        assert_eq!(merge.config["coalesce"]["policy"], "require_all");
        assert_eq!(merge.plugin_name, "coalesce");
        let enrich = graph.get_node_info("enrich").unwrap();
        assert_eq!(enrich.plugin_name, "add_fields");
        assert_eq!(enrich.config, json!({"fields": {"score": 7}}));
    }

    #[test]
    fn build_graph_rejects_non_finite_timeouts() {
        let mut settings = fork_join_settings(require_all());
        settings.coalesce[0].timeout_seconds = Some(f64::INFINITY);
        assert!(matches!(
            settings.build_graph(),
            Err(TributaryError::NonFiniteValue { .. })
        ));
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.json");
        let settings = fork_join_settings(require_all());
        std::fs::write(&path, serde_json::to_string_pretty(&settings).unwrap()).unwrap();
        let loaded = PipelineSettings::load(&path).unwrap();
        assert_eq!(loaded, settings);
        assert!(loaded.checkpoint.enabled);
    }
}
