//! Structural hashing of the execution graph and coalesce-branch tracing.

use serde::Serialize;

use tributary_types::Result;

use crate::canonical::{stable_hash, stable_hash_of};
use crate::graph::{ExecutionGraph, NodeType, RoutingMode};

#[derive(Serialize)]
struct TopologyNode<'a> {
    node_id: &'a str,
    node_type: NodeType,
}

#[derive(Serialize, PartialEq, Eq, PartialOrd, Ord)]
struct TopologyEdge<'a> {
    from: &'a str,
    to: &'a str,
    label: Option<&'a str>,
    mode: RoutingMode,
}

#[derive(Serialize)]
struct Topology<'a> {
    target: &'a str,
    nodes: Vec<TopologyNode<'a>>,
    edges: Vec<TopologyEdge<'a>>,
}

/// Hash of the shape of the subgraph strictly upstream of `node_id`.
///
/// Covers node ids, node types, and edge structure. Node configuration and
/// plugin names are left out; the node's own config is covered by
/// [`node_config_hash`].
pub fn upstream_topology_hash(graph: &ExecutionGraph, node_id: &str) -> Result<String> {
    let sub = graph.upstream_subgraph(node_id)?;

    let mut nodes: Vec<TopologyNode<'_>> = sub
        .nodes
        .iter()
        .map(|n| TopologyNode {
            node_id: &n.node_id,
            node_type: n.node_type,
        })
        .collect();
    nodes.sort_by(|a, b| a.node_id.cmp(b.node_id));

    let mut edges: Vec<TopologyEdge<'_>> = sub
        .edges
        .iter()
        .map(|e| TopologyEdge {
            from: &e.from_node_id,
            to: &e.to_node_id,
            label: e.label.as_deref(),
            mode: e.mode,
        })
        .collect();
    edges.sort();

    stable_hash_of(&Topology {
        target: sub.target,
        nodes,
        edges,
    })
}

/// Hash of a node's full configuration.
///
/// Any byte-level difference in the canonical form changes the hash; there is
/// no semantic diffing.
pub fn node_config_hash(graph: &ExecutionGraph, node_id: &str) -> Result<String> {
    let info = graph.get_node_info(node_id)?;
    stable_hash(&info.config)
}

/// A branch opened by a gate whose COPY edge leads to a coalesce point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchEntry {
    pub gate: String,
    pub branch: String,
    /// First node on the branch; the coalesce point itself for identity branches.
    pub entry_node: String,
}

/// Trace which branches reach `coalesce_id`.
///
/// Returns one entry per labelled COPY edge that leaves an upstream gate and
/// whose target is the coalesce node or one of its ancestors.
pub fn branch_entry_edges(graph: &ExecutionGraph, coalesce_id: &str) -> Result<Vec<BranchEntry>> {
    let upstream = graph.upstream_nodes(coalesce_id)?;
    let mut entries: Vec<BranchEntry> = graph
        .edges()
        .iter()
        .filter(|e| e.mode == RoutingMode::Copy && upstream.contains(&e.from_node_id))
        .filter(|e| e.to_node_id == coalesce_id || upstream.contains(&e.to_node_id))
        .filter(|e| {
            graph
                .get_node_info(&e.from_node_id)
                .map(|n| n.node_type == NodeType::Gate)
                .unwrap_or(false)
        })
        .filter_map(|e| {
            e.label.as_ref().map(|label| BranchEntry {
                gate: e.from_node_id.clone(),
                branch: label.clone(),
                entry_node: e.to_node_id.clone(),
            })
        })
        .collect();
    entries.sort_by(|a, b| (&a.branch, &a.gate).cmp(&(&b.branch, &b.gate)));
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::tests::{copy_edge, edge, fork_join_graph, node};
    use crate::graph::{EdgeInfo, NodeInfo};
    use serde_json::json;

    fn rebuild(mut nodes: Vec<NodeInfo>, mut edges: Vec<EdgeInfo>, extra_nodes: Vec<NodeInfo>, extra_edges: Vec<EdgeInfo>) -> ExecutionGraph {
        nodes.extend(extra_nodes);
        edges.extend(extra_edges);
        ExecutionGraph::new(nodes, edges).unwrap()
    }

    fn parts(g: &ExecutionGraph) -> (Vec<NodeInfo>, Vec<EdgeInfo>) {
        (g.nodes().cloned().collect(), g.edges().to_vec())
    }

    #[test]
    fn topology_hash_is_stable() {
        let a = upstream_topology_hash(&fork_join_graph(), "merge").unwrap();
        let b = upstream_topology_hash(&fork_join_graph(), "merge").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn topology_hash_ignores_edge_declaration_order() {
        let g = fork_join_graph();
        let (nodes, mut edges) = parts(&g);
        edges.reverse();
        let reordered = ExecutionGraph::new(nodes, edges).unwrap();
        assert_eq!(
            upstream_topology_hash(&g, "merge").unwrap(),
            upstream_topology_hash(&reordered, "merge").unwrap()
        );
    }

    #[test]
    fn downstream_changes_do_not_affect_upstream_hash() {
        let g = fork_join_graph();
        let before = upstream_topology_hash(&g, "merge").unwrap();
        let (nodes, edges) = parts(&g);
        let extended = rebuild(
            nodes,
            edges,
            vec![node("audit_sink", NodeType::Sink)],
            vec![edge("merge", "audit_sink")],
        );
        assert_eq!(before, upstream_topology_hash(&extended, "merge").unwrap());
    }

    #[test]
    fn upstream_insertion_changes_hash() {
        let g = fork_join_graph();
        let before = upstream_topology_hash(&g, "merge").unwrap();
        let (nodes, edges) = parts(&g);
        let edges: Vec<EdgeInfo> = edges
            .into_iter()
            .filter(|e| !(e.from_node_id == "source" && e.to_node_id == "fork"))
            .collect();
        let changed = rebuild(
            nodes,
            edges,
            vec![node("clean", NodeType::Transform)],
            vec![edge("source", "clean"), edge("clean", "fork")],
        );
        assert_ne!(before, upstream_topology_hash(&changed, "merge").unwrap());
    }

    #[test]
    fn upstream_config_change_does_not_affect_topology_hash() {
        let g = fork_join_graph();
        let before = upstream_topology_hash(&g, "merge").unwrap();
        let (mut nodes, edges) = parts(&g);
        for n in &mut nodes {
            if n.node_id == "enrich_a" {
                n.config = json!({"threshold": 5});
                n.plugin_name = "other_plugin".into();
            }
        }
        let changed = ExecutionGraph::new(nodes, edges).unwrap();
        assert_eq!(before, upstream_topology_hash(&changed, "merge").unwrap());
    }

    #[test]
    fn routing_mode_change_affects_hash() {
        let g = fork_join_graph();
        let before = upstream_topology_hash(&g, "merge").unwrap();
        let (nodes, mut edges) = parts(&g);
        for e in &mut edges {
            if e.label.as_deref() == Some("b") {
                e.mode = RoutingMode::Move;
            }
        }
        let changed = ExecutionGraph::new(nodes, edges).unwrap();
        assert_ne!(before, upstream_topology_hash(&changed, "merge").unwrap());
    }

    #[test]
    fn config_hash_tracks_config_bytes() {
        let g = fork_join_graph();
        let before = node_config_hash(&g, "merge").unwrap();
        let (mut nodes, edges) = parts(&g);
        for n in &mut nodes {
            if n.node_id == "merge" {
                n.config = json!({"timeout_seconds": 30.0});
            }
        }
        let changed = ExecutionGraph::new(nodes, edges).unwrap();
        assert_ne!(before, node_config_hash(&changed, "merge").unwrap());
        assert!(node_config_hash(&g, "ghost").is_err());
    }

    #[test]
    fn branch_tracing_finds_identity_and_transformed_branches() {
        let g = fork_join_graph();
        let entries = branch_entry_edges(&g, "merge").unwrap();
        let branches: Vec<&str> = entries.iter().map(|e| e.branch.as_str()).collect();
        assert_eq!(branches, vec!["a", "b"]);
        assert_eq!(entries[1].entry_node, "merge");
        assert_eq!(entries[0].entry_node, "enrich_a");
    }

    #[test]
    fn branch_tracing_skips_branches_routed_elsewhere() {
        let g = fork_join_graph();
        let (nodes, edges) = parts(&g);
        let extended = rebuild(
            nodes,
            edges,
            vec![node("side", NodeType::Sink)],
            vec![copy_edge("fork", "side", "c")],
        );
        let entries = branch_entry_edges(&extended, "merge").unwrap();
        assert!(entries.iter().all(|e| e.branch != "c"));
    }
}
