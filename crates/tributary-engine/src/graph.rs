//! Frozen execution graph: nodes, routing edges, and ancestry queries.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use serde::{Deserialize, Serialize};

use tributary_types::{Result, TributaryError};

/// Role a node plays in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Source,
    Transform,
    Gate,
    Aggregation,
    Coalesce,
    Sink,
}

impl NodeType {
    pub fn as_str(self) -> &'static str {
        match self {
            NodeType::Source => "source",
            NodeType::Transform => "transform",
            NodeType::Gate => "gate",
            NodeType::Aggregation => "aggregation",
            NodeType::Coalesce => "coalesce",
            NodeType::Sink => "sink",
        }
    }
}

impl std::fmt::Display for NodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a token travels along an edge.
///
/// `Copy` edges leave a gate with a copy of the token on a named branch;
/// `Move` edges hand the token itself to the next node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RoutingMode {
    #[default]
    Move,
    Copy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub node_id: String,
    pub node_type: NodeType,
    pub plugin_name: String,
    /// Opaque configuration; hashed for comparison, never interpreted here.
    #[serde(default)]
    pub config: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeInfo {
    pub from_node_id: String,
    pub to_node_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default)]
    pub mode: RoutingMode,
}

/// The nodes strictly upstream of a target plus the edges that connect them
/// to each other and to the target.
#[derive(Debug, Clone)]
pub struct Subgraph<'g> {
    pub target: &'g str,
    pub nodes: Vec<&'g NodeInfo>,
    pub edges: Vec<&'g EdgeInfo>,
}

/// An immutable DAG of pipeline nodes.
///
/// Built once at launch and never modified for the duration of a run.
#[derive(Debug, Clone)]
pub struct ExecutionGraph {
    nodes: BTreeMap<String, NodeInfo>,
    edges: Vec<EdgeInfo>,
    outgoing: HashMap<String, Vec<usize>>,
    incoming: HashMap<String, Vec<usize>>,
    order: Vec<String>,
}

impl ExecutionGraph {
    /// Build a graph, rejecting duplicate node ids, dangling edges, and cycles.
    pub fn new(nodes: Vec<NodeInfo>, edges: Vec<EdgeInfo>) -> Result<Self> {
        let mut by_id = BTreeMap::new();
        for node in nodes {
            let id = node.node_id.clone();
            if by_id.insert(id.clone(), node).is_some() {
                return Err(TributaryError::ValidationError(format!(
                    "duplicate node id '{id}'"
                )));
            }
        }

        let mut outgoing: HashMap<String, Vec<usize>> = HashMap::new();
        let mut incoming: HashMap<String, Vec<usize>> = HashMap::new();
        for (idx, edge) in edges.iter().enumerate() {
            for endpoint in [&edge.from_node_id, &edge.to_node_id] {
                if !by_id.contains_key(endpoint) {
                    return Err(TributaryError::ValidationError(format!(
                        "edge {} -> {} references unknown node '{endpoint}'",
                        edge.from_node_id, edge.to_node_id
                    )));
                }
            }
            outgoing.entry(edge.from_node_id.clone()).or_default().push(idx);
            incoming.entry(edge.to_node_id.clone()).or_default().push(idx);
        }

        let order = topological_sort(&by_id, &edges, &outgoing, &incoming)?;

        Ok(Self {
            nodes: by_id,
            edges,
            outgoing,
            incoming,
            order,
        })
    }

    pub fn has_node(&self, node_id: &str) -> bool {
        self.nodes.contains_key(node_id)
    }

    pub fn get_node_info(&self, node_id: &str) -> Result<&NodeInfo> {
        self.nodes
            .get(node_id)
            .ok_or_else(|| TributaryError::UnknownNode(node_id.to_string()))
    }

    /// Nodes in id order.
    pub fn nodes(&self) -> impl Iterator<Item = &NodeInfo> {
        self.nodes.values()
    }

    pub fn edges(&self) -> &[EdgeInfo] {
        &self.edges
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn outgoing_edges(&self, node_id: &str) -> Vec<&EdgeInfo> {
        self.edge_list(self.outgoing.get(node_id))
    }

    pub fn incoming_edges(&self, node_id: &str) -> Vec<&EdgeInfo> {
        self.edge_list(self.incoming.get(node_id))
    }

    fn edge_list(&self, indices: Option<&Vec<usize>>) -> Vec<&EdgeInfo> {
        indices
            .map(|idx| idx.iter().map(|&i| &self.edges[i]).collect())
            .unwrap_or_default()
    }

    /// Node ids in a deterministic topological order.
    pub fn topological_order(&self) -> &[String] {
        &self.order
    }

    pub fn nodes_of_type(&self, node_type: NodeType) -> impl Iterator<Item = &NodeInfo> {
        self.nodes.values().filter(move |n| n.node_type == node_type)
    }

    pub fn source_nodes(&self) -> Vec<&NodeInfo> {
        self.nodes_of_type(NodeType::Source).collect()
    }

    pub fn sink_nodes(&self) -> Vec<&NodeInfo> {
        self.nodes_of_type(NodeType::Sink).collect()
    }

    /// Strict ancestors of `node_id` (the node itself is excluded).
    pub fn upstream_nodes(&self, node_id: &str) -> Result<BTreeSet<String>> {
        if !self.has_node(node_id) {
            return Err(TributaryError::UnknownNode(node_id.to_string()));
        }
        let mut seen = BTreeSet::new();
        let mut queue = VecDeque::from([node_id.to_string()]);
        while let Some(current) = queue.pop_front() {
            for edge in self.incoming_edges(&current) {
                if edge.from_node_id != node_id && seen.insert(edge.from_node_id.clone()) {
                    queue.push_back(edge.from_node_id.clone());
                }
            }
        }
        Ok(seen)
    }

    /// The subgraph strictly upstream of `node_id`.
    ///
    /// Includes every ancestor node, every edge between two ancestors, and
    /// every edge from an ancestor into `node_id`. Edges leaving `node_id`
    /// and everything downstream are excluded.
    pub fn upstream_subgraph<'g>(&'g self, node_id: &'g str) -> Result<Subgraph<'g>> {
        let ancestors = self.upstream_nodes(node_id)?;
        let nodes = ancestors
            .iter()
            .filter_map(|id| self.nodes.get(id))
            .collect();
        let edges = self
            .edges
            .iter()
            .filter(|e| {
                ancestors.contains(&e.from_node_id)
                    && (e.to_node_id == node_id || ancestors.contains(&e.to_node_id))
            })
            .collect();
        Ok(Subgraph {
            target: node_id,
            nodes,
            edges,
        })
    }
}

/// Kahn's algorithm with id-ordered tie breaking.
fn topological_sort(
    nodes: &BTreeMap<String, NodeInfo>,
    edges: &[EdgeInfo],
    outgoing: &HashMap<String, Vec<usize>>,
    incoming: &HashMap<String, Vec<usize>>,
) -> Result<Vec<String>> {
    let mut in_degree: BTreeMap<&str, usize> = nodes
        .keys()
        .map(|id| (id.as_str(), incoming.get(id).map_or(0, Vec::len)))
        .collect();
    let mut ready: BTreeSet<&str> = in_degree
        .iter()
        .filter(|(_, &d)| d == 0)
        .map(|(&id, _)| id)
        .collect();

    let mut order = Vec::with_capacity(nodes.len());
    while let Some(id) = ready.pop_first() {
        order.push(id.to_string());
        for &idx in outgoing.get(id).map(Vec::as_slice).unwrap_or_default() {
            let to = edges[idx].to_node_id.as_str();
            if let Some(d) = in_degree.get_mut(to) {
                *d -= 1;
                if *d == 0 {
                    ready.insert(to);
                }
            }
        }
    }

    if order.len() != nodes.len() {
        let mut cyclic: Vec<&str> = in_degree
            .iter()
            .filter(|(_, &d)| d > 0)
            .map(|(&id, _)| id)
            .collect();
        cyclic.sort_unstable();
        return Err(TributaryError::ValidationError(format!(
            "execution graph contains a cycle through: {}",
            cyclic.join(", ")
        )));
    }
    Ok(order)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;

    pub(crate) fn node(id: &str, node_type: NodeType) -> NodeInfo {
        NodeInfo {
            node_id: id.to_string(),
            node_type,
            plugin_name: node_type.as_str().to_string(),
            config: json!({}),
        }
    }

    pub(crate) fn edge(from: &str, to: &str) -> EdgeInfo {
        EdgeInfo {
            from_node_id: from.to_string(),
            to_node_id: to.to_string(),
            label: None,
            mode: RoutingMode::Move,
        }
    }

    pub(crate) fn copy_edge(from: &str, to: &str, label: &str) -> EdgeInfo {
        EdgeInfo {
            from_node_id: from.to_string(),
            to_node_id: to.to_string(),
            label: Some(label.to_string()),
            mode: RoutingMode::Copy,
        }
    }

    /// source -> fork =(a)=> enrich_a -> merge
    ///                =(b)=> merge          (identity branch)
    /// merge -> out
    pub(crate) fn fork_join_graph() -> ExecutionGraph {
        ExecutionGraph::new(
            vec![
                node("source", NodeType::Source),
                node("fork", NodeType::Gate),
                node("enrich_a", NodeType::Transform),
                node("merge", NodeType::Coalesce),
                node("out", NodeType::Sink),
            ],
            vec![
                edge("source", "fork"),
                copy_edge("fork", "enrich_a", "a"),
                edge("enrich_a", "merge"),
                copy_edge("fork", "merge", "b"),
                edge("merge", "out"),
            ],
        )
        .unwrap()
    }

    #[test]
    fn lookup_and_adjacency() {
        let g = fork_join_graph();
        assert!(g.has_node("merge"));
        assert!(!g.has_node("missing"));
        assert_eq!(g.get_node_info("fork").unwrap().node_type, NodeType::Gate);
        assert_eq!(g.outgoing_edges("fork").len(), 2);
        assert_eq!(g.incoming_edges("merge").len(), 2);
        assert!(g.outgoing_edges("out").is_empty());
        assert_eq!(g.source_nodes().len(), 1);
        assert_eq!(g.sink_nodes()[0].node_id, "out");
    }

    #[test]
    fn unknown_node_lookup_is_an_error() {
        let g = fork_join_graph();
        assert!(matches!(
            g.get_node_info("nope"),
            Err(TributaryError::UnknownNode(ref id)) if id == "nope"
        ));
    }

    #[test]
    fn topological_order_respects_edges() {
        let g = fork_join_graph();
        let order = g.topological_order();
        let pos = |id: &str| order.iter().position(|n| n == id).unwrap();
        assert!(pos("source") < pos("fork"));
        assert!(pos("fork") < pos("enrich_a"));
        assert!(pos("enrich_a") < pos("merge"));
        assert!(pos("merge") < pos("out"));
    }

    #[test]
    fn upstream_nodes_are_strict_ancestors() {
        let g = fork_join_graph();
        let up = g.upstream_nodes("merge").unwrap();
        let expected: BTreeSet<String> = ["source", "fork", "enrich_a"]
            .into_iter()
            .map(String::from)
            .collect();
        assert_eq!(up, expected);
        assert!(g.upstream_nodes("source").unwrap().is_empty());
    }

    #[test]
    fn upstream_subgraph_excludes_downstream_edges() {
        let g = fork_join_graph();
        let sub = g.upstream_subgraph("merge").unwrap();
        assert_eq!(sub.nodes.len(), 3);
        assert_eq!(sub.edges.len(), 4);
        assert!(sub.edges.iter().all(|e| e.from_node_id != "merge"));
    }

    #[test]
    fn duplicate_node_rejected() {
        let err = ExecutionGraph::new(
            vec![node("a", NodeType::Source), node("a", NodeType::Sink)],
            vec![],
        )
        .unwrap_err();
        assert!(err.to_string().contains("duplicate node id 'a'"));
    }

    #[test]
    fn dangling_edge_rejected() {
        let err = ExecutionGraph::new(vec![node("a", NodeType::Source)], vec![edge("a", "b")])
            .unwrap_err();
        assert!(err.to_string().contains("unknown node 'b'"));
    }

    #[test]
    fn cycle_rejected() {
        let err = ExecutionGraph::new(
            vec![
                node("s", NodeType::Source),
                node("a", NodeType::Transform),
                node("b", NodeType::Transform),
            ],
            vec![edge("s", "a"), edge("a", "b"), edge("b", "a")],
        )
        .unwrap_err();
        assert!(err.to_string().contains("cycle through: a, b"));
    }

    #[test]
    fn routing_mode_serializes_upper_case() {
        assert_eq!(serde_json::to_string(&RoutingMode::Copy).unwrap(), "\"COPY\"");
        let mode: RoutingMode = serde_json::from_str("\"MOVE\"").unwrap();
        assert_eq!(mode, RoutingMode::Move);
    }
}
