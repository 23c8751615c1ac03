//! Chain planning: source discovery, validation and linearization.
//!
//! A chain starts at a source node (one that is no edge's target) and
//! follows the first outgoing edge of each node until a node has none.
//! Fan-out beyond the first edge is not linearized.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;

use super::{Edge, Node, Workflow};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    #[error("duplicate node id: {0}")]
    DuplicateNodeId(String),

    #[error("edge {edge_id} references unknown {side} node: {node_id}")]
    UnknownNodeReference {
        edge_id: String,
        node_id: String,
        side: &'static str,
    },

    #[error("cycle detected through node {node_id}")]
    CycleDetected { node_id: String },
}

/// One linear path through the graph, in execution order.
#[derive(Debug, Clone, PartialEq)]
pub struct Chain {
    nodes: Vec<Node>,
}

impl Chain {
    pub fn new(nodes: Vec<Node>) -> Self {
        Self { nodes }
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node_ids(&self) -> Vec<&str> {
        self.nodes.iter().map(|n| n.id.as_str()).collect()
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.nodes.iter().any(|n| n.id == node_id)
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.node_ids().join(" → "))
    }
}

/// Nodes that are not the target of any edge, in node-array order.
pub fn find_source_nodes(workflow: &Workflow) -> Vec<&Node> {
    let targets: HashSet<&str> = workflow.edges.iter().map(|e| e.target.as_str()).collect();
    workflow
        .nodes
        .iter()
        .filter(|n| !targets.contains(n.id.as_str()))
        .collect()
}

/// Target of the first edge leaving `node_id`, if that edge and node exist.
pub fn find_next_node<'a>(node_id: &str, workflow: &'a Workflow) -> Option<&'a Node> {
    let edge = workflow.edges.iter().find(|e| e.source == node_id)?;
    workflow.node(&edge.target)
}

pub fn outgoing_edges<'a>(node_id: &str, workflow: &'a Workflow) -> Vec<&'a Edge> {
    workflow.edges.iter().filter(|e| e.source == node_id).collect()
}

/// Ids of nodes with more than one outgoing edge. Only their first edge
/// takes part in a chain.
pub fn branching_nodes(workflow: &Workflow) -> Vec<&str> {
    workflow
        .nodes
        .iter()
        .filter(|n| outgoing_edges(&n.id, workflow).len() > 1)
        .map(|n| n.id.as_str())
        .collect()
}

/// One chain per source node.
///
/// Fails instead of looping when a walk revisits a node, and instead of
/// truncating when the followed edge points at a missing node.
pub fn build_chains(workflow: &Workflow) -> Result<Vec<Chain>, GraphError> {
    let mut chains = Vec::new();

    for source in find_source_nodes(workflow) {
        let mut visited: HashSet<&str> = HashSet::new();
        let mut nodes = Vec::new();
        let mut current = Some(source);

        while let Some(node) = current {
            if !visited.insert(node.id.as_str()) {
                return Err(GraphError::CycleDetected {
                    node_id: node.id.clone(),
                });
            }
            nodes.push(node.clone());

            current = match workflow.edges.iter().find(|e| e.source == node.id) {
                None => None,
                Some(edge) => Some(workflow.node(&edge.target).ok_or_else(|| {
                    GraphError::UnknownNodeReference {
                        edge_id: edge.id.clone(),
                        node_id: edge.target.clone(),
                        side: "target",
                    }
                })?),
            };
        }

        chains.push(Chain::new(nodes));
    }

    Ok(chains)
}

/// Reject duplicate ids, dangling edges and cycles anywhere in the graph.
pub fn validate(workflow: &Workflow) -> Result<(), GraphError> {
    let mut seen: HashSet<&str> = HashSet::new();
    for node in &workflow.nodes {
        if !seen.insert(node.id.as_str()) {
            return Err(GraphError::DuplicateNodeId(node.id.clone()));
        }
    }

    for edge in &workflow.edges {
        for (node_id, side) in [(&edge.source, "source"), (&edge.target, "target")] {
            if !seen.contains(node_id.as_str()) {
                return Err(GraphError::UnknownNodeReference {
                    edge_id: edge.id.clone(),
                    node_id: node_id.clone(),
                    side,
                });
            }
        }
    }

    // Kahn's algorithm: whatever never reaches in-degree zero sits on a cycle.
    let mut in_degree: HashMap<&str, usize> =
        workflow.nodes.iter().map(|n| (n.id.as_str(), 0)).collect();
    let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
    for edge in &workflow.edges {
        adjacency
            .entry(edge.source.as_str())
            .or_default()
            .push(edge.target.as_str());
        *in_degree.entry(edge.target.as_str()).or_insert(0) += 1;
    }

    let mut queue: VecDeque<&str> = workflow
        .nodes
        .iter()
        .map(|n| n.id.as_str())
        .filter(|id| in_degree[id] == 0)
        .collect();
    let mut visited = 0usize;

    while let Some(id) = queue.pop_front() {
        visited += 1;
        for &next in adjacency.get(id).map(Vec::as_slice).unwrap_or(&[]) {
            if let Some(deg) = in_degree.get_mut(next) {
                *deg -= 1;
                if *deg == 0 {
                    queue.push_back(next);
                }
            }
        }
    }

    if visited != workflow.nodes.len() {
        let node_id = workflow
            .nodes
            .iter()
            .find(|n| in_degree[n.id.as_str()] > 0)
            .map(|n| n.id.clone())
            .unwrap_or_default();
        return Err(GraphError::CycleDetected { node_id });
    }

    Ok(())
}

/// Validate, then linearize.
pub fn plan(workflow: &Workflow) -> Result<Vec<Chain>, GraphError> {
    validate(workflow)?;
    let branching = branching_nodes(workflow);
    if !branching.is_empty() {
        tracing::warn!(nodes = ?branching, "only the first outgoing edge of a branching node is executed");
    }
    build_chains(workflow)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str) -> Node {
        Node::new(id, id.to_uppercase(), format!("console.log('{id}')"))
    }

    fn workflow(ids: &[&str], edges: &[(&str, &str)]) -> Workflow {
        Workflow::new(
            ids.iter().map(|id| node(id)).collect(),
            edges.iter().map(|(s, t)| Edge::new(*s, *t)).collect(),
        )
    }

    fn ids(chains: &[Chain]) -> Vec<Vec<&str>> {
        chains.iter().map(|c| c.node_ids()).collect()
    }

    #[test]
    fn linear_graph_yields_single_chain() {
        let wf = workflow(&["a", "b", "c"], &[("a", "b"), ("b", "c")]);

        let sources: Vec<_> = find_source_nodes(&wf).iter().map(|n| n.id.as_str()).collect();
        assert_eq!(sources, vec!["a"]);

        let chains = build_chains(&wf).unwrap();
        assert_eq!(ids(&chains), vec![vec!["a", "b", "c"]]);
        assert_eq!(chains[0].to_string(), "a → b → c");
    }

    #[test]
    fn disjoint_chains_follow_node_order() {
        let wf = workflow(&["x", "a", "y", "b"], &[("a", "b"), ("x", "y")]);
        let chains = build_chains(&wf).unwrap();
        assert_eq!(ids(&chains), vec![vec!["x", "y"], vec!["a", "b"]]);
    }

    #[test]
    fn isolated_node_is_its_own_chain() {
        let wf = workflow(&["solo"], &[]);
        let chains = build_chains(&wf).unwrap();
        assert_eq!(ids(&chains), vec![vec!["solo"]]);
    }

    #[test]
    fn empty_workflow_has_no_chains() {
        assert!(build_chains(&Workflow::default()).unwrap().is_empty());
        assert!(plan(&Workflow::default()).unwrap().is_empty());
    }

    #[test]
    fn find_next_node_follows_first_edge_only() {
        let wf = workflow(&["a", "b", "c"], &[("a", "b"), ("a", "c")]);
        assert_eq!(find_next_node("a", &wf).unwrap().id, "b");
        assert!(find_next_node("b", &wf).is_none());
        assert_eq!(branching_nodes(&wf), vec!["a"]);

        let chains = build_chains(&wf).unwrap();
        assert_eq!(ids(&chains), vec![vec!["a", "b"]]);
    }

    #[test]
    fn find_next_node_missing_source_is_none() {
        let wf = workflow(&["a"], &[]);
        assert!(find_next_node("ghost", &wf).is_none());
    }

    #[test]
    fn build_chains_detects_cycle_reachable_from_source() {
        // a → b → c → b
        let wf = workflow(&["a", "b", "c"], &[("a", "b"), ("b", "c"), ("c", "b")]);
        assert_eq!(
            build_chains(&wf),
            Err(GraphError::CycleDetected { node_id: "b".into() })
        );
    }

    #[test]
    fn build_chains_rejects_dangling_target() {
        let wf = workflow(&["a"], &[("a", "ghost")]);
        assert!(matches!(
            build_chains(&wf),
            Err(GraphError::UnknownNodeReference { node_id, side: "target", .. }) if node_id == "ghost"
        ));
    }

    #[test]
    fn validate_detects_sourceless_cycle() {
        // No node is a source, so build_chains alone would return nothing.
        let wf = workflow(&["a", "b"], &[("a", "b"), ("b", "a")]);
        assert!(build_chains(&wf).unwrap().is_empty());
        assert!(matches!(validate(&wf), Err(GraphError::CycleDetected { .. })));
        assert!(plan(&wf).is_err());
    }

    #[test]
    fn validate_rejects_duplicate_ids() {
        let wf = workflow(&["a", "a"], &[]);
        assert_eq!(validate(&wf), Err(GraphError::DuplicateNodeId("a".into())));
    }

    #[test]
    fn validate_rejects_dangling_source() {
        let wf = workflow(&["b"], &[("ghost", "b")]);
        assert!(matches!(
            validate(&wf),
            Err(GraphError::UnknownNodeReference { side: "source", .. })
        ));
    }

    #[test]
    fn validate_accepts_diamond() {
        let wf = workflow(
            &["a", "b", "c", "d"],
            &[("a", "b"), ("a", "c"), ("b", "d"), ("c", "d")],
        );
        assert!(validate(&wf).is_ok());
    }

    #[test]
    fn join_node_appears_in_every_chain_reaching_it() {
        let wf = workflow(&["a", "b", "c"], &[("a", "c"), ("b", "c")]);
        let chains = build_chains(&wf).unwrap();
        assert_eq!(ids(&chains), vec![vec!["a", "c"], vec!["b", "c"]]);
    }

    #[test]
    fn disjoint_paths_partition_the_node_set() {
        // Several graphs made of vertex-disjoint paths of varying length.
        for lengths in [vec![1], vec![3], vec![2, 2], vec![1, 4, 2], vec![5, 1, 1, 3]] {
            let mut names = Vec::new();
            let mut edges = Vec::new();
            for (p, len) in lengths.iter().enumerate() {
                for i in 0..*len {
                    names.push(format!("p{p}n{i}"));
                    if i > 0 {
                        edges.push(Edge::new(format!("p{p}n{}", i - 1), format!("p{p}n{i}")));
                    }
                }
            }
            let wf = Workflow::new(names.iter().map(|n| node(n)).collect(), edges);

            let chains = plan(&wf).unwrap();
            assert_eq!(chains.len(), lengths.len());

            let mut all: Vec<&str> = chains.iter().flat_map(|c| c.node_ids()).collect();
            let total = all.len();
            all.sort_unstable();
            all.dedup();
            assert_eq!(all.len(), total, "a node appeared in two chains");

            let mut expected: Vec<&str> = names.iter().map(String::as_str).collect();
            expected.sort_unstable();
            assert_eq!(all, expected);
        }
    }
}
