pub mod canvas;
pub mod events;
pub mod file_repository;
pub mod graph;
pub mod mapping;
pub mod orchestrator;
pub mod repository;
pub mod script;

use serde::{Deserialize, Serialize};

use mapping::FieldBinding;

/// A node graph of code-bearing nodes.
///
/// Readers treat a `Workflow` as an immutable snapshot; edits produce a new
/// value (see [`canvas::Canvas`]).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub id: String,
    pub title: String,
    /// Script source, written to a scratch file and run by the interpreter.
    pub code: String,
    #[serde(default)]
    pub is_running: bool,
    /// Free-text purpose of the node. Never executed.
    #[serde(default)]
    pub flow_summary: String,
    #[serde(default)]
    pub spec: NodeSpec,
    #[serde(default)]
    pub position: Position,
}

/// Declared input/output contract of a node. Documentary only.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeSpec {
    #[serde(default)]
    pub inputs: Vec<ContractField>,
    #[serde(default)]
    pub process: Vec<String>,
    #[serde(default)]
    pub outputs: Vec<ContractField>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContractField {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub optional: bool,
}

impl ContractField {
    pub fn new(name: impl Into<String>, field_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            field_type: field_type.into(),
            item_type: None,
            description: None,
            optional: false,
        }
    }
}

/// `source` runs before `target` and its stdout feeds the target's stdin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub id: String,
    pub source: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mappings: Vec<FieldBinding>,
}

impl Edge {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        let source = source.into();
        let target = target.into();
        Self {
            id: format!("edge-{source}-{target}"),
            source,
            target,
            mappings: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Node {
    pub fn new(id: impl Into<String>, title: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            code: code.into(),
            is_running: false,
            flow_summary: String::new(),
            spec: NodeSpec::default(),
            position: Position::default(),
        }
    }
}

impl Workflow {
    pub fn new(nodes: Vec<Node>, edges: Vec<Edge>) -> Self {
        Self { nodes, edges }
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Two demo nodes: the first prints a line, the second upper-cases
    /// whatever arrives on stdin.
    pub fn default_template() -> Self {
        let mut first = Node::new(
            "node-1",
            "Greeter",
            "console.log('hello from node 1');\n",
        );
        first.flow_summary = "Prints a greeting to stdout.".into();
        first.spec.process = vec!["print a greeting".into()];
        first.spec.outputs = vec![ContractField::new("greeting", "string")];
        first.position = Position { x: 100.0, y: 100.0 };

        let mut second = Node::new(
            "node-2",
            "Shouter",
            concat!(
                "const readline = require('readline');\n",
                "const rl = readline.createInterface({ input: process.stdin });\n",
                "rl.on('line', (line) => console.log(`node 2 got: ${line.toUpperCase()}`));\n",
            ),
        );
        second.flow_summary = "Reads lines from stdin and echoes them upper-cased.".into();
        second.spec.inputs = vec![ContractField::new("greeting", "string")];
        second.spec.process = vec!["read each line".into(), "upper-case it".into()];
        second.spec.outputs = vec![ContractField::new("shout", "string")];
        second.position = Position { x: 400.0, y: 100.0 };

        Self::new(vec![first, second], vec![Edge::new("node-1", "node-2")])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_json_is_camel_case() {
        let mut node = Node::new("n1", "Title", "console.log(1)");
        node.flow_summary = "does a thing".into();
        node.is_running = true;

        let json = serde_json::to_value(&node).unwrap();
        assert_eq!(json["isRunning"], true);
        assert_eq!(json["flowSummary"], "does a thing");
        assert!(json.get("is_running").is_none());
    }

    #[test]
    fn test_node_defaults_when_fields_missing() {
        let node: Node = serde_json::from_str(r#"{"id":"a","title":"A","code":"x"}"#).unwrap();
        assert!(!node.is_running);
        assert!(node.flow_summary.is_empty());
        assert!(node.spec.inputs.is_empty());
        assert_eq!(node.position, Position::default());
    }

    #[test]
    fn test_contract_field_serialization() {
        let field: ContractField = serde_json::from_str(
            r#"{"name":"items","type":"array","itemType":"string","optional":true}"#,
        )
        .unwrap();
        assert_eq!(field.field_type, "array");
        assert_eq!(field.item_type.as_deref(), Some("string"));
        assert!(field.optional);

        let json = serde_json::to_value(ContractField::new("x", "number")).unwrap();
        assert_eq!(json, serde_json::json!({"name": "x", "type": "number"}));
    }

    #[test]
    fn test_edge_mappings_omitted_when_empty() {
        let json = serde_json::to_value(Edge::new("a", "b")).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"id": "edge-a-b", "source": "a", "target": "b"})
        );
    }

    #[test]
    fn test_default_template() {
        let wf = Workflow::default_template();
        assert_eq!(wf.nodes.len(), 2);
        assert_eq!(wf.edges.len(), 1);
        assert_eq!(wf.edges[0].source, "node-1");
        assert_eq!(wf.edges[0].target, "node-2");
        assert!(wf.nodes.iter().all(|n| !n.is_running));
        assert!(wf.node("node-2").unwrap().code.contains("readline"));
    }
}
