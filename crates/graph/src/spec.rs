//! Serializable description of a graph, as submitted by callers.

use std::path::Path;

use exgraf_core::{NodeId, OpKind, Shape, WorkerId};
use serde::{Deserialize, Serialize};

use crate::error::GraphError;

/// Where a node is allowed to execute.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Placement {
    /// Always runs on the local executor.
    LocalOnly,
    /// May run on any live worker; falls back to local when none is live.
    #[default]
    RemoteEligible,
    /// Must run on this worker.
    Pinned(WorkerId),
}

/// One node as written in a graph spec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSpec {
    pub id: NodeId,
    pub op: OpKind,
    #[serde(default)]
    pub inputs: Vec<NodeId>,
    /// Declared output shape. Required for placeholders whose shape
    /// downstream nodes depend on; checked against inference otherwise.
    #[serde(default)]
    pub shape: Option<Shape>,
    #[serde(default)]
    pub placement: Placement,
}

impl NodeSpec {
    pub fn new(id: u64, op: OpKind) -> Self {
        Self {
            id: NodeId(id),
            op,
            inputs: Vec::new(),
            shape: None,
            placement: Placement::default(),
        }
    }

    pub fn inputs(mut self, inputs: impl IntoIterator<Item = u64>) -> Self {
        self.inputs = inputs.into_iter().map(NodeId).collect();
        self
    }

    pub fn shape(mut self, rows: usize, cols: usize) -> Self {
        self.shape = Some(Shape::new(rows, cols));
        self
    }

    pub fn placement(mut self, placement: Placement) -> Self {
        self.placement = placement;
        self
    }
}

/// A full graph submission: nodes plus the ids whose values are wanted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphSpec {
    pub nodes: Vec<NodeSpec>,
    #[serde(default)]
    pub outputs: Vec<NodeId>,
}

impl GraphSpec {
    pub fn new(nodes: Vec<NodeSpec>, outputs: impl IntoIterator<Item = u64>) -> Self {
        Self {
            nodes,
            outputs: outputs.into_iter().map(NodeId).collect(),
        }
    }

    pub fn from_json(json: &str) -> Result<Self, GraphError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_toml(toml_str: &str) -> Result<Self, GraphError> {
        Ok(toml::from_str(toml_str)?)
    }

    /// Load a spec file, choosing the format from the extension (`.toml`
    /// or anything else as JSON).
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, GraphError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Self::from_toml(&content),
            _ => Self::from_json(&content),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const DIAMOND_JSON: &str = r#"{
        "nodes": [
            {"id": 1, "op": {"placeholder": {"name": "x"}}, "shape": {"rows": 2, "cols": 2}},
            {"id": 2, "op": "relu", "inputs": [1], "placement": "local_only"},
            {"id": 3, "op": "neg", "inputs": [1], "placement": {"pinned": "w1"}},
            {"id": 4, "op": "add", "inputs": [2, 3]}
        ],
        "outputs": [4]
    }"#;

    #[test]
    fn parses_json_with_defaults() {
        let spec = GraphSpec::from_json(DIAMOND_JSON).unwrap();
        assert_eq!(spec.nodes.len(), 4);
        assert_eq!(spec.nodes[1].placement, Placement::LocalOnly);
        assert_eq!(spec.nodes[2].placement, Placement::Pinned(WorkerId::from("w1")));
        assert_eq!(spec.nodes[3].placement, Placement::RemoteEligible);
        assert_eq!(spec.outputs, vec![NodeId(4)]);
    }

    #[test]
    fn parses_toml() {
        let spec = GraphSpec::from_toml(
            r#"
            outputs = [2]

            [[nodes]]
            id = 1
            op = { constant = { value = { shape = { rows = 1, cols = 2 }, data = [1.0, -2.0] } } }

            [[nodes]]
            id = 2
            op = "relu"
            inputs = [1]
            "#,
        )
        .unwrap();
        assert_eq!(spec.nodes.len(), 2);
        assert_eq!(spec.nodes[1].op, OpKind::Relu);
    }

    #[test]
    fn from_file_picks_format_by_extension() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        file.write_all(DIAMOND_JSON.as_bytes()).unwrap();
        let spec = GraphSpec::from_file(file.path()).unwrap();
        assert_eq!(spec.outputs.len(), 1);
    }

    #[test]
    fn builder_helpers() {
        let node = NodeSpec::new(5, OpKind::MatMul)
            .inputs([1, 2])
            .shape(3, 4)
            .placement(Placement::LocalOnly);
        assert_eq!(node.inputs, vec![NodeId(1), NodeId(2)]);
        assert_eq!(node.shape, Some(Shape::new(3, 4)));
    }
}
