use exgraf_core::{NodeId, NumericError, Shape};
use thiserror::Error;

/// Build-time graph validation failures. Fatal to that build attempt only.
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("duplicate node id {0}")]
    DuplicateNode(NodeId),

    #[error("node {node} references missing input {input}")]
    DanglingInput { node: NodeId, input: NodeId },

    #[error("cycle detected through {}", join_ids(.nodes))]
    CycleDetected { nodes: Vec<NodeId> },

    #[error("node {node} ({op}) expects {expected} input(s), got {actual}")]
    ArityMismatch {
        node: NodeId,
        op: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("node {node}: {source}")]
    ShapeMismatch {
        node: NodeId,
        #[source]
        source: NumericError,
    },

    #[error("node {node} declares shape {declared} but its inputs produce {inferred}")]
    DeclaredShapeConflict {
        node: NodeId,
        declared: Shape,
        inferred: Shape,
    },

    #[error("output {0} is not a node of the graph")]
    UnknownOutput(NodeId),

    #[error("graph spec parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("graph spec parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("graph spec I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn join_ids(ids: &[NodeId]) -> String {
    ids.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" -> ")
}
