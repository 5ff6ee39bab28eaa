use exgraf_core::{NodeId, Shape};
use exgraf_graph::GraphError;
use thiserror::Error;

use crate::executor::ExecutionError;
use crate::scheduler::FailureCause;

/// Why a run produced no outputs.
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error("no feed supplied for placeholder '{0}'")]
    MissingFeed(String),

    #[error("feed '{name}' has shape {actual} but the placeholder expects {expected}")]
    FeedShapeMismatch {
        name: String,
        expected: Shape,
        actual: Shape,
    },

    #[error("node {node} failed: {cause}")]
    NodeFailed { node: NodeId, cause: FailureCause },

    #[error("run cancelled")]
    Cancelled,

    #[error("executor setup failed: {0}")]
    Executor(#[from] ExecutionError),
}

impl RunError {
    /// Short machine-readable kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Graph(GraphError::CycleDetected { .. }) => "cycle_detected",
            Self::Graph(GraphError::DanglingInput { .. }) => "dangling_input",
            Self::Graph(_) => "invalid_graph",
            Self::MissingFeed(_) => "missing_feed",
            Self::FeedShapeMismatch { .. } => "feed_shape_mismatch",
            Self::NodeFailed { cause, .. } => cause.kind(),
            Self::Cancelled => "cancelled",
            Self::Executor(_) => "executor",
        }
    }
}
