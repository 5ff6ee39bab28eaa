use serde::Serialize;

/// Per-node lifecycle within one run.
///
/// `Pending -> Ready` when every input is `Done`; `Ready -> Dispatched`
/// on placement; `Dispatched -> Done | Failed` on completion. Nodes
/// downstream of a failure go straight from `Pending`/`Ready` to `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    Pending,
    Ready,
    Dispatched,
    Done,
    Failed,
}

impl ExecutionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}
