//! Node dispatch messages exchanged over DEALER/ROUTER.
//!
//! Small tensors travel inline in the control message. Tensors at or above
//! the bulk threshold are stored on the peer's bulk server first and only
//! referenced by key here.

use exgraf_core::{NodeId, OpKind, Tensor};
use serde::{Deserialize, Serialize};

/// A tensor value, either inline or parked on the receiver's bulk store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Payload {
    Inline(Tensor),
    /// Key in the peer's blob store plus the encoded length in bytes.
    Bulk { key: String, len: usize },
}

impl Payload {
    pub fn as_inline(&self) -> Option<&Tensor> {
        match self {
            Self::Inline(t) => Some(t),
            Self::Bulk { .. } => None,
        }
    }
}

/// Execute `op` for `node` over `inputs` (in declared order).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchRequest {
    pub node: NodeId,
    pub op: OpKind,
    pub inputs: Vec<Payload>,
}

/// Worker outcome for one dispatch. `Err` carries the worker-side
/// numeric failure rendered as text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchReply {
    pub node: NodeId,
    pub outcome: Result<Payload, String>,
}
