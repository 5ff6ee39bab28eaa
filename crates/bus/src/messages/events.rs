//! Event payloads published via PUB/SUB.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Self-reported worker condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Healthy,
    Degraded,
    /// Going down; coordinators treat this as an immediate loss.
    Unhealthy,
}

/// Periodic heartbeat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerHealth {
    /// Unique identifier for the worker.
    pub worker_id: String,
    pub status: WorkerStatus,
    /// Dispatches currently executing on the worker.
    #[serde(default)]
    pub in_flight: usize,
}

/// Emitted when a run starts executing. Describes what the graph is made
/// of so subscribers can label the metrics that follow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStarted {
    pub run_id: Uuid,
    pub node_count: usize,
    pub output_count: usize,
    pub started_at: DateTime<Utc>,
    /// Node count per operation name.
    #[serde(default)]
    pub ops: BTreeMap<String, usize>,
    /// Placeholder names the run is fed through.
    #[serde(default)]
    pub feeds: Vec<String>,
}

/// Terminal state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Succeeded,
    Failed,
    Cancelled,
}

/// Emitted when a run reaches a terminal state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunFinished {
    pub run_id: Uuid,
    pub outcome: RunOutcome,
    /// Nodes executed on the coordinator's pool.
    pub nodes_local: u64,
    /// Nodes executed on remote workers.
    pub nodes_remote: u64,
    pub nodes_failed: u64,
    /// Intermediate results released before the run ended.
    pub evictions: u64,
    pub duration_ms: u64,
    /// Failure descriptor, when `outcome` is `Failed`.
    #[serde(default)]
    pub error: Option<String>,
}
