use std::time::Duration;

use exgraf_core::WorkerId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::executor::ExecutionError;
use crate::store::StoreError;

/// Scheduler configuration, typically parsed from TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Local executor threads, also the local in-flight cap. 0 = host parallelism.
    #[serde(default = "default_local_parallelism")]
    pub local_parallelism: usize,
    /// Dispatched nodes allowed per remote worker.
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight_per_worker: usize,
    /// Per-node kernel timeout on the local executor. 0 = none.
    #[serde(default = "default_node_timeout")]
    pub node_timeout_ms: u64,
    /// Retry delay for ready nodes held back by back-pressure.
    #[serde(default = "default_admission_tick")]
    pub admission_tick_ms: u64,
}

fn default_local_parallelism() -> usize { 0 }
fn default_max_in_flight() -> usize { 4 }
fn default_node_timeout() -> u64 { 0 }
fn default_admission_tick() -> u64 { 5 }

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            local_parallelism: default_local_parallelism(),
            max_in_flight_per_worker: default_max_in_flight(),
            node_timeout_ms: default_node_timeout(),
            admission_tick_ms: default_admission_tick(),
        }
    }
}

impl SchedulerConfig {
    /// Get the effective local parallelism (resolves 0 to available cores).
    pub fn resolved_local_parallelism(&self) -> usize {
        if self.local_parallelism == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        } else {
            self.local_parallelism
        }
    }

    pub fn node_timeout(&self) -> Option<Duration> {
        (self.node_timeout_ms > 0).then(|| Duration::from_millis(self.node_timeout_ms))
    }

    pub fn admission_tick(&self) -> Duration {
        Duration::from_millis(self.admission_tick_ms.max(1))
    }
}

/// Where a node was sent.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Target {
    Local,
    Remote(WorkerId),
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local => f.write_str("local"),
            Self::Remote(w) => write!(f, "remote:{w}"),
        }
    }
}

/// Why a node failed. Downstream nodes inherit the failure without a
/// cause of their own.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum FailureCause {
    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error("worker {0} was lost")]
    WorkerLost(WorkerId),

    #[error("worker {worker} failed: {message}")]
    Remote { worker: WorkerId, message: String },

    #[error("dispatch to {worker} failed: {message}")]
    Dispatch { worker: WorkerId, message: String },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("no value fed for placeholder '{0}'")]
    MissingFeed(String),
}

impl FailureCause {
    /// Short machine-readable kind, used in failure descriptors.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Execution(ExecutionError::Numeric(_)) => "numeric",
            Self::Execution(ExecutionError::Timeout { .. }) => "execution_timeout",
            Self::Execution(ExecutionError::Panicked { .. }) => "panicked",
            Self::Execution(ExecutionError::Pool(_)) => "pool",
            Self::WorkerLost(_) => "worker_lost",
            Self::Remote { .. } => "remote",
            Self::Dispatch { .. } => "dispatch",
            Self::Store(_) => "store",
            Self::MissingFeed(_) => "missing_feed",
        }
    }
}
