use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::runs::RunRetention;
use crate::scheduler::SchedulerConfig;

// ── Top-level config ────────────────────────────────────────────────

/// Full configuration of a coordinator process.
///
/// Parsed from `exgraf.toml`; every section is optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExgrafConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub transport: TransportConfig,

    /// Remote workers, in any order. Empty means local-only execution.
    #[serde(default)]
    pub workers: Vec<WorkerEndpoints>,

    #[serde(default)]
    pub server: ServerConfig,
}

// ── Section configs ─────────────────────────────────────────────────

/// Liveness and wire settings for remote workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// A worker silent for longer than this is considered dead.
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_ms: u64,

    /// How often heartbeat ages are checked.
    #[serde(default = "default_liveness_sweep")]
    pub liveness_sweep_ms: u64,

    /// Tensors of at least this many bytes travel over the bulk plane.
    #[serde(default = "default_bulk_threshold")]
    pub bulk_threshold_bytes: usize,

    /// Upper bound on one dispatch round trip, bulk transfers included.
    #[serde(default = "default_dispatch_timeout")]
    pub dispatch_timeout_ms: u64,
}

fn default_heartbeat_timeout() -> u64 {
    3_000
}

fn default_liveness_sweep() -> u64 {
    500
}

fn default_bulk_threshold() -> usize {
    64 * 1024
}

fn default_dispatch_timeout() -> u64 {
    60_000
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout_ms: default_heartbeat_timeout(),
            liveness_sweep_ms: default_liveness_sweep(),
            bulk_threshold_bytes: default_bulk_threshold(),
            dispatch_timeout_ms: default_dispatch_timeout(),
        }
    }
}

impl TransportConfig {
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn liveness_sweep(&self) -> Duration {
        Duration::from_millis(self.liveness_sweep_ms)
    }

    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_millis(self.dispatch_timeout_ms)
    }
}

/// Sockets of one remote worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerEndpoints {
    /// Must match the `worker_id` the worker puts in its heartbeats.
    pub id: String,

    /// ROUTER endpoint receiving dispatches.
    pub control: String,

    /// PUB endpoint emitting heartbeats.
    pub heartbeat: String,

    /// TCP endpoint of the bulk server.
    pub bulk: String,
}

/// HTTP tooling surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    /// PUB endpoint for run started/finished events. Unset disables them.
    #[serde(default)]
    pub events: Option<String>,

    /// File receiving run started/finished events as JSON lines.
    #[serde(default)]
    pub event_log: Option<PathBuf>,

    /// Finished runs kept for polling; the oldest are dropped beyond this.
    #[serde(default = "default_max_finished_runs")]
    pub max_finished_runs: usize,

    /// Finished runs are dropped this long after they end. 0 = never.
    #[serde(default = "default_finished_run_ttl")]
    pub finished_run_ttl_secs: u64,
}

fn default_port() -> u16 {
    8470
}

fn default_max_finished_runs() -> usize {
    1024
}

fn default_finished_run_ttl() -> u64 {
    3_600
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            events: None,
            event_log: None,
            max_finished_runs: default_max_finished_runs(),
            finished_run_ttl_secs: default_finished_run_ttl(),
        }
    }
}

impl ServerConfig {
    pub fn run_retention(&self) -> RunRetention {
        RunRetention {
            max_finished: self.max_finished_runs,
            ttl: (self.finished_run_ttl_secs > 0)
                .then(|| Duration::from_secs(self.finished_run_ttl_secs)),
        }
    }
}
