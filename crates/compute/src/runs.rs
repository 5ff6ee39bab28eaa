//! Asynchronous run submission and polling.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use exgraf_core::{NodeId, Tensor};
use exgraf_graph::{Graph, GraphSpec};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

use crate::cancel::CancelToken;
use crate::coordinator::{Coordinator, RunOutput};
use crate::error::RunError;
use crate::scheduler::RunMetrics;

/// What went wrong, in a form fit for an API response.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureDescriptor {
    pub node: Option<NodeId>,
    pub kind: String,
    pub message: String,
}

impl From<&RunError> for FailureDescriptor {
    fn from(e: &RunError) -> Self {
        let node = match e {
            RunError::NodeFailed { node, .. } => Some(*node),
            _ => None,
        };
        Self {
            node,
            kind: e.kind().to_string(),
            message: e.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Succeeded {
        outputs: Vec<(NodeId, Tensor)>,
        metrics: RunMetrics,
    },
    Failed {
        error: FailureDescriptor,
    },
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }

    fn from_result(result: Result<RunOutput, RunError>) -> Self {
        match result {
            Ok(out) => Self::Succeeded {
                outputs: out.outputs,
                metrics: out.metrics,
            },
            Err(RunError::Cancelled) => Self::Cancelled,
            Err(e) => Self::Failed {
                error: FailureDescriptor::from(&e),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub id: Uuid,
    pub status: &'static str,
    pub submitted_at: DateTime<Utc>,
}

/// How long finished runs stay pollable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunRetention {
    /// Finished runs kept; the earliest finished are dropped first.
    pub max_finished: usize,
    /// Age after finishing at which a run is dropped. `None` = no limit.
    pub ttl: Option<Duration>,
}

impl Default for RunRetention {
    fn default() -> Self {
        Self {
            max_finished: 1024,
            ttl: Some(Duration::from_secs(3_600)),
        }
    }
}

struct RunEntry {
    status: RunStatus,
    cancel: CancelToken,
    submitted_at: DateTime<Utc>,
    finished_at: Option<Instant>,
}

type RunTable = HashMap<Uuid, RunEntry>;

/// Runs submitted through [`RunRegistry::submit_graph`], by id.
///
/// Running runs are always kept. Finished ones are pruned by the
/// [`RunRetention`] policy whenever a run is submitted, finishes or the
/// registry is listed.
#[derive(Clone)]
pub struct RunRegistry {
    coordinator: Arc<Coordinator>,
    runs: Arc<Mutex<RunTable>>,
    retention: RunRetention,
}

impl RunRegistry {
    pub fn new(coordinator: Arc<Coordinator>) -> Self {
        Self::with_retention(coordinator, RunRetention::default())
    }

    pub fn with_retention(coordinator: Arc<Coordinator>, retention: RunRetention) -> Self {
        Self {
            coordinator,
            runs: Arc::new(Mutex::new(HashMap::new())),
            retention,
        }
    }

    fn runs(&self) -> MutexGuard<'_, RunTable> {
        self.runs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drop finished runs past their TTL, then the earliest finished ones
    /// beyond the cap. Returns how many were dropped.
    fn prune(runs: &mut RunTable, retention: RunRetention) -> usize {
        let before = runs.len();
        if let Some(ttl) = retention.ttl {
            runs.retain(|_, e| e.finished_at.map_or(true, |t| t.elapsed() < ttl));
        }

        let mut finished: Vec<(Instant, Uuid)> = runs
            .iter()
            .filter_map(|(id, e)| e.finished_at.map(|t| (t, *id)))
            .collect();
        if finished.len() > retention.max_finished {
            finished.sort_unstable();
            let excess = finished.len() - retention.max_finished;
            for (_, id) in &finished[..excess] {
                runs.remove(id);
            }
        }

        let dropped = before - runs.len();
        if dropped > 0 {
            debug!(dropped, kept = runs.len(), "pruned finished runs");
        }
        dropped
    }

    /// Validate the graph and feeds, then start the run in the background.
    ///
    /// Graph and feed errors are returned here; everything that happens
    /// during execution is reported through [`RunRegistry::poll`].
    pub fn submit_graph(
        &self,
        spec: GraphSpec,
        feeds: HashMap<String, Tensor>,
    ) -> Result<Uuid, RunError> {
        let graph = Arc::new(Graph::build(spec)?);
        let feeds = Coordinator::resolve_feeds(&graph, &feeds)?;

        let id = Uuid::new_v4();
        let cancel = CancelToken::new();
        {
            let mut runs = self.runs();
            Self::prune(&mut runs, self.retention);
            runs.insert(
                id,
                RunEntry {
                    status: RunStatus::Running,
                    cancel: cancel.clone(),
                    submitted_at: Utc::now(),
                    finished_at: None,
                },
            );
        }
        info!(run_id = %id, nodes = graph.len(), "run submitted");

        let coordinator = Arc::clone(&self.coordinator);
        let runs = Arc::clone(&self.runs);
        let retention = self.retention;
        tokio::spawn(async move {
            let result = coordinator.execute(id, graph, feeds, cancel).await;
            let status = RunStatus::from_result(result);
            let mut runs = runs.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(entry) = runs.get_mut(&id) {
                entry.status = status;
                entry.finished_at = Some(Instant::now());
            }
            Self::prune(&mut runs, retention);
        });
        Ok(id)
    }

    /// Current status of a run, or `None` for an unknown id.
    pub fn poll(&self, id: Uuid) -> Option<RunStatus> {
        self.runs().get(&id).map(|e| e.status.clone())
    }

    /// Request cancellation. Returns `false` for an unknown or finished run.
    pub fn cancel(&self, id: Uuid) -> bool {
        let runs = self.runs();
        match runs.get(&id) {
            Some(entry) if !entry.status.is_terminal() => {
                debug!(run_id = %id, "cancelling run");
                entry.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    /// All retained runs, oldest first.
    pub fn list(&self) -> Vec<RunSummary> {
        let mut runs = self.runs();
        Self::prune(&mut runs, self.retention);
        let mut out: Vec<_> = runs
            .iter()
            .map(|(id, e)| RunSummary {
                id: *id,
                status: match e.status {
                    RunStatus::Running => "running",
                    RunStatus::Succeeded { .. } => "succeeded",
                    RunStatus::Failed { .. } => "failed",
                    RunStatus::Cancelled => "cancelled",
                },
                submitted_at: e.submitted_at,
            })
            .collect();
        drop(runs);
        out.sort_by_key(|s| s.submitted_at);
        out
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }
}
