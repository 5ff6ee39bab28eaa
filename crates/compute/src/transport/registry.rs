use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use exgraf_bus::events::WorkerStatus;
use exgraf_core::WorkerId;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, warn};

use super::WorkerLoad;

/// Identity, load and liveness of one configured worker.
#[derive(Debug)]
pub struct WorkerHandle {
    id: WorkerId,
    load: AtomicUsize,
    live: AtomicBool,
    last_seen: Mutex<Instant>,
}

impl WorkerHandle {
    fn new(id: WorkerId) -> Self {
        Self {
            id,
            load: AtomicUsize::new(0),
            live: AtomicBool::new(true),
            last_seen: Mutex::new(Instant::now()),
        }
    }

    pub fn id(&self) -> &WorkerId {
        &self.id
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    pub fn load(&self) -> usize {
        self.load.load(Ordering::Acquire)
    }

    pub(crate) fn acquire(&self) {
        self.load.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn release(&self) {
        let _ = self
            .load
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    fn last_seen(&self) -> Instant {
        *self.last_seen.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn touch(&self) {
        *self.last_seen.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }
}

/// Point-in-time view of a worker for status endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerSnapshot {
    pub id: WorkerId,
    pub live: bool,
    pub in_flight: usize,
    pub last_seen_ms: u64,
}

/// The fixed set of workers a transport may dispatch to.
///
/// Workers start live. One that misses heartbeats for longer than the
/// timeout, or reports itself unhealthy, is marked dead until its next
/// healthy heartbeat.
#[derive(Debug)]
pub struct WorkerRegistry {
    workers: BTreeMap<WorkerId, Arc<WorkerHandle>>,
    heartbeat_timeout: Duration,
}

impl WorkerRegistry {
    pub fn new(ids: impl IntoIterator<Item = WorkerId>, heartbeat_timeout: Duration) -> Self {
        let workers = ids
            .into_iter()
            .map(|id| (id.clone(), Arc::new(WorkerHandle::new(id))))
            .collect();
        Self {
            workers,
            heartbeat_timeout,
        }
    }

    pub fn get(&self, id: &WorkerId) -> Option<&Arc<WorkerHandle>> {
        self.workers.get(id)
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Record a heartbeat. Returns `true` if it made the worker dead.
    pub fn heartbeat(&self, id: &WorkerId, status: WorkerStatus) -> bool {
        let Some(handle) = self.workers.get(id) else {
            warn!(worker = %id, "heartbeat from unconfigured worker");
            return false;
        };
        handle.touch();
        match status {
            WorkerStatus::Unhealthy => {
                let was_live = handle.live.swap(false, Ordering::AcqRel);
                if was_live {
                    info!(worker = %id, "worker reported unhealthy");
                }
                was_live
            }
            WorkerStatus::Healthy | WorkerStatus::Degraded => {
                if !handle.live.swap(true, Ordering::AcqRel) {
                    info!(worker = %id, "worker is live again");
                }
                false
            }
        }
    }

    /// Mark every live worker whose last heartbeat is older than the
    /// timeout as dead. Returns the workers that just died.
    pub fn sweep(&self) -> Vec<WorkerId> {
        let now = Instant::now();
        self.workers
            .values()
            .filter(|h| h.is_live() && now.duration_since(h.last_seen()) > self.heartbeat_timeout)
            .filter(|h| h.live.swap(false, Ordering::AcqRel))
            .map(|h| h.id.clone())
            .collect()
    }

    /// Force a worker dead. Returns `false` if it already was.
    pub fn mark_dead(&self, id: &WorkerId) -> bool {
        self.workers
            .get(id)
            .is_some_and(|h| h.live.swap(false, Ordering::AcqRel))
    }

    pub fn live_loads(&self) -> Vec<WorkerLoad> {
        self.workers
            .values()
            .filter(|h| h.is_live())
            .map(|h| WorkerLoad {
                worker: h.id.clone(),
                in_flight: h.load(),
            })
            .collect()
    }

    pub fn snapshot(&self) -> Vec<WorkerSnapshot> {
        let now = Instant::now();
        self.workers
            .values()
            .map(|h| WorkerSnapshot {
                id: h.id.clone(),
                live: h.is_live(),
                in_flight: h.load(),
                last_seen_ms: now.duration_since(h.last_seen()).as_millis() as u64,
            })
            .collect()
    }
}
