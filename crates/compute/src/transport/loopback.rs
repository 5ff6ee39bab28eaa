//! In-process workers speaking the [`WorkerTransport`] contract.
//!
//! Each simulated worker executes kernels on the blocking pool, heartbeats
//! into the shared registry while alive, and can be killed, revived,
//! slowed down or told to deliver every result twice.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use exgraf_bus::events::WorkerStatus;
use exgraf_core::WorkerId;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::{
    CorrelationToken, RemoteError, RemoteTask, TransportCore, TransportError, TransportEvent,
    WorkerLoad, WorkerRegistry, WorkerSnapshot, WorkerTransport,
};
use crate::kernels::Kernels;

/// Timing of simulated heartbeats and liveness sweeps.
#[derive(Debug, Clone)]
pub struct LoopbackConfig {
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub sweep_interval: Duration,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(20),
            heartbeat_timeout: Duration::from_millis(100),
            sweep_interval: Duration::from_millis(20),
        }
    }
}

/// Behaviour knobs of one simulated worker.
#[derive(Debug)]
pub struct LoopbackWorker {
    id: WorkerId,
    alive: AtomicBool,
    duplicate_replies: AtomicBool,
    latency_ms: AtomicU64,
    executed: AtomicUsize,
}

impl LoopbackWorker {
    fn new(id: WorkerId) -> Self {
        Self {
            id,
            alive: AtomicBool::new(true),
            duplicate_replies: AtomicBool::new(false),
            latency_ms: AtomicU64::new(0),
            executed: AtomicUsize::new(0),
        }
    }

    pub fn id(&self) -> &WorkerId {
        &self.id
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Nodes this worker has finished executing.
    pub fn executed(&self) -> usize {
        self.executed.load(Ordering::Acquire)
    }

    fn latency(&self) -> Duration {
        Duration::from_millis(self.latency_ms.load(Ordering::Acquire))
    }
}

pub struct LoopbackTransport {
    core: Arc<TransportCore>,
    workers: BTreeMap<WorkerId, Arc<LoopbackWorker>>,
    kernels: Arc<dyn Kernels>,
    background: Vec<JoinHandle<()>>,
}

impl LoopbackTransport {
    /// Start simulated workers. Must be called inside a tokio runtime.
    pub fn new(
        ids: impl IntoIterator<Item = WorkerId>,
        config: LoopbackConfig,
        kernels: Arc<dyn Kernels>,
    ) -> Self {
        let workers: BTreeMap<WorkerId, Arc<LoopbackWorker>> = ids
            .into_iter()
            .map(|id| (id.clone(), Arc::new(LoopbackWorker::new(id))))
            .collect();
        let registry = WorkerRegistry::new(workers.keys().cloned(), config.heartbeat_timeout);
        let core = Arc::new(TransportCore::new(registry));

        let heartbeat = {
            let core = Arc::clone(&core);
            let workers: Vec<_> = workers.values().cloned().collect();
            let period = config.heartbeat_interval;
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(period);
                loop {
                    interval.tick().await;
                    for w in workers.iter().filter(|w| w.is_alive()) {
                        core.registry.heartbeat(&w.id, WorkerStatus::Healthy);
                    }
                }
            })
        };
        let sweeper = {
            let core = Arc::clone(&core);
            let period = config.sweep_interval;
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(period);
                loop {
                    interval.tick().await;
                    core.sweep();
                }
            })
        };

        Self {
            core,
            workers,
            kernels,
            background: vec![heartbeat, sweeper],
        }
    }

    pub fn worker(&self, id: &str) -> Option<&Arc<LoopbackWorker>> {
        self.workers.get(&WorkerId::new(id))
    }

    /// Stop heartbeating and answering. In-flight dispatches are reported
    /// lost once the liveness sweep notices.
    pub fn kill(&self, id: &str) {
        if let Some(w) = self.worker(id) {
            info!(worker = %w.id, "killing loopback worker");
            w.alive.store(false, Ordering::Release);
        }
    }

    pub fn revive(&self, id: &str) {
        if let Some(w) = self.worker(id) {
            w.alive.store(true, Ordering::Release);
            self.core.registry.heartbeat(&w.id, WorkerStatus::Healthy);
        }
    }

    pub fn set_latency(&self, id: &str, latency: Duration) {
        if let Some(w) = self.worker(id) {
            w.latency_ms.store(latency.as_millis() as u64, Ordering::Release);
        }
    }

    /// Deliver every result twice, once through the token table and once
    /// straight to the scheduler.
    pub fn set_duplicate_replies(&self, id: &str, on: bool) {
        if let Some(w) = self.worker(id) {
            w.duplicate_replies.store(on, Ordering::Release);
        }
    }

    pub fn snapshot(&self) -> Vec<WorkerSnapshot> {
        self.core.registry.snapshot()
    }

    /// Dispatches still awaiting a result.
    pub fn in_flight(&self) -> usize {
        self.core.in_flight.len()
    }

    async fn execute(
        core: Arc<TransportCore>,
        worker: Arc<LoopbackWorker>,
        kernels: Arc<dyn Kernels>,
        token: CorrelationToken,
        task: RemoteTask,
        reply_to: UnboundedSender<TransportEvent>,
    ) {
        let latency = worker.latency();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if !worker.is_alive() {
            debug!(worker = %worker.id, token = %token, "dead worker drops dispatch");
            return;
        }

        let RemoteTask { node, op, inputs } = task;
        let computed = tokio::task::spawn_blocking(move || {
            let refs: Vec<_> = inputs.iter().map(Arc::as_ref).collect();
            kernels.apply(&op, &refs)
        })
        .await;
        if !worker.is_alive() {
            return;
        }
        let outcome = match computed {
            Ok(result) => result.map_err(|e| RemoteError::Execution(e.to_string())),
            Err(e) => Err(RemoteError::Execution(e.to_string())),
        };
        worker.executed.fetch_add(1, Ordering::AcqRel);

        if worker.duplicate_replies.load(Ordering::Acquire) {
            let _ = reply_to.send(TransportEvent::Completed {
                token,
                node,
                worker: worker.id.clone(),
                outcome: outcome.clone(),
            });
            core.finish(token, outcome.clone());
            core.finish(token, outcome);
        } else {
            core.finish(token, outcome);
        }
    }
}

impl Drop for LoopbackTransport {
    fn drop(&mut self) {
        for task in &self.background {
            task.abort();
        }
    }
}

#[async_trait]
impl WorkerTransport for LoopbackTransport {
    fn live_workers(&self) -> Vec<WorkerLoad> {
        self.core.registry.live_loads()
    }

    fn is_live(&self, worker: &WorkerId) -> bool {
        self.core.registry.get(worker).is_some_and(|h| h.is_live())
    }

    async fn dispatch(
        &self,
        worker: &WorkerId,
        task: RemoteTask,
        reply_to: UnboundedSender<TransportEvent>,
    ) -> Result<CorrelationToken, TransportError> {
        let sim = self
            .workers
            .get(worker)
            .cloned()
            .ok_or_else(|| TransportError::UnknownWorker(worker.clone()))?;
        let token = self.core.begin(worker, task.node, reply_to.clone())?;
        let handle = tokio::spawn(Self::execute(
            Arc::clone(&self.core),
            sim,
            Arc::clone(&self.kernels),
            token,
            task,
            reply_to,
        ));
        self.core.in_flight.set_abort(token, handle.abort_handle());
        Ok(token)
    }
}
