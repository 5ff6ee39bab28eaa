//! Remote dispatch of nodes to workers.
//!
//! - `registry`: worker handles, load counters and heartbeat liveness
//! - `inflight`: correlation-token table giving at-most-once completion
//! - `zmq`: ZeroMQ control plane plus TCP bulk plane
//! - `loopback`: in-process simulated workers with the same contract

mod inflight;
pub mod loopback;
pub mod registry;
pub mod zmq;

use std::sync::Arc;

use async_trait::async_trait;
use exgraf_bus::BusError;
use exgraf_core::{NodeId, OpKind, Tensor, WorkerId};
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};
use uuid::Uuid;

pub use self::inflight::InFlight;
pub use self::loopback::{LoopbackConfig, LoopbackTransport, LoopbackWorker};
pub use self::registry::{WorkerRegistry, WorkerSnapshot};
pub use self::zmq::ZmqWorkerTransport;

/// Links one dispatch to its eventual result.
pub type CorrelationToken = Uuid;

/// Node descriptor plus resolved input values, as sent to a worker.
#[derive(Debug, Clone)]
pub struct RemoteTask {
    pub node: NodeId,
    pub op: OpKind,
    pub inputs: Vec<Arc<Tensor>>,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum RemoteError {
    /// The worker ran the kernel and it failed.
    #[error("{0}")]
    Execution(String),

    /// The request or its reply never made it.
    #[error("transport failure: {0}")]
    Transport(String),
}

/// Delivered into the scheduler's event queue.
#[derive(Debug)]
pub enum TransportEvent {
    Completed {
        token: CorrelationToken,
        node: NodeId,
        worker: WorkerId,
        outcome: Result<Tensor, RemoteError>,
    },
    /// The worker stopped heartbeating while this dispatch was in flight.
    Lost {
        token: CorrelationToken,
        node: NodeId,
        worker: WorkerId,
    },
}

impl TransportEvent {
    pub fn token(&self) -> CorrelationToken {
        match self {
            Self::Completed { token, .. } | Self::Lost { token, .. } => *token,
        }
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("worker {0} is not live")]
    WorkerUnavailable(WorkerId),

    #[error("unknown worker {0}")]
    UnknownWorker(WorkerId),

    #[error(transparent)]
    Bus(#[from] BusError),

    #[error("codec error: {0}")]
    Codec(String),
}

/// Current load of one live worker, for placement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerLoad {
    pub worker: WorkerId,
    pub in_flight: usize,
}

/// Sends nodes to remote workers and reports their results.
///
/// `dispatch` returns as soon as the request is handed off. Exactly one
/// [`TransportEvent`] per returned token is delivered on `reply_to`: the
/// result, or `Lost` if the worker dies first. Duplicate replies are
/// filtered before they reach `reply_to`.
#[async_trait]
pub trait WorkerTransport: Send + Sync {
    /// Live workers with their dispatched-node counts, ordered by id.
    fn live_workers(&self) -> Vec<WorkerLoad>;

    fn is_live(&self, worker: &WorkerId) -> bool;

    async fn dispatch(
        &self,
        worker: &WorkerId,
        task: RemoteTask,
        reply_to: UnboundedSender<TransportEvent>,
    ) -> Result<CorrelationToken, TransportError>;
}

/// Registry and token table shared by every transport implementation.
pub(crate) struct TransportCore {
    pub registry: WorkerRegistry,
    pub in_flight: InFlight,
}

impl TransportCore {
    pub fn new(registry: WorkerRegistry) -> Self {
        Self {
            registry,
            in_flight: InFlight::default(),
        }
    }

    /// Reserve a token and count it against `worker`'s load.
    pub fn begin(
        &self,
        worker: &WorkerId,
        node: NodeId,
        reply_to: UnboundedSender<TransportEvent>,
    ) -> Result<CorrelationToken, TransportError> {
        let handle = self
            .registry
            .get(worker)
            .ok_or_else(|| TransportError::UnknownWorker(worker.clone()))?;
        if !handle.is_live() {
            return Err(TransportError::WorkerUnavailable(worker.clone()));
        }
        let token = Uuid::new_v4();
        handle.acquire();
        self.in_flight.insert(token, node, worker.clone(), reply_to);
        Ok(token)
    }

    /// Deliver a result for `token`. Returns `false` for a token that is
    /// not in flight (duplicate or late reply), which is dropped.
    pub fn finish(&self, token: CorrelationToken, outcome: Result<Tensor, RemoteError>) -> bool {
        let Some(entry) = self.in_flight.remove(token) else {
            debug!(token = %token, "dropping reply for unknown token");
            return false;
        };
        if let Some(handle) = self.registry.get(&entry.worker) {
            handle.release();
        }
        let event = TransportEvent::Completed {
            token,
            node: entry.node,
            worker: entry.worker,
            outcome,
        };
        if entry.reply_to.send(event).is_err() {
            debug!(token = %token, "run no longer listening");
        }
        true
    }

    /// Mark workers with stale heartbeats dead and fail their dispatches.
    pub fn sweep(&self) {
        for worker in self.registry.sweep() {
            self.lose_worker(&worker);
        }
    }

    pub fn lose_worker(&self, worker: &WorkerId) {
        let lost = self.in_flight.drain_worker(worker);
        warn!(worker = %worker, in_flight = lost.len(), "worker lost");
        if let Some(handle) = self.registry.get(worker) {
            for _ in &lost {
                handle.release();
            }
        }
        for (token, entry) in lost {
            if let Some(abort) = entry.abort {
                abort.abort();
            }
            let _ = entry.reply_to.send(TransportEvent::Lost {
                token,
                node: entry.node,
                worker: entry.worker,
            });
        }
    }
}
