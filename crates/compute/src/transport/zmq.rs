//! Worker transport over the messaging layer.
//!
//! Dispatches go out on a DEALER socket per worker and come back with the
//! same correlation id. Large inputs are parked on the worker's bulk
//! server first; large results are fetched from it afterwards. Heartbeats
//! from every worker arrive on a single SUB socket.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use exgraf_bus::dispatch::{DispatchReply, DispatchRequest, Payload};
use exgraf_bus::events::WorkerHealth;
use exgraf_bus::{
    topics, BulkClient, Endpoint, EventSubscriber, Message, RequestSender, ZmqRequestClient,
    ZmqSubscriber,
};
use exgraf_core::{Tensor, WorkerId};
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use super::{
    CorrelationToken, RemoteError, RemoteTask, TransportCore, TransportError, TransportEvent,
    WorkerLoad, WorkerRegistry, WorkerSnapshot, WorkerTransport,
};
use crate::config::{TransportConfig, WorkerEndpoints};

struct WorkerLink {
    control: ZmqRequestClient,
    bulk: BulkClient,
}

/// [`WorkerTransport`] backed by ZeroMQ control sockets and TCP bulk links.
pub struct ZmqWorkerTransport {
    core: Arc<TransportCore>,
    links: BTreeMap<WorkerId, Arc<WorkerLink>>,
    bulk_threshold: usize,
    dispatch_timeout: Duration,
    background: Vec<JoinHandle<()>>,
}

impl ZmqWorkerTransport {
    /// Connect to every configured worker and start the heartbeat listener
    /// and liveness sweeper.
    #[instrument(skip_all, fields(workers = workers.len()))]
    pub async fn connect(
        workers: &[WorkerEndpoints],
        config: &TransportConfig,
    ) -> Result<Self, TransportError> {
        let subscriber = ZmqSubscriber::new();
        let mut links = BTreeMap::new();
        for w in workers {
            let control = ZmqRequestClient::connect(&Endpoint::parse(&w.control)?).await?;
            let bulk = BulkClient::new(&Endpoint::parse(&w.bulk)?)?;
            subscriber
                .add_publisher(&Endpoint::parse(&w.heartbeat)?)
                .await?;
            links.insert(WorkerId::new(&w.id), Arc::new(WorkerLink { control, bulk }));
        }
        subscriber.subscribe(topics::WORKER_HEALTH).await?;

        let registry = WorkerRegistry::new(links.keys().cloned(), config.heartbeat_timeout());
        let core = Arc::new(TransportCore::new(registry));

        let listener = tokio::spawn(Self::heartbeat_loop(subscriber, Arc::clone(&core)));
        let sweeper = {
            let core = Arc::clone(&core);
            let period = config.liveness_sweep();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(period);
                loop {
                    interval.tick().await;
                    core.sweep();
                }
            })
        };
        info!(workers = links.len(), "worker transport connected");

        Ok(Self {
            core,
            links,
            bulk_threshold: config.bulk_threshold_bytes,
            dispatch_timeout: config.dispatch_timeout(),
            background: vec![listener, sweeper],
        })
    }

    async fn heartbeat_loop(subscriber: ZmqSubscriber, core: Arc<TransportCore>) {
        loop {
            let message = match subscriber.recv().await {
                Ok(m) => m,
                Err(e) => {
                    warn!(error = %e, "heartbeat receive failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            };
            let health: WorkerHealth = match message.decode() {
                Ok(h) => h,
                Err(e) => {
                    debug!(error = %e, "undecodable heartbeat");
                    continue;
                }
            };
            let worker = WorkerId::new(health.worker_id);
            if core.registry.heartbeat(&worker, health.status) {
                core.lose_worker(&worker);
            }
        }
    }

    pub fn snapshot(&self) -> Vec<WorkerSnapshot> {
        self.core.registry.snapshot()
    }

    /// One dispatch round trip, bulk transfers included. A round trip that
    /// fails in transit leaves blobs on the worker; those are taken back
    /// on a best-effort basis.
    async fn round_trip(
        link: &WorkerLink,
        token: CorrelationToken,
        task: RemoteTask,
        bulk_threshold: usize,
        timeout: Duration,
    ) -> Result<Tensor, RemoteError> {
        let mut parked = Vec::new();
        let outcome = Self::exchange(link, token, task, bulk_threshold, timeout, &mut parked).await;
        if let Err(RemoteError::Transport(_)) = &outcome {
            parked.push(format!("{token}-out"));
            for key in parked {
                if let Ok(Some(_)) = link.bulk.take(&key).await {
                    debug!(token = %token, key = %key, "discarded orphaned blob");
                }
            }
        }
        outcome
    }

    async fn exchange(
        link: &WorkerLink,
        token: CorrelationToken,
        task: RemoteTask,
        bulk_threshold: usize,
        timeout: Duration,
        parked: &mut Vec<String>,
    ) -> Result<Tensor, RemoteError> {
        let transport = |e: exgraf_bus::BusError| RemoteError::Transport(e.to_string());

        let mut inputs = Vec::with_capacity(task.inputs.len());
        for (i, value) in task.inputs.iter().enumerate() {
            if value.byte_len() < bulk_threshold {
                inputs.push(Payload::Inline(value.as_ref().clone()));
                continue;
            }
            let key = format!("{token}-{i}");
            let bytes = rmp_serde::to_vec(value.as_ref())
                .map_err(|e| RemoteError::Transport(e.to_string()))?;
            let len = bytes.len();
            parked.push(key.clone());
            link.bulk.put(&key, bytes).await.map_err(transport)?;
            debug!(token = %token, key = %key, len, "input sent over bulk plane");
            inputs.push(Payload::Bulk { key, len });
        }

        let request = DispatchRequest {
            node: task.node,
            op: task.op,
            inputs,
        };
        let message =
            Message::with_correlation(topics::DISPATCH, &request, token).map_err(transport)?;
        let reply = link
            .control
            .request(message, timeout)
            .await
            .map_err(transport)?;
        let reply: DispatchReply = reply.decode().map_err(transport)?;

        match reply.outcome {
            Err(message) => Err(RemoteError::Execution(message)),
            Ok(Payload::Inline(value)) => Ok(value),
            Ok(Payload::Bulk { key, .. }) => {
                let bytes = link
                    .bulk
                    .take(&key)
                    .await
                    .map_err(transport)?
                    .ok_or_else(|| RemoteError::Transport(format!("result blob {key} missing")))?;
                rmp_serde::from_slice(&bytes).map_err(|e| RemoteError::Transport(e.to_string()))
            }
        }
    }
}

impl Drop for ZmqWorkerTransport {
    fn drop(&mut self) {
        for task in &self.background {
            task.abort();
        }
    }
}

#[async_trait]
impl WorkerTransport for ZmqWorkerTransport {
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
        let link = self
            .links
            .get(worker)
            .cloned()
            .ok_or_else(|| TransportError::UnknownWorker(worker.clone()))?;
        let token = self.core.begin(worker, task.node, reply_to)?;

        let core = Arc::clone(&self.core);
        let (threshold, timeout) = (self.bulk_threshold, self.dispatch_timeout);
        let handle = tokio::spawn(async move {
            let outcome = Self::round_trip(&link, token, task, threshold, timeout).await;
            if let Err(e) = &outcome {
                debug!(token = %token, error = %e, "dispatch round trip failed");
            }
            core.finish(token, outcome);
        });
        self.core.in_flight.set_abort(token, handle.abort_handle());
        Ok(token)
    }
}
