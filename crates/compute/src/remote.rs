//! Worker side of the dispatch protocol.
//!
//! A worker process binds a ROUTER control socket and a bulk server that
//! share one [`BlobStore`]. Each request is executed on its own task so a
//! slow kernel never blocks the socket.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use exgraf_bus::dispatch::{DispatchReply, DispatchRequest, Payload};
use exgraf_bus::{topics, BlobStore, Message, RequestHandler, ZmqRequestServer};
use exgraf_core::{NodeId, OpKind, Tensor};
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::executor::LocalExecutor;

/// Executes dispatched nodes on a local executor.
pub struct WorkerService {
    executor: Arc<LocalExecutor>,
    blobs: BlobStore,
    bulk_threshold: usize,
    in_flight: Arc<AtomicUsize>,
}

impl WorkerService {
    pub fn new(executor: Arc<LocalExecutor>, blobs: BlobStore, bulk_threshold: usize) -> Self {
        Self {
            executor,
            blobs,
            bulk_threshold,
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Gauge of requests being executed, reported in heartbeats.
    pub fn load_gauge(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.in_flight)
    }

    fn resolve(&self, payload: Payload) -> Result<Arc<Tensor>, String> {
        match payload {
            Payload::Inline(value) => Ok(Arc::new(value)),
            Payload::Bulk { key, .. } => {
                let bytes = self
                    .blobs
                    .take(&key)
                    .ok_or_else(|| format!("input blob {key} not found"))?;
                rmp_serde::from_slice(&bytes)
                    .map(Arc::new)
                    .map_err(|e| format!("input blob {key}: {e}"))
            }
        }
    }

    async fn compute(
        &self,
        correlation_id: Uuid,
        node: NodeId,
        op: OpKind,
        inputs: Vec<Payload>,
    ) -> Result<Payload, String> {
        // Resolve every input before checking for errors so no parked blob
        // outlives a failed request.
        let resolved: Vec<_> = inputs.into_iter().map(|p| self.resolve(p)).collect();
        let inputs = resolved.into_iter().collect::<Result<Vec<_>, _>>()?;
        let value = self
            .executor
            .execute(node, op, inputs)
            .await
            .map_err(|e| e.to_string())?;
        if value.byte_len() < self.bulk_threshold {
            return Ok(Payload::Inline(value));
        }
        let bytes = rmp_serde::to_vec(&value).map_err(|e| e.to_string())?;
        let key = format!("{correlation_id}-out");
        let len = bytes.len();
        self.blobs.put(key.clone(), bytes);
        Ok(Payload::Bulk { key, len })
    }

    /// Execute one request. Failures come back inside the reply.
    pub async fn handle(&self, correlation_id: Uuid, request: DispatchRequest) -> DispatchReply {
        let DispatchRequest { node, op, inputs } = request;
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        let outcome = self.compute(correlation_id, node, op, inputs).await;
        self.in_flight.fetch_sub(1, Ordering::Relaxed);

        if let Err(e) = &outcome {
            debug!(node = %node, error = %e, "dispatched node failed");
        }
        DispatchReply { node, outcome }
    }

    /// Answer requests from `server` until `shutdown` is notified.
    pub async fn serve(self: Arc<Self>, server: Arc<ZmqRequestServer>, shutdown: Arc<Notify>) {
        info!("worker service accepting dispatches");
        loop {
            tokio::select! {
                received = server.recv_request() => {
                    let (token, message) = match received {
                        Ok(r) => r,
                        Err(e) => {
                            warn!(error = %e, "receive failed, service stopping");
                            break;
                        }
                    };
                    let request: DispatchRequest = match message.decode() {
                        Ok(r) => r,
                        Err(e) => {
                            warn!(error = %e, correlation_id = %message.correlation_id, "undecodable dispatch, skipping");
                            continue;
                        }
                    };
                    let service = Arc::clone(&self);
                    let server = Arc::clone(&server);
                    tokio::spawn(async move {
                        let reply = service.handle(message.correlation_id, request).await;
                        match Message::reply(&message, topics::DISPATCH_REPLY, &reply) {
                            Ok(out) => {
                                if let Err(e) = server.send_reply(token, out).await {
                                    warn!(error = %e, "failed to send dispatch reply");
                                }
                            }
                            Err(e) => warn!(error = %e, "failed to encode dispatch reply"),
                        }
                    });
                }
                _ = shutdown.notified() => {
                    info!("worker service shutting down");
                    break;
                }
            }
        }
    }
}
