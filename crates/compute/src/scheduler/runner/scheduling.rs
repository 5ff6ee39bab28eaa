use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::Arc;

use exgraf_core::{NodeId, OpKind, Tensor, WorkerId};
use exgraf_graph::Placement;
use tokio::time::Instant;
use tracing::debug;

use crate::executor::ExecSlot;
use crate::scheduler::state::ExecutionState;
use crate::scheduler::types::{FailureCause, Target};
use crate::store::StoreError;
use crate::transport::{RemoteTask, TransportError};

use super::core::LocalDone;
use super::Scheduler;

/// Placement decision for one ready node.
enum Decision {
    Local(ExecSlot),
    Remote(WorkerId),
    /// Every eligible executor is at its cap.
    Blocked,
    Fail(FailureCause),
}

/// What became of a remote hand-off.
enum Handoff {
    Sent,
    /// The worker died between placement and dispatch; place again later.
    Retry,
    Failed,
}

impl Scheduler {
    /// Count unmet input edges and settle every source node.
    pub(crate) fn seed(&mut self, mut feeds: HashMap<NodeId, Tensor>) {
        let graph = Arc::clone(&self.graph);
        let order: Vec<usize> = {
            let mut topo = graph.topological_order();
            std::iter::from_fn(|| topo.next_index()).collect()
        };
        for &idx in &order {
            if self.active[idx] {
                self.unmet[idx] = graph.inputs(idx).len();
            }
        }

        for idx in order {
            if !self.active[idx]
                || self.unmet[idx] > 0
                || self.state[idx] != ExecutionState::Pending
            {
                continue;
            }
            let node = graph.node(idx);
            match &node.op {
                OpKind::Constant { value } => {
                    let value = Arc::new(value.clone());
                    self.complete(idx, value);
                }
                OpKind::Placeholder { name } => match feeds.remove(&node.id) {
                    Some(value) => self.complete(idx, Arc::new(value)),
                    None => {
                        let cause = FailureCause::MissingFeed(name.clone());
                        self.fail(idx, cause);
                    }
                },
                _ => self.mark_ready(idx),
            }
        }
    }

    pub(super) fn mark_ready(&mut self, idx: usize) {
        self.state[idx] = ExecutionState::Ready;
        self.ready.push(Reverse((self.graph.rank(idx), idx)));
    }

    /// Hand every ready node that has a free slot to an executor.
    pub(super) async fn dispatch_ready(&mut self) {
        let mut deferred = Vec::new();
        while let Some(Reverse((rank, idx))) = self.ready.pop() {
            if self.state[idx] != ExecutionState::Ready {
                continue;
            }
            if self.cancel.is_cancelled() {
                deferred.push(Reverse((rank, idx)));
                break;
            }
            match self.place(idx) {
                Decision::Local(slot) => self.spawn_local(idx, slot),
                Decision::Remote(worker) => {
                    if let Handoff::Retry = self.send_remote(idx, worker).await {
                        deferred.push(Reverse((rank, idx)));
                    }
                }
                Decision::Blocked => deferred.push(Reverse((rank, idx))),
                Decision::Fail(cause) => self.fail(idx, cause),
            }
        }
        self.ready.extend(deferred);
    }

    /// A local slot, if this run is under its cap and the shared executor
    /// has a thread free.
    fn local_slot(&self) -> Option<ExecSlot> {
        if self.local_in_flight >= self.parallelism {
            return None;
        }
        self.executor.try_reserve()
    }

    fn place(&mut self, idx: usize) -> Decision {
        let cap = self.config.max_in_flight_per_worker;

        match &self.graph.node(idx).placement {
            Placement::LocalOnly => self.local_slot().map_or(Decision::Blocked, Decision::Local),
            Placement::Pinned(worker) => {
                let Some(transport) = &self.transport else {
                    return Decision::Fail(FailureCause::WorkerLost(worker.clone()));
                };
                match transport.live_workers().into_iter().find(|l| &l.worker == worker) {
                    None => Decision::Fail(FailureCause::WorkerLost(worker.clone())),
                    Some(load) if load.in_flight < cap => Decision::Remote(worker.clone()),
                    Some(_) => Decision::Blocked,
                }
            }
            Placement::RemoteEligible => {
                let live = self
                    .transport
                    .as_ref()
                    .map(|t| t.live_workers())
                    .unwrap_or_default();
                if live.is_empty() {
                    return match self.local_slot() {
                        Some(slot) => {
                            self.metrics.local_fallbacks += 1;
                            Decision::Local(slot)
                        }
                        None => Decision::Blocked,
                    };
                }
                live.into_iter()
                    .filter(|l| l.in_flight < cap)
                    .min_by(|a, b| (a.in_flight, &a.worker).cmp(&(b.in_flight, &b.worker)))
                    .map_or(Decision::Blocked, |l| Decision::Remote(l.worker))
            }
        }
    }

    fn resolve_inputs(&self, idx: usize) -> Result<Vec<Arc<Tensor>>, StoreError> {
        self.graph
            .inputs(idx)
            .iter()
            .map(|&i| self.store.get(self.id(i)))
            .collect()
    }

    fn spawn_local(&mut self, idx: usize, slot: ExecSlot) {
        let inputs = match self.resolve_inputs(idx) {
            Ok(inputs) => inputs,
            Err(e) => return self.fail(idx, e.into()),
        };
        let node = self.graph.node(idx);
        let (id, op) = (node.id, node.op.clone());
        debug!(node = %id, op = op.name(), placement = "local", "node dispatched");

        self.state[idx] = ExecutionState::Dispatched;
        self.local_in_flight += 1;
        self.placements.insert(id, Target::Local);
        self.started_at[idx] = Some(Instant::now());

        let executor = Arc::clone(&self.executor);
        let done = self.local_tx.clone();
        tokio::spawn(async move {
            let result = executor.execute_in(slot, id, op, inputs).await;
            let _ = done.send(LocalDone { idx, result });
        });
    }

    async fn send_remote(&mut self, idx: usize, worker: WorkerId) -> Handoff {
        let Some(transport) = self.transport.clone() else {
            self.fail(idx, FailureCause::WorkerLost(worker));
            return Handoff::Failed;
        };
        let inputs = match self.resolve_inputs(idx) {
            Ok(inputs) => inputs,
            Err(e) => {
                self.fail(idx, e.into());
                return Handoff::Failed;
            }
        };
        let node = self.graph.node(idx);
        let task = RemoteTask {
            node: node.id,
            op: node.op.clone(),
            inputs,
        };
        let (id, op_name) = (node.id, node.op.name());

        match transport.dispatch(&worker, task, self.remote_tx.clone()).await {
            Ok(token) => {
                debug!(node = %id, op = op_name, worker = %worker, token = %token, "node dispatched");
                self.tokens.insert(token, idx);
                self.state[idx] = ExecutionState::Dispatched;
                self.placements.insert(id, Target::Remote(worker));
                self.started_at[idx] = Some(Instant::now());
                Handoff::Sent
            }
            Err(TransportError::WorkerUnavailable(_)) => {
                debug!(node = %id, worker = %worker, "worker went away before dispatch");
                Handoff::Retry
            }
            Err(e) => {
                let message = e.to_string();
                self.fail(idx, FailureCause::Dispatch { worker, message });
                Handoff::Failed
            }
        }
    }
}
