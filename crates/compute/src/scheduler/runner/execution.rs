use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use exgraf_core::{NodeId, Tensor};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::scheduler::state::ExecutionState;
use crate::scheduler::types::FailureCause;
use crate::store::StoreError;
use crate::transport::{RemoteError, TransportEvent};

use super::core::{LocalDone, NodeFailure, Outcome, RunReport};
use super::Scheduler;

impl Scheduler {
    /// Run the graph to quiescence.
    ///
    /// `feeds` binds placeholder nodes to their values. The loop ends when
    /// nothing is in flight and nothing more can be dispatched: every
    /// scheduled node is terminal, or the run was cancelled and in-flight
    /// work has drained.
    pub async fn run(mut self, feeds: HashMap<NodeId, Tensor>) -> RunReport {
        let started = Instant::now();
        let scheduled = self.active.iter().filter(|&&a| a).count();
        info!(nodes = scheduled, outputs = self.graph.outputs().len(), "run started");

        self.seed(feeds);
        loop {
            let cancelled = self.cancel.is_cancelled();
            if !cancelled {
                self.dispatch_ready().await;
            }
            if self.in_flight() == 0 && (cancelled || self.ready.is_empty()) {
                break;
            }

            let waiting = !cancelled && !self.ready.is_empty();
            let tick = self.config.admission_tick();
            tokio::select! {
                Some(done) = self.local_rx.recv() => self.on_local_done(done),
                Some(event) = self.remote_rx.recv() => self.on_transport_event(event),
                _ = self.cancel.cancelled(), if !cancelled => {
                    info!(in_flight = self.in_flight(), "cancellation requested, draining");
                }
                _ = tokio::time::sleep(tick), if waiting => {}
            }
        }

        self.into_report(started)
    }

    fn on_local_done(&mut self, done: LocalDone) {
        let LocalDone { idx, result } = done;
        self.local_in_flight = self.local_in_flight.saturating_sub(1);
        if self.state[idx] != ExecutionState::Dispatched {
            self.metrics.duplicates_ignored += 1;
            return;
        }
        match result {
            Ok(value) => {
                self.metrics.nodes_local += 1;
                self.record(idx);
                self.complete(idx, Arc::new(value));
            }
            Err(e) => self.fail(idx, e.into()),
        }
    }

    fn on_transport_event(&mut self, event: TransportEvent) {
        let token = event.token();
        let Some(idx) = self.tokens.remove(&token) else {
            debug!(token = %token, "ignoring completion for unknown token");
            self.metrics.duplicates_ignored += 1;
            return;
        };
        if self.state[idx] != ExecutionState::Dispatched {
            self.metrics.duplicates_ignored += 1;
            return;
        }
        match event {
            TransportEvent::Completed {
                outcome: Ok(value), ..
            } => {
                self.metrics.nodes_remote += 1;
                self.record(idx);
                self.complete(idx, Arc::new(value));
            }
            TransportEvent::Completed {
                outcome: Err(RemoteError::Execution(message)),
                worker,
                ..
            } => self.fail(idx, FailureCause::Remote { worker, message }),
            TransportEvent::Completed {
                outcome: Err(RemoteError::Transport(message)),
                worker,
                ..
            } => self.fail(idx, FailureCause::Dispatch { worker, message }),
            TransportEvent::Lost { worker, .. } => self.fail(idx, FailureCause::WorkerLost(worker)),
        }
    }

    fn record(&mut self, idx: usize) {
        let elapsed = self.started_at[idx]
            .map(|t| t.elapsed())
            .unwrap_or_default();
        let node = self.graph.node(idx);
        debug!(node = %node.id, elapsed = ?elapsed, "node done");
        self.metrics.record_execution(node.op.name(), elapsed);
    }

    /// Store a node's value, release its inputs and wake its dependents.
    pub(super) fn complete(&mut self, idx: usize, value: Arc<Tensor>) {
        let graph = Arc::clone(&self.graph);
        let id = graph.node(idx).id;
        let consumers = graph
            .dependents(idx)
            .iter()
            .filter(|&&d| self.active[d] && self.state[d] != ExecutionState::Failed)
            .count();

        if let Err(e) = self.store.put(id, value, consumers, graph.is_output(idx)) {
            return self.fail(idx, e.into());
        }
        self.state[idx] = ExecutionState::Done;
        self.release_inputs(idx);

        for &d in graph.dependents(idx) {
            if !self.active[d] || self.state[d] != ExecutionState::Pending {
                continue;
            }
            self.unmet[d] -= 1;
            if self.unmet[d] == 0 {
                self.mark_ready(d);
            }
        }
    }

    /// Record a root failure and fail everything downstream of it.
    pub(super) fn fail(&mut self, idx: usize, cause: FailureCause) {
        let id = self.id(idx);
        warn!(node = %id, error = %cause, "node failed");
        self.mark_failed(idx);
        self.root_failures.push((idx, cause));

        for d in self.graph.downstream(idx) {
            if self.active[d]
                && matches!(self.state[d], ExecutionState::Pending | ExecutionState::Ready)
            {
                self.mark_failed(d);
            }
        }
    }

    fn mark_failed(&mut self, idx: usize) {
        self.state[idx] = ExecutionState::Failed;
        self.metrics.nodes_failed += 1;
        self.release_inputs(idx);
    }

    /// Give back one read of every `Done` input, once per edge.
    fn release_inputs(&mut self, idx: usize) {
        let graph = Arc::clone(&self.graph);
        for &i in graph.inputs(idx) {
            if self.state[i] != ExecutionState::Done {
                continue;
            }
            if let Err(e) = self.store.release(graph.node(i).id) {
                warn!(node = %graph.node(i).id, error = %e, "release of input failed");
            }
        }
    }

    fn into_report(mut self, started: Instant) -> RunReport {
        self.metrics.elapsed = started.elapsed();
        self.metrics.evictions = self.store.evictions();

        let all_done = self.graph.outputs().iter().all(|id| {
            self.graph
                .index_of(*id)
                .is_some_and(|i| self.state[i] == ExecutionState::Done)
        });

        let outcome = if all_done {
            let collected: Result<Vec<_>, _> = self
                .graph
                .outputs()
                .iter()
                .map(|&id| self.store.get(id).map(|v| (id, v)))
                .collect();
            match collected {
                Ok(outputs) => Outcome::Completed(outputs),
                Err(e) => Outcome::Failed(NodeFailure {
                    node: e.node(),
                    cause: e.into(),
                }),
            }
        } else if self.cancel.is_cancelled() {
            Outcome::Cancelled
        } else {
            match self
                .root_failures
                .iter()
                .min_by_key(|(idx, _)| self.graph.rank(*idx))
            {
                Some((idx, cause)) => Outcome::Failed(NodeFailure {
                    node: self.id(*idx),
                    cause: cause.clone(),
                }),
                None => {
                    let node = self
                        .graph
                        .outputs()
                        .iter()
                        .copied()
                        .find(|id| self.store.get(*id).is_err())
                        .unwrap_or(NodeId(0));
                    Outcome::Failed(NodeFailure {
                        node,
                        cause: StoreError::NotReady(node).into(),
                    })
                }
            }
        };

        let label = match &outcome {
            Outcome::Completed(_) => "succeeded",
            Outcome::Failed(_) => "failed",
            Outcome::Cancelled => "cancelled",
        };
        info!(
            outcome = label,
            local = self.metrics.nodes_local,
            remote = self.metrics.nodes_remote,
            failed = self.metrics.nodes_failed,
            evictions = self.metrics.evictions,
            elapsed = ?self.metrics.elapsed,
            "run finished"
        );

        let states: BTreeMap<NodeId, ExecutionState> = self
            .graph
            .nodes()
            .iter()
            .enumerate()
            .filter(|(i, _)| self.active[*i])
            .map(|(i, n)| (n.id, self.state[i]))
            .collect();

        RunReport {
            outcome,
            metrics: self.metrics,
            states,
            placements: self.placements,
        }
    }
}
