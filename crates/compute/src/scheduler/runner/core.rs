use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap};
use std::sync::Arc;

use exgraf_core::{NodeId, Tensor};
use exgraf_graph::Graph;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::cancel::CancelToken;
use crate::executor::{ExecutionError, LocalExecutor};
use crate::scheduler::metrics::RunMetrics;
use crate::scheduler::state::ExecutionState;
use crate::scheduler::types::{FailureCause, SchedulerConfig, Target};
use crate::store::ResultStore;
use crate::transport::{CorrelationToken, TransportEvent, WorkerTransport};

/// A local kernel finished.
pub(super) struct LocalDone {
    pub idx: usize,
    pub result: Result<Tensor, ExecutionError>,
}

/// The failure a run reports: the earliest failed node in topological order.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeFailure {
    pub node: NodeId,
    pub cause: FailureCause,
}

#[derive(Debug, Clone)]
pub enum Outcome {
    /// Output values, in the graph's output order.
    Completed(Vec<(NodeId, Arc<Tensor>)>),
    Failed(NodeFailure),
    Cancelled,
}

/// Everything a finished run leaves behind.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub outcome: Outcome,
    pub metrics: RunMetrics,
    /// Final state of every node scheduled in this run.
    pub states: BTreeMap<NodeId, ExecutionState>,
    /// Where each executed node ran.
    pub placements: BTreeMap<NodeId, Target>,
}

/// Drives one run of a graph to completion.
///
/// Every field is owned by the event loop; kernels and remote calls run
/// elsewhere and report back through the two channels.
pub struct Scheduler {
    pub(super) graph: Arc<Graph>,
    pub(super) store: Arc<ResultStore>,
    pub(super) executor: Arc<LocalExecutor>,
    pub(super) transport: Option<Arc<dyn WorkerTransport>>,
    pub(super) config: SchedulerConfig,
    pub(super) cancel: CancelToken,
    /// Local in-flight cap.
    pub(super) parallelism: usize,

    pub(super) state: Vec<ExecutionState>,
    /// Node is an output or an ancestor of one.
    pub(super) active: Vec<bool>,
    /// Input edges whose producer is not yet `Done`.
    pub(super) unmet: Vec<usize>,
    /// Ready nodes, lowest topological rank first.
    pub(super) ready: BinaryHeap<Reverse<(usize, usize)>>,
    pub(super) local_in_flight: usize,
    /// Outstanding remote dispatches.
    pub(super) tokens: HashMap<CorrelationToken, usize>,
    pub(super) placements: BTreeMap<NodeId, Target>,
    pub(super) started_at: Vec<Option<Instant>>,
    /// Nodes that failed on their own, as opposed to by propagation.
    pub(super) root_failures: Vec<(usize, FailureCause)>,
    pub(super) metrics: RunMetrics,

    pub(super) local_tx: mpsc::UnboundedSender<LocalDone>,
    pub(super) local_rx: mpsc::UnboundedReceiver<LocalDone>,
    pub(super) remote_tx: mpsc::UnboundedSender<TransportEvent>,
    pub(super) remote_rx: mpsc::UnboundedReceiver<TransportEvent>,
}

impl Scheduler {
    pub fn new(
        graph: Arc<Graph>,
        store: Arc<ResultStore>,
        executor: Arc<LocalExecutor>,
        transport: Option<Arc<dyn WorkerTransport>>,
        config: SchedulerConfig,
        cancel: CancelToken,
    ) -> Self {
        let n = graph.len();
        let parallelism = executor.parallelism();
        let (local_tx, local_rx) = mpsc::unbounded_channel();
        let (remote_tx, remote_rx) = mpsc::unbounded_channel();
        let active = graph.output_ancestors();
        Self {
            graph,
            store,
            executor,
            transport,
            config,
            cancel,
            parallelism,
            state: vec![ExecutionState::Pending; n],
            active,
            unmet: vec![0; n],
            ready: BinaryHeap::new(),
            local_in_flight: 0,
            tokens: HashMap::new(),
            placements: BTreeMap::new(),
            started_at: vec![None; n],
            root_failures: Vec::new(),
            metrics: RunMetrics::default(),
            local_tx,
            local_rx,
            remote_tx,
            remote_rx,
        }
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    /// Current state of a node, `None` for ids outside the graph.
    pub fn state_of(&self, id: NodeId) -> Option<ExecutionState> {
        self.graph.index_of(id).map(|i| self.state[i])
    }

    pub(super) fn in_flight(&self) -> usize {
        self.local_in_flight + self.tokens.len()
    }

    pub(super) fn id(&self, idx: usize) -> NodeId {
        self.graph.node(idx).id
    }
}
