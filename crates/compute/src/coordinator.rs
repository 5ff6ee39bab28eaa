//! Top-level driver of a single run.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::Utc;
use exgraf_bus::events::{RunFinished, RunOutcome, RunStarted};
use exgraf_bus::{topics, EventPublisher, Message};
use exgraf_core::{NodeId, OpKind, Tensor};
use exgraf_graph::{Graph, GraphSpec};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::cancel::CancelToken;
use crate::error::RunError;
use crate::executor::LocalExecutor;
use crate::scheduler::{Outcome, RunMetrics, Scheduler, SchedulerConfig, Target};
use crate::store::ResultStore;
use crate::transport::WorkerTransport;

/// Outputs of a successful run, in the graph's output order.
#[derive(Debug, Clone)]
pub struct RunOutput {
    pub outputs: Vec<(NodeId, Tensor)>,
    pub metrics: RunMetrics,
    pub placements: BTreeMap<NodeId, Target>,
}

impl RunOutput {
    pub fn get(&self, node: NodeId) -> Option<&Tensor> {
        self.outputs.iter().find(|(id, _)| *id == node).map(|(_, t)| t)
    }
}

/// Owns the executor and transport shared by every run, and gives each
/// run its own [`Scheduler`] and [`ResultStore`].
pub struct Coordinator {
    executor: Arc<LocalExecutor>,
    transport: Option<Arc<dyn WorkerTransport>>,
    config: SchedulerConfig,
    publisher: Option<Arc<dyn EventPublisher>>,
}

impl Coordinator {
    /// Local-only coordinator on the CPU kernels.
    pub fn new(config: SchedulerConfig) -> Result<Self, RunError> {
        let executor = LocalExecutor::cpu(config.resolved_local_parallelism(), config.node_timeout())?;
        Ok(Self::with_executor(config, Arc::new(executor)))
    }

    pub fn with_executor(config: SchedulerConfig, executor: Arc<LocalExecutor>) -> Self {
        Self {
            executor,
            transport: None,
            config,
            publisher: None,
        }
    }

    /// Dispatch remote-eligible nodes through `transport`.
    pub fn with_transport(mut self, transport: Arc<dyn WorkerTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Publish run lifecycle events through `publisher`.
    pub fn with_publisher(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn transport(&self) -> Option<&Arc<dyn WorkerTransport>> {
        self.transport.as_ref()
    }

    /// Bind feeds to the placeholders the run needs, by placeholder name.
    ///
    /// Placeholders that feed no output are not required. A feed with a
    /// shape other than the placeholder's declared shape is rejected.
    pub fn resolve_feeds(
        graph: &Graph,
        feeds: &HashMap<String, Tensor>,
    ) -> Result<HashMap<NodeId, Tensor>, RunError> {
        let active = graph.output_ancestors();
        let mut bound = HashMap::new();
        for (idx, node) in graph.nodes().iter().enumerate() {
            let OpKind::Placeholder { name } = &node.op else {
                continue;
            };
            if !active[idx] {
                continue;
            }
            let value = feeds
                .get(name)
                .ok_or_else(|| RunError::MissingFeed(name.clone()))?;
            if let Some(expected) = node.shape {
                if value.shape() != expected {
                    return Err(RunError::FeedShapeMismatch {
                        name: name.clone(),
                        expected,
                        actual: value.shape(),
                    });
                }
            }
            bound.insert(node.id, value.clone());
        }
        Ok(bound)
    }

    /// Build, validate and execute a graph in one call.
    pub async fn run(
        &self,
        spec: GraphSpec,
        feeds: HashMap<String, Tensor>,
    ) -> Result<RunOutput, RunError> {
        let graph = Arc::new(Graph::build(spec)?);
        let feeds = Self::resolve_feeds(&graph, &feeds)?;
        self.execute(Uuid::new_v4(), graph, feeds, CancelToken::new())
            .await
    }

    /// Execute an already built graph with resolved feeds.
    pub async fn execute(
        &self,
        run_id: Uuid,
        graph: Arc<Graph>,
        feeds: HashMap<NodeId, Tensor>,
        cancel: CancelToken,
    ) -> Result<RunOutput, RunError> {
        self.publish(
            topics::RUN_STARTED,
            &Self::describe(run_id, &graph),
        )
        .await;

        let scheduler = Scheduler::new(
            Arc::clone(&graph),
            Arc::new(ResultStore::new()),
            Arc::clone(&self.executor),
            self.transport.clone(),
            self.config.clone(),
            cancel,
        );
        let report = scheduler.run(feeds).await;
        let metrics = report.metrics;

        let result = match report.outcome {
            Outcome::Completed(outputs) => Ok(RunOutput {
                outputs: outputs
                    .into_iter()
                    .map(|(id, v)| (id, Arc::unwrap_or_clone(v)))
                    .collect(),
                metrics: metrics.clone(),
                placements: report.placements,
            }),
            Outcome::Failed(failure) => Err(RunError::NodeFailed {
                node: failure.node,
                cause: failure.cause,
            }),
            Outcome::Cancelled => Err(RunError::Cancelled),
        };

        let outcome = match &result {
            Ok(_) => RunOutcome::Succeeded,
            Err(RunError::Cancelled) => RunOutcome::Cancelled,
            Err(_) => RunOutcome::Failed,
        };
        info!(run_id = %run_id, outcome = ?outcome, "run finished");
        self.publish(
            topics::RUN_FINISHED,
            &RunFinished {
                run_id,
                outcome,
                nodes_local: metrics.nodes_local,
                nodes_remote: metrics.nodes_remote,
                nodes_failed: metrics.nodes_failed,
                evictions: metrics.evictions,
                duration_ms: metrics.elapsed.as_millis() as u64,
                error: result.as_ref().err().map(ToString::to_string),
            },
        )
        .await;

        result
    }

    fn describe(run_id: Uuid, graph: &Graph) -> RunStarted {
        let mut ops = BTreeMap::new();
        let mut feeds = Vec::new();
        for node in graph.nodes() {
            *ops.entry(node.op.name().to_string()).or_insert(0) += 1;
            if let OpKind::Placeholder { name } = &node.op {
                feeds.push(name.clone());
            }
        }
        RunStarted {
            run_id,
            node_count: graph.len(),
            output_count: graph.outputs().len(),
            started_at: Utc::now(),
            ops,
            feeds,
        }
    }

    async fn publish<T: Serialize>(&self, topic: &str, payload: &T) {
        let Some(publisher) = &self.publisher else {
            return;
        };
        match Message::new(topic, payload) {
            Ok(msg) => {
                if let Err(e) = publisher.publish(msg).await {
                    warn!(error = %e, topic, "failed to publish run event");
                }
            }
            Err(e) => warn!(error = %e, topic, "failed to serialize run event"),
        }
    }
}
