//! Coordinator and run registry: feed binding, error mapping, lifecycle
//! events, and submit/poll/cancel.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use exgraf_bus::events::{RunFinished, RunOutcome, RunStarted};
use exgraf_bus::{topics, BusError, EventPublisher, Message};
use exgraf_compute::{
    Coordinator, CpuKernels, Kernels, LocalExecutor, RunError, RunRegistry, RunRetention,
    RunStatus, SchedulerConfig,
};
use exgraf_core::{NodeId, NumericError, OpKind, Shape, Tensor};
use exgraf_graph::{GraphSpec, NodeSpec};

fn coordinator() -> Coordinator {
    Coordinator::new(SchedulerConfig::default()).unwrap()
}

/// y = relu(x · w) summed per row.
fn linear() -> GraphSpec {
    GraphSpec::new(
        vec![
            NodeSpec::new(1, OpKind::Placeholder { name: "x".into() }).shape(2, 2),
            NodeSpec::new(
                2,
                OpKind::Constant {
                    value: Tensor::from_rows(&[&[1.0, 0.0], &[0.0, -1.0]]).unwrap(),
                },
            ),
            NodeSpec::new(3, OpKind::MatMul).inputs([1, 2]),
            NodeSpec::new(4, OpKind::Relu).inputs([3]),
            NodeSpec::new(5, OpKind::Sum { axis: Some(1) }).inputs([4]),
        ],
        [5],
    )
}

fn x() -> Tensor {
    Tensor::from_rows(&[&[1.0, 2.0], &[3.0, -4.0]]).unwrap()
}

#[tokio::test]
async fn runs_graph_with_feeds() {
    let out = coordinator()
        .run(linear(), HashMap::from([("x".to_string(), x())]))
        .await
        .unwrap();
    // x·w = [[1, -2], [3, 4]] → relu → row sums
    let y = out.get(NodeId(5)).unwrap();
    assert_eq!(y.shape(), Shape::new(2, 1));
    assert_eq!(y.data(), &[1.0, 7.0]);
    assert_eq!(out.metrics.nodes_local, 3);
}

#[tokio::test]
async fn missing_feed_is_rejected_before_running() {
    let err = coordinator().run(linear(), HashMap::new()).await.unwrap_err();
    assert!(matches!(err, RunError::MissingFeed(ref name) if name == "x"));
    assert_eq!(err.kind(), "missing_feed");
}

#[tokio::test]
async fn feed_shape_must_match_declaration() {
    let feeds = HashMap::from([("x".to_string(), Tensor::zeros(Shape::new(3, 2)))]);
    let err = coordinator().run(linear(), feeds).await.unwrap_err();
    match err {
        RunError::FeedShapeMismatch {
            name,
            expected,
            actual,
        } => {
            assert_eq!(name, "x");
            assert_eq!(expected, Shape::new(2, 2));
            assert_eq!(actual, Shape::new(3, 2));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn placeholders_outside_output_cone_need_no_feed() {
    let mut spec = linear();
    spec.nodes
        .push(NodeSpec::new(9, OpKind::Placeholder { name: "unused".into() }).shape(1, 1));
    let out = coordinator()
        .run(spec, HashMap::from([("x".to_string(), x())]))
        .await
        .unwrap();
    assert_eq!(out.outputs.len(), 1);
}

#[tokio::test]
async fn cycle_is_a_graph_error() {
    let spec = GraphSpec::new(
        vec![
            NodeSpec::new(1, OpKind::Relu).inputs([2]),
            NodeSpec::new(2, OpKind::Neg).inputs([1]),
        ],
        [2],
    );
    let err = coordinator().run(spec, HashMap::new()).await.unwrap_err();
    assert!(matches!(err, RunError::Graph(_)));
    assert_eq!(err.kind(), "cycle_detected");
}

struct FailingLog;

impl Kernels for FailingLog {
    fn apply(&self, op: &OpKind, inputs: &[&Tensor]) -> Result<Tensor, NumericError> {
        match op {
            OpKind::Log => Err(NumericError::NonFinite { op: "log" }),
            _ => CpuKernels.apply(op, inputs),
        }
    }
}

#[tokio::test]
async fn node_failure_names_the_node() {
    let executor = Arc::new(LocalExecutor::new(1, None, Arc::new(FailingLog)).unwrap());
    let coordinator = Coordinator::with_executor(SchedulerConfig::default(), executor);
    let spec = GraphSpec::new(
        vec![
            NodeSpec::new(1, OpKind::Constant { value: Tensor::scalar(2.0) }),
            NodeSpec::new(2, OpKind::Log).inputs([1]),
            NodeSpec::new(3, OpKind::Neg).inputs([2]),
        ],
        [3],
    );
    let err = coordinator.run(spec, HashMap::new()).await.unwrap_err();
    assert!(matches!(err, RunError::NodeFailed { node: NodeId(2), .. }));
    assert_eq!(err.kind(), "numeric");
}

#[derive(Default)]
struct Recorder {
    messages: Mutex<Vec<Message>>,
}

#[async_trait]
impl EventPublisher for Recorder {
    async fn publish(&self, message: Message) -> Result<(), BusError> {
        self.messages.lock().unwrap().push(message);
        Ok(())
    }
}

#[tokio::test]
async fn lifecycle_events_are_published() {
    let recorder = Arc::new(Recorder::default());
    let coordinator = coordinator().with_publisher(recorder.clone());
    coordinator
        .run(linear(), HashMap::from([("x".to_string(), x())]))
        .await
        .unwrap();

    let messages = recorder.messages.lock().unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].topic, topics::RUN_STARTED);
    assert_eq!(messages[1].topic, topics::RUN_FINISHED);

    let started: RunStarted = messages[0].decode().unwrap();
    let finished: RunFinished = messages[1].decode().unwrap();
    assert_eq!(started.run_id, finished.run_id);
    assert_eq!(started.node_count, 5);
    assert_eq!(started.ops.get("matmul"), Some(&1));
    assert_eq!(started.ops.values().sum::<usize>(), 5);
    assert_eq!(started.feeds, vec!["x".to_string()]);
    assert_eq!(finished.outcome, RunOutcome::Succeeded);
    assert_eq!(finished.nodes_local, 3);
    assert!(finished.error.is_none());
}

// ── registry ────────────────────────────────────────────────────────

struct Slow;

impl Kernels for Slow {
    fn apply(&self, op: &OpKind, inputs: &[&Tensor]) -> Result<Tensor, NumericError> {
        std::thread::sleep(Duration::from_millis(100));
        CpuKernels.apply(op, inputs)
    }
}

fn chain(len: u64) -> GraphSpec {
    let mut nodes = vec![NodeSpec::new(1, OpKind::Constant { value: Tensor::scalar(1.0) })];
    for id in 2..=len {
        nodes.push(NodeSpec::new(id, OpKind::Neg).inputs([id - 1]));
    }
    GraphSpec::new(nodes, [len])
}

async fn wait_terminal(registry: &RunRegistry, id: uuid::Uuid) -> RunStatus {
    for _ in 0..200 {
        let status = registry.poll(id).unwrap();
        if status.is_terminal() {
            return status;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("run {id} never finished");
}

#[tokio::test]
async fn submit_then_poll_to_success() {
    let registry = RunRegistry::new(Arc::new(coordinator()));
    let id = registry.submit_graph(chain(4), HashMap::new()).unwrap();
    assert!(registry.poll(id).is_some());

    match wait_terminal(&registry, id).await {
        RunStatus::Succeeded { outputs, metrics } => {
            assert_eq!(outputs, vec![(NodeId(4), Tensor::scalar(-1.0))]);
            assert_eq!(metrics.nodes_local, 3);
        }
        other => panic!("unexpected status {other:?}"),
    }
    assert!(!registry.cancel(id));
    assert_eq!(registry.list().len(), 1);
    assert_eq!(registry.list()[0].status, "succeeded");
}

#[tokio::test]
async fn submit_rejects_bad_input_synchronously() {
    let registry = RunRegistry::new(Arc::new(coordinator()));
    let err = registry.submit_graph(linear(), HashMap::new()).unwrap_err();
    assert!(matches!(err, RunError::MissingFeed(_)));
    assert!(registry.list().is_empty());
}

#[tokio::test]
async fn cancel_running_submission() {
    let executor = Arc::new(LocalExecutor::new(1, None, Arc::new(Slow)).unwrap());
    let coordinator = Coordinator::with_executor(SchedulerConfig::default(), executor);
    let registry = RunRegistry::new(Arc::new(coordinator));

    let id = registry.submit_graph(chain(20), HashMap::new()).unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(registry.cancel(id));
    assert!(matches!(wait_terminal(&registry, id).await, RunStatus::Cancelled));
}

#[tokio::test]
async fn unknown_run_is_none() {
    let registry = RunRegistry::new(Arc::new(coordinator()));
    assert!(registry.poll(uuid::Uuid::new_v4()).is_none());
    assert!(!registry.cancel(uuid::Uuid::new_v4()));
}

#[tokio::test]
async fn oldest_finished_runs_are_dropped_beyond_the_cap() {
    let retention = RunRetention {
        max_finished: 2,
        ttl: None,
    };
    let registry = RunRegistry::with_retention(Arc::new(coordinator()), retention);

    let mut ids = Vec::new();
    for _ in 0..4 {
        let id = registry.submit_graph(chain(3), HashMap::new()).unwrap();
        wait_terminal(&registry, id).await;
        ids.push(id);
    }

    assert!(registry.poll(ids[0]).is_none());
    assert!(registry.poll(ids[1]).is_none());
    assert!(registry.poll(ids[2]).is_some());
    assert!(registry.poll(ids[3]).is_some());
    let listed: Vec<_> = registry.list().into_iter().map(|s| s.id).collect();
    assert_eq!(listed, vec![ids[2], ids[3]]);
}

#[tokio::test]
async fn finished_runs_expire_but_running_ones_stay() {
    let retention = RunRetention {
        max_finished: 16,
        ttl: Some(Duration::from_millis(50)),
    };
    let executor = Arc::new(LocalExecutor::new(1, None, Arc::new(Slow)).unwrap());
    let coordinator = Coordinator::with_executor(SchedulerConfig::default(), executor);
    let registry = RunRegistry::with_retention(Arc::new(coordinator), retention);

    let quick = registry
        .submit_graph(
            GraphSpec::new(
                vec![NodeSpec::new(1, OpKind::Constant { value: Tensor::scalar(2.0) })],
                [1],
            ),
            HashMap::new(),
        )
        .unwrap();
    wait_terminal(&registry, quick).await;
    let slow = registry.submit_graph(chain(40), HashMap::new()).unwrap();

    tokio::time::sleep(Duration::from_millis(120)).await;
    let listed: Vec<_> = registry.list().into_iter().map(|s| s.id).collect();
    assert_eq!(listed, vec![slow]);
    assert!(registry.poll(quick).is_none());
    assert!(matches!(registry.poll(slow), Some(RunStatus::Running)));
    assert!(registry.cancel(slow));
}

#[tokio::test]
async fn concurrent_runs_share_the_executor_without_false_timeouts() {
    let executor = Arc::new(
        LocalExecutor::new(1, Some(Duration::from_millis(150)), Arc::new(Slow)).unwrap(),
    );
    let coordinator = Arc::new(Coordinator::with_executor(SchedulerConfig::default(), executor));

    let a = {
        let coordinator = Arc::clone(&coordinator);
        tokio::spawn(async move { coordinator.run(chain(3), HashMap::new()).await })
    };
    let b = {
        let coordinator = Arc::clone(&coordinator);
        tokio::spawn(async move { coordinator.run(chain(3), HashMap::new()).await })
    };
    for run in [a, b] {
        let out = run.await.unwrap().expect("100ms kernels fit a 150ms budget");
        assert_eq!(out.get(NodeId(3)), Some(&Tensor::scalar(1.0)));
    }
}
