//! Scheduler runs against in-process workers: placement, worker loss and
//! duplicate delivery.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use exgraf_compute::scheduler::{ExecutionState, FailureCause, Outcome, RunReport, Scheduler};
use exgraf_compute::{
    CancelToken, CpuKernels, LocalExecutor, LoopbackConfig, LoopbackTransport, ResultStore,
    SchedulerConfig, Target, WorkerTransport,
};
use exgraf_core::{NodeId, OpKind, Tensor, WorkerId};
use exgraf_graph::{Graph, GraphSpec, NodeSpec, Placement};

fn loopback(ids: &[&str]) -> Arc<LoopbackTransport> {
    Arc::new(LoopbackTransport::new(
        ids.iter().map(|w| WorkerId::new(*w)),
        LoopbackConfig::default(),
        Arc::new(CpuKernels),
    ))
}

fn source() -> NodeSpec {
    NodeSpec::new(
        1,
        OpKind::Constant {
            value: Tensor::from_rows(&[&[1.0, -2.0, 3.0]]).unwrap(),
        },
    )
}

/// Constant source fanning out to `ops`, one leaf output each (ids 2..).
fn fan_out(ops: Vec<(OpKind, Placement)>) -> GraphSpec {
    let mut nodes = vec![source()];
    let mut outputs = Vec::new();
    for (i, (op, placement)) in ops.into_iter().enumerate() {
        let id = i as u64 + 2;
        nodes.push(NodeSpec::new(id, op).inputs([1]).placement(placement));
        outputs.push(id);
    }
    GraphSpec::new(nodes, outputs)
}

async fn run(
    spec: GraphSpec,
    transport: Arc<LoopbackTransport>,
    config: SchedulerConfig,
) -> RunReport {
    let graph = Arc::new(Graph::build(spec).unwrap());
    let executor = Arc::new(LocalExecutor::cpu(2, None).unwrap());
    let transport: Arc<dyn WorkerTransport> = transport;
    let scheduler = Scheduler::new(
        graph,
        Arc::new(ResultStore::new()),
        executor,
        Some(transport),
        config,
        CancelToken::new(),
    );
    tokio::time::timeout(Duration::from_secs(10), scheduler.run(HashMap::new()))
        .await
        .expect("run hung")
}

#[tokio::test]
async fn no_live_workers_falls_back_to_local() {
    let transport = loopback(&[]);
    let spec = fan_out(vec![
        (OpKind::Relu, Placement::RemoteEligible),
        (OpKind::Neg, Placement::RemoteEligible),
        (OpKind::Softmax, Placement::RemoteEligible),
    ]);
    let report = run(spec, transport, SchedulerConfig::default()).await;

    assert!(matches!(report.outcome, Outcome::Completed(ref o) if o.len() == 3));
    assert_eq!(report.metrics.local_fallbacks, 3);
    assert_eq!(report.metrics.nodes_local, 3);
    assert_eq!(report.metrics.nodes_remote, 0);
}

#[tokio::test]
async fn idle_workers_share_ready_nodes_by_load_then_id() {
    let transport = loopback(&["w1", "w2", "w3"]);
    for w in ["w1", "w2", "w3"] {
        transport.set_latency(w, Duration::from_millis(50));
    }
    let spec = fan_out(vec![
        (OpKind::Relu, Placement::RemoteEligible),
        (OpKind::Neg, Placement::RemoteEligible),
        (OpKind::Softmax, Placement::RemoteEligible),
    ]);
    let report = run(spec, transport.clone(), SchedulerConfig::default()).await;

    assert!(matches!(report.outcome, Outcome::Completed(_)));
    let used: BTreeSet<_> = report.placements.values().cloned().collect();
    let expected: BTreeSet<_> = ["w1", "w2", "w3"]
        .into_iter()
        .map(|w| Target::Remote(WorkerId::new(w)))
        .collect();
    assert_eq!(used, expected);
    for w in ["w1", "w2", "w3"] {
        assert_eq!(transport.worker(w).unwrap().executed(), 1);
    }
    assert_eq!(transport.in_flight(), 0);
}

#[tokio::test]
async fn per_worker_cap_queues_excess_nodes() {
    let transport = loopback(&["w1"]);
    transport.set_latency("w1", Duration::from_millis(20));
    let spec = fan_out(vec![
        (OpKind::Relu, Placement::RemoteEligible),
        (OpKind::Neg, Placement::RemoteEligible),
        (OpKind::Softmax, Placement::RemoteEligible),
        (OpKind::Sum { axis: None }, Placement::RemoteEligible),
    ]);
    let config = SchedulerConfig {
        max_in_flight_per_worker: 1,
        ..SchedulerConfig::default()
    };
    let report = run(spec, transport.clone(), config).await;

    assert!(matches!(report.outcome, Outcome::Completed(ref o) if o.len() == 4));
    assert_eq!(report.metrics.nodes_remote, 4);
    assert_eq!(transport.worker("w1").unwrap().executed(), 4);
    assert!(report
        .placements
        .values()
        .all(|t| *t == Target::Remote(WorkerId::new("w1"))));
}

#[tokio::test]
async fn mixed_placements_are_honoured() {
    let transport = loopback(&["w1", "w2"]);
    let spec = fan_out(vec![
        (OpKind::Relu, Placement::LocalOnly),
        (OpKind::Neg, Placement::Pinned(WorkerId::new("w2"))),
        (OpKind::Softmax, Placement::RemoteEligible),
    ]);
    let report = run(spec, transport, SchedulerConfig::default()).await;

    let Outcome::Completed(outputs) = &report.outcome else {
        panic!("run did not complete: {:?}", report.outcome);
    };
    let negated = outputs.iter().find(|(id, _)| *id == NodeId(3)).unwrap();
    assert_eq!(negated.1.data(), &[-1.0, 2.0, -3.0]);
    assert_eq!(report.placements[&NodeId(2)], Target::Local);
    assert_eq!(report.placements[&NodeId(3)], Target::Remote(WorkerId::new("w2")));
    assert!(matches!(report.placements[&NodeId(4)], Target::Remote(_)));
}

#[tokio::test]
async fn killed_worker_fails_its_node_and_spares_the_rest() {
    let transport = loopback(&["w1"]);
    transport.set_latency("w1", Duration::from_millis(400));
    let spec = fan_out(vec![
        (OpKind::Neg, Placement::Pinned(WorkerId::new("w1"))),
        (OpKind::Relu, Placement::LocalOnly),
    ]);

    let killer = {
        let transport = transport.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            transport.kill("w1");
        })
    };
    let report = run(spec, transport.clone(), SchedulerConfig::default()).await;
    killer.await.unwrap();

    let Outcome::Failed(failure) = &report.outcome else {
        panic!("expected failure, got {:?}", report.outcome);
    };
    assert_eq!(failure.node, NodeId(2));
    assert_eq!(failure.cause, FailureCause::WorkerLost(WorkerId::new("w1")));
    assert_eq!(failure.cause.kind(), "worker_lost");
    assert_eq!(report.states[&NodeId(2)], ExecutionState::Failed);
    assert_eq!(report.states[&NodeId(3)], ExecutionState::Done);
    assert_eq!(transport.worker("w1").unwrap().executed(), 0);
    assert!(transport.live_workers().is_empty());
}

#[tokio::test]
async fn duplicate_replies_are_applied_once() {
    let transport = loopback(&["w1"]);
    transport.set_duplicate_replies("w1", true);
    let spec = GraphSpec::new(
        vec![
            source(),
            NodeSpec::new(2, OpKind::Neg).inputs([1]),
            NodeSpec::new(3, OpKind::Relu).inputs([2]),
        ],
        [3],
    );
    let report = run(spec, transport.clone(), SchedulerConfig::default()).await;

    let Outcome::Completed(outputs) = &report.outcome else {
        panic!("run did not complete: {:?}", report.outcome);
    };
    assert_eq!(outputs[0].1.data(), &[0.0, 2.0, 0.0]);
    assert_eq!(report.metrics.nodes_remote, 2);
    assert!(report.metrics.duplicates_ignored >= 2);
    assert_eq!(report.metrics.op_counts.get("neg"), Some(&1));
    assert_eq!(transport.in_flight(), 0);
}

#[tokio::test]
async fn revived_worker_takes_work_again() {
    let transport = loopback(&["w1"]);
    transport.kill("w1");
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(transport.live_workers().is_empty());

    transport.revive("w1");
    let spec = fan_out(vec![(OpKind::Neg, Placement::RemoteEligible)]);
    let report = run(spec, transport, SchedulerConfig::default()).await;
    assert_eq!(report.placements[&NodeId(2)], Target::Remote(WorkerId::new("w1")));
}
