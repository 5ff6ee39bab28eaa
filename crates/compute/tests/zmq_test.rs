//! End to end over real sockets: coordinator transport on one side,
//! `WorkerService` behind ROUTER, PUB and bulk endpoints on the other.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use exgraf_bus::{
    BlobStore, BulkServer, Endpoint, Worker, WorkerBuilder, WorkerRunner, ZmqPublisher,
    ZmqRequestServer,
};
use exgraf_compute::{
    Coordinator, CpuKernels, FailureCause, Kernels, LocalExecutor, RunError, SchedulerConfig,
    Target, TransportConfig, WorkerEndpoints, WorkerService, WorkerTransport, ZmqWorkerTransport,
};
use exgraf_core::{NodeId, OpKind, Shape, Tensor, WorkerId};
use exgraf_graph::{GraphSpec, NodeSpec, Placement};
use tokio::sync::Notify;

const SETTLE: Duration = Duration::from_millis(300);

struct ServiceWorker {
    service: Arc<WorkerService>,
    server: Arc<ZmqRequestServer>,
    shutdown: Arc<Notify>,
}

#[async_trait::async_trait]
impl Worker for ServiceWorker {
    async fn start(&self) -> Result<(), exgraf_bus::BusError> {
        tokio::spawn(Arc::clone(&self.service).serve(
            Arc::clone(&self.server),
            Arc::clone(&self.shutdown),
        ));
        Ok(())
    }

    async fn stop(&self) -> Result<(), exgraf_bus::BusError> {
        self.shutdown.notify_one();
        Ok(())
    }

    fn name(&self) -> &str {
        "w1"
    }
}

/// Start a worker on `base..base+2`. Notify the returned handle to stop it.
async fn spawn_worker(base: u16) -> (WorkerEndpoints, Arc<Notify>) {
    let control = Endpoint::tcp("127.0.0.1", base);
    let heartbeat = Endpoint::tcp("127.0.0.1", base + 1);
    let bulk = Endpoint::tcp("127.0.0.1", base + 2);

    let blobs = BlobStore::new();
    let server = Arc::new(ZmqRequestServer::bind(&control).await.unwrap());
    let publisher = Arc::new(ZmqPublisher::bind(&heartbeat).await.unwrap());
    let bulk_server = BulkServer::bind(&bulk, blobs.clone()).await.unwrap();

    let executor = Arc::new(LocalExecutor::cpu(2, None).unwrap());
    let service = Arc::new(WorkerService::new(executor, blobs, 64));
    let config = WorkerBuilder::new("w1")
        .health_interval(Duration::from_millis(50))
        .load_gauge(service.load_gauge())
        .build();
    let worker = Arc::new(ServiceWorker {
        service,
        server,
        shutdown: Arc::new(Notify::new()),
    });

    let stop = Arc::new(Notify::new());
    let external = Arc::clone(&stop);
    tokio::spawn(async move {
        let _bulk = bulk_server;
        WorkerRunner::run(worker, publisher, config, Some(external))
            .await
            .unwrap();
    });

    let endpoints = WorkerEndpoints {
        id: "w1".into(),
        control: control.endpoint(),
        heartbeat: heartbeat.endpoint(),
        bulk: bulk.endpoint(),
    };
    (endpoints, stop)
}

fn transport_config() -> TransportConfig {
    TransportConfig {
        heartbeat_timeout_ms: 400,
        liveness_sweep_ms: 50,
        bulk_threshold_bytes: 64,
        dispatch_timeout_ms: 5_000,
    }
}

fn square(n: usize) -> Tensor {
    let data = (0..n * n).map(|i| (i % 7) as f64 - 3.0).collect();
    Tensor::new(Shape::new(n, n), data).unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn remote_nodes_round_trip_inline_and_bulk() {
    let (endpoints, _stop) = spawn_worker(16600).await;
    tokio::time::sleep(SETTLE).await;
    let transport = Arc::new(
        ZmqWorkerTransport::connect(&[endpoints], &transport_config())
            .await
            .unwrap(),
    );
    tokio::time::sleep(SETTLE).await;
    assert_eq!(transport.live_workers().len(), 1);

    let a = square(8);
    let spec = GraphSpec::new(
        vec![
            NodeSpec::new(1, OpKind::Constant { value: a.clone() }),
            // 512-byte operands and result: bulk plane both ways.
            NodeSpec::new(2, OpKind::MatMul)
                .inputs([1, 1])
                .placement(Placement::Pinned(WorkerId::new("w1"))),
            // Scalar result: inline.
            NodeSpec::new(3, OpKind::Sum { axis: None })
                .inputs([2])
                .placement(Placement::Pinned(WorkerId::new("w1"))),
        ],
        [2, 3],
    );
    let coordinator =
        Coordinator::new(SchedulerConfig::default()).unwrap().with_transport(transport.clone());
    let out = coordinator.run(spec, HashMap::new()).await.unwrap();

    let expected = CpuKernels.apply(&OpKind::MatMul, &[&a, &a]).unwrap();
    assert!(out.get(NodeId(2)).unwrap().approx_eq(&expected, 1e-9));
    let total: f64 = expected.data().iter().sum();
    assert!((out.get(NodeId(3)).unwrap().get(0, 0) - total).abs() < 1e-9);

    assert_eq!(out.metrics.nodes_remote, 2);
    assert_eq!(out.placements[&NodeId(2)], Target::Remote(WorkerId::new("w1")));
    assert_eq!(transport.snapshot()[0].in_flight, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn remote_kernel_failure_is_reported_with_worker() {
    let (endpoints, _stop) = spawn_worker(16610).await;
    tokio::time::sleep(SETTLE).await;
    let transport = Arc::new(
        ZmqWorkerTransport::connect(&[endpoints], &transport_config())
            .await
            .unwrap(),
    );
    tokio::time::sleep(SETTLE).await;

    // Shapes are unknown until run time, so the mismatch surfaces remotely.
    let spec = GraphSpec::new(
        vec![
            NodeSpec::new(1, OpKind::Placeholder { name: "a".into() }),
            NodeSpec::new(2, OpKind::MatMul)
                .inputs([1, 1])
                .placement(Placement::Pinned(WorkerId::new("w1"))),
        ],
        [2],
    );
    let feeds = HashMap::from([("a".to_string(), Tensor::zeros(Shape::new(2, 3)))]);
    let coordinator =
        Coordinator::new(SchedulerConfig::default()).unwrap().with_transport(transport);
    let err = coordinator.run(spec, feeds).await.unwrap_err();

    let RunError::NodeFailed { node, cause } = err else {
        panic!("unexpected error {err}");
    };
    assert_eq!(node, NodeId(2));
    assert!(matches!(cause, FailureCause::Remote { ref worker, .. } if worker.as_str() == "w1"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stopped_worker_goes_dead() {
    let (endpoints, stop) = spawn_worker(16620).await;
    tokio::time::sleep(SETTLE).await;
    let transport = ZmqWorkerTransport::connect(&[endpoints], &transport_config())
        .await
        .unwrap();
    tokio::time::sleep(SETTLE).await;
    assert_eq!(transport.live_workers().len(), 1);

    // The runner's final heartbeat reports Unhealthy.
    stop.notify_one();
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(transport.live_workers().is_empty());
    assert!(!transport.is_live(&WorkerId::new("w1")));
}
