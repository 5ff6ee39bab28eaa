//! Worker heartbeats observed over a real PUB/SUB socket.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::timeout;

use exgraf_bus::messages::events::{WorkerHealth, WorkerStatus};
use exgraf_bus::messages::topics;
use exgraf_bus::{BusError, Endpoint, EventSubscriber, Worker, WorkerBuilder, WorkerRunner, ZmqPublisher, ZmqSubscriber};

const TIMEOUT: Duration = Duration::from_secs(5);
const SETTLE: Duration = Duration::from_millis(200);

struct NoopWorker {
    name: String,
}

#[async_trait]
impl Worker for NoopWorker {
    async fn start(&self) -> Result<(), BusError> {
        Ok(())
    }
    async fn stop(&self) -> Result<(), BusError> {
        Ok(())
    }
    fn name(&self) -> &str {
        &self.name
    }
}

#[tokio::test]
async fn heartbeats_carry_load_and_final_unhealthy() {
    let endpoint = Endpoint::tcp("127.0.0.1", 16400);
    let publisher = Arc::new(ZmqPublisher::bind(&endpoint).await.unwrap());
    tokio::time::sleep(SETTLE).await;

    let sub = ZmqSubscriber::connect(&endpoint).await.unwrap();
    sub.subscribe(topics::WORKER_HEALTH).await.unwrap();
    tokio::time::sleep(SETTLE).await;

    let load = Arc::new(AtomicUsize::new(2));
    let worker = Arc::new(NoopWorker { name: "hb-worker".into() });
    let shutdown = Arc::new(Notify::new());
    let config = WorkerBuilder::new("hb-worker")
        .health_interval(Duration::from_millis(50))
        .shutdown_timeout(Duration::from_secs(1))
        .load_gauge(load.clone())
        .build();

    let s = shutdown.clone();
    let handle = tokio::spawn(async move { WorkerRunner::run(worker, publisher, config, Some(s)).await });

    let msg = timeout(TIMEOUT, sub.recv()).await.expect("timed out waiting for heartbeat").unwrap();
    let health: WorkerHealth = msg.decode().unwrap();
    assert_eq!(health.worker_id, "hb-worker");
    assert_eq!(health.status, WorkerStatus::Healthy);
    assert_eq!(health.in_flight, 2);

    load.store(0, Ordering::SeqCst);
    shutdown.notify_one();
    timeout(TIMEOUT, handle).await.expect("runner hung").unwrap().unwrap();

    // Drain until the final heartbeat.
    let last = timeout(TIMEOUT, async {
        loop {
            let h: WorkerHealth = sub.recv().await.unwrap().decode().unwrap();
            if h.status == WorkerStatus::Unhealthy {
                return h;
            }
        }
    })
    .await
    .expect("no final heartbeat");
    assert_eq!(last.in_flight, 0);
}
