//! exgraf-worker: executes dispatched graph nodes for a coordinator.
//!
//! Binds three endpoints:
//! - control (ROUTER): `exgraf.dispatch` requests in, `exgraf.dispatch.reply` out
//! - heartbeat (PUB): `exgraf.worker.health` every health interval
//! - bulk (TCP): large tensors parked by either side

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::Parser;
use tokio::sync::Notify;
use tracing::info;

use exgraf_bus::{
    BlobStore, BulkServer, BusError, Endpoint, Worker, WorkerBuilder, WorkerRunner,
    ZmqPublisher, ZmqRequestServer,
};
use exgraf_compute::{LocalExecutor, WorkerService};

// ── CLI ─────────────────────────────────────────────────────────────

/// Remote executor for exgraf computation graphs.
#[derive(Parser, Debug)]
#[command(name = "exgraf-worker", version, about)]
struct Cli {
    /// Worker id; must match the coordinator's `[[workers]]` entry.
    #[arg(long, env = "EXGRAF_WORKER_ID")]
    id: String,

    /// Control endpoint to bind, e.g. tcp://0.0.0.0:5601.
    #[arg(long, env = "EXGRAF_WORKER_CONTROL")]
    control: String,

    /// Heartbeat endpoint to bind.
    #[arg(long, env = "EXGRAF_WORKER_HEARTBEAT")]
    heartbeat: String,

    /// Bulk endpoint to bind (tcp only).
    #[arg(long, env = "EXGRAF_WORKER_BULK")]
    bulk: String,

    /// Kernel threads; 0 uses every core.
    #[arg(long, env = "EXGRAF_WORKER_THREADS", default_value_t = 0)]
    threads: usize,

    /// Heartbeat interval in milliseconds.
    #[arg(long, env = "EXGRAF_WORKER_HEALTH_INTERVAL_MS", default_value_t = 1000)]
    health_interval_ms: u64,

    /// Results at or above this size go back over the bulk endpoint.
    #[arg(long, env = "EXGRAF_WORKER_BULK_THRESHOLD", default_value_t = 65536)]
    bulk_threshold: usize,

    /// Per-node kernel timeout in milliseconds; 0 disables it.
    #[arg(long, env = "EXGRAF_WORKER_NODE_TIMEOUT_MS", default_value_t = 0)]
    node_timeout_ms: u64,

    /// Parked blobs nobody collects are dropped after this many seconds.
    #[arg(long, env = "EXGRAF_WORKER_BLOB_TTL_SECS", default_value_t = 300)]
    blob_ttl_secs: u64,

    /// Shutdown timeout in seconds.
    #[arg(long, env = "EXGRAF_WORKER_SHUTDOWN_TIMEOUT", default_value_t = 10)]
    shutdown_timeout: u64,
}

// ── GraphWorker ─────────────────────────────────────────────────────

struct GraphWorker {
    id: String,
    service: Arc<WorkerService>,
    server: Arc<ZmqRequestServer>,
    shutdown: Arc<Notify>,
}

#[async_trait]
impl Worker for GraphWorker {
    async fn start(&self) -> Result<(), BusError> {
        let service = Arc::clone(&self.service);
        let server = Arc::clone(&self.server);
        let shutdown = Arc::clone(&self.shutdown);
        tokio::spawn(service.serve(server, shutdown));
        info!(worker = %self.id, "graph worker started");
        Ok(())
    }

    async fn stop(&self) -> Result<(), BusError> {
        // notify_one keeps a permit if the loop is between iterations.
        self.shutdown.notify_one();
        info!(worker = %self.id, "graph worker stopped");
        Ok(())
    }

    fn name(&self) -> &str {
        &self.id
    }
}

// ── main ────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    exgraf_core::config::load_dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let threads = if cli.threads == 0 {
        std::thread::available_parallelism().map_or(1, |n| n.get())
    } else {
        cli.threads
    };
    let timeout = (cli.node_timeout_ms > 0).then(|| Duration::from_millis(cli.node_timeout_ms));
    let executor = Arc::new(LocalExecutor::cpu(threads, timeout)?);

    let blobs = BlobStore::new();
    let server = Arc::new(ZmqRequestServer::bind(&Endpoint::parse(&cli.control)?).await?);
    let publisher = Arc::new(ZmqPublisher::bind(&Endpoint::parse(&cli.heartbeat)?).await?);
    let bulk = BulkServer::bind(&Endpoint::parse(&cli.bulk)?, blobs.clone()).await?;
    info!(bulk = %bulk.local_addr(), threads, "endpoints bound");

    let blob_ttl = Duration::from_secs(cli.blob_ttl_secs.max(1));
    let sweeper = blobs.spawn_sweeper(blob_ttl, (blob_ttl / 4).max(Duration::from_secs(1)));

    let service = Arc::new(WorkerService::new(executor, blobs, cli.bulk_threshold));
    let runner_config = WorkerBuilder::new(cli.id.clone())
        .health_interval(Duration::from_millis(cli.health_interval_ms))
        .shutdown_timeout(Duration::from_secs(cli.shutdown_timeout))
        .load_gauge(service.load_gauge())
        .build();

    let worker = Arc::new(GraphWorker {
        id: cli.id.clone(),
        service,
        server,
        shutdown: Arc::new(Notify::new()),
    });

    info!(worker = %cli.id, "exgraf-worker starting");

    // Blocks until SIGINT/SIGTERM.
    WorkerRunner::run(worker, publisher, runner_config, None).await?;

    sweeper.abort();
    drop(bulk);
    info!("exgraf-worker exited cleanly");
    Ok(())
}
