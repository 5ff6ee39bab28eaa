mod api;
mod router;
mod state;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use exgraf_bus::{Endpoint, EventFanout, EventPublisher, FileEventLog, ZmqPublisher};
use exgraf_compute::{ConfigError, Coordinator, ExgrafConfig, RunRegistry, ZmqWorkerTransport};
use exgraf_core::Tensor;
use exgraf_graph::{Graph, GraphSpec};
use tracing::{info, warn};

use crate::state::AppState;

// ── CLI ─────────────────────────────────────────────────────────────

/// Distributed computation-graph coordinator.
#[derive(Parser, Debug)]
#[command(name = "exgraf", version, about)]
struct Cli {
    /// Path to exgraf.toml.
    #[arg(long, env = "EXGRAF_CONFIG", default_value = "config/exgraf.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the run API over HTTP.
    Serve {
        /// Overrides `server.port`.
        #[arg(long)]
        port: Option<u16>,
    },
    /// Execute one graph and print its outputs as JSON.
    Run {
        /// Graph spec (.json or .toml).
        graph: PathBuf,
        /// JSON object mapping placeholder names to tensors.
        #[arg(long)]
        feeds: Option<PathBuf>,
    },
    /// Print a graph in Graphviz dot format.
    Dot { graph: PathBuf },
}

/// A missing file falls back to defaults plus `EXGRAF_*` overrides; a
/// file that exists but does not parse or validate is an error.
fn load_config(path: &Path) -> anyhow::Result<ExgrafConfig> {
    match ExgrafConfig::from_file(path) {
        Ok(cfg) => {
            info!(path = %path.display(), workers = cfg.workers.len(), "loaded exgraf config");
            Ok(cfg)
        }
        Err(ConfigError::Io(e)) => {
            warn!(error = %e, path = %path.display(), "config not readable, using environment defaults");
            Ok(ExgrafConfig::from_env()?)
        }
        Err(e) => Err(e.into()),
    }
}

/// Coordinator plus the worker transport it dispatches through, if any.
async fn build_coordinator(
    config: &ExgrafConfig,
) -> anyhow::Result<(Coordinator, Option<Arc<ZmqWorkerTransport>>)> {
    let mut coordinator = Coordinator::new(config.scheduler.clone())?;

    let transport = if config.workers.is_empty() {
        info!("no workers configured, running local only");
        None
    } else {
        let transport =
            Arc::new(ZmqWorkerTransport::connect(&config.workers, &config.transport).await?);
        coordinator = coordinator.with_transport(transport.clone());
        Some(transport)
    };

    let mut sinks: Vec<Arc<dyn EventPublisher>> = Vec::new();
    if let Some(events) = &config.server.events {
        sinks.push(Arc::new(ZmqPublisher::bind(&Endpoint::parse(events)?).await?));
    }
    if let Some(path) = &config.server.event_log {
        sinks.push(Arc::new(FileEventLog::open(path).await?));
    }
    let publisher = match sinks.len() {
        0 => None,
        1 => sinks.pop(),
        _ => Some(Arc::new(EventFanout::new(sinks)) as Arc<dyn EventPublisher>),
    };
    if let Some(publisher) = publisher {
        coordinator = coordinator.with_publisher(publisher);
    }
    Ok((coordinator, transport))
}

async fn serve(config: ExgrafConfig, port: Option<u16>) -> anyhow::Result<()> {
    let (coordinator, workers) = build_coordinator(&config).await?;
    let state = Arc::new(AppState {
        runs: RunRegistry::with_retention(Arc::new(coordinator), config.server.run_retention()),
        workers,
    });
    let app = router::build_router(state);

    let port = port.unwrap_or(config.server.port);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!("Server listening on http://localhost:{port}");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn run_once(config: ExgrafConfig, graph: &Path, feeds: Option<&Path>) -> anyhow::Result<()> {
    let spec = GraphSpec::from_file(graph)?;
    let feeds: HashMap<String, Tensor> = match feeds {
        Some(path) => serde_json::from_str(&std::fs::read_to_string(path)?)?,
        None => HashMap::new(),
    };

    let (coordinator, _workers) = build_coordinator(&config).await?;
    let out = coordinator.run(spec, feeds).await?;
    info!(
        local = out.metrics.nodes_local,
        remote = out.metrics.nodes_remote,
        elapsed = ?out.metrics.elapsed,
        "run succeeded"
    );
    println!("{}", serde_json::to_string_pretty(&out.outputs)?);
    Ok(())
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
        .with_target(false)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve { port } => serve(load_config(&cli.config)?, port).await,
        Command::Run { graph, feeds } => {
            run_once(load_config(&cli.config)?, &graph, feeds.as_deref()).await
        }
        Command::Dot { graph } => {
            let graph = Graph::build(GraphSpec::from_file(graph)?)?;
            print!("{}", graph.to_dot());
            Ok(())
        }
    }
}
