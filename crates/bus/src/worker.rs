//! Worker lifecycle management.
//!
//! Provides the [`Worker`] trait for long-running processes,
//! [`WorkerBuilder`] for fluent configuration, and [`WorkerRunner`] for
//! running a worker with periodic heartbeats and graceful shutdown.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tracing::{info, warn};

use crate::error::BusError;
use crate::message::Message;
use crate::messages::events::{WorkerHealth, WorkerStatus};
use crate::messages::topics::WORKER_HEALTH;
use crate::traits::EventPublisher;

// ── Worker trait ─────────────────────────────────────────────────────

/// A long-running process that executes dispatched nodes.
///
/// Implementors define startup/shutdown; [`WorkerRunner`] handles
/// heartbeats, signals and the lifecycle.
#[async_trait]
pub trait Worker: Send + Sync {
    /// Called once when the worker starts. Bind sockets, spawn serve loops.
    async fn start(&self) -> Result<(), BusError>;

    /// Called once during graceful shutdown. Drain in-flight work.
    async fn stop(&self) -> Result<(), BusError>;

    /// Identifier used in heartbeats and logging.
    fn name(&self) -> &str;
}

// ── WorkerBuilder ────────────────────────────────────────────────────

/// Fluent builder for a [`WorkerRunnerConfig`].
///
/// # Example
/// ```ignore
/// let in_flight = Arc::new(AtomicUsize::new(0));
/// let config = WorkerBuilder::new("w1")
///     .health_interval(Duration::from_millis(500))
///     .load_gauge(in_flight.clone())
///     .build();
/// ```
pub struct WorkerBuilder {
    name: String,
    health_interval: Duration,
    shutdown_timeout: Duration,
    load: Option<Arc<AtomicUsize>>,
}

impl WorkerBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            health_interval: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(5),
            load: None,
        }
    }

    /// Interval between heartbeats (default: 1s). Keep it well under the
    /// coordinator's heartbeat timeout.
    pub fn health_interval(mut self, interval: Duration) -> Self {
        self.health_interval = interval;
        self
    }

    /// Maximum time to wait for in-flight work during shutdown (default: 5s).
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Gauge read into every heartbeat's `in_flight` field.
    pub fn load_gauge(mut self, load: Arc<AtomicUsize>) -> Self {
        self.load = Some(load);
        self
    }

    pub fn build(self) -> WorkerRunnerConfig {
        WorkerRunnerConfig {
            name: self.name,
            health_interval: self.health_interval,
            shutdown_timeout: self.shutdown_timeout,
            load: self.load,
        }
    }
}

// ── WorkerRunnerConfig ───────────────────────────────────────────────

/// Configuration produced by [`WorkerBuilder`], consumed by [`WorkerRunner`].
pub struct WorkerRunnerConfig {
    pub name: String,
    pub health_interval: Duration,
    pub shutdown_timeout: Duration,
    pub load: Option<Arc<AtomicUsize>>,
}

impl WorkerRunnerConfig {
    fn in_flight(&self) -> usize {
        self.load.as_ref().map_or(0, |l| l.load(Ordering::Relaxed))
    }
}

// ── WorkerRunner ─────────────────────────────────────────────────────

/// Runs a [`Worker`] with heartbeats and graceful shutdown.
///
/// 1. **Heartbeat loop** publishes [`WorkerHealth`] every `health_interval`
/// 2. **Signal handler** waits for SIGINT/SIGTERM or the external notify
/// 3. **Lifecycle** calls `start()`, waits for shutdown, then `stop()`
pub struct WorkerRunner;

impl WorkerRunner {
    /// Run a worker until a shutdown signal or `shutdown_notify` fires.
    pub async fn run(
        worker: Arc<dyn Worker>,
        publisher: Arc<dyn EventPublisher>,
        config: WorkerRunnerConfig,
        shutdown_notify: Option<Arc<Notify>>,
    ) -> Result<(), BusError> {
        let config = Arc::new(config);
        let worker_name = config.name.clone();
        info!(worker = %worker_name, "starting worker");

        worker.start().await?;
        info!(worker = %worker_name, "worker started");

        Self::publish_health(&*publisher, &config, WorkerStatus::Healthy).await;

        let shutdown = Arc::new(Notify::new());

        let health_publisher = publisher.clone();
        let health_config = config.clone();
        let health_handle = tokio::spawn(async move {
            Self::health_loop(&*health_publisher, &health_config).await;
        });

        let sig_shutdown = shutdown.clone();
        let sig_name = worker_name.clone();
        let signal_handle = tokio::spawn(async move {
            Self::wait_for_shutdown(shutdown_notify).await;
            info!(worker = %sig_name, "shutdown signal received");
            sig_shutdown.notify_one();
        });

        shutdown.notified().await;

        health_handle.abort();
        signal_handle.abort();

        info!(worker = %worker_name, timeout = ?config.shutdown_timeout, "stopping worker");
        match tokio::time::timeout(config.shutdown_timeout, worker.stop()).await {
            Ok(Ok(())) => {
                info!(worker = %worker_name, "worker stopped gracefully");
            }
            Ok(Err(e)) => {
                warn!(worker = %worker_name, error = %e, "worker stop returned error");
            }
            Err(_) => {
                warn!(worker = %worker_name, "worker stop timed out, forcing shutdown");
            }
        }

        // Last heartbeat tells coordinators not to wait for the timeout.
        Self::publish_health(&*publisher, &config, WorkerStatus::Unhealthy).await;

        info!(worker = %worker_name, "worker shutdown complete");
        Ok(())
    }

    /// Runs until aborted by [`WorkerRunner::run`].
    async fn health_loop(publisher: &dyn EventPublisher, config: &WorkerRunnerConfig) {
        let mut ticker = tokio::time::interval(config.health_interval);
        // First tick is immediate; the initial heartbeat was already sent.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            Self::publish_health(publisher, config, WorkerStatus::Healthy).await;
        }
    }

    async fn publish_health(publisher: &dyn EventPublisher, config: &WorkerRunnerConfig, status: WorkerStatus) {
        let health = WorkerHealth {
            worker_id: config.name.clone(),
            status,
            in_flight: config.in_flight(),
        };

        match Message::new(WORKER_HEALTH, &health) {
            Ok(msg) => {
                if let Err(e) = publisher.publish(msg).await {
                    warn!(worker = %config.name, error = %e, "failed to publish heartbeat");
                }
            }
            Err(e) => {
                warn!(worker = %config.name, error = %e, "failed to serialize heartbeat");
            }
        }
    }

    async fn wait_for_shutdown(external: Option<Arc<Notify>>) {
        match external {
            Some(notify) => {
                tokio::select! {
                    _ = Self::os_signal() => {}
                    _ = notify.notified() => {}
                }
            }
            None => {
                Self::os_signal().await;
            }
        }
    }

    /// Wait for SIGINT or SIGTERM (Unix) or Ctrl+C elsewhere. If the
    /// handlers cannot be installed this never resolves.
    async fn os_signal() {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match (signal(SignalKind::interrupt()), signal(SignalKind::terminate())) {
                (Ok(mut sigint), Ok(mut sigterm)) => {
                    tokio::select! {
                        _ = sigint.recv() => {}
                        _ = sigterm.recv() => {}
                    }
                }
                (Err(e), _) | (_, Err(e)) => {
                    warn!(error = %e, "failed to install signal handlers");
                    std::future::pending::<()>().await;
                }
            }
        }

        #[cfg(not(unix))]
        {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for ctrl_c");
                std::future::pending::<()>().await;
            }
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────
