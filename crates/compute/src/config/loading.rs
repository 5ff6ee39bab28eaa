use std::path::Path;

use exgraf_core::config::{env_opt, env_parse};

use super::types::ExgrafConfig;
use super::ConfigError;

impl ExgrafConfig {
    /// Parse config from a TOML string, apply env overrides, validate.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let mut config: Self = toml::from_str(toml_str)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    /// Defaults plus env overrides, for processes started without a file.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    // ── Environment variable overrides ──────────────────────────────

    /// Convention: `EXGRAF_SECTION_KEY` overrides `section.key`.
    /// Examples:
    /// - `EXGRAF_SCHEDULER_LOCAL_PARALLELISM` -> `scheduler.local_parallelism`
    /// - `EXGRAF_TRANSPORT_HEARTBEAT_TIMEOUT_MS` -> `transport.heartbeat_timeout_ms`
    /// - `EXGRAF_SERVER_PORT` -> `server.port`
    /// - `EXGRAF_SERVER_EVENTS` -> `server.events`
    ///
    /// Unparseable values are ignored.
    pub(crate) fn apply_env_overrides(&mut self) {
        let s = &mut self.scheduler;
        if let Some(v) = env_parse("EXGRAF_SCHEDULER_LOCAL_PARALLELISM") {
            s.local_parallelism = v;
        }
        if let Some(v) = env_parse("EXGRAF_SCHEDULER_MAX_IN_FLIGHT_PER_WORKER") {
            s.max_in_flight_per_worker = v;
        }
        if let Some(v) = env_parse("EXGRAF_SCHEDULER_NODE_TIMEOUT_MS") {
            s.node_timeout_ms = v;
        }
        if let Some(v) = env_parse("EXGRAF_SCHEDULER_ADMISSION_TICK_MS") {
            s.admission_tick_ms = v;
        }

        let t = &mut self.transport;
        if let Some(v) = env_parse("EXGRAF_TRANSPORT_HEARTBEAT_TIMEOUT_MS") {
            t.heartbeat_timeout_ms = v;
        }
        if let Some(v) = env_parse("EXGRAF_TRANSPORT_LIVENESS_SWEEP_MS") {
            t.liveness_sweep_ms = v;
        }
        if let Some(v) = env_parse("EXGRAF_TRANSPORT_BULK_THRESHOLD_BYTES") {
            t.bulk_threshold_bytes = v;
        }
        if let Some(v) = env_parse("EXGRAF_TRANSPORT_DISPATCH_TIMEOUT_MS") {
            t.dispatch_timeout_ms = v;
        }

        if let Some(v) = env_parse("EXGRAF_SERVER_PORT") {
            self.server.port = v;
        }
        if let Some(v) = env_opt("EXGRAF_SERVER_EVENTS") {
            self.server.events = Some(v);
        }
        if let Some(v) = env_opt("EXGRAF_SERVER_EVENT_LOG") {
            self.server.event_log = Some(v.into());
        }
        if let Some(v) = env_parse("EXGRAF_SERVER_MAX_FINISHED_RUNS") {
            self.server.max_finished_runs = v;
        }
        if let Some(v) = env_parse("EXGRAF_SERVER_FINISHED_RUN_TTL_SECS") {
            self.server.finished_run_ttl_secs = v;
        }
    }
}
