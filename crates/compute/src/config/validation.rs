use std::collections::HashSet;

use exgraf_bus::Endpoint;

use super::types::ExgrafConfig;
use super::ConfigError;

impl ExgrafConfig {
    /// Reject configs the coordinator could not run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.validate_scheduler()?;
        self.validate_transport()?;
        self.validate_workers()?;
        if let Some(events) = &self.server.events {
            Endpoint::parse(events)
                .map_err(|e| ConfigError::Invalid(format!("server.events: {e}")))?;
        }
        if self.server.max_finished_runs == 0 {
            return Err(ConfigError::Invalid(
                "server.max_finished_runs must be at least 1".into(),
            ));
        }
        Ok(())
    }

    fn validate_scheduler(&self) -> Result<(), ConfigError> {
        if self.scheduler.max_in_flight_per_worker == 0 {
            return Err(ConfigError::Invalid(
                "scheduler.max_in_flight_per_worker must be at least 1".into(),
            ));
        }
        if self.scheduler.admission_tick_ms == 0 {
            return Err(ConfigError::Invalid(
                "scheduler.admission_tick_ms must be at least 1".into(),
            ));
        }
        Ok(())
    }

    fn validate_transport(&self) -> Result<(), ConfigError> {
        let t = &self.transport;
        if t.liveness_sweep_ms == 0 || t.heartbeat_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "transport heartbeat timeout and sweep interval must be non-zero".into(),
            ));
        }
        if t.liveness_sweep_ms > t.heartbeat_timeout_ms {
            return Err(ConfigError::Invalid(format!(
                "transport.liveness_sweep_ms ({}) exceeds heartbeat_timeout_ms ({})",
                t.liveness_sweep_ms, t.heartbeat_timeout_ms
            )));
        }
        Ok(())
    }

    /// Unique ids, parseable endpoints, TCP bulk servers.
    fn validate_workers(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for worker in &self.workers {
            if worker.id.is_empty() {
                return Err(ConfigError::Invalid("worker with empty id".into()));
            }
            if !seen.insert(worker.id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "worker '{}' is declared twice",
                    worker.id
                )));
            }
            for (field, endpoint) in [
                ("control", &worker.control),
                ("heartbeat", &worker.heartbeat),
                ("bulk", &worker.bulk),
            ] {
                let parsed = Endpoint::parse(endpoint).map_err(|e| {
                    ConfigError::Invalid(format!("worker '{}' {field}: {e}", worker.id))
                })?;
                if field == "bulk" && parsed.socket_addr().is_none() {
                    return Err(ConfigError::Invalid(format!(
                        "worker '{}' bulk endpoint must be tcp://",
                        worker.id
                    )));
                }
            }
        }
        Ok(())
    }
}
