use std::collections::BTreeMap;
use std::time::Duration;

use serde::Serialize;

/// Counters and timings collected over one run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunMetrics {
    /// Nodes executed on the local executor (sources excluded).
    pub nodes_local: u64,
    /// Nodes executed by remote workers.
    pub nodes_remote: u64,
    /// Nodes that ended `Failed`, root causes and downstream alike.
    pub nodes_failed: u64,
    /// Intermediate values dropped from the result store.
    pub evictions: u64,
    /// Completions ignored because the node was no longer `Dispatched`.
    pub duplicates_ignored: u64,
    /// Ready nodes that fell back to local execution with no live worker.
    pub local_fallbacks: u64,
    /// Executions per op name.
    pub op_counts: BTreeMap<String, u64>,
    /// Average execution time per op name.
    pub avg_op_duration: BTreeMap<String, Duration>,
    pub elapsed: Duration,
}

impl RunMetrics {
    /// Record one node execution.
    pub fn record_execution(&mut self, op: &str, duration: Duration) {
        let count = {
            let count = self.op_counts.entry(op.to_string()).or_default();
            *count += 1;
            *count
        };
        let prev_avg = self.avg_op_duration.get(op).copied().unwrap_or_default();

        // Incremental mean: new_avg = prev_avg + (duration - prev_avg) / count
        let new_avg = if count == 1 {
            duration
        } else {
            let prev_nanos = prev_avg.as_nanos() as f64;
            let cur_nanos = duration.as_nanos() as f64;
            let avg_nanos = prev_nanos + (cur_nanos - prev_nanos) / count as f64;
            Duration::from_nanos(avg_nanos as u64)
        };
        self.avg_op_duration.insert(op.to_string(), new_avg);
    }

    pub fn nodes_executed(&self) -> u64 {
        self.nodes_local + self.nodes_remote
    }
}
