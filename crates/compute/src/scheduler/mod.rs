//! Per-run graph scheduler.
//!
//! One [`Scheduler`] drives one run: it tracks node readiness, places
//! ready nodes on the local executor or a remote worker under
//! back-pressure, and folds completions back into the result store from a
//! single event loop.

pub mod metrics;
pub mod runner;
pub mod state;
pub mod types;

pub use metrics::RunMetrics;
pub use runner::{NodeFailure, Outcome, RunReport, Scheduler};
pub use state::ExecutionState;
pub use types::{FailureCause, SchedulerConfig, Target};
