//! Topic constants for routing.
//!
//! Topics follow the pattern `exgraf.<domain>.<event>`.

// ── Control plane ─────────────────────────────────────────────────────────

/// Coordinator asks a worker to execute one node.
pub const DISPATCH: &str = "exgraf.dispatch";

/// Worker answers a dispatch (same correlation id).
pub const DISPATCH_REPLY: &str = "exgraf.dispatch.reply";

// ── Events ────────────────────────────────────────────────────────────────

/// Periodic worker heartbeat.
pub const WORKER_HEALTH: &str = "exgraf.worker.health";

/// A graph run was accepted and started executing.
pub const RUN_STARTED: &str = "exgraf.run.started";

/// A graph run reached a terminal state.
pub const RUN_FINISHED: &str = "exgraf.run.finished";

/// Prefix matching every run lifecycle topic.
pub const RUN_PREFIX: &str = "exgraf.run.";
