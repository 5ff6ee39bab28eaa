use std::sync::Arc;

use exgraf_compute::{RunRegistry, ZmqWorkerTransport};

pub struct AppState {
    pub runs: RunRegistry,
    /// Present when workers are configured.
    pub workers: Option<Arc<ZmqWorkerTransport>>,
}
