use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use exgraf_core::{NodeId, WorkerId};
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::AbortHandle;

use super::{CorrelationToken, TransportEvent};

pub(crate) struct Entry {
    pub node: NodeId,
    pub worker: WorkerId,
    pub reply_to: UnboundedSender<TransportEvent>,
    pub abort: Option<AbortHandle>,
}

/// Dispatches awaiting a result, keyed by correlation token.
///
/// Removing an entry is the single point where a result is accepted, so a
/// token completes at most once however many replies arrive.
#[derive(Default)]
pub struct InFlight {
    entries: Mutex<HashMap<CorrelationToken, Entry>>,
}

impl InFlight {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<CorrelationToken, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn insert(
        &self,
        token: CorrelationToken,
        node: NodeId,
        worker: WorkerId,
        reply_to: UnboundedSender<TransportEvent>,
    ) {
        self.lock().insert(
            token,
            Entry {
                node,
                worker,
                reply_to,
                abort: None,
            },
        );
    }

    /// Attach the task carrying the request so a lost worker can cancel it.
    pub(crate) fn set_abort(&self, token: CorrelationToken, abort: AbortHandle) {
        if let Some(entry) = self.lock().get_mut(&token) {
            entry.abort = Some(abort);
        }
    }

    pub(crate) fn remove(&self, token: CorrelationToken) -> Option<Entry> {
        self.lock().remove(&token)
    }

    pub(crate) fn drain_worker(&self, worker: &WorkerId) -> Vec<(CorrelationToken, Entry)> {
        let mut entries = self.lock();
        let tokens: Vec<_> = entries
            .iter()
            .filter(|(_, e)| &e.worker == worker)
            .map(|(t, _)| *t)
            .collect();
        tokens
            .into_iter()
            .filter_map(|t| entries.remove(&t).map(|e| (t, e)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
