//! Reference-counted store of computed node values.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use exgraf_core::{NodeId, Tensor};
use thiserror::Error;
use tracing::debug;

const SHARDS: usize = 16;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("value of {0} is not ready")]
    NotReady(NodeId),

    #[error("value of {0} was evicted")]
    Evicted(NodeId),

    #[error("{0} has no outstanding consumers")]
    Unknown(NodeId),

    #[error("value of {0} was already stored")]
    Duplicate(NodeId),
}

impl StoreError {
    pub fn node(&self) -> NodeId {
        match self {
            Self::NotReady(n) | Self::Evicted(n) | Self::Unknown(n) | Self::Duplicate(n) => *n,
        }
    }
}

#[derive(Debug)]
enum Slot {
    Present {
        value: Arc<Tensor>,
        consumers: usize,
        pinned: bool,
    },
    Evicted,
}

/// Completed node values keyed by node id.
///
/// Each entry carries the number of consumer edges still to read it. A
/// pinned entry (a run output) survives its count reaching zero; any other
/// entry is dropped at zero and later reads fail with
/// [`StoreError::Evicted`]. The table is split into shards so concurrent
/// callers on different nodes rarely contend.
#[derive(Debug)]
pub struct ResultStore {
    shards: Vec<Mutex<HashMap<NodeId, Slot>>>,
    evictions: AtomicU64,
}

impl Default for ResultStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ResultStore {
    pub fn new() -> Self {
        Self {
            shards: (0..SHARDS).map(|_| Mutex::new(HashMap::new())).collect(),
            evictions: AtomicU64::new(0),
        }
    }

    fn shard(&self, node: NodeId) -> MutexGuard<'_, HashMap<NodeId, Slot>> {
        self.shards[(node.0 as usize) % SHARDS]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Store a completed value with `consumers` pending reads.
    pub fn put(
        &self,
        node: NodeId,
        value: Arc<Tensor>,
        consumers: usize,
        pinned: bool,
    ) -> Result<(), StoreError> {
        let mut shard = self.shard(node);
        if shard.contains_key(&node) {
            return Err(StoreError::Duplicate(node));
        }
        if consumers == 0 && !pinned {
            shard.insert(node, Slot::Evicted);
            self.evictions.fetch_add(1, Ordering::Relaxed);
            debug!(node = %node, "stored value has no consumers, evicted");
        } else {
            shard.insert(
                node,
                Slot::Present {
                    value,
                    consumers,
                    pinned,
                },
            );
        }
        Ok(())
    }

    pub fn get(&self, node: NodeId) -> Result<Arc<Tensor>, StoreError> {
        match self.shard(node).get(&node) {
            Some(Slot::Present { value, .. }) => Ok(Arc::clone(value)),
            Some(Slot::Evicted) => Err(StoreError::Evicted(node)),
            None => Err(StoreError::NotReady(node)),
        }
    }

    /// Consume one pending read. Returns `true` when this release evicted
    /// the entry.
    pub fn release(&self, node: NodeId) -> Result<bool, StoreError> {
        let mut shard = self.shard(node);
        let slot = shard.get_mut(&node).ok_or(StoreError::NotReady(node))?;
        let Slot::Present {
            consumers, pinned, ..
        } = slot
        else {
            return Err(StoreError::Evicted(node));
        };
        if *consumers == 0 {
            return Err(StoreError::Unknown(node));
        }
        *consumers -= 1;
        if *consumers == 0 && !*pinned {
            *slot = Slot::Evicted;
            self.evictions.fetch_add(1, Ordering::Relaxed);
            debug!(node = %node, "evicted");
            return Ok(true);
        }
        Ok(false)
    }

    /// Remaining reads for a present entry.
    pub fn consumers(&self, node: NodeId) -> Option<usize> {
        match self.shard(node).get(&node) {
            Some(Slot::Present { consumers, .. }) => Some(*consumers),
            _ => None,
        }
    }

    pub fn is_evicted(&self, node: NodeId) -> bool {
        matches!(self.shard(node).get(&node), Some(Slot::Evicted))
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    /// Number of values currently held.
    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|s| {
                s.lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .values()
                    .filter(|slot| matches!(slot, Slot::Present { .. }))
                    .count()
            })
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
