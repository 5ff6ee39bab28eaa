//! Local executor: runs ready nodes on a bounded rayon pool.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use exgraf_core::{NodeId, NumericError, OpKind, Tensor};
use thiserror::Error;
use tokio::sync::{oneshot, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use crate::kernels::{CpuKernels, Kernels};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ExecutionError {
    #[error(transparent)]
    Numeric(#[from] NumericError),

    #[error("node {node} exceeded its {timeout:?} timeout")]
    Timeout { node: NodeId, timeout: Duration },

    #[error("kernel for node {node} panicked: {message}")]
    Panicked { node: NodeId, message: String },

    #[error("executor pool unavailable: {0}")]
    Pool(String),
}

/// One of the executor's `threads` slots, held from dispatch until the
/// kernel returns.
#[derive(Debug)]
pub struct ExecSlot(OwnedSemaphorePermit);

/// Runs node kernels on a dedicated thread pool.
///
/// Independent nodes run in parallel up to the pool size; parallelism
/// inside a single kernel is left to faer. Every kernel holds an
/// [`ExecSlot`], so the pool never queues work no matter how many runs
/// share the executor, and the node timeout counts from the moment the
/// kernel starts. A kernel that outlives the node timeout is reported as
/// [`ExecutionError::Timeout`]; its thread and slot are not reclaimed
/// until the kernel returns.
pub struct LocalExecutor {
    pool: rayon::ThreadPool,
    slots: Arc<Semaphore>,
    kernels: Arc<dyn Kernels>,
    node_timeout: Option<Duration>,
    threads: usize,
}

impl LocalExecutor {
    pub fn new(
        threads: usize,
        node_timeout: Option<Duration>,
        kernels: Arc<dyn Kernels>,
    ) -> Result<Self, ExecutionError> {
        let threads = threads.max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("exgraf-exec-{i}"))
            .build()
            .map_err(|e| ExecutionError::Pool(e.to_string()))?;
        Ok(Self {
            pool,
            slots: Arc::new(Semaphore::new(threads)),
            kernels,
            node_timeout,
            threads,
        })
    }

    /// Executor backed by [`CpuKernels`].
    pub fn cpu(threads: usize, node_timeout: Option<Duration>) -> Result<Self, ExecutionError> {
        Self::new(threads, node_timeout, Arc::new(CpuKernels))
    }

    /// Pool size, which is also the local dispatch cap.
    pub fn parallelism(&self) -> usize {
        self.threads
    }

    /// Slots not held by a running (or timed-out, still running) kernel.
    pub fn free_slots(&self) -> usize {
        self.slots.available_permits()
    }

    /// Claim a slot if one is free right now.
    pub fn try_reserve(&self) -> Option<ExecSlot> {
        Arc::clone(&self.slots).try_acquire_owned().ok().map(ExecSlot)
    }

    /// Wait for a free slot.
    pub async fn reserve(&self) -> Result<ExecSlot, ExecutionError> {
        Arc::clone(&self.slots)
            .acquire_owned()
            .await
            .map(ExecSlot)
            .map_err(|e| ExecutionError::Pool(e.to_string()))
    }

    pub fn kernels(&self) -> Arc<dyn Kernels> {
        Arc::clone(&self.kernels)
    }

    /// Run one node's kernel over its resolved inputs, waiting for a slot
    /// first.
    pub async fn execute(
        &self,
        node: NodeId,
        op: OpKind,
        inputs: Vec<Arc<Tensor>>,
    ) -> Result<Tensor, ExecutionError> {
        let slot = self.reserve().await?;
        self.execute_in(slot, node, op, inputs).await
    }

    /// Run one node's kernel in an already reserved slot.
    pub async fn execute_in(
        &self,
        slot: ExecSlot,
        node: NodeId,
        op: OpKind,
        inputs: Vec<Arc<Tensor>>,
    ) -> Result<Tensor, ExecutionError> {
        let (started_tx, started_rx) = oneshot::channel();
        let (tx, rx) = oneshot::channel();
        let kernels = Arc::clone(&self.kernels);
        self.pool.spawn(move || {
            let _ = started_tx.send(());
            let refs: Vec<&Tensor> = inputs.iter().map(Arc::as_ref).collect();
            let result = catch_unwind(AssertUnwindSafe(|| kernels.apply(&op, &refs)));
            drop(slot);
            let _ = tx.send(result);
        });

        if started_rx.await.is_err() {
            return Err(ExecutionError::Pool("kernel task dropped".into()));
        }

        let outcome = match self.node_timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    warn!(node = %node, timeout = ?limit, "kernel timed out");
                    return Err(ExecutionError::Timeout {
                        node,
                        timeout: limit,
                    });
                }
            },
            None => rx.await,
        };

        match outcome {
            Ok(Ok(result)) => {
                debug!(node = %node, ok = result.is_ok(), "kernel returned");
                result.map_err(ExecutionError::from)
            }
            Ok(Err(panic)) => Err(ExecutionError::Panicked {
                node,
                message: panic_message(panic.as_ref()),
            }),
            Err(_) => Err(ExecutionError::Pool("kernel task dropped".into())),
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Stall;

    impl Kernels for Stall {
        fn apply(&self, _op: &OpKind, _inputs: &[&Tensor]) -> Result<Tensor, NumericError> {
            std::thread::sleep(Duration::from_millis(300));
            Ok(Tensor::scalar(0.0))
        }
    }

    struct Boom;

    impl Kernels for Boom {
        fn apply(&self, _op: &OpKind, _inputs: &[&Tensor]) -> Result<Tensor, NumericError> {
            panic!("kernel exploded");
        }
    }

    #[tokio::test]
    async fn executes_on_pool() {
        let exec = LocalExecutor::cpu(2, None).unwrap();
        let x = Arc::new(Tensor::from_rows(&[&[1.0, -2.0]]).unwrap());
        let out = exec.execute(NodeId(1), OpKind::Neg, vec![x]).await.unwrap();
        assert_eq!(out.data(), &[-1.0, 2.0]);
        assert_eq!(exec.parallelism(), 2);
    }

    #[tokio::test]
    async fn numeric_failure_is_reported() {
        let exec = LocalExecutor::cpu(1, None).unwrap();
        let a = Arc::new(Tensor::zeros(exgraf_core::Shape::new(2, 3)));
        let err = exec
            .execute(NodeId(5), OpKind::MatMul, vec![a.clone(), a])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ExecutionError::Numeric(NumericError::IncompatibleDimensions { .. })
        ));
    }

    #[tokio::test]
    async fn stuck_kernel_times_out() {
        let exec = LocalExecutor::new(1, Some(Duration::from_millis(50)), Arc::new(Stall)).unwrap();
        let err = exec.execute(NodeId(9), OpKind::Neg, vec![]).await.unwrap_err();
        assert_eq!(
            err,
            ExecutionError::Timeout {
                node: NodeId(9),
                timeout: Duration::from_millis(50)
            }
        );
    }

    struct Slow;

    impl Kernels for Slow {
        fn apply(&self, _op: &OpKind, _inputs: &[&Tensor]) -> Result<Tensor, NumericError> {
            std::thread::sleep(Duration::from_millis(100));
            Ok(Tensor::scalar(1.0))
        }
    }

    #[tokio::test]
    async fn queued_kernel_gets_its_full_timeout() {
        let exec = Arc::new(
            LocalExecutor::new(1, Some(Duration::from_millis(150)), Arc::new(Slow)).unwrap(),
        );
        let a = {
            let exec = Arc::clone(&exec);
            tokio::spawn(async move { exec.execute(NodeId(1), OpKind::Neg, vec![]).await })
        };
        let b = {
            let exec = Arc::clone(&exec);
            tokio::spawn(async move { exec.execute(NodeId(2), OpKind::Neg, vec![]).await })
        };
        assert!(a.await.unwrap().is_ok());
        assert!(b.await.unwrap().is_ok());
        assert_eq!(exec.free_slots(), 1);
    }

    #[tokio::test]
    async fn timed_out_kernel_keeps_its_slot() {
        let exec = LocalExecutor::new(1, Some(Duration::from_millis(50)), Arc::new(Stall)).unwrap();
        assert!(exec.execute(NodeId(1), OpKind::Neg, vec![]).await.is_err());
        assert_eq!(exec.free_slots(), 0);
        assert!(exec.try_reserve().is_none());

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(exec.free_slots(), 1);
    }

    #[tokio::test]
    async fn panic_becomes_error() {
        let exec = LocalExecutor::new(1, None, Arc::new(Boom)).unwrap();
        let err = exec.execute(NodeId(2), OpKind::Relu, vec![]).await.unwrap_err();
        match err {
            ExecutionError::Panicked { node, message } => {
                assert_eq!(node, NodeId(2));
                assert!(message.contains("exploded"));
            }
            other => panic!("expected panic error, got {other}"),
        }
    }
}
