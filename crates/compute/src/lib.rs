pub mod cancel;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod executor;
pub mod kernels;
pub mod remote;
pub mod runs;
pub mod scheduler;
pub mod store;
pub mod transport;

pub use cancel::CancelToken;
pub use config::{ConfigError, ExgrafConfig, ServerConfig, TransportConfig, WorkerEndpoints};
pub use coordinator::{Coordinator, RunOutput};
pub use error::RunError;
pub use executor::{ExecSlot, ExecutionError, LocalExecutor};
pub use kernels::{CpuKernels, Kernels};
pub use remote::WorkerService;
pub use runs::{FailureDescriptor, RunRegistry, RunRetention, RunStatus, RunSummary};
pub use scheduler::{
    ExecutionState, FailureCause, NodeFailure, Outcome, RunMetrics, RunReport, Scheduler,
    SchedulerConfig, Target,
};
pub use store::{ResultStore, StoreError};
pub use transport::{
    CorrelationToken, LoopbackConfig, LoopbackTransport, RemoteError, RemoteTask, TransportError,
    TransportEvent, WorkerLoad, WorkerTransport, ZmqWorkerTransport,
};
