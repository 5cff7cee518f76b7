pub mod components;
pub mod context;
pub mod executors;
pub mod handler_registry;
pub mod pool;

pub use components::{
    ExecutionOutcome, HeartbeatManager, JobExecutionManager, WorkerLifecycle, WorkerSettings,
    WorkerState,
};
pub use context::JobContext;
pub use executors::{simulated_registry, SimulatedHandler, SimulationParams};
pub use handler_registry::{HandlerRegistry, JobHandler};
pub use pool::{resolve_worker_id, WorkerPool};
