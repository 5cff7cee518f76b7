pub mod heartbeat_manager;
pub mod job_execution;
pub mod worker_lifecycle;
pub mod worker_state;

pub use heartbeat_manager::HeartbeatManager;
pub use job_execution::{ExecutionOutcome, JobExecutionManager};
pub use worker_lifecycle::{WorkerLifecycle, WorkerSettings};
pub use worker_state::WorkerState;
