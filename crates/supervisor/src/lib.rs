pub mod heartbeat_registry;
pub mod job_service;
pub mod retry_promoter;

pub use heartbeat_registry::{HeartbeatRegistry, HeartbeatRegistryConfig, ReclaimReport};
pub use job_service::{CancelOutcome, JobService, JobStatusView, SubmitJobRequest, WorkerView};
pub use retry_promoter::RetryPromoter;
