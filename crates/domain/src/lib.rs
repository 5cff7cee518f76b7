pub mod entities;
pub mod events;
pub mod ports;
pub mod retry_scheduler;
pub mod value_objects;

pub use entities::*;
pub use events::*;
pub use jobqueue_errors::{JobQueueError, JobQueueResult};
pub use ports::*;
pub use retry_scheduler::*;
pub use value_objects::*;
