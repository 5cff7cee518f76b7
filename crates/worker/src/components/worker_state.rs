use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::RwLock;

/// Worker主循环与心跳循环共享的状态
#[derive(Debug, Default)]
pub struct WorkerState {
    current_job: RwLock<Option<String>>,
    jobs_processed: AtomicU64,
}

impl WorkerState {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_current_job(&self, job_id: Option<String>) {
        *self.current_job.write().await = job_id;
    }

    pub async fn current_job(&self) -> Option<String> {
        self.current_job.read().await.clone()
    }

    pub fn increment_processed(&self) -> u64 {
        self.jobs_processed.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn jobs_processed(&self) -> u64 {
        self.jobs_processed.load(Ordering::SeqCst)
    }
}
