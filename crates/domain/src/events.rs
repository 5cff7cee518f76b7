use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entities::{Job, JobStatus};

/// 作业状态或进度变更事件，发布到 jobs:progress:{id}
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProgressEvent {
    pub job_id: String,
    pub status: JobStatus,
    pub progress: u8,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl From<&Job> for ProgressEvent {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.job_id.clone(),
            status: job.status,
            progress: job.progress,
            message: job.message.clone(),
            timestamp: job.updated_at,
        }
    }
}

impl ProgressEvent {
    pub fn channel(&self) -> String {
        format!("jobs:progress:{}", self.job_id)
    }
}
