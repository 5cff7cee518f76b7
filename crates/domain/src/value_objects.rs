use serde::{Deserialize, Serialize};

use crate::entities::Job;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum OwnerUpdate {
    #[default]
    Keep,
    Set(String),
    Clear,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AttemptUpdate {
    #[default]
    Keep,
    Increment,
    Reset,
}

/// transition 附带的字段更新
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobUpdate {
    pub owner: OwnerUpdate,
    /// 要求当前持有者与之相同，否则视为 StaleTransition
    pub expected_owner: Option<String>,
    pub progress: Option<u8>,
    pub message: Option<String>,
    pub attempt: AttemptUpdate,
}

impl JobUpdate {
    /// queued -> running 的认领更新
    pub fn claim(worker_id: impl Into<String>) -> Self {
        Self {
            owner: OwnerUpdate::Set(worker_id.into()),
            progress: Some(0),
            message: Some("running".to_string()),
            attempt: AttemptUpdate::Increment,
            ..Default::default()
        }
    }

    pub fn owner(mut self, owner: OwnerUpdate) -> Self {
        self.owner = owner;
        self
    }

    pub fn clear_owner(self) -> Self {
        self.owner(OwnerUpdate::Clear)
    }

    pub fn expect_owner(mut self, worker_id: impl Into<String>) -> Self {
        self.expected_owner = Some(worker_id.into());
        self
    }

    pub fn progress(mut self, progress: u8) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn attempt(mut self, attempt: AttemptUpdate) -> Self {
        self.attempt = attempt;
        self
    }
}

/// list_jobs 的分页结果，按创建时间倒序
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobPage {
    pub jobs: Vec<Job>,
    pub total: usize,
}
