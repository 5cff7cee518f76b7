//! 存储端口抽象
//!
//! 队列、状态表与存活注册表共享同一个存储，所有作业状态变更都经过 `JobStore::transition`

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobqueue_errors::JobQueueResult;

use crate::entities::{DeadLetterEntry, Job, JobStatus, JobType, QueueEntry, WorkerHeartbeat};
use crate::value_objects::{JobPage, JobUpdate};

/// 作业状态表
#[async_trait]
pub trait JobStore: Send + Sync {
    /// 作业ID已存在时返回 DuplicateJob
    async fn create(&self, job: &Job) -> JobQueueResult<()>;

    /// 比较并设置：仅当当前状态属于 `from` 时才写入 `to`，否则返回 StaleTransition
    async fn transition(
        &self,
        id: &str,
        from: &[JobStatus],
        to: JobStatus,
        update: JobUpdate,
    ) -> JobQueueResult<Job>;

    async fn get(&self, id: &str) -> JobQueueResult<Option<Job>>;

    async fn list_jobs(&self, limit: usize, job_type: Option<JobType>) -> JobQueueResult<JobPage>;

    async fn list_running(&self) -> JobQueueResult<Vec<Job>>;

    /// 指定状态的全部作业，供对账扫描使用
    async fn list_by_status(&self, status: JobStatus) -> JobQueueResult<Vec<Job>>;

    async fn request_cancel(&self, id: &str) -> JobQueueResult<()>;

    async fn is_cancel_requested(&self, id: &str) -> JobQueueResult<bool>;
}

/// 按作业类型分区的FIFO队列
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// 追加到该类型队列尾部
    async fn enqueue(&self, job_type: JobType, job_id: &str) -> JobQueueResult<()>;

    /// 原子地弹出队首，队列为空时返回 None
    async fn dequeue(&self, job_type: JobType) -> JobQueueResult<Option<QueueEntry>>;

    /// 放入延迟集合，到期后由 promote_due 移到队列尾部
    async fn schedule(
        &self,
        job_type: JobType,
        job_id: &str,
        ready_at: DateTime<Utc>,
    ) -> JobQueueResult<()>;

    async fn promote_due(&self, now: DateTime<Utc>) -> JobQueueResult<usize>;

    /// 作业ID是否在该类型的就绪队列或延迟集合中
    async fn is_pending(&self, job_type: JobType, job_id: &str) -> JobQueueResult<bool>;

    async fn depth(&self, job_type: JobType) -> JobQueueResult<usize>;

    async fn delayed_depth(&self) -> JobQueueResult<usize>;
}

/// 死信队列，同一作业ID只保留一条
#[async_trait]
pub trait DeadLetterQueue: Send + Sync {
    /// 返回 false 表示该作业已在死信队列中
    async fn push(&self, entry: &DeadLetterEntry) -> JobQueueResult<bool>;

    async fn list(&self) -> JobQueueResult<Vec<DeadLetterEntry>>;

    async fn remove(&self, job_id: &str) -> JobQueueResult<bool>;

    async fn contains(&self, job_id: &str) -> JobQueueResult<bool>;

    async fn depth(&self) -> JobQueueResult<usize>;
}

#[async_trait]
pub trait HeartbeatStore: Send + Sync {
    async fn record(&self, heartbeat: &WorkerHeartbeat) -> JobQueueResult<()>;

    async fn get(&self, worker_id: &str) -> JobQueueResult<Option<WorkerHeartbeat>>;

    async fn list(&self) -> JobQueueResult<Vec<WorkerHeartbeat>>;

    async fn remove(&self, worker_id: &str) -> JobQueueResult<()>;
}

/// 同一后端上各端口的组合
#[derive(Clone)]
pub struct Stores {
    pub jobs: Arc<dyn JobStore>,
    pub queue: Arc<dyn JobQueue>,
    pub dlq: Arc<dyn DeadLetterQueue>,
    pub heartbeats: Arc<dyn HeartbeatStore>,
}

impl Stores {
    /// 由同时实现所有端口的后端构造
    pub fn from_backend<S>(backend: Arc<S>) -> Self
    where
        S: JobStore + JobQueue + DeadLetterQueue + HeartbeatStore + 'static,
    {
        Self {
            jobs: backend.clone(),
            queue: backend.clone(),
            dlq: backend.clone(),
            heartbeats: backend,
        }
    }
}
