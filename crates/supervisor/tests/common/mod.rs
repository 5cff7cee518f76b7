#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobqueue_config::CircuitBreakerSettings;
use jobqueue_domain::{
    DeadLetterEntry, DeadLetterQueue, HeartbeatStore, Job, JobPage, JobQueue, JobQueueError,
    JobQueueResult, JobStatus, JobStore, JobType, JobUpdate, QueueEntry, RetryPolicy,
    RetryScheduler, Stores, WorkerHeartbeat,
};
use jobqueue_infrastructure::{CircuitBreakerRegistry, InMemoryStore};
use jobqueue_supervisor::{HeartbeatRegistry, HeartbeatRegistryConfig};
use jobqueue_worker::{simulated_registry, WorkerLifecycle, WorkerSettings};

/// 包装内存存储，按操作名让接下来的调用返回存储错误
pub struct FaultyStore {
    inner: InMemoryStore,
    faults: Mutex<HashMap<&'static str, u32>>,
}

impl FaultyStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: InMemoryStore::new(),
            faults: Mutex::new(HashMap::new()),
        })
    }

    pub fn stores(self: &Arc<Self>) -> Stores {
        Stores::from_backend(Arc::clone(self))
    }

    /// 接下来 `times` 次调用失败
    pub fn fail_next(&self, operation: &'static str, times: u32) {
        self.faults.lock().unwrap().insert(operation, times);
    }

    pub fn fail_always(&self, operation: &'static str) {
        self.fail_next(operation, u32::MAX);
    }

    pub fn heal(&self, operation: &'static str) {
        self.faults.lock().unwrap().remove(operation);
    }

    fn check(&self, operation: &'static str) -> JobQueueResult<()> {
        let mut faults = self.faults.lock().unwrap();
        match faults.get_mut(operation) {
            Some(remaining) if *remaining > 0 => {
                if *remaining != u32::MAX {
                    *remaining -= 1;
                }
                Err(JobQueueError::store(format!("{operation} unavailable")))
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl JobStore for FaultyStore {
    async fn create(&self, job: &Job) -> JobQueueResult<()> {
        self.check("create")?;
        self.inner.create(job).await
    }

    async fn transition(
        &self,
        id: &str,
        from: &[JobStatus],
        to: JobStatus,
        update: JobUpdate,
    ) -> JobQueueResult<Job> {
        self.check("transition")?;
        self.inner.transition(id, from, to, update).await
    }

    async fn get(&self, id: &str) -> JobQueueResult<Option<Job>> {
        self.check("get_job")?;
        JobStore::get(&self.inner, id).await
    }

    async fn list_jobs(&self, limit: usize, job_type: Option<JobType>) -> JobQueueResult<JobPage> {
        self.check("list_jobs")?;
        self.inner.list_jobs(limit, job_type).await
    }

    async fn list_running(&self) -> JobQueueResult<Vec<Job>> {
        self.check("list_running")?;
        self.inner.list_running().await
    }

    async fn list_by_status(&self, status: JobStatus) -> JobQueueResult<Vec<Job>> {
        self.check("list_by_status")?;
        self.inner.list_by_status(status).await
    }

    async fn request_cancel(&self, id: &str) -> JobQueueResult<()> {
        self.check("request_cancel")?;
        self.inner.request_cancel(id).await
    }

    async fn is_cancel_requested(&self, id: &str) -> JobQueueResult<bool> {
        self.check("is_cancel_requested")?;
        self.inner.is_cancel_requested(id).await
    }
}

#[async_trait]
impl JobQueue for FaultyStore {
    async fn enqueue(&self, job_type: JobType, job_id: &str) -> JobQueueResult<()> {
        self.check("enqueue")?;
        self.inner.enqueue(job_type, job_id).await
    }

    async fn dequeue(&self, job_type: JobType) -> JobQueueResult<Option<QueueEntry>> {
        self.check("dequeue")?;
        self.inner.dequeue(job_type).await
    }

    async fn schedule(
        &self,
        job_type: JobType,
        job_id: &str,
        ready_at: DateTime<Utc>,
    ) -> JobQueueResult<()> {
        self.check("schedule")?;
        self.inner.schedule(job_type, job_id, ready_at).await
    }

    async fn promote_due(&self, now: DateTime<Utc>) -> JobQueueResult<usize> {
        self.check("promote_due")?;
        self.inner.promote_due(now).await
    }

    async fn is_pending(&self, job_type: JobType, job_id: &str) -> JobQueueResult<bool> {
        self.check("is_pending")?;
        self.inner.is_pending(job_type, job_id).await
    }

    async fn depth(&self, job_type: JobType) -> JobQueueResult<usize> {
        JobQueue::depth(&self.inner, job_type).await
    }

    async fn delayed_depth(&self) -> JobQueueResult<usize> {
        self.inner.delayed_depth().await
    }
}

#[async_trait]
impl DeadLetterQueue for FaultyStore {
    async fn push(&self, entry: &DeadLetterEntry) -> JobQueueResult<bool> {
        self.check("push")?;
        self.inner.push(entry).await
    }

    async fn list(&self) -> JobQueueResult<Vec<DeadLetterEntry>> {
        DeadLetterQueue::list(&self.inner).await
    }

    async fn remove(&self, job_id: &str) -> JobQueueResult<bool> {
        self.check("remove_dead")?;
        DeadLetterQueue::remove(&self.inner, job_id).await
    }

    async fn contains(&self, job_id: &str) -> JobQueueResult<bool> {
        self.check("contains")?;
        self.inner.contains(job_id).await
    }

    async fn depth(&self) -> JobQueueResult<usize> {
        DeadLetterQueue::depth(&self.inner).await
    }
}

#[async_trait]
impl HeartbeatStore for FaultyStore {
    async fn record(&self, heartbeat: &WorkerHeartbeat) -> JobQueueResult<()> {
        self.check("record")?;
        self.inner.record(heartbeat).await
    }

    async fn get(&self, worker_id: &str) -> JobQueueResult<Option<WorkerHeartbeat>> {
        HeartbeatStore::get(&self.inner, worker_id).await
    }

    async fn list(&self) -> JobQueueResult<Vec<WorkerHeartbeat>> {
        HeartbeatStore::list(&self.inner).await
    }

    async fn remove(&self, worker_id: &str) -> JobQueueResult<()> {
        HeartbeatStore::remove(&self.inner, worker_id).await
    }
}

pub const DEAD_TIMEOUT: Duration = Duration::from_secs(3);

pub fn worker(stores: &Stores, worker_id: &str) -> WorkerLifecycle {
    WorkerLifecycle::new(
        worker_id.to_string(),
        WorkerSettings {
            job_types: vec![JobType::Migration, JobType::Backtest],
            poll_interval: Duration::from_millis(5),
            max_poll_interval: Duration::from_millis(20),
            heartbeat_interval: Duration::from_secs(1),
            job_timeout: Duration::from_secs(5),
            max_jobs: 0,
            error_backoff: Duration::from_millis(10),
        },
        stores.clone(),
        Arc::new(simulated_registry(Duration::from_millis(1))),
        Arc::new(CircuitBreakerRegistry::new(CircuitBreakerSettings::default())),
        Arc::new(RetryScheduler::new(RetryPolicy {
            base_delay: Duration::from_millis(10),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_millis(50),
            jitter_factor: 0.0,
        })),
    )
}

/// 死亡超时为 DEAD_TIMEOUT
pub fn registry(stores: &Stores) -> HeartbeatRegistry {
    HeartbeatRegistry::new(
        stores.clone(),
        HeartbeatRegistryConfig {
            heartbeat_interval: Duration::from_secs(1),
            dead_timeout_multiplier: 3,
            poll_interval: Duration::from_millis(10),
        },
    )
}

/// 超过死亡超时之后的扫描时间点
pub fn after_dead_timeout() -> DateTime<Utc> {
    Utc::now() + chrono::Duration::from_std(DEAD_TIMEOUT).unwrap() + chrono::Duration::seconds(1)
}
