//! 进程内存储后端，用于测试与单进程运行
//!
//! 每个关注点一把互斥锁，transition 在锁内完成检查与写入，等价于存储层的原子CAS。

use std::collections::{HashMap, HashSet, VecDeque};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, Mutex};
use tracing::debug;

use jobqueue_domain::{
    DeadLetterEntry, DeadLetterQueue, HeartbeatStore, Job, JobPage, JobQueue, JobStatus,
    JobStore, JobType, JobUpdate, ProgressEvent, QueueEntry, WorkerHeartbeat,
};
use jobqueue_errors::{JobQueueError, JobQueueResult};

const PROGRESS_CHANNEL_CAPACITY: usize = 1024;

#[derive(Default)]
struct JobTable {
    jobs: HashMap<String, Job>,
    cancel_requested: HashSet<String>,
}

#[derive(Default)]
struct QueueState {
    ready: HashMap<JobType, VecDeque<QueueEntry>>,
    delayed: HashMap<(JobType, String), DateTime<Utc>>,
}

#[derive(Default)]
struct DlqState {
    order: Vec<String>,
    entries: HashMap<String, DeadLetterEntry>,
}

pub struct InMemoryStore {
    jobs: Mutex<JobTable>,
    queues: Mutex<QueueState>,
    dlq: Mutex<DlqState>,
    heartbeats: Mutex<HashMap<String, WorkerHeartbeat>>,
    progress_tx: broadcast::Sender<ProgressEvent>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        let (progress_tx, _) = broadcast::channel(PROGRESS_CHANNEL_CAPACITY);
        Self {
            jobs: Mutex::new(JobTable::default()),
            queues: Mutex::new(QueueState::default()),
            dlq: Mutex::new(DlqState::default()),
            heartbeats: Mutex::new(HashMap::new()),
            progress_tx,
        }
    }

    /// 订阅作业状态与进度变更
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.progress_tx.subscribe()
    }

    fn publish(&self, job: &Job) {
        // 没有订阅者时发送失败是正常情况
        let _ = self.progress_tx.send(ProgressEvent::from(job));
    }
}

#[async_trait]
impl JobStore for InMemoryStore {
    async fn create(&self, job: &Job) -> JobQueueResult<()> {
        let mut table = self.jobs.lock().await;
        if table.jobs.contains_key(&job.job_id) {
            return Err(JobQueueError::DuplicateJob {
                id: job.job_id.clone(),
            });
        }
        table.jobs.insert(job.job_id.clone(), job.clone());
        drop(table);

        self.publish(job);
        Ok(())
    }

    async fn transition(
        &self,
        id: &str,
        from: &[JobStatus],
        to: JobStatus,
        update: JobUpdate,
    ) -> JobQueueResult<Job> {
        let mut table = self.jobs.lock().await;
        let job = table
            .jobs
            .get_mut(id)
            .ok_or_else(|| JobQueueError::job_not_found(id))?;

        job.check_transition(from, &update)?;

        let mut next = job.clone();
        next.apply_transition(to, &update, Utc::now())?;
        *job = next.clone();

        if to.is_terminal() {
            table.cancel_requested.remove(id);
        }
        drop(table);

        debug!(job_id = %id, status = %to, progress = next.progress, "作业状态已更新");
        self.publish(&next);
        Ok(next)
    }

    async fn get(&self, id: &str) -> JobQueueResult<Option<Job>> {
        Ok(self.jobs.lock().await.jobs.get(id).cloned())
    }

    async fn list_jobs(&self, limit: usize, job_type: Option<JobType>) -> JobQueueResult<JobPage> {
        let table = self.jobs.lock().await;
        let mut jobs: Vec<Job> = table
            .jobs
            .values()
            .filter(|job| job_type.map_or(true, |t| job.job_type == t))
            .cloned()
            .collect();
        drop(table);

        jobs.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.job_id.cmp(&a.job_id))
        });
        let total = jobs.len();
        jobs.truncate(limit);

        Ok(JobPage { jobs, total })
    }

    async fn list_running(&self) -> JobQueueResult<Vec<Job>> {
        Ok(self
            .jobs
            .lock()
            .await
            .jobs
            .values()
            .filter(|job| job.is_running())
            .cloned()
            .collect())
    }

    async fn list_by_status(&self, status: JobStatus) -> JobQueueResult<Vec<Job>> {
        Ok(self
            .jobs
            .lock()
            .await
            .jobs
            .values()
            .filter(|job| job.status == status)
            .cloned()
            .collect())
    }

    async fn request_cancel(&self, id: &str) -> JobQueueResult<()> {
        let mut table = self.jobs.lock().await;
        if !table.jobs.contains_key(id) {
            return Err(JobQueueError::job_not_found(id));
        }
        table.cancel_requested.insert(id.to_string());
        Ok(())
    }

    async fn is_cancel_requested(&self, id: &str) -> JobQueueResult<bool> {
        Ok(self.jobs.lock().await.cancel_requested.contains(id))
    }
}

#[async_trait]
impl JobQueue for InMemoryStore {
    async fn enqueue(&self, job_type: JobType, job_id: &str) -> JobQueueResult<()> {
        let mut queues = self.queues.lock().await;
        queues
            .ready
            .entry(job_type)
            .or_default()
            .push_back(QueueEntry::new(job_type, job_id));
        Ok(())
    }

    async fn dequeue(&self, job_type: JobType) -> JobQueueResult<Option<QueueEntry>> {
        let mut queues = self.queues.lock().await;
        Ok(queues
            .ready
            .get_mut(&job_type)
            .and_then(|queue| queue.pop_front()))
    }

    async fn schedule(
        &self,
        job_type: JobType,
        job_id: &str,
        ready_at: DateTime<Utc>,
    ) -> JobQueueResult<()> {
        let mut queues = self.queues.lock().await;
        queues
            .delayed
            .insert((job_type, job_id.to_string()), ready_at);
        Ok(())
    }

    async fn promote_due(&self, now: DateTime<Utc>) -> JobQueueResult<usize> {
        let mut queues = self.queues.lock().await;

        let mut due: Vec<((JobType, String), DateTime<Utc>)> = queues
            .delayed
            .iter()
            .filter(|(_, ready_at)| **ready_at <= now)
            .map(|(key, ready_at)| (key.clone(), *ready_at))
            .collect();
        due.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0 .1.cmp(&b.0 .1)));

        for ((job_type, job_id), _) in &due {
            queues.delayed.remove(&(*job_type, job_id.clone()));
            queues
                .ready
                .entry(*job_type)
                .or_default()
                .push_back(QueueEntry::new(*job_type, job_id.clone()));
        }

        Ok(due.len())
    }

    async fn is_pending(&self, job_type: JobType, job_id: &str) -> JobQueueResult<bool> {
        let queues = self.queues.lock().await;
        let ready = queues
            .ready
            .get(&job_type)
            .is_some_and(|queue| queue.iter().any(|entry| entry.job_id == job_id));
        Ok(ready || queues.delayed.contains_key(&(job_type, job_id.to_string())))
    }

    async fn depth(&self, job_type: JobType) -> JobQueueResult<usize> {
        Ok(self
            .queues
            .lock()
            .await
            .ready
            .get(&job_type)
            .map(|queue| queue.len())
            .unwrap_or(0))
    }

    async fn delayed_depth(&self) -> JobQueueResult<usize> {
        Ok(self.queues.lock().await.delayed.len())
    }
}

#[async_trait]
impl DeadLetterQueue for InMemoryStore {
    async fn push(&self, entry: &DeadLetterEntry) -> JobQueueResult<bool> {
        let mut dlq = self.dlq.lock().await;
        if dlq.entries.contains_key(&entry.job_id) {
            return Ok(false);
        }
        dlq.order.push(entry.job_id.clone());
        dlq.entries.insert(entry.job_id.clone(), entry.clone());
        Ok(true)
    }

    async fn list(&self) -> JobQueueResult<Vec<DeadLetterEntry>> {
        let dlq = self.dlq.lock().await;
        Ok(dlq
            .order
            .iter()
            .filter_map(|id| dlq.entries.get(id).cloned())
            .collect())
    }

    async fn remove(&self, job_id: &str) -> JobQueueResult<bool> {
        let mut dlq = self.dlq.lock().await;
        if dlq.entries.remove(job_id).is_none() {
            return Ok(false);
        }
        dlq.order.retain(|id| id != job_id);
        Ok(true)
    }

    async fn contains(&self, job_id: &str) -> JobQueueResult<bool> {
        Ok(self.dlq.lock().await.entries.contains_key(job_id))
    }

    async fn depth(&self) -> JobQueueResult<usize> {
        Ok(self.dlq.lock().await.entries.len())
    }
}

#[async_trait]
impl HeartbeatStore for InMemoryStore {
    async fn record(&self, heartbeat: &WorkerHeartbeat) -> JobQueueResult<()> {
        self.heartbeats
            .lock()
            .await
            .insert(heartbeat.worker_id.clone(), heartbeat.clone());
        Ok(())
    }

    async fn get(&self, worker_id: &str) -> JobQueueResult<Option<WorkerHeartbeat>> {
        Ok(self.heartbeats.lock().await.get(worker_id).cloned())
    }

    async fn list(&self) -> JobQueueResult<Vec<WorkerHeartbeat>> {
        let mut heartbeats: Vec<WorkerHeartbeat> =
            self.heartbeats.lock().await.values().cloned().collect();
        heartbeats.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        Ok(heartbeats)
    }

    async fn remove(&self, worker_id: &str) -> JobQueueResult<()> {
        self.heartbeats.lock().await.remove(worker_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn job(id: &str, job_type: JobType) -> Job {
        Job::new(id.to_string(), job_type, json!({}), 3)
    }

    #[tokio::test]
    async fn test_create_rejects_duplicate() {
        let store = InMemoryStore::new();
        store.create(&job("job-1", JobType::Migration)).await.unwrap();

        let err = store
            .create(&job("job-1", JobType::Migration))
            .await
            .unwrap_err();
        assert!(matches!(err, JobQueueError::DuplicateJob { .. }));
        assert_eq!(store.list_jobs(10, None).await.unwrap().total, 1);
    }

    #[tokio::test]
    async fn test_transition_cas() {
        let store = InMemoryStore::new();
        store.create(&job("job-1", JobType::Migration)).await.unwrap();

        let claimed = store
            .transition(
                "job-1",
                &[JobStatus::Queued],
                JobStatus::Running,
                JobUpdate::claim("worker-a"),
            )
            .await
            .unwrap();
        assert_eq!(claimed.attempt, 1);
        assert_eq!(claimed.owner_worker_id, "worker-a");

        let err = store
            .transition(
                "job-1",
                &[JobStatus::Queued],
                JobStatus::Running,
                JobUpdate::claim("worker-b"),
            )
            .await
            .unwrap_err();
        assert!(err.is_stale());

        let missing = store
            .transition(
                "nope",
                &[JobStatus::Queued],
                JobStatus::Running,
                JobUpdate::claim("worker-b"),
            )
            .await
            .unwrap_err();
        assert!(matches!(missing, JobQueueError::JobNotFound { .. }));
    }

    #[tokio::test]
    async fn test_transition_publishes_progress() {
        let store = InMemoryStore::new();
        let mut events = store.subscribe();
        store.create(&job("job-1", JobType::Backtest)).await.unwrap();
        store
            .transition(
                "job-1",
                &[JobStatus::Queued],
                JobStatus::Running,
                JobUpdate::claim("worker-a"),
            )
            .await
            .unwrap();

        let created = events.recv().await.unwrap();
        assert_eq!(created.status, JobStatus::Queued);
        let running = events.recv().await.unwrap();
        assert_eq!(running.status, JobStatus::Running);
        assert_eq!(running.channel(), "jobs:progress:job-1");
    }

    #[tokio::test]
    async fn test_queue_fifo_per_type() {
        let store = InMemoryStore::new();
        store.enqueue(JobType::Migration, "m1").await.unwrap();
        store.enqueue(JobType::Backtest, "b1").await.unwrap();
        store.enqueue(JobType::Migration, "m2").await.unwrap();

        assert_eq!(JobQueue::depth(&store, JobType::Migration).await.unwrap(), 2);
        assert_eq!(
            store.dequeue(JobType::Migration).await.unwrap().unwrap().job_id,
            "m1"
        );
        assert_eq!(
            store.dequeue(JobType::Migration).await.unwrap().unwrap().job_id,
            "m2"
        );
        assert!(store.dequeue(JobType::Migration).await.unwrap().is_none());
        assert_eq!(
            store.dequeue(JobType::Backtest).await.unwrap().unwrap().job_id,
            "b1"
        );
    }

    #[tokio::test]
    async fn test_delayed_promotion_appends_to_tail() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        store.enqueue(JobType::Migration, "m1").await.unwrap();
        store
            .schedule(JobType::Migration, "retry-1", now - chrono::Duration::seconds(1))
            .await
            .unwrap();
        store
            .schedule(JobType::Migration, "later", now + chrono::Duration::seconds(60))
            .await
            .unwrap();

        assert_eq!(store.promote_due(now).await.unwrap(), 1);
        assert_eq!(store.delayed_depth().await.unwrap(), 1);
        assert_eq!(
            store.dequeue(JobType::Migration).await.unwrap().unwrap().job_id,
            "m1"
        );
        assert_eq!(
            store.dequeue(JobType::Migration).await.unwrap().unwrap().job_id,
            "retry-1"
        );
    }

    #[tokio::test]
    async fn test_dlq_push_is_idempotent() {
        let store = InMemoryStore::new();
        let entry = DeadLetterEntry::from_job(&job("job-1", JobType::Backtest), "boom");

        assert!(store.push(&entry).await.unwrap());
        assert!(!store.push(&entry).await.unwrap());
        assert_eq!(DeadLetterQueue::depth(&store).await.unwrap(), 1);

        assert!(DeadLetterQueue::remove(&store, "job-1").await.unwrap());
        assert!(DeadLetterQueue::list(&store).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_jobs_newest_first_with_filter() {
        let store = InMemoryStore::new();
        let mut first = job("a", JobType::Migration);
        first.created_at = Utc::now() - chrono::Duration::seconds(10);
        store.create(&first).await.unwrap();
        store.create(&job("b", JobType::Backtest)).await.unwrap();
        store.create(&job("c", JobType::Migration)).await.unwrap();

        let page = store.list_jobs(1, Some(JobType::Migration)).await.unwrap();
        assert_eq!(page.total, 2);
        assert_eq!(page.jobs.len(), 1);
        assert_eq!(page.jobs[0].job_id, "c");
    }

    #[tokio::test]
    async fn test_cancel_marker_cleared_on_terminal() {
        let store = InMemoryStore::new();
        store.create(&job("job-1", JobType::Migration)).await.unwrap();
        store.request_cancel("job-1").await.unwrap();
        assert!(store.is_cancel_requested("job-1").await.unwrap());

        store
            .transition(
                "job-1",
                &[JobStatus::Queued],
                JobStatus::Failed,
                JobUpdate::default().message("cancelled"),
            )
            .await
            .unwrap();
        assert!(!store.is_cancel_requested("job-1").await.unwrap());
        assert!(store.request_cancel("missing").await.is_err());
    }

    #[tokio::test]
    async fn test_pending_lookup_covers_ready_and_delayed() {
        let store = InMemoryStore::new();
        store.enqueue(JobType::Migration, "ready").await.unwrap();
        store
            .schedule(JobType::Backtest, "waiting", Utc::now() + chrono::Duration::seconds(30))
            .await
            .unwrap();

        assert!(store.is_pending(JobType::Migration, "ready").await.unwrap());
        assert!(store.is_pending(JobType::Backtest, "waiting").await.unwrap());
        assert!(!store.is_pending(JobType::Backtest, "ready").await.unwrap());

        store.dequeue(JobType::Migration).await.unwrap();
        assert!(!store.is_pending(JobType::Migration, "ready").await.unwrap());
    }

    #[tokio::test]
    async fn test_list_by_status_and_dlq_contains() {
        let store = InMemoryStore::new();
        store.create(&job("q-1", JobType::Migration)).await.unwrap();
        store.create(&job("r-1", JobType::Backtest)).await.unwrap();
        store
            .transition("r-1", &[JobStatus::Queued], JobStatus::Running, JobUpdate::claim("w"))
            .await
            .unwrap();

        let queued = store.list_by_status(JobStatus::Queued).await.unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].job_id, "q-1");
        assert!(store.list_by_status(JobStatus::Dead).await.unwrap().is_empty());

        assert!(!store.contains("r-1").await.unwrap());
        store
            .push(&DeadLetterEntry::from_job(&job("r-1", JobType::Backtest), "boom"))
            .await
            .unwrap();
        assert!(store.contains("r-1").await.unwrap());
    }
}
