use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, error, info, warn};

use jobqueue_domain::{
    DeadLetterEntry, Job, JobStatus, JobUpdate, QueueEntry, RetryAction, RetryScheduler, Stores,
};
use jobqueue_errors::{JobQueueError, JobQueueResult};
use jobqueue_infrastructure::{CircuitBreakerRegistry, MetricsCollector};

use super::WorkerState;
use crate::context::JobContext;
use crate::handler_registry::HandlerRegistry;

/// 认领之后的存储写入失败时的重试次数与基础间隔
const STORE_RETRY_ATTEMPTS: u32 = 3;
const STORE_RETRY_DELAY: Duration = Duration::from_millis(20);

/// 只对存储暂时不可用的错误重试，间隔线性增长
async fn retry_store<F, Fut, T>(mut operation: F) -> JobQueueResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = JobQueueResult<T>>,
{
    let mut attempt = 1;
    loop {
        match operation().await {
            Err(e) if e.is_store_unavailable() && attempt < STORE_RETRY_ATTEMPTS => {
                debug!(attempt, "存储写入失败，稍后重试: {}", e);
                tokio::time::sleep(STORE_RETRY_DELAY * attempt).await;
                attempt += 1;
            }
            result => return result,
        }
    }
}

/// 一次出队处理的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Completed,
    Retried { delay: Duration },
    DeadLettered { reason: String },
    Failed { reason: String },
    /// 认领失败或执行中失去持有权，不计入处理数
    Discarded,
}

impl ExecutionOutcome {
    pub fn label(&self) -> Option<&'static str> {
        match self {
            ExecutionOutcome::Completed => Some("completed"),
            ExecutionOutcome::Retried { .. } => Some("retried"),
            ExecutionOutcome::DeadLettered { .. } => Some("dead_lettered"),
            ExecutionOutcome::Failed { .. } => Some("failed"),
            ExecutionOutcome::Discarded => None,
        }
    }

    pub fn is_processed(&self) -> bool {
        self.label().is_some()
    }
}

/// 单个作业尝试的状态机: Claimed -> Executing -> {Succeeded, Retrying, DeadLettered}
pub struct JobExecutionManager {
    worker_id: String,
    stores: Stores,
    handlers: Arc<HandlerRegistry>,
    breakers: Arc<CircuitBreakerRegistry>,
    retry_scheduler: Arc<RetryScheduler>,
    job_timeout: Duration,
    state: Arc<WorkerState>,
    metrics: MetricsCollector,
}

impl JobExecutionManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        worker_id: String,
        stores: Stores,
        handlers: Arc<HandlerRegistry>,
        breakers: Arc<CircuitBreakerRegistry>,
        retry_scheduler: Arc<RetryScheduler>,
        job_timeout: Duration,
        state: Arc<WorkerState>,
    ) -> Self {
        Self {
            worker_id,
            stores,
            handlers,
            breakers,
            retry_scheduler,
            job_timeout,
            state,
            metrics: MetricsCollector::new(),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// 处理一个已出队的条目
    pub async fn execute(&self, entry: QueueEntry) -> JobQueueResult<ExecutionOutcome> {
        let job = match self.stores.jobs.get(&entry.job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                warn!(job_id = %entry.job_id, "出队的作业不存在，丢弃");
                return Ok(ExecutionOutcome::Discarded);
            }
            Err(e) => {
                self.restore_entry(&entry).await;
                return Err(e);
            }
        };

        if job.status == JobStatus::Queued && job.attempts_exhausted() {
            return self.dead_letter_unclaimed(job).await;
        }

        let job = match self.claim(&entry).await? {
            Some(job) => job,
            None => return Ok(ExecutionOutcome::Discarded),
        };

        self.state.set_current_job(Some(job.job_id.clone())).await;
        let started = Instant::now();
        let result = self.run_claimed(&job).await;
        self.state.set_current_job(None).await;

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                self.release(&job, &e).await;
                return Err(e);
            }
        };
        if let Some(label) = outcome.label() {
            self.metrics.record_job_outcome(
                job.job_type.as_str(),
                label,
                started.elapsed().as_secs_f64(),
            );
        }
        Ok(outcome)
    }

    /// queued -> running，CAS失败表示作业已被其他路径处理
    async fn claim(&self, entry: &QueueEntry) -> JobQueueResult<Option<Job>> {
        match self
            .stores
            .jobs
            .transition(
                &entry.job_id,
                &[JobStatus::Queued],
                JobStatus::Running,
                JobUpdate::claim(self.worker_id.clone()),
            )
            .await
        {
            Ok(job) => {
                info!(
                    job_id = %job.job_id,
                    job_type = %job.job_type,
                    worker_id = %self.worker_id,
                    attempt = job.attempt,
                    max_attempts = job.max_attempts,
                    "认领作业"
                );
                Ok(Some(job))
            }
            Err(e) if e.is_stale() => {
                debug!(job_id = %entry.job_id, "认领失败，作业状态已变化: {}", e);
                self.metrics.record_stale_transition("claim");
                Ok(None)
            }
            Err(JobQueueError::JobNotFound { .. }) => Ok(None),
            Err(e) => {
                self.restore_entry(entry).await;
                Err(e)
            }
        }
    }

    /// 条目已弹出但作业未被认领，放回队尾以免丢失
    async fn restore_entry(&self, entry: &QueueEntry) {
        let queue = &self.stores.queue;
        if let Err(e) = retry_store(move || queue.enqueue(entry.job_type, &entry.job_id)).await {
            error!(job_id = %entry.job_id, "放回队列失败，等待对账扫描: {}", e);
        }
    }

    /// 认领后遇到存储错误时交还作业: running -> queued 并重新入队，
    /// 交还失败的作业由心跳注册表的回收与对账扫描处理
    async fn release(&self, job: &Job, error: &JobQueueError) {
        let jobs = &self.stores.jobs;
        let worker_id = self.worker_id.as_str();
        let message = format!("released after store error: {error}");
        let released = retry_store(move || {
            jobs.transition(
                &job.job_id,
                &[JobStatus::Running],
                JobStatus::Queued,
                JobUpdate::default()
                    .expect_owner(worker_id)
                    .clear_owner()
                    .message(message.clone()),
            )
        })
        .await;

        match released {
            Ok(_) => {
                let queue = &self.stores.queue;
                match retry_store(move || queue.enqueue(job.job_type, &job.job_id)).await {
                    Ok(()) => warn!(job_id = %job.job_id, "存储错误后交还作业: {}", error),
                    Err(e) => error!(job_id = %job.job_id, "交还作业后入队失败，等待对账扫描: {}", e),
                }
            }
            Err(e) if e.is_stale() => {
                // 作业已离开 running（例如已进入死信或重试），剩余步骤由对账扫描补齐
                debug!(job_id = %job.job_id, "无需交还作业: {}", e);
            }
            Err(e) => {
                error!(job_id = %job.job_id, "交还作业失败，等待心跳回收: {}", e);
            }
        }
    }

    async fn run_claimed(&self, job: &Job) -> JobQueueResult<ExecutionOutcome> {
        if self.stores.jobs.is_cancel_requested(&job.job_id).await? {
            return self.fail(job, "cancelled before start").await;
        }

        let handler = match self.handlers.get(job.job_type) {
            Some(handler) => handler,
            None => {
                error!(job_id = %job.job_id, job_type = %job.job_type, "没有注册的处理器");
                let reason = JobQueueError::UnsupportedJobType(job.job_type.to_string());
                return self.fail(job, &reason.to_string()).await;
            }
        };

        let ctx = JobContext::new(
            job,
            self.worker_id.clone(),
            Arc::clone(&self.stores.jobs),
            Arc::clone(&self.breakers),
        );

        let result = match tokio::time::timeout(self.job_timeout, handler.handle(&ctx, &job.payload)).await {
            Ok(result) => result,
            Err(_) => Err(JobQueueError::Timeout(format!(
                "作业 {} 执行超过 {:?}",
                job.job_id, self.job_timeout
            ))),
        };

        match result {
            Ok(()) => self.complete(job).await,
            Err(e) if e.is_stale() => {
                warn!(job_id = %job.job_id, "执行期间失去作业持有权: {}", e);
                self.metrics.record_stale_transition("progress");
                Ok(ExecutionOutcome::Discarded)
            }
            Err(JobQueueError::Cancelled { .. }) => {
                info!(job_id = %job.job_id, "作业已取消");
                self.fail(job, "cancelled").await
            }
            Err(e) if e.is_retryable() => self.handle_retryable_failure(job, e).await,
            Err(e) => {
                // 不可重试的错误重试也不会成功
                let reason = format!("non-retryable: {e}");
                error!(job_id = %job.job_id, "{}", reason);
                self.metrics.record_handler_error(job.job_type.as_str());
                self.dead_letter(job, reason).await
            }
        }
    }

    async fn complete(&self, job: &Job) -> JobQueueResult<ExecutionOutcome> {
        match self
            .stores
            .jobs
            .transition(
                &job.job_id,
                &[JobStatus::Running],
                JobStatus::Completed,
                JobUpdate::default()
                    .expect_owner(self.worker_id.clone())
                    .clear_owner()
                    .progress(100)
                    .message("completed"),
            )
            .await
        {
            Ok(_) => {
                info!(job_id = %job.job_id, attempt = job.attempt, "作业完成");
                Ok(ExecutionOutcome::Completed)
            }
            Err(e) => self.lost_ownership(job, "complete", e),
        }
    }

    async fn handle_retryable_failure(
        &self,
        job: &Job,
        error: JobQueueError,
    ) -> JobQueueResult<ExecutionOutcome> {
        if error.is_dependency_unavailable() {
            warn!(job_id = %job.job_id, "依赖不可用: {}", error);
        } else {
            warn!(job_id = %job.job_id, attempt = job.attempt, "作业执行失败: {}", error);
            self.metrics.record_handler_error(job.job_type.as_str());
        }

        let decision = self
            .retry_scheduler
            .decide(job.job_type, job.attempt, job.max_attempts);

        match decision.action {
            RetryAction::Requeue => {
                let delay = self.retry_scheduler.jittered_delay(job.job_type, decision.delay);
                self.retry(job, &error, delay).await
            }
            RetryAction::DeadLetter => {
                let poison = JobQueueError::PoisonJob {
                    id: job.job_id.clone(),
                    attempts: job.attempt,
                    reason: error.to_string(),
                };
                error!(job_id = %job.job_id, "{}", poison);
                self.dead_letter(job, error.to_string()).await
            }
        }
    }

    /// running -> queued 后放入延迟集合，到期后由提升循环放回队尾
    async fn retry(
        &self,
        job: &Job,
        error: &JobQueueError,
        delay: Duration,
    ) -> JobQueueResult<ExecutionOutcome> {
        let message = format!("retrying in {}ms: {}", delay.as_millis(), error);
        if let Err(e) = self
            .stores
            .jobs
            .transition(
                &job.job_id,
                &[JobStatus::Running],
                JobStatus::Queued,
                JobUpdate::default()
                    .expect_owner(self.worker_id.clone())
                    .clear_owner()
                    .message(message),
            )
            .await
        {
            return self.lost_ownership(job, "retry", e);
        }

        let ready_at = Utc::now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        let queue = &self.stores.queue;
        let scheduled =
            retry_store(move || queue.schedule(job.job_type, &job.job_id, ready_at)).await;
        let delay = match scheduled {
            Ok(()) => delay,
            Err(e) => {
                // 延迟集合写不进去时立即放回就绪队列，放弃这次退避
                warn!(job_id = %job.job_id, "写入延迟集合失败，立即重新入队: {}", e);
                retry_store(move || queue.enqueue(job.job_type, &job.job_id)).await?;
                Duration::ZERO
            }
        };

        self.metrics.record_retry(job.job_type.as_str());
        info!(
            job_id = %job.job_id,
            attempt = job.attempt,
            delay_ms = delay.as_millis() as u64,
            "作业将在退避后重试"
        );
        Ok(ExecutionOutcome::Retried { delay })
    }

    async fn dead_letter(&self, job: &Job, reason: String) -> JobQueueResult<ExecutionOutcome> {
        let dead = match self
            .stores
            .jobs
            .transition(
                &job.job_id,
                &[JobStatus::Running],
                JobStatus::Dead,
                JobUpdate::default()
                    .expect_owner(self.worker_id.clone())
                    .clear_owner()
                    .message(reason.clone()),
            )
            .await
        {
            Ok(dead) => dead,
            Err(e) => return self.lost_ownership(job, "dead_letter", e),
        };

        self.push_dead_letter(&dead, &reason).await?;
        Ok(ExecutionOutcome::DeadLettered { reason })
    }

    /// 尝试次数已用尽但仍在队列中的作业（例如回收后）直接进入死信队列
    async fn dead_letter_unclaimed(&self, job: Job) -> JobQueueResult<ExecutionOutcome> {
        let reason = format!("attempts exhausted ({}/{})", job.attempt, job.max_attempts);
        match self
            .stores
            .jobs
            .transition(
                &job.job_id,
                &[JobStatus::Queued],
                JobStatus::Dead,
                JobUpdate::default().clear_owner().message(reason.clone()),
            )
            .await
        {
            Ok(dead) => {
                self.push_dead_letter(&dead, &reason).await?;
                self.metrics.record_job_outcome(dead.job_type.as_str(), "dead_lettered", 0.0);
                Ok(ExecutionOutcome::DeadLettered { reason })
            }
            Err(e) if e.is_stale() => {
                self.metrics.record_stale_transition("dead_letter");
                Ok(ExecutionOutcome::Discarded)
            }
            Err(e) => Err(e),
        }
    }

    async fn push_dead_letter(&self, job: &Job, reason: &str) -> JobQueueResult<()> {
        let entry = DeadLetterEntry::from_job(job, reason);
        let dlq = &self.stores.dlq;
        let entry = &entry;
        if retry_store(move || dlq.push(entry)).await? {
            self.metrics.record_dlq_move(job.job_type.as_str());
            warn!(job_id = %job.job_id, attempts = job.attempt, reason, "作业进入死信队列");
        } else {
            debug!(job_id = %job.job_id, "作业已在死信队列中");
        }
        Ok(())
    }

    /// running -> failed，用于取消与无处理器等不可重试的结束
    async fn fail(&self, job: &Job, reason: &str) -> JobQueueResult<ExecutionOutcome> {
        match self
            .stores
            .jobs
            .transition(
                &job.job_id,
                &[JobStatus::Running],
                JobStatus::Failed,
                JobUpdate::default()
                    .expect_owner(self.worker_id.clone())
                    .clear_owner()
                    .message(reason),
            )
            .await
        {
            Ok(_) => Ok(ExecutionOutcome::Failed {
                reason: reason.to_string(),
            }),
            Err(e) => self.lost_ownership(job, "fail", e),
        }
    }

    fn lost_ownership(
        &self,
        job: &Job,
        operation: &'static str,
        error: JobQueueError,
    ) -> JobQueueResult<ExecutionOutcome> {
        if error.is_stale() {
            warn!(job_id = %job.job_id, operation, "作业已被其他路径处理: {}", error);
            self.metrics.record_stale_transition(operation);
            Ok(ExecutionOutcome::Discarded)
        } else {
            Err(error)
        }
    }
}
