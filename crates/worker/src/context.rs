use std::future::Future;
use std::sync::Arc;

use tracing::debug;

use jobqueue_domain::{Job, JobStatus, JobStore, JobType, JobUpdate};
use jobqueue_errors::{JobQueueError, JobQueueResult};
use jobqueue_infrastructure::CircuitBreakerRegistry;

/// 处理器执行一次作业时可用的上下文
///
/// 进度上报只在当前Worker仍持有作业时生效；作业被回收后上报返回
/// StaleTransition，处理器应当停止继续工作。
pub struct JobContext {
    job_id: String,
    job_type: JobType,
    attempt: u32,
    worker_id: String,
    jobs: Arc<dyn JobStore>,
    breakers: Arc<CircuitBreakerRegistry>,
}

impl JobContext {
    pub fn new(
        job: &Job,
        worker_id: impl Into<String>,
        jobs: Arc<dyn JobStore>,
        breakers: Arc<CircuitBreakerRegistry>,
    ) -> Self {
        Self {
            job_id: job.job_id.clone(),
            job_type: job.job_type,
            attempt: job.attempt,
            worker_id: worker_id.into(),
            jobs,
            breakers,
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn job_type(&self) -> JobType {
        self.job_type
    }

    /// 本次执行的尝试序号，从1开始
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// running -> running 自转换，只更新进度与消息
    pub async fn report_progress(&self, progress: u8, message: impl Into<String>) -> JobQueueResult<()> {
        let message = message.into();
        debug!(job_id = %self.job_id, progress, message = %message, "上报作业进度");

        self.jobs
            .transition(
                &self.job_id,
                &[JobStatus::Running],
                JobStatus::Running,
                JobUpdate::default()
                    .expect_owner(self.worker_id.clone())
                    .progress(progress)
                    .message(message),
            )
            .await?;
        Ok(())
    }

    /// 通过依赖的熔断器调用外部依赖，熔断器打开时快速失败
    pub async fn guard<F, Fut, T>(&self, dependency: &str, operation: F) -> JobQueueResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = JobQueueResult<T>>,
    {
        self.breakers.call(dependency, operation).await
    }

    pub async fn is_cancelled(&self) -> JobQueueResult<bool> {
        self.jobs.is_cancel_requested(&self.job_id).await
    }

    /// 在工作单元之间协作式检查取消标记
    pub async fn check_cancelled(&self) -> JobQueueResult<()> {
        if self.is_cancelled().await? {
            return Err(JobQueueError::Cancelled {
                id: self.job_id.clone(),
            });
        }
        Ok(())
    }
}
