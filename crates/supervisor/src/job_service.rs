use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use jobqueue_config::JobsConfig;
use jobqueue_domain::{
    AttemptUpdate, DeadLetterEntry, Job, JobPage, JobStatus, JobType, JobUpdate, Stores,
    WorkerHeartbeat,
};
use jobqueue_errors::{JobQueueError, JobQueueResult};
use jobqueue_infrastructure::MetricsCollector;

/// 提交作业请求，job_id 为空时按载荷生成
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitJobRequest {
    pub job_type: JobType,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub job_id: Option<String>,
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

impl SubmitJobRequest {
    pub fn new(job_type: JobType, payload: serde_json::Value) -> Self {
        Self {
            job_type,
            payload,
            job_id: None,
            max_attempts: None,
        }
    }

    pub fn with_job_id(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }
}

/// getJobStatus 的返回内容
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatusView {
    pub job_id: String,
    pub status: JobStatus,
    pub progress: u8,
    pub message: String,
}

impl From<&Job> for JobStatusView {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.job_id.clone(),
            status: job.status,
            progress: job.progress,
            message: job.message.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    /// 排队中的作业直接标记为failed
    Cancelled,
    /// 运行中的作业设置取消标记，由处理器协作式结束
    CancelRequested,
    AlreadyFinished(JobStatus),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerView {
    #[serde(flatten)]
    pub heartbeat: WorkerHeartbeat,
    pub alive: bool,
}

/// 作业提交、查询与运维操作
pub struct JobService {
    stores: Stores,
    jobs_config: JobsConfig,
    dead_timeout: std::time::Duration,
    metrics: MetricsCollector,
}

impl JobService {
    pub fn new(stores: Stores, jobs_config: JobsConfig, dead_timeout: std::time::Duration) -> Self {
        Self {
            stores,
            jobs_config,
            dead_timeout,
            metrics: MetricsCollector::new(),
        }
    }

    /// 写入作业记录并入队，相同ID的重复提交被拒绝
    pub async fn submit_job(&self, request: SubmitJobRequest) -> JobQueueResult<Job> {
        let max_attempts = request
            .max_attempts
            .unwrap_or_else(|| self.jobs_config.max_attempts_for(request.job_type.as_str()));
        if max_attempts == 0 {
            return Err(JobQueueError::validation_error("max_attempts must be at least 1"));
        }

        let job_id = match request.job_id {
            Some(id) if !id.trim().is_empty() => id,
            Some(_) => return Err(JobQueueError::validation_error("job_id cannot be empty")),
            None => Job::generate_id(request.job_type, &request.payload, Utc::now()),
        };

        let job = Job::new(job_id, request.job_type, request.payload, max_attempts);
        self.stores.jobs.create(&job).await?;

        if let Err(e) = self.stores.queue.enqueue(job.job_type, &job.job_id).await {
            error!(job_id = %job.job_id, "作业入队失败: {}", e);
            // 记录已写入但不在队列中，标记失败以免永远停在queued
            if let Err(mark_err) = self
                .stores
                .jobs
                .transition(
                    &job.job_id,
                    &[JobStatus::Queued],
                    JobStatus::Failed,
                    JobUpdate::default().message(format!("enqueue failed: {e}")),
                )
                .await
            {
                error!(job_id = %job.job_id, "标记作业失败也未成功，作业将由对账扫描重新入队: {}", mark_err);
            }
            return Err(e);
        }

        self.metrics.record_submitted(job.job_type.as_str());
        info!(
            job_id = %job.job_id,
            job_type = %job.job_type,
            max_attempts = job.max_attempts,
            "作业已提交"
        );
        Ok(job)
    }

    pub async fn get_job(&self, job_id: &str) -> JobQueueResult<Job> {
        self.stores
            .jobs
            .get(job_id)
            .await?
            .ok_or_else(|| JobQueueError::job_not_found(job_id))
    }

    pub async fn get_job_status(&self, job_id: &str) -> JobQueueResult<JobStatusView> {
        Ok(JobStatusView::from(&self.get_job(job_id).await?))
    }

    pub async fn list_jobs(&self, limit: usize, job_type: Option<JobType>) -> JobQueueResult<JobPage> {
        self.stores.jobs.list_jobs(limit, job_type).await
    }

    pub async fn cancel_job(&self, job_id: &str) -> JobQueueResult<CancelOutcome> {
        let job = self.get_job(job_id).await?;

        match job.status {
            JobStatus::Queued => {
                match self
                    .stores
                    .jobs
                    .transition(
                        job_id,
                        &[JobStatus::Queued],
                        JobStatus::Failed,
                        JobUpdate::default().message("cancelled"),
                    )
                    .await
                {
                    Ok(_) => {
                        info!(job_id, "排队中的作业已取消");
                        Ok(CancelOutcome::Cancelled)
                    }
                    // 取消期间被Worker认领
                    Err(e) if e.is_stale() => self.request_running_cancel(job_id).await,
                    Err(e) => Err(e),
                }
            }
            JobStatus::Running => self.request_running_cancel(job_id).await,
            status => Ok(CancelOutcome::AlreadyFinished(status)),
        }
    }

    async fn request_running_cancel(&self, job_id: &str) -> JobQueueResult<CancelOutcome> {
        let job = self.get_job(job_id).await?;
        if job.is_terminal() {
            return Ok(CancelOutcome::AlreadyFinished(job.status));
        }
        self.stores.jobs.request_cancel(job_id).await?;
        info!(job_id, "已设置取消标记，等待处理器结束");
        Ok(CancelOutcome::CancelRequested)
    }

    pub async fn list_dlq(&self) -> JobQueueResult<Vec<DeadLetterEntry>> {
        self.stores.dlq.list().await
    }

    /// 运维手动重新排队死信作业：重置尝试次数，移出死信队列并入队
    pub async fn requeue_dead(&self, job_id: &str) -> JobQueueResult<Job> {
        let job = self
            .stores
            .jobs
            .transition(
                job_id,
                &[JobStatus::Dead],
                JobStatus::Queued,
                JobUpdate::default()
                    .clear_owner()
                    .attempt(AttemptUpdate::Reset)
                    .progress(0)
                    .message("requeued by operator"),
            )
            .await?;

        if !self.stores.dlq.remove(job_id).await? {
            warn!(job_id, "死信队列中没有该作业的条目");
        }
        self.stores.queue.enqueue(job.job_type, job_id).await?;

        info!(job_id, job_type = %job.job_type, "死信作业已重新排队");
        Ok(job)
    }

    pub async fn list_workers(&self, now: DateTime<Utc>) -> JobQueueResult<Vec<WorkerView>> {
        Ok(self
            .stores
            .heartbeats
            .list()
            .await?
            .into_iter()
            .map(|heartbeat| WorkerView {
                alive: !heartbeat.is_expired(self.dead_timeout, now),
                heartbeat,
            })
            .collect())
    }

    pub async fn queue_depths(&self) -> JobQueueResult<Vec<(JobType, usize)>> {
        let mut depths = Vec::with_capacity(JobType::ALL.len());
        for job_type in JobType::ALL {
            depths.push((job_type, self.stores.queue.depth(job_type).await?));
        }
        Ok(depths)
    }
}
