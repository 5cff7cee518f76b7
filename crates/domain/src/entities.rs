use chrono::{DateTime, Utc};
use jobqueue_errors::{JobQueueError, JobQueueResult};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::value_objects::{AttemptUpdate, JobUpdate, OwnerUpdate};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum JobType {
    Migration,
    Backtest,
}

impl JobType {
    pub const ALL: [JobType; 2] = [JobType::Migration, JobType::Backtest];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Migration => "migration",
            JobType::Backtest => "backtest",
        }
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobType {
    type Err = JobQueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "migration" => Ok(JobType::Migration),
            "backtest" => Ok(JobType::Backtest),
            other => Err(JobQueueError::UnsupportedJobType(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Dead,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Dead => "dead",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Dead
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = JobQueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "dead" => Ok(JobStatus::Dead),
            other => Err(JobQueueError::Serialization(format!(
                "Invalid job status: {other}"
            ))),
        }
    }
}

/// 作业记录，字段与状态枚举是API与队列核心之间的线上契约
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub job_id: String,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub payload: serde_json::Value,
    pub status: JobStatus,
    pub progress: u8,
    pub message: String,
    pub attempt: u32,
    pub max_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// 未运行时为空字符串
    pub owner_worker_id: String,
}

impl Job {
    pub fn new(
        job_id: String,
        job_type: JobType,
        payload: serde_json::Value,
        max_attempts: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            job_id,
            job_type,
            payload,
            status: JobStatus::Queued,
            progress: 0,
            message: "queued".to_string(),
            attempt: 0,
            max_attempts,
            created_at: now,
            updated_at: now,
            owner_worker_id: String::new(),
        }
    }

    /// 生成作业ID: 优先使用载荷中的 run/inst/strategy 字段，否则使用UUID
    pub fn generate_id(job_type: JobType, payload: &serde_json::Value, now: DateTime<Utc>) -> String {
        let run = payload.get("run").and_then(id_fragment);
        let inst = payload.get("inst").and_then(id_fragment);
        let ts = now.timestamp();

        match (job_type, run, inst) {
            (JobType::Migration, Some(run), Some(inst)) => {
                format!("migration:run{run}_inst{inst}:{ts}")
            }
            (JobType::Backtest, Some(run), Some(inst)) => {
                match payload.get("strategy").and_then(id_fragment) {
                    Some(strategy) => format!("backtest:{strategy}:run{run}_inst{inst}:{ts}"),
                    None => format!("backtest:run{run}_inst{inst}:{ts}"),
                }
            }
            _ => format!("{}:{}", job_type, Uuid::new_v4()),
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == JobStatus::Running
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn has_owner(&self) -> bool {
        !self.owner_worker_id.is_empty()
    }

    pub fn attempts_exhausted(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    /// 校验CAS前置条件：当前状态在允许集合内，且持有者匹配（如有要求）
    pub fn check_transition(&self, from: &[JobStatus], update: &JobUpdate) -> JobQueueResult<()> {
        if !from.contains(&self.status) {
            let expected = from
                .iter()
                .map(|s| s.as_str())
                .collect::<Vec<_>>()
                .join("|");
            return Err(JobQueueError::stale(
                self.job_id.clone(),
                expected,
                self.status.to_string(),
            ));
        }

        if let Some(owner) = &update.expected_owner {
            if &self.owner_worker_id != owner {
                return Err(JobQueueError::stale(
                    self.job_id.clone(),
                    format!("{} owned by {}", self.status, owner),
                    format!("{} owned by {:?}", self.status, self.owner_worker_id),
                ));
            }
        }

        Ok(())
    }

    /// 在前置条件通过后应用状态转换
    pub fn apply_transition(
        &mut self,
        to: JobStatus,
        update: &JobUpdate,
        now: DateTime<Utc>,
    ) -> JobQueueResult<()> {
        let owner = match &update.owner {
            OwnerUpdate::Keep => self.owner_worker_id.clone(),
            OwnerUpdate::Set(owner) => owner.clone(),
            OwnerUpdate::Clear => String::new(),
        };

        if to == JobStatus::Running && owner.is_empty() {
            return Err(JobQueueError::validation_error(format!(
                "作业 {} 进入running状态时必须有持有者",
                self.job_id
            )));
        }

        let attempt = match update.attempt {
            AttemptUpdate::Keep => self.attempt,
            AttemptUpdate::Increment => self.attempt.saturating_add(1),
            AttemptUpdate::Reset => 0,
        };

        if attempt > self.max_attempts {
            return Err(JobQueueError::validation_error(format!(
                "作业 {} 尝试次数 {} 超过上限 {}",
                self.job_id, attempt, self.max_attempts
            )));
        }

        if let Some(progress) = update.progress {
            let progress = progress.min(100);
            self.progress = if self.status == JobStatus::Running && to == JobStatus::Running {
                self.progress.max(progress)
            } else {
                progress
            };
        }

        if let Some(message) = &update.message {
            self.message = message.clone();
        }

        self.owner_worker_id = owner;
        self.attempt = attempt;
        self.status = to;
        self.updated_at = now;
        Ok(())
    }

    pub fn entity_description(&self) -> String {
        format!(
            "作业 '{}' (类型: {}, 状态: {}, 尝试: {}/{})",
            self.job_id, self.job_type, self.status, self.attempt, self.max_attempts
        )
    }
}

fn id_fragment(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// 队列条目：作业ID与入队时间，同类型内FIFO
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueEntry {
    pub job_id: String,
    pub job_type: JobType,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub enqueued_at: DateTime<Utc>,
}

impl QueueEntry {
    pub fn new(job_type: JobType, job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            job_type,
            enqueued_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerHeartbeat {
    pub worker_id: String,
    pub last_seen: DateTime<Utc>,
    pub current_job_id: Option<String>,
    pub cpu_percent: f64,
    pub memory_mb: f64,
    pub jobs_processed: u64,
}

impl WorkerHeartbeat {
    pub fn new(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            last_seen: Utc::now(),
            current_job_id: None,
            cpu_percent: 0.0,
            memory_mb: 0.0,
            jobs_processed: 0,
        }
    }

    pub fn is_expired(&self, timeout: std::time::Duration, now: DateTime<Utc>) -> bool {
        let elapsed = now.signed_duration_since(self.last_seen);
        match chrono::Duration::from_std(timeout) {
            Ok(timeout) => elapsed > timeout,
            Err(_) => false,
        }
    }
}

/// 死信条目，附带最后一次失败原因
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeadLetterEntry {
    pub job_id: String,
    pub job_type: JobType,
    pub reason: String,
    pub attempts: u32,
    pub dead_at: DateTime<Utc>,
}

impl DeadLetterEntry {
    pub fn from_job(job: &Job, reason: impl Into<String>) -> Self {
        Self {
            job_id: job.job_id.clone(),
            job_type: job.job_type,
            reason: reason.into(),
            attempts: job.attempt,
            dead_at: Utc::now(),
        }
    }
}
