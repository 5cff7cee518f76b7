use thiserror::Error;


#[derive(Debug, Error)]
pub enum JobQueueError {
    #[error("存储不可用: {0}")]
    Store(String),
    #[error("作业未找到: {id}")]
    JobNotFound { id: String },
    #[error("作业已存在: {id}")]
    DuplicateJob { id: String },
    #[error("状态转换冲突: 作业 {id} 当前状态为 {actual}，期望 {expected}")]
    StaleTransition {
        id: String,
        expected: String,
        actual: String,
    },
    #[error("作业处理失败: {0}")]
    Handler(String),
    #[error("依赖不可用: {dependency} (熔断器已打开)")]
    DependencyUnavailable { dependency: String },
    #[error("毒作业: {id} 已耗尽 {attempts} 次尝试 - {reason}")]
    PoisonJob {
        id: String,
        attempts: u32,
        reason: String,
    },
    #[error("不支持的作业类型: {0}")]
    UnsupportedJobType(String),
    #[error("作业已取消: {id}")]
    Cancelled { id: String },
    #[error("操作超时: {0}")]
    Timeout(String),
    #[error("序列化错误: {0}")]
    Serialization(String),
    #[error("配置错误: {0}")]
    Configuration(String),
    #[error("数据验证失败: {0}")]
    ValidationError(String),
    #[error("内部错误: {0}")]
    Internal(String),
}

pub type JobQueueResult<T> = Result<T, JobQueueError>;

impl JobQueueError {
    pub fn store<S: Into<String>>(msg: S) -> Self {
        Self::Store(msg.into())
    }
    pub fn job_not_found<S: Into<String>>(id: S) -> Self {
        Self::JobNotFound { id: id.into() }
    }
    pub fn handler<S: Into<String>>(msg: S) -> Self {
        Self::Handler(msg.into())
    }
    pub fn dependency_unavailable<S: Into<String>>(dependency: S) -> Self {
        Self::DependencyUnavailable {
            dependency: dependency.into(),
        }
    }
    pub fn stale<S: Into<String>>(id: S, expected: S, actual: S) -> Self {
        Self::StaleTransition {
            id: id.into(),
            expected: expected.into(),
            actual: actual.into(),
        }
    }
    pub fn config_error<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }
    pub fn validation_error<S: Into<String>>(msg: S) -> Self {
        Self::ValidationError(msg.into())
    }

    /// 由Worker通过重试策略处理的失败
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            JobQueueError::Handler(_)
                | JobQueueError::DependencyUnavailable { .. }
                | JobQueueError::Store(_)
                | JobQueueError::Timeout(_)
        )
    }

    /// CAS失败是正常的并发结果，调用方应忽略或重试
    pub fn is_stale(&self) -> bool {
        matches!(self, JobQueueError::StaleTransition { .. })
    }

    /// 存储暂时不可用，同一操作稍后重试可能成功
    pub fn is_store_unavailable(&self) -> bool {
        matches!(self, JobQueueError::Store(_))
    }

    pub fn is_dependency_unavailable(&self) -> bool {
        matches!(self, JobQueueError::DependencyUnavailable { .. })
    }

    /// 用于指标标签的错误分类
    pub fn kind(&self) -> &'static str {
        match self {
            JobQueueError::Store(_) => "store",
            JobQueueError::JobNotFound { .. } => "job_not_found",
            JobQueueError::DuplicateJob { .. } => "duplicate_job",
            JobQueueError::StaleTransition { .. } => "stale_transition",
            JobQueueError::Handler(_) => "handler",
            JobQueueError::DependencyUnavailable { .. } => "dependency_unavailable",
            JobQueueError::PoisonJob { .. } => "poison_job",
            JobQueueError::UnsupportedJobType(_) => "unsupported_job_type",
            JobQueueError::Cancelled { .. } => "cancelled",
            JobQueueError::Timeout(_) => "timeout",
            JobQueueError::Serialization(_) => "serialization",
            JobQueueError::Configuration(_) => "configuration",
            JobQueueError::ValidationError(_) => "validation",
            JobQueueError::Internal(_) => "internal",
        }
    }
}

impl From<serde_json::Error> for JobQueueError {
    fn from(err: serde_json::Error) -> Self {
        JobQueueError::Serialization(err.to_string())
    }
}

impl From<anyhow::Error> for JobQueueError {
    fn from(err: anyhow::Error) -> Self {
        JobQueueError::Internal(err.to_string())
    }
}
