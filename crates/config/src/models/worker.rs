use std::collections::HashMap;

use crate::validation::{ConfigValidator, ValidationUtils};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub enabled: bool,
    /// 为空时使用 主机名-进程号
    pub worker_id: String,
    pub pool_size: usize,
    pub job_types: Vec<String>,
    pub heartbeat_interval_seconds: u64,
    pub poll_interval_ms: u64,
    pub max_poll_interval_ms: u64,
    pub job_timeout_seconds: u64,
    /// 每个Worker最多处理的作业数，0表示不限
    pub max_jobs: u64,
    pub error_backoff_ms: u64,
    /// 内置模拟处理器每个工作单元的耗时
    pub simulated_step_delay_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            worker_id: String::new(),
            pool_size: 4,
            job_types: vec!["migration".to_string(), "backtest".to_string()],
            heartbeat_interval_seconds: 5,
            poll_interval_ms: 200,
            max_poll_interval_ms: 5000,
            job_timeout_seconds: 3600,
            max_jobs: 0,
            error_backoff_ms: 1000,
            simulated_step_delay_ms: 500,
        }
    }
}

impl ConfigValidator for WorkerConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        ValidationUtils::validate_count(self.pool_size, "worker.pool_size", 256)?;
        ValidationUtils::validate_timeout_seconds(
            self.heartbeat_interval_seconds,
            "worker.heartbeat_interval_seconds",
        )?;
        ValidationUtils::validate_timeout_seconds(
            self.job_timeout_seconds,
            "worker.job_timeout_seconds",
        )?;

        if self.poll_interval_ms == 0 || self.poll_interval_ms > self.max_poll_interval_ms {
            return Err(crate::ConfigError::Validation(
                "worker.poll_interval_ms must be in [1, max_poll_interval_ms]".to_string(),
            ));
        }

        if self.job_types.is_empty() {
            return Err(crate::ConfigError::Validation(
                "worker.job_types cannot be empty".to_string(),
            ));
        }

        for job_type in &self.job_types {
            ValidationUtils::validate_not_empty(job_type, "worker.job_types")?;
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobsConfig {
    pub max_attempts: u32,
    /// 按作业类型覆盖 max_attempts
    pub max_attempts_overrides: HashMap<String, u32>,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            max_attempts_overrides: HashMap::new(),
        }
    }
}

impl JobsConfig {
    pub fn max_attempts_for(&self, job_type: &str) -> u32 {
        self.max_attempts_overrides
            .get(job_type)
            .copied()
            .unwrap_or(self.max_attempts)
    }
}

impl ConfigValidator for JobsConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        ValidationUtils::validate_count(self.max_attempts as usize, "jobs.max_attempts", 100)?;
        for (job_type, attempts) in &self.max_attempts_overrides {
            ValidationUtils::validate_count(
                *attempts as usize,
                &format!("jobs.max_attempts_overrides.{job_type}"),
                100,
            )?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub enabled: bool,
    /// 心跳间隔的倍数，超过则判定Worker死亡
    pub dead_timeout_multiplier: u32,
    pub poll_interval_seconds: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dead_timeout_multiplier: 3,
            poll_interval_seconds: 5,
        }
    }
}

impl ConfigValidator for HeartbeatConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        if self.dead_timeout_multiplier < 2 {
            return Err(crate::ConfigError::Validation(
                "heartbeat.dead_timeout_multiplier must be at least 2".to_string(),
            ));
        }
        ValidationUtils::validate_timeout_seconds(
            self.poll_interval_seconds,
            "heartbeat.poll_interval_seconds",
        )?;
        Ok(())
    }
}
