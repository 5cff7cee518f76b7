use std::collections::HashMap;
use std::time::Duration;

use jobqueue_config::{RetryConfig, RetryPolicyConfig};

use crate::entities::JobType;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryAction {
    Requeue,
    DeadLetter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDecision {
    pub action: RetryAction,
    pub delay: Duration,
}

/// 重试退避策略
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub backoff_multiplier: f64,
    pub max_delay: Duration,
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryPolicyConfig::default())
    }
}

impl From<&RetryPolicyConfig> for RetryPolicy {
    fn from(config: &RetryPolicyConfig) -> Self {
        Self {
            base_delay: Duration::from_millis(config.base_delay_ms),
            backoff_multiplier: config.backoff_multiplier,
            max_delay: Duration::from_millis(config.max_delay_ms),
            jitter_factor: config.jitter_factor,
        }
    }
}

impl RetryPolicy {
    /// min(base * multiplier^attempt, max)
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay.as_secs_f64();
        let max = self.max_delay.as_secs_f64();
        let exponent = attempt.min(i32::MAX as u32) as i32;

        // 计算指数退避间隔
        let exponential = base * self.backoff_multiplier.powi(exponent);

        // 限制最大间隔
        let capped = if exponential.is_finite() {
            exponential.min(max)
        } else {
            max
        };

        Duration::from_secs_f64(capped.max(0.0))
    }

    /// 在延迟上叠加 ±jitter_factor 的抖动，`sample` 取值 [0, 1)
    pub fn apply_jitter(&self, delay: Duration, sample: f64) -> Duration {
        if self.jitter_factor <= 0.0 {
            return delay;
        }
        let secs = delay.as_secs_f64();
        let jitter = secs * self.jitter_factor * (sample - 0.5) * 2.0;
        let jittered = (secs + jitter).clamp(0.0, self.max_delay.as_secs_f64().max(secs));
        Duration::from_secs_f64(jittered)
    }
}

/// 失败后的重试决策，按作业类型选择策略
#[derive(Debug, Clone, Default)]
pub struct RetryScheduler {
    default_policy: RetryPolicy,
    overrides: HashMap<JobType, RetryPolicy>,
}

impl RetryScheduler {
    pub fn new(default_policy: RetryPolicy) -> Self {
        Self {
            default_policy,
            overrides: HashMap::new(),
        }
    }

    pub fn with_override(mut self, job_type: JobType, policy: RetryPolicy) -> Self {
        self.overrides.insert(job_type, policy);
        self
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        let mut scheduler = Self::new(RetryPolicy::from(&config.default));
        for (name, policy) in &config.overrides {
            // 未知类型的覆盖配置没有对应队列
            if let Ok(job_type) = name.parse::<JobType>() {
                scheduler
                    .overrides
                    .insert(job_type, RetryPolicy::from(policy));
            }
        }
        scheduler
    }

    pub fn policy_for(&self, job_type: JobType) -> &RetryPolicy {
        self.overrides
            .get(&job_type)
            .unwrap_or(&self.default_policy)
    }

    /// (attempt, max_attempts) -> 重新排队或进入死信队列
    pub fn decide(&self, job_type: JobType, attempt: u32, max_attempts: u32) -> RetryDecision {
        if attempt >= max_attempts {
            return RetryDecision {
                action: RetryAction::DeadLetter,
                delay: Duration::ZERO,
            };
        }

        RetryDecision {
            action: RetryAction::Requeue,
            delay: self.policy_for(job_type).backoff_delay(attempt),
        }
    }

    /// 带随机抖动的重试延迟，避免同时失败的作业同时重试
    pub fn jittered_delay(&self, job_type: JobType, delay: Duration) -> Duration {
        self.policy_for(job_type)
            .apply_jitter(delay, rand::random::<f64>())
    }
}
