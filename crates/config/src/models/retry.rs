use std::collections::HashMap;

use crate::validation::ConfigValidator;
use serde::{Deserialize, Serialize};

/// 指数退避: min(base_delay * multiplier^attempt, max_delay)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryPolicyConfig {
    pub base_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub max_delay_ms: u64,
    /// 0.0 ~ 1.0，在延迟上叠加的随机抖动比例
    pub jitter_factor: f64,
}

impl Default for RetryPolicyConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1000,
            backoff_multiplier: 2.0,
            max_delay_ms: 60_000,
            jitter_factor: 0.1,
        }
    }
}

impl ConfigValidator for RetryPolicyConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        if self.backoff_multiplier < 1.0 {
            return Err(crate::ConfigError::Validation(
                "retry.backoff_multiplier must be at least 1.0".to_string(),
            ));
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err(crate::ConfigError::Validation(
                "retry.max_delay_ms must be greater than or equal to base_delay_ms".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(crate::ConfigError::Validation(format!(
                "retry.jitter_factor must be in [0.0, 1.0], got {}",
                self.jitter_factor
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub default: RetryPolicyConfig,
    pub overrides: HashMap<String, RetryPolicyConfig>,
    /// 延迟队列提升到就绪队列的检查间隔
    pub promote_interval_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            default: RetryPolicyConfig::default(),
            overrides: HashMap::new(),
            promote_interval_ms: 500,
        }
    }
}

impl RetryConfig {
    pub fn policy_for(&self, job_type: &str) -> &RetryPolicyConfig {
        self.overrides.get(job_type).unwrap_or(&self.default)
    }
}

impl ConfigValidator for RetryConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        self.default.validate()?;
        for (job_type, policy) in &self.overrides {
            policy.validate().map_err(|e| {
                crate::ConfigError::Validation(format!("retry.overrides.{job_type}: {e}"))
            })?;
        }
        if self.promote_interval_ms == 0 {
            return Err(crate::ConfigError::Validation(
                "retry.promote_interval_ms must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}
