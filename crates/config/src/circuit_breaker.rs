use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::validation::{ConfigValidator, ValidationUtils};
use crate::{ConfigError, ConfigResult};

mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    /// 指标导出使用的数值编码
    pub fn as_gauge(&self) -> f64 {
        match self {
            CircuitState::Closed => 0.0,
            CircuitState::HalfOpen => 1.0,
            CircuitState::Open => 2.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// 滑动窗口大小（最近N次调用）
    pub window_size: usize,
    /// 窗口内至少累计多少次调用才计算失败率
    pub minimum_calls: usize,
    /// 失败率阈值，超过则打开熔断器
    pub failure_rate_threshold: f64,
    /// 冷却时间，之后进入半开状态
    #[serde(with = "duration_serde")]
    pub recovery_timeout: Duration,
    #[serde(with = "duration_serde")]
    pub call_timeout: Duration,
    /// 半开试探失败后冷却时间的倍增系数
    pub backoff_multiplier: f64,
    #[serde(with = "duration_serde")]
    pub max_recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            window_size: 20,
            minimum_calls: 5,
            failure_rate_threshold: 0.5,
            recovery_timeout: Duration::from_secs(30),
            call_timeout: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            max_recovery_timeout: Duration::from_secs(300), // 5 minutes
        }
    }
}

impl ConfigValidator for CircuitBreakerConfig {
    fn validate(&self) -> ConfigResult<()> {
        ValidationUtils::validate_count(self.window_size, "circuit_breaker.window_size", 10000)?;

        if self.minimum_calls == 0 || self.minimum_calls > self.window_size {
            return Err(ConfigError::Validation(
                "minimum_calls must be in [1, window_size]".to_string(),
            ));
        }

        ValidationUtils::validate_ratio(
            self.failure_rate_threshold,
            "circuit_breaker.failure_rate_threshold",
        )?;

        if self.backoff_multiplier < 1.0 {
            return Err(ConfigError::Validation(
                "backoff_multiplier must be at least 1.0".to_string(),
            ));
        }

        if self.recovery_timeout.is_zero() {
            return Err(ConfigError::Validation(
                "recovery_timeout must be greater than 0".to_string(),
            ));
        }

        if self.call_timeout.is_zero() {
            return Err(ConfigError::Validation(
                "call_timeout must be greater than 0".to_string(),
            ));
        }

        if self.recovery_timeout > self.max_recovery_timeout {
            return Err(ConfigError::Validation(
                "recovery_timeout must be less than or equal to max_recovery_timeout".to_string(),
            ));
        }

        Ok(())
    }
}

/// 按依赖名称区分的熔断器配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CircuitBreakerSettings {
    #[serde(default)]
    pub default: CircuitBreakerConfig,
    #[serde(default)]
    pub dependencies: HashMap<String, CircuitBreakerConfig>,
}

impl CircuitBreakerSettings {
    pub fn for_dependency(&self, dependency: &str) -> CircuitBreakerConfig {
        self.dependencies
            .get(dependency)
            .cloned()
            .unwrap_or_else(|| self.default.clone())
    }
}

impl ConfigValidator for CircuitBreakerSettings {
    fn validate(&self) -> ConfigResult<()> {
        self.default.validate()?;
        for (name, config) in &self.dependencies {
            config.validate().map_err(|e| {
                ConfigError::Validation(format!("circuit_breaker.dependencies.{name}: {e}"))
            })?;
        }
        Ok(())
    }
}
