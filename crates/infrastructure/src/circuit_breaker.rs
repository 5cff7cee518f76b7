//! 依赖熔断器
//!
//! 基于最近N次调用的失败率打开熔断器，冷却后只放行一次试探调用。
//! 同一进程内调用同一依赖的所有Worker共享同一个熔断器实例。

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::counter;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use jobqueue_config::{CircuitBreakerConfig, CircuitBreakerSettings, CircuitState};
use jobqueue_errors::{JobQueueError, JobQueueResult};

/// Circuit breaker statistics
#[derive(Debug, Clone)]
pub struct CircuitBreakerStats {
    pub state: CircuitState,
    /// 最近调用结果，true 表示失败
    pub window: VecDeque<bool>,
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub rejected_calls: u64,
    pub trial_in_flight: bool,
    pub last_state_change: Instant,
    pub current_recovery_timeout: Duration,
}

impl CircuitBreakerStats {
    pub fn new(config: &CircuitBreakerConfig) -> Self {
        Self {
            state: CircuitState::Closed,
            window: VecDeque::with_capacity(config.window_size),
            total_calls: 0,
            successful_calls: 0,
            failed_calls: 0,
            rejected_calls: 0,
            trial_in_flight: false,
            last_state_change: Instant::now(),
            current_recovery_timeout: config.recovery_timeout,
        }
    }

    /// 窗口内的失败率
    pub fn failure_rate(&self) -> f64 {
        if self.window.is_empty() {
            0.0
        } else {
            let failures = self.window.iter().filter(|failed| **failed).count();
            failures as f64 / self.window.len() as f64
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Permit {
    Normal,
    Trial,
}

/// Circuit breaker implementation
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    stats: Arc<RwLock<CircuitBreakerStats>>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_config(name, CircuitBreakerConfig::default())
    }

    pub fn with_config(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let stats = CircuitBreakerStats::new(&config);
        Self {
            name: name.into(),
            config,
            stats: Arc::new(RwLock::new(stats)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// 在熔断器保护下执行调用。熔断器打开时不调用 `operation`，直接返回 DependencyUnavailable
    pub async fn execute<F, Fut, T>(&self, operation: F) -> JobQueueResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = JobQueueResult<T>>,
    {
        let permit = match self.acquire_permit().await {
            Some(permit) => permit,
            None => {
                counter!("jobqueue_dependency_unavailable_total", "dependency" => self.name.clone())
                    .increment(1);
                return Err(JobQueueError::dependency_unavailable(self.name.clone()));
            }
        };

        let result = tokio::time::timeout(self.config.call_timeout, operation()).await;

        match result {
            Ok(Ok(value)) => {
                self.record_outcome(permit, false).await;
                Ok(value)
            }
            Ok(Err(error)) => {
                self.record_outcome(permit, true).await;
                Err(error)
            }
            Err(_) => {
                self.record_outcome(permit, true).await;
                Err(JobQueueError::Timeout(format!(
                    "调用依赖 {} 超时 ({:?})",
                    self.name, self.config.call_timeout
                )))
            }
        }
    }

    /// 状态判断与半开切换在同一把写锁内完成，保证只放行一次试探调用
    async fn acquire_permit(&self) -> Option<Permit> {
        let mut stats = self.stats.write().await;

        match stats.state {
            CircuitState::Closed => Some(Permit::Normal),
            CircuitState::Open => {
                if stats.last_state_change.elapsed() >= stats.current_recovery_timeout {
                    stats.state = CircuitState::HalfOpen;
                    stats.last_state_change = Instant::now();
                    stats.trial_in_flight = true;
                    info!(dependency = %self.name, "熔断器进入半开状态，放行试探调用");
                    Some(Permit::Trial)
                } else {
                    stats.rejected_calls += 1;
                    None
                }
            }
            CircuitState::HalfOpen => {
                // 试探调用的future被丢弃时不会回报结果，超过调用超时后允许新的试探
                let trial_abandoned = stats.trial_in_flight
                    && stats.last_state_change.elapsed() > self.config.call_timeout;
                if !stats.trial_in_flight || trial_abandoned {
                    stats.trial_in_flight = true;
                    stats.last_state_change = Instant::now();
                    Some(Permit::Trial)
                } else {
                    stats.rejected_calls += 1;
                    None
                }
            }
        }
    }

    async fn record_outcome(&self, permit: Permit, failed: bool) {
        let mut stats = self.stats.write().await;

        stats.total_calls += 1;
        if failed {
            stats.failed_calls += 1;
        } else {
            stats.successful_calls += 1;
        }

        match permit {
            Permit::Trial => {
                stats.trial_in_flight = false;
                if failed {
                    let next = Duration::from_millis(
                        (stats.current_recovery_timeout.as_millis() as f64
                            * self.config.backoff_multiplier) as u64,
                    );
                    stats.current_recovery_timeout =
                        std::cmp::min(next, self.config.max_recovery_timeout);
                    stats.state = CircuitState::Open;
                    stats.last_state_change = Instant::now();
                    warn!(
                        dependency = %self.name,
                        recovery_timeout_ms = stats.current_recovery_timeout.as_millis() as u64,
                        "试探调用失败，熔断器重新打开"
                    );
                } else {
                    stats.state = CircuitState::Closed;
                    stats.last_state_change = Instant::now();
                    stats.window.clear();
                    stats.current_recovery_timeout = self.config.recovery_timeout;
                    info!(dependency = %self.name, "试探调用成功，熔断器关闭");
                }
            }
            Permit::Normal => {
                // 许可发放后状态可能已被其他调用改变，只有关闭状态才计入窗口
                if stats.state != CircuitState::Closed {
                    return;
                }

                stats.window.push_back(failed);
                while stats.window.len() > self.config.window_size {
                    stats.window.pop_front();
                }

                if stats.window.len() >= self.config.minimum_calls
                    && stats.failure_rate() >= self.config.failure_rate_threshold
                {
                    stats.state = CircuitState::Open;
                    stats.last_state_change = Instant::now();
                    stats.current_recovery_timeout = self.config.recovery_timeout;
                    warn!(
                        dependency = %self.name,
                        failure_rate = stats.failure_rate(),
                        "失败率超过阈值，熔断器打开"
                    );
                } else {
                    debug!(
                        dependency = %self.name,
                        failed,
                        window = stats.window.len(),
                        "记录调用结果"
                    );
                }
            }
        }
    }

    pub async fn get_state(&self) -> CircuitState {
        self.stats.read().await.state
    }

    pub async fn get_stats(&self) -> CircuitBreakerStats {
        self.stats.read().await.clone()
    }

    pub async fn reset(&self) {
        let mut stats = self.stats.write().await;
        *stats = CircuitBreakerStats::new(&self.config);
    }

    pub async fn force_open(&self) {
        let mut stats = self.stats.write().await;
        stats.state = CircuitState::Open;
        stats.last_state_change = Instant::now();
    }

    pub async fn force_close(&self) {
        let mut stats = self.stats.write().await;
        stats.state = CircuitState::Closed;
        stats.last_state_change = Instant::now();
        stats.window.clear();
        stats.trial_in_flight = false;
        stats.current_recovery_timeout = self.config.recovery_timeout;
    }
}

impl Clone for CircuitBreaker {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            config: self.config.clone(),
            stats: Arc::clone(&self.stats),
        }
    }
}

/// 按依赖名称懒创建熔断器
#[derive(Default)]
pub struct CircuitBreakerRegistry {
    settings: CircuitBreakerSettings,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    pub fn new(settings: CircuitBreakerSettings) -> Self {
        Self {
            settings,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    pub async fn get(&self, dependency: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.read().await.get(dependency) {
            return breaker.clone();
        }

        let mut breakers = self.breakers.write().await;
        breakers
            .entry(dependency.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::with_config(
                    dependency,
                    self.settings.for_dependency(dependency),
                ))
            })
            .clone()
    }

    pub async fn call<F, Fut, T>(&self, dependency: &str, operation: F) -> JobQueueResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = JobQueueResult<T>>,
    {
        self.get(dependency).await.execute(operation).await
    }

    /// 所有已创建熔断器的当前状态，按名称排序
    pub async fn states(&self) -> Vec<(String, CircuitState)> {
        let breakers: Vec<Arc<CircuitBreaker>> =
            self.breakers.read().await.values().cloned().collect();

        let mut states = Vec::with_capacity(breakers.len());
        for breaker in breakers {
            states.push((breaker.name().to_string(), breaker.get_state().await));
        }
        states.sort_by(|a, b| a.0.cmp(&b.0));
        states
    }
}
