use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::{self, error::TryRecvError};
use tokio::sync::RwLock;
use tokio::time::sleep;
use tracing::{error, info, warn};

use jobqueue_config::WorkerConfig;
use jobqueue_domain::{JobQueue, JobType, RetryScheduler, Stores};
use jobqueue_errors::JobQueueResult;
use jobqueue_infrastructure::CircuitBreakerRegistry;

use super::{ExecutionOutcome, HeartbeatManager, JobExecutionManager, WorkerState};
use crate::handler_registry::HandlerRegistry;

/// 连续多少次存储错误后切换到长暂停
const ERROR_ESCALATION_THRESHOLD: u32 = 5;
const ERROR_ESCALATION_FACTOR: u32 = 5;

/// 单个Worker的运行参数
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub job_types: Vec<JobType>,
    pub poll_interval: Duration,
    pub max_poll_interval: Duration,
    pub heartbeat_interval: Duration,
    pub job_timeout: Duration,
    /// 0 表示不限制
    pub max_jobs: u64,
    pub error_backoff: Duration,
}

impl WorkerSettings {
    pub fn from_config(config: &WorkerConfig) -> JobQueueResult<Self> {
        let job_types = config
            .job_types
            .iter()
            .map(|t| t.parse::<JobType>())
            .collect::<JobQueueResult<Vec<_>>>()?;

        Ok(Self {
            job_types,
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            max_poll_interval: Duration::from_millis(config.max_poll_interval_ms),
            heartbeat_interval: Duration::from_secs(config.heartbeat_interval_seconds),
            job_timeout: Duration::from_secs(config.job_timeout_seconds),
            max_jobs: config.max_jobs,
            error_backoff: Duration::from_millis(config.error_backoff_ms),
        })
    }
}

/// Worker主循环：轮询出队、逐个执行作业，心跳在独立任务中发送
pub struct WorkerLifecycle {
    worker_id: String,
    settings: WorkerSettings,
    queue: Arc<dyn JobQueue>,
    executor: Arc<JobExecutionManager>,
    heartbeat_manager: Arc<HeartbeatManager>,
    state: Arc<WorkerState>,
    next_type: AtomicUsize,
    is_running: Arc<RwLock<bool>>,
}

impl WorkerLifecycle {
    pub fn new(
        worker_id: String,
        settings: WorkerSettings,
        stores: Stores,
        handlers: Arc<HandlerRegistry>,
        breakers: Arc<CircuitBreakerRegistry>,
        retry_scheduler: Arc<RetryScheduler>,
    ) -> Self {
        let state = Arc::new(WorkerState::new());
        let executor = Arc::new(JobExecutionManager::new(
            worker_id.clone(),
            stores.clone(),
            handlers,
            breakers,
            retry_scheduler,
            settings.job_timeout,
            Arc::clone(&state),
        ));
        let heartbeat_manager = Arc::new(HeartbeatManager::new(
            worker_id.clone(),
            Arc::clone(&stores.heartbeats),
            settings.heartbeat_interval,
            Arc::clone(&state),
        ));

        Self {
            worker_id,
            settings,
            queue: stores.queue,
            executor,
            heartbeat_manager,
            state,
            next_type: AtomicUsize::new(0),
            is_running: Arc::new(RwLock::new(false)),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn jobs_processed(&self) -> u64 {
        self.state.jobs_processed()
    }

    pub async fn is_running(&self) -> bool {
        *self.is_running.read().await
    }

    fn budget_exhausted(&self) -> bool {
        self.settings.max_jobs > 0 && self.state.jobs_processed() >= self.settings.max_jobs
    }

    /// 运行直到收到关闭信号或作业预算用完，返回处理的作业数
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) -> u64 {
        {
            let mut is_running = self.is_running.write().await;
            if *is_running {
                warn!(worker_id = %self.worker_id, "Worker already running");
                return self.state.jobs_processed();
            }
            *is_running = true;
        }

        info!(
            worker_id = %self.worker_id,
            job_types = ?self.settings.job_types,
            max_jobs = self.settings.max_jobs,
            "Worker started"
        );

        let (heartbeat_tx, heartbeat_rx) = broadcast::channel(1);
        let heartbeat_handle = self.heartbeat_manager.start_heartbeat_task(heartbeat_rx);

        let mut poll_delay = self.settings.poll_interval;
        let mut consecutive_errors: u32 = 0;

        loop {
            if self.budget_exhausted() {
                info!(
                    worker_id = %self.worker_id,
                    "已处理 {} 个作业，达到上限，Worker退出",
                    self.state.jobs_processed()
                );
                break;
            }

            match shutdown_rx.try_recv() {
                Err(TryRecvError::Empty) => {}
                _ => {
                    info!(worker_id = %self.worker_id, "Worker shutting down");
                    break;
                }
            }

            let pause = match self.poll_once().await {
                Ok(Some(_)) => {
                    consecutive_errors = 0;
                    poll_delay = self.settings.poll_interval;
                    continue;
                }
                Ok(None) => {
                    consecutive_errors = 0;
                    let pause = poll_delay;
                    poll_delay = (poll_delay * 2).min(self.settings.max_poll_interval);
                    pause
                }
                Err(e) => {
                    consecutive_errors += 1;
                    error!(
                        worker_id = %self.worker_id,
                        consecutive_errors,
                        "Job polling failed: {}", e
                    );
                    if consecutive_errors >= ERROR_ESCALATION_THRESHOLD {
                        self.settings.error_backoff * ERROR_ESCALATION_FACTOR
                    } else {
                        self.settings.error_backoff
                    }
                }
            };

            tokio::select! {
                _ = sleep(pause) => {}
                _ = shutdown_rx.recv() => {
                    info!(worker_id = %self.worker_id, "Worker shutting down");
                    break;
                }
            }
        }

        let _ = heartbeat_tx.send(());
        if let Err(e) = heartbeat_handle.await {
            warn!(worker_id = %self.worker_id, "等待心跳任务退出失败: {}", e);
        }

        *self.is_running.write().await = false;
        info!(
            worker_id = %self.worker_id,
            jobs_processed = self.state.jobs_processed(),
            "Worker stopped"
        );
        self.state.jobs_processed()
    }

    /// 按类型轮询一次，队列都为空时返回 None
    pub async fn poll_once(&self) -> JobQueueResult<Option<ExecutionOutcome>> {
        let types = &self.settings.job_types;
        if types.is_empty() {
            return Ok(None);
        }

        let start = self.next_type.fetch_add(1, Ordering::Relaxed) % types.len();
        for offset in 0..types.len() {
            let job_type = types[(start + offset) % types.len()];
            if let Some(entry) = self.queue.dequeue(job_type).await? {
                let outcome = self.executor.execute(entry).await?;
                if outcome.is_processed() {
                    self.state.increment_processed();
                }
                return Ok(Some(outcome));
            }
        }

        Ok(None)
    }
}
