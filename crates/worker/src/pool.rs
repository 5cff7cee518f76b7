use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use jobqueue_config::WorkerConfig;
use jobqueue_domain::{RetryScheduler, Stores};
use jobqueue_errors::JobQueueResult;
use jobqueue_infrastructure::CircuitBreakerRegistry;

use crate::components::{WorkerLifecycle, WorkerSettings};
use crate::handler_registry::HandlerRegistry;

/// 配置未指定时使用 主机名-进程号 作为Worker标识
pub fn resolve_worker_id(configured: &str) -> String {
    if !configured.is_empty() {
        return configured.to_string();
    }
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "worker".to_string());
    format!("{}-{}", host, std::process::id())
}

/// 同一进程内的一组Worker，共享处理器注册表、熔断器与重试策略
pub struct WorkerPool {
    workers: Vec<Arc<WorkerLifecycle>>,
    shutdown_tx: Option<broadcast::Sender<()>>,
    handles: Vec<JoinHandle<u64>>,
}

impl WorkerPool {
    pub fn new(
        config: &WorkerConfig,
        stores: Stores,
        handlers: Arc<HandlerRegistry>,
        breakers: Arc<CircuitBreakerRegistry>,
        retry_scheduler: Arc<RetryScheduler>,
    ) -> JobQueueResult<Self> {
        let settings = WorkerSettings::from_config(config)?;
        for job_type in &settings.job_types {
            if !handlers.contains(*job_type) {
                warn!("作业类型 {} 没有注册处理器，认领后将标记为failed", job_type);
            }
        }

        let base_id = resolve_worker_id(&config.worker_id);
        let pool_size = config.pool_size.max(1);
        let workers = (0..pool_size)
            .map(|i| {
                let worker_id = if pool_size == 1 {
                    base_id.clone()
                } else {
                    format!("{base_id}-{i}")
                };
                Arc::new(WorkerLifecycle::new(
                    worker_id,
                    settings.clone(),
                    stores.clone(),
                    Arc::clone(&handlers),
                    Arc::clone(&breakers),
                    Arc::clone(&retry_scheduler),
                ))
            })
            .collect();

        Ok(Self {
            workers,
            shutdown_tx: None,
            handles: Vec::new(),
        })
    }

    pub fn worker_ids(&self) -> Vec<String> {
        self.workers.iter().map(|w| w.worker_id().to_string()).collect()
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    pub fn is_started(&self) -> bool {
        !self.handles.is_empty()
    }

    pub fn start(&mut self) {
        if self.is_started() {
            warn!("Worker pool already started");
            return;
        }

        let (shutdown_tx, _) = broadcast::channel(1);
        for worker in &self.workers {
            let worker = Arc::clone(worker);
            let shutdown_rx = shutdown_tx.subscribe();
            self.handles
                .push(tokio::spawn(async move { worker.run(shutdown_rx).await }));
        }
        self.shutdown_tx = Some(shutdown_tx);
        info!("Worker pool started with {} workers", self.workers.len());
    }

    /// 等待所有Worker退出，返回处理的作业总数
    pub async fn wait(&mut self) -> u64 {
        let mut total = 0;
        for handle in self.handles.drain(..) {
            match handle.await {
                Ok(processed) => total += processed,
                Err(e) => warn!("Worker task failed: {}", e),
            }
        }
        total
    }

    /// 发送关闭信号，当前作业执行完后Worker退出
    pub async fn stop(&mut self) -> u64 {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
        let total = self.wait().await;
        info!("Worker pool stopped, {} jobs processed", total);
        total
    }
}
