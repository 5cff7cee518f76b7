use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use jobqueue_config::AppConfig;
use jobqueue_domain::{RetryScheduler, Stores};
use jobqueue_infrastructure::{CircuitBreakerRegistry, MetricsExporter, StoreFactory};
use jobqueue_supervisor::{HeartbeatRegistry, HeartbeatRegistryConfig, JobService, RetryPromoter};
use jobqueue_worker::{simulated_registry, HandlerRegistry, WorkerPool};

/// 应用运行模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppMode {
    /// 仅运行Worker池
    Worker,
    /// 心跳检测、重试提升与指标采样
    Supervisor,
    /// 运行所有组件
    All,
}

impl std::str::FromStr for AppMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "worker" => Ok(AppMode::Worker),
            "supervisor" => Ok(AppMode::Supervisor),
            "all" => Ok(AppMode::All),
            other => Err(anyhow::anyhow!("不支持的运行模式: {other}")),
        }
    }
}

/// 主应用程序
pub struct Application {
    config: AppConfig,
    mode: AppMode,
    stores: Stores,
    breakers: Arc<CircuitBreakerRegistry>,
    retry_scheduler: Arc<RetryScheduler>,
    handlers: Arc<HandlerRegistry>,
}

impl Application {
    /// 创建新的应用实例
    pub async fn new(config: AppConfig, mode: AppMode) -> Result<Self> {
        info!("初始化应用程序，模式: {:?}", mode);

        if mode == AppMode::Worker && !config.worker.enabled {
            return Err(anyhow::anyhow!("Worker模式被禁用，请检查配置"));
        }

        let stores = StoreFactory::create(&config.store)
            .await
            .context("创建存储失败")?;
        Ok(Self::with_stores(config, mode, stores))
    }

    /// 使用已有的存储创建应用，测试中配合进程内存储使用
    pub fn with_stores(config: AppConfig, mode: AppMode, stores: Stores) -> Self {
        let breakers = Arc::new(CircuitBreakerRegistry::new(config.circuit_breaker.clone()));
        let retry_scheduler = Arc::new(RetryScheduler::from_config(&config.retry));
        let handlers = Arc::new(simulated_registry(Duration::from_millis(
            config.worker.simulated_step_delay_ms,
        )));

        Self {
            config,
            mode,
            stores,
            breakers,
            retry_scheduler,
            handlers,
        }
    }

    pub fn mode(&self) -> AppMode {
        self.mode
    }

    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    pub fn job_service(&self) -> JobService {
        JobService::new(
            self.stores.clone(),
            self.config.jobs.clone(),
            self.heartbeat_config().dead_timeout(),
        )
    }

    fn heartbeat_config(&self) -> HeartbeatRegistryConfig {
        HeartbeatRegistryConfig::from_config(&self.config.worker, &self.config.heartbeat)
    }

    /// 运行应用程序直到收到关闭信号
    pub async fn run(&self, shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        info!("启动应用程序，模式: {:?}", self.mode);

        match self.mode {
            AppMode::Worker => self.run_worker(shutdown_rx).await,
            AppMode::Supervisor => self.run_supervisor(shutdown_rx).await,
            AppMode::All => {
                let worker_rx = shutdown_rx.resubscribe();
                let (worker_result, supervisor_result) = if self.config.worker.enabled {
                    tokio::join!(self.run_worker(worker_rx), self.run_supervisor(shutdown_rx))
                } else {
                    warn!("Worker被禁用，仅运行监督组件");
                    (Ok(()), self.run_supervisor(shutdown_rx).await)
                };
                worker_result.and(supervisor_result)
            }
        }
    }

    /// 运行Worker池
    async fn run_worker(&self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        let mut pool = WorkerPool::new(
            &self.config.worker,
            self.stores.clone(),
            Arc::clone(&self.handlers),
            Arc::clone(&self.breakers),
            Arc::clone(&self.retry_scheduler),
        )
        .context("创建Worker池失败")?;

        info!("启动Worker池: {:?}", pool.worker_ids());
        pool.start();

        let mut finished = None;
        if self.config.worker.max_jobs > 0 {
            // 设置了作业上限时Worker可能自行退出
            tokio::select! {
                processed = pool.wait() => finished = Some(processed),
                _ = shutdown_rx.recv() => info!("Worker池收到关闭信号"),
            }
        } else {
            let _ = shutdown_rx.recv().await;
            info!("Worker池收到关闭信号");
        }
        let processed = match finished {
            Some(processed) => processed,
            None => pool.stop().await,
        };

        info!("Worker池已停止，共处理 {} 个作业", processed);
        Ok(())
    }

    /// 运行心跳检测、重试提升与指标采样
    async fn run_supervisor(&self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        let heartbeat_config = self.heartbeat_config();

        let mut registry = if self.config.heartbeat.enabled {
            let mut registry = HeartbeatRegistry::new(self.stores.clone(), heartbeat_config.clone());
            registry.start();
            Some(registry)
        } else {
            warn!("心跳检测已禁用，崩溃Worker持有的作业不会被回收");
            None
        };

        let mut promoter = RetryPromoter::new(
            Arc::clone(&self.stores.queue),
            Duration::from_millis(self.config.retry.promote_interval_ms),
        );
        promoter.start();

        let mut exporter = if self.config.metrics.enabled {
            let mut exporter = MetricsExporter::new(
                self.stores.clone(),
                Arc::clone(&self.breakers),
                Duration::from_secs(self.config.metrics.sample_interval_seconds),
                heartbeat_config.dead_timeout(),
            );
            exporter.start();
            Some(exporter)
        } else {
            None
        };

        if let Err(e) = shutdown_rx.recv().await {
            error!("关闭信号通道异常: {}", e);
        }
        info!("监督组件收到关闭信号");

        promoter.stop().await;
        if let Some(registry) = registry.as_mut() {
            registry.stop().await;
        }
        if let Some(exporter) = exporter.as_mut() {
            exporter.stop().await;
        }

        info!("监督组件已停止");
        Ok(())
    }
}

/// 屏蔽Redis URL中的密码
pub fn mask_redis_url(url: &str) -> String {
    if let Some(at_pos) = url.find('@') {
        if let Some(colon_pos) = url[..at_pos].rfind(':') {
            let mut masked = url.to_string();
            masked.replace_range(colon_pos + 1..at_pos, "***");
            return masked;
        }
    }
    url.to_string()
}
