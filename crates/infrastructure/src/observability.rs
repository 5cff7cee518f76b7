use anyhow::{Context, Result};
use metrics::{counter, gauge, histogram, Counter, Gauge};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use jobqueue_config::{CircuitState, LogFormat};

/// 作业队列的指标记录入口
#[derive(Clone)]
pub struct MetricsCollector {
    jobs_reclaimed_total: Counter,
    delayed_depth: Gauge,
    dlq_depth: Gauge,
    active_workers: Gauge,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            jobs_reclaimed_total: counter!("jobqueue_jobs_reclaimed_total"),
            delayed_depth: gauge!("jobqueue_delayed_depth"),
            dlq_depth: gauge!("jobqueue_dlq_depth"),
            active_workers: gauge!("jobqueue_active_workers"),
        }
    }

    /// outcome: completed / retried / dead_lettered / failed
    pub fn record_job_outcome(&self, job_type: &str, outcome: &'static str, duration_seconds: f64) {
        counter!(
            "jobqueue_jobs_processed_total",
            "job_type" => job_type.to_string(),
            "outcome" => outcome
        )
        .increment(1);
        histogram!(
            "jobqueue_job_duration_seconds",
            "job_type" => job_type.to_string(),
            "outcome" => outcome
        )
        .record(duration_seconds);
    }

    pub fn record_retry(&self, job_type: &str) {
        counter!("jobqueue_job_retries_total", "job_type" => job_type.to_string()).increment(1);
    }

    pub fn record_dlq_move(&self, job_type: &str) {
        counter!("jobqueue_dlq_moves_total", "job_type" => job_type.to_string()).increment(1);
    }

    pub fn record_handler_error(&self, job_type: &str) {
        counter!("jobqueue_handler_errors_total", "job_type" => job_type.to_string()).increment(1);
    }

    pub fn record_stale_transition(&self, operation: &'static str) {
        counter!("jobqueue_stale_transitions_total", "operation" => operation).increment(1);
    }

    pub fn record_reclaimed(&self) {
        self.jobs_reclaimed_total.increment(1);
    }

    pub fn record_submitted(&self, job_type: &str) {
        counter!("jobqueue_jobs_submitted_total", "job_type" => job_type.to_string()).increment(1);
    }

    pub fn update_queue_depth(&self, queue: &str, depth: f64) {
        gauge!("jobqueue_queue_depth", "queue" => queue.to_string()).set(depth);
    }

    pub fn update_delayed_depth(&self, depth: f64) {
        self.delayed_depth.set(depth);
    }

    pub fn update_dlq_depth(&self, depth: f64) {
        self.dlq_depth.set(depth);
    }

    pub fn update_active_workers(&self, count: f64) {
        self.active_workers.set(count);
    }

    pub fn update_worker_resources(&self, worker_id: &str, cpu_percent: f64, memory_mb: f64) {
        gauge!("jobqueue_worker_cpu_percent", "worker_id" => worker_id.to_string())
            .set(cpu_percent);
        gauge!("jobqueue_worker_memory_mb", "worker_id" => worker_id.to_string()).set(memory_mb);
    }

    pub fn update_circuit_state(&self, dependency: &str, state: CircuitState) {
        gauge!("jobqueue_circuit_breaker_state", "dependency" => dependency.to_string())
            .set(state.as_gauge());
    }
}

/// 初始化结构化日志，RUST_LOG 优先于配置的级别
pub fn init_logging(level: &str, format: LogFormat) -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    let registry = tracing_subscriber::registry().with(env_filter);

    match format {
        LogFormat::Json => {
            let fmt_layer = tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(true)
                .with_target(true)
                .with_thread_ids(true);

            registry
                .with(fmt_layer)
                .try_init()
                .context("初始化日志失败")?;
        }
        LogFormat::Pretty => {
            let fmt_layer = tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true);

            registry
                .with(fmt_layer)
                .try_init()
                .context("初始化日志失败")?;
        }
    }

    info!(logging.format = %format, logging.level = level, "Structured logging initialized");
    Ok(())
}

/// 安装Prometheus记录器并在 `listen_address` 上提供拉取端点
pub fn init_metrics(listen_address: &str) -> Result<()> {
    let addr: std::net::SocketAddr = listen_address
        .parse()
        .with_context(|| format!("无效的指标监听地址: {listen_address}"))?;

    let (recorder, exporter) = metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .build()
        .map_err(|e| anyhow::anyhow!("Failed to create Prometheus exporter: {}", e))?;

    tokio::spawn(async move {
        if let Err(e) = exporter.await {
            tracing::error!("Prometheus exporter stopped: {:?}", e);
        }
    });

    metrics::set_global_recorder(recorder)
        .map_err(|e| anyhow::anyhow!("Failed to install metrics recorder: {}", e))?;

    info!("Metrics initialized with Prometheus exporter on {}", addr);
    Ok(())
}
