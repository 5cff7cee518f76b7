use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};

use jobqueue_config::CircuitState;
use jobqueue_domain::{JobType, Stores, WorkerHeartbeat};
use jobqueue_errors::JobQueueResult;

use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::observability::MetricsCollector;

/// 一次采样得到的队列与工作者状态
#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    pub queue_depths: BTreeMap<String, usize>,
    pub delayed_depth: usize,
    pub dlq_depth: usize,
    pub active_workers: usize,
    pub workers: Vec<WorkerHeartbeat>,
    pub circuit_states: Vec<(String, CircuitState)>,
}

/// 周期性采样队列深度、死信数量、工作者资源和熔断器状态并写入指标
pub struct MetricsExporter {
    stores: Stores,
    breakers: Arc<CircuitBreakerRegistry>,
    collector: MetricsCollector,
    sample_interval: Duration,
    heartbeat_timeout: Duration,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl MetricsExporter {
    pub fn new(
        stores: Stores,
        breakers: Arc<CircuitBreakerRegistry>,
        sample_interval: Duration,
        heartbeat_timeout: Duration,
    ) -> Self {
        Self {
            stores,
            breakers,
            collector: MetricsCollector::new(),
            sample_interval,
            heartbeat_timeout,
            shutdown_tx: None,
            handle: None,
        }
    }

    /// 采样一次并更新所有仪表
    pub async fn sample_once(&self) -> JobQueueResult<MetricsSnapshot> {
        Self::sample(
            &self.stores,
            &self.breakers,
            &self.collector,
            self.heartbeat_timeout,
        )
        .await
    }

    async fn sample(
        stores: &Stores,
        breakers: &CircuitBreakerRegistry,
        collector: &MetricsCollector,
        heartbeat_timeout: Duration,
    ) -> JobQueueResult<MetricsSnapshot> {
        let mut snapshot = MetricsSnapshot::default();

        for job_type in JobType::ALL {
            let depth = stores.queue.depth(job_type).await?;
            collector.update_queue_depth(job_type.as_str(), depth as f64);
            snapshot.queue_depths.insert(job_type.to_string(), depth);
        }

        snapshot.delayed_depth = stores.queue.delayed_depth().await?;
        collector.update_delayed_depth(snapshot.delayed_depth as f64);

        snapshot.dlq_depth = stores.dlq.depth().await?;
        collector.update_dlq_depth(snapshot.dlq_depth as f64);

        let now = Utc::now();
        let workers: Vec<WorkerHeartbeat> = stores
            .heartbeats
            .list()
            .await?
            .into_iter()
            .filter(|hb| !hb.is_expired(heartbeat_timeout, now))
            .collect();
        for worker in &workers {
            collector.update_worker_resources(&worker.worker_id, worker.cpu_percent, worker.memory_mb);
        }
        snapshot.active_workers = workers.len();
        collector.update_active_workers(workers.len() as f64);
        snapshot.workers = workers;

        snapshot.circuit_states = breakers.states().await;
        for (dependency, state) in &snapshot.circuit_states {
            collector.update_circuit_state(dependency, *state);
        }

        debug!(
            "Metrics sampled: dlq={} delayed={} workers={}",
            snapshot.dlq_depth, snapshot.delayed_depth, snapshot.active_workers
        );
        Ok(snapshot)
    }

    /// 启动后台采样
    pub fn start(&mut self) {
        if self.handle.is_some() {
            warn!("Metrics exporter already running");
            return;
        }

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        self.shutdown_tx = Some(shutdown_tx);

        let stores = self.stores.clone();
        let breakers = Arc::clone(&self.breakers);
        let collector = self.collector.clone();
        let sample_interval = self.sample_interval;
        let heartbeat_timeout = self.heartbeat_timeout;

        let handle = tokio::spawn(async move {
            let mut ticker = interval(sample_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = Self::sample(&stores, &breakers, &collector, heartbeat_timeout).await {
                            warn!("指标采样失败: {}", e);
                        }
                    }
                    _ = &mut shutdown_rx => {
                        info!("Metrics exporter shutdown requested");
                        break;
                    }
                }
            }
        });

        self.handle = Some(handle);
        info!("Metrics exporter started, interval {:?}", self.sample_interval);
    }

    /// 停止后台采样并等待任务退出
    pub async fn stop(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                warn!("Error waiting for metrics exporter to stop: {}", e);
            }
        }
        info!("Metrics exporter stopped");
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InMemoryStore;
    use jobqueue_config::CircuitBreakerSettings;
    use jobqueue_domain::DeadLetterEntry;

    fn exporter(stores: Stores) -> MetricsExporter {
        MetricsExporter::new(
            stores,
            Arc::new(CircuitBreakerRegistry::new(CircuitBreakerSettings::default())),
            Duration::from_millis(20),
            Duration::from_secs(15),
        )
    }

    #[tokio::test]
    async fn test_sample_once_reports_depths() {
        let stores = Stores::from_backend(Arc::new(InMemoryStore::new()));
        stores.queue.enqueue(JobType::Migration, "m-1").await.unwrap();
        stores.queue.enqueue(JobType::Migration, "m-2").await.unwrap();
        stores
            .queue
            .schedule(JobType::Backtest, "b-1", Utc::now() + chrono::Duration::seconds(60))
            .await
            .unwrap();
        stores
            .dlq
            .push(&DeadLetterEntry {
                job_id: "d-1".to_string(),
                job_type: JobType::Backtest,
                reason: "boom".to_string(),
                attempts: 3,
                dead_at: Utc::now(),
            })
            .await
            .unwrap();

        let mut live = WorkerHeartbeat::new("worker-live");
        live.cpu_percent = 12.5;
        stores.heartbeats.record(&live).await.unwrap();
        let mut stale = WorkerHeartbeat::new("worker-stale");
        stale.last_seen = Utc::now() - chrono::Duration::seconds(120);
        stores.heartbeats.record(&stale).await.unwrap();

        let exporter = exporter(stores);
        exporter.breakers.get("database").await;

        let snapshot = exporter.sample_once().await.unwrap();
        assert_eq!(snapshot.queue_depths.get("migration"), Some(&2));
        assert_eq!(snapshot.queue_depths.get("backtest"), Some(&0));
        assert_eq!(snapshot.delayed_depth, 1);
        assert_eq!(snapshot.dlq_depth, 1);
        assert_eq!(snapshot.active_workers, 1);
        assert_eq!(snapshot.workers[0].worker_id, "worker-live");
        assert_eq!(
            snapshot.circuit_states,
            vec![("database".to_string(), CircuitState::Closed)]
        );
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let stores = Stores::from_backend(Arc::new(InMemoryStore::new()));
        let mut exporter = exporter(stores);
        exporter.start();
        assert!(exporter.is_running());
        tokio::time::sleep(Duration::from_millis(50)).await;
        exporter.stop().await;
        assert!(!exporter.is_running());
    }
}
