use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use jobqueue_config::{HeartbeatConfig, WorkerConfig};
use jobqueue_domain::{DeadLetterEntry, Job, JobStatus, JobUpdate, Stores, WorkerHeartbeat};
use jobqueue_errors::JobQueueResult;
use jobqueue_infrastructure::MetricsCollector;

/// 心跳注册表配置
#[derive(Debug, Clone)]
pub struct HeartbeatRegistryConfig {
    /// Worker发送心跳的间隔
    pub heartbeat_interval: Duration,
    /// 超过 心跳间隔 x 倍数 未更新即判定死亡
    pub dead_timeout_multiplier: u32,
    /// 检测间隔
    pub poll_interval: Duration,
}

impl Default for HeartbeatRegistryConfig {
    fn default() -> Self {
        Self::from_config(&WorkerConfig::default(), &HeartbeatConfig::default())
    }
}

impl HeartbeatRegistryConfig {
    pub fn from_config(worker: &WorkerConfig, heartbeat: &HeartbeatConfig) -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(worker.heartbeat_interval_seconds),
            dead_timeout_multiplier: heartbeat.dead_timeout_multiplier,
            poll_interval: Duration::from_secs(heartbeat.poll_interval_seconds),
        }
    }

    pub fn dead_timeout(&self) -> Duration {
        self.heartbeat_interval * self.dead_timeout_multiplier
    }
}

/// 一次扫描的回收结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReclaimReport {
    pub dead_workers: Vec<String>,
    pub requeued: Vec<String>,
    pub dead_lettered: Vec<String>,
    /// 回收时作业已通过其他路径变化
    pub stale: usize,
    /// 状态为queued却不在任何队列中，已重新入队
    pub restored_queue: Vec<String>,
    /// 状态为dead却没有死信条目，已补写
    pub restored_dlq: Vec<String>,
}

impl ReclaimReport {
    pub fn is_empty(&self) -> bool {
        self.dead_workers.is_empty()
            && self.requeued.is_empty()
            && self.dead_lettered.is_empty()
            && self.stale == 0
            && self.restored_queue.is_empty()
            && self.restored_dlq.is_empty()
    }
}

/// 跟踪Worker心跳，回收死亡Worker持有的作业
///
/// 这是Worker崩溃后作业的唯一恢复路径。与作业分发并发运行，
/// 回收时的CAS冲突说明作业已被其他路径处理，直接忽略。
/// 每轮扫描还会对账：状态写入成功但入队或写死信失败的作业在这里补齐。
pub struct HeartbeatRegistry {
    stores: Stores,
    config: HeartbeatRegistryConfig,
    metrics: MetricsCollector,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl HeartbeatRegistry {
    pub fn new(stores: Stores, config: HeartbeatRegistryConfig) -> Self {
        Self {
            stores,
            config,
            metrics: MetricsCollector::new(),
            shutdown_tx: None,
            handle: None,
        }
    }

    pub fn config(&self) -> &HeartbeatRegistryConfig {
        &self.config
    }

    /// 心跳未过期的Worker
    pub async fn live_workers(&self, now: DateTime<Utc>) -> JobQueueResult<Vec<WorkerHeartbeat>> {
        let dead_timeout = self.config.dead_timeout();
        Ok(self
            .stores
            .heartbeats
            .list()
            .await?
            .into_iter()
            .filter(|hb| !hb.is_expired(dead_timeout, now))
            .collect())
    }

    /// 扫描一次：回收死亡Worker的作业并删除其心跳记录
    pub async fn scan_once(&self, now: DateTime<Utc>) -> JobQueueResult<ReclaimReport> {
        Self::scan(&self.stores, &self.config, &self.metrics, now).await
    }

    async fn scan(
        stores: &Stores,
        config: &HeartbeatRegistryConfig,
        metrics: &MetricsCollector,
        now: DateTime<Utc>,
    ) -> JobQueueResult<ReclaimReport> {
        let dead_timeout = config.dead_timeout();
        let heartbeats: HashMap<String, WorkerHeartbeat> = stores
            .heartbeats
            .list()
            .await?
            .into_iter()
            .map(|hb| (hb.worker_id.clone(), hb))
            .collect();

        let mut report = ReclaimReport::default();
        for (worker_id, heartbeat) in &heartbeats {
            if heartbeat.is_expired(dead_timeout, now) {
                warn!(
                    worker_id = %worker_id,
                    last_seen = %heartbeat.last_seen.format("%Y-%m-%d %H:%M:%S UTC"),
                    "检测到死亡Worker"
                );
                report.dead_workers.push(worker_id.clone());
            }
        }
        report.dead_workers.sort();

        for job in stores.jobs.list_running().await? {
            if !Self::is_orphaned(&job, &heartbeats, dead_timeout, now) {
                continue;
            }
            match Self::reclaim(stores, metrics, &job).await {
                Ok(Some(status)) if status == JobStatus::Dead => {
                    report.dead_lettered.push(job.job_id.clone())
                }
                Ok(Some(_)) => report.requeued.push(job.job_id.clone()),
                Ok(None) => report.stale += 1,
                Err(e) => error!(job_id = %job.job_id, "回收作业失败: {}", e),
            }
        }

        if let Err(e) = Self::reconcile(stores, metrics, dead_timeout, now, &mut report).await {
            error!("对账扫描出错: {}", e);
        }

        // 死亡Worker的作业处理完后再删除心跳，避免下一轮把作业当作无心跳处理
        for worker_id in &report.dead_workers {
            if let Err(e) = stores.heartbeats.remove(worker_id).await {
                warn!(worker_id = %worker_id, "删除死亡Worker心跳失败: {}", e);
            }
        }

        if !report.is_empty() {
            info!(
                dead_workers = report.dead_workers.len(),
                requeued = report.requeued.len(),
                dead_lettered = report.dead_lettered.len(),
                stale = report.stale,
                restored_queue = report.restored_queue.len(),
                restored_dlq = report.restored_dlq.len(),
                "心跳扫描完成"
            );
        }
        Ok(report)
    }

    /// 持有者心跳过期；或持有者没有在心跳中报告这个作业（包括没有心跳），
    /// 且作业超过死亡超时未更新
    fn is_orphaned(
        job: &Job,
        heartbeats: &HashMap<String, WorkerHeartbeat>,
        dead_timeout: Duration,
        now: DateTime<Utc>,
    ) -> bool {
        match heartbeats.get(&job.owner_worker_id) {
            Some(heartbeat) if heartbeat.is_expired(dead_timeout, now) => true,
            Some(heartbeat) => {
                heartbeat.current_job_id.as_deref() != Some(job.job_id.as_str())
                    && Self::idle_longer_than(job, dead_timeout, now)
            }
            None => Self::idle_longer_than(job, dead_timeout, now),
        }
    }

    fn idle_longer_than(job: &Job, timeout: Duration, now: DateTime<Utc>) -> bool {
        let idle = now.signed_duration_since(job.updated_at);
        chrono::Duration::from_std(timeout)
            .map(|timeout| idle > timeout)
            .unwrap_or(false)
    }

    /// 补齐两步写入中丢失的第二步：
    /// queued 作业超过死亡超时仍不在就绪队列或延迟集合中则重新入队，
    /// dead 作业没有死信条目则补写。
    /// 出队与认领之间的作业也可能被重新入队，重复条目在认领时被CAS丢弃。
    async fn reconcile(
        stores: &Stores,
        metrics: &MetricsCollector,
        dead_timeout: Duration,
        now: DateTime<Utc>,
        report: &mut ReclaimReport,
    ) -> JobQueueResult<()> {
        for job in stores.jobs.list_by_status(JobStatus::Queued).await? {
            if !Self::idle_longer_than(&job, dead_timeout, now) {
                continue;
            }
            match stores.queue.is_pending(job.job_type, &job.job_id).await {
                Ok(true) => {}
                Ok(false) => match stores.queue.enqueue(job.job_type, &job.job_id).await {
                    Ok(()) => {
                        warn!(job_id = %job.job_id, job_type = %job.job_type, "作业不在任何队列中，已重新入队");
                        report.restored_queue.push(job.job_id.clone());
                    }
                    Err(e) => error!(job_id = %job.job_id, "对账重新入队失败: {}", e),
                },
                Err(e) => error!(job_id = %job.job_id, "查询作业排队状态失败: {}", e),
            }
        }

        for job in stores.jobs.list_by_status(JobStatus::Dead).await? {
            match stores.dlq.contains(&job.job_id).await {
                Ok(true) => {}
                Ok(false) => {
                    let entry = DeadLetterEntry::from_job(&job, job.message.clone());
                    match stores.dlq.push(&entry).await {
                        Ok(pushed) => {
                            if pushed {
                                metrics.record_dlq_move(job.job_type.as_str());
                            }
                            warn!(job_id = %job.job_id, "死信条目缺失，已补写");
                            report.restored_dlq.push(job.job_id.clone());
                        }
                        Err(e) => error!(job_id = %job.job_id, "对账补写死信失败: {}", e),
                    }
                }
                Err(e) => error!(job_id = %job.job_id, "查询死信条目失败: {}", e),
            }
        }

        report.restored_queue.sort();
        report.restored_dlq.sort();
        Ok(())
    }

    /// running -> queued 并放回队尾；最后一次尝试已用尽时进入死信队列
    async fn reclaim(
        stores: &Stores,
        metrics: &MetricsCollector,
        job: &Job,
    ) -> JobQueueResult<Option<JobStatus>> {
        let owner = job.owner_worker_id.clone();
        let exhausted = job.attempts_exhausted();
        let (to, message) = if exhausted {
            (
                JobStatus::Dead,
                format!("worker {owner} lost; attempts exhausted ({}/{})", job.attempt, job.max_attempts),
            )
        } else {
            (JobStatus::Queued, format!("reclaimed from worker {owner}"))
        };

        let updated = match stores
            .jobs
            .transition(
                &job.job_id,
                &[JobStatus::Running],
                to,
                JobUpdate::default()
                    .expect_owner(owner.clone())
                    .clear_owner()
                    .message(message.clone()),
            )
            .await
        {
            Ok(updated) => updated,
            Err(e) if e.is_stale() => {
                debug!(job_id = %job.job_id, "作业已通过其他路径变化，跳过回收: {}", e);
                metrics.record_stale_transition("reclaim");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        // 状态已写入，第二步失败时留给后续的对账扫描
        metrics.record_reclaimed();
        if exhausted {
            let entry = DeadLetterEntry::from_job(&updated, message);
            match stores.dlq.push(&entry).await {
                Ok(true) => metrics.record_dlq_move(updated.job_type.as_str()),
                Ok(false) => {}
                Err(e) => error!(job_id = %job.job_id, "回收后写入死信失败，等待对账: {}", e),
            }
            warn!(job_id = %job.job_id, worker_id = %owner, "回收的作业已无剩余尝试，进入死信队列");
        } else {
            match stores.queue.enqueue(updated.job_type, &updated.job_id).await {
                Ok(()) => info!(job_id = %job.job_id, worker_id = %owner, attempt = updated.attempt, "作业已回收并重新排队"),
                Err(e) => error!(job_id = %job.job_id, "回收后入队失败，等待对账: {}", e),
            }
        }

        Ok(Some(updated.status))
    }

    /// 启动后台检测循环
    pub fn start(&mut self) {
        if self.handle.is_some() {
            warn!("Heartbeat registry already running");
            return;
        }

        info!(
            "启动心跳检测，死亡超时 {:?}，检测间隔 {:?}",
            self.config.dead_timeout(),
            self.config.poll_interval
        );

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let stores = self.stores.clone();
        let config = self.config.clone();
        let metrics = self.metrics.clone();

        self.handle = Some(tokio::spawn(async move {
            let mut ticker = interval(config.poll_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = Self::scan(&stores, &config, &metrics, Utc::now()).await {
                            error!("心跳扫描出错: {}", e);
                        }
                    }
                    _ = &mut shutdown_rx => {
                        info!("收到停止信号，退出心跳检测循环");
                        break;
                    }
                }
            }
        }));
        self.shutdown_tx = Some(shutdown_tx);
    }

    pub async fn stop(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                warn!("Error waiting for heartbeat registry to stop: {}", e);
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use jobqueue_domain::JobType;
    use jobqueue_infrastructure::InMemoryStore;
    use serde_json::json;

    fn registry(stores: &Stores) -> HeartbeatRegistry {
        HeartbeatRegistry::new(
            stores.clone(),
            HeartbeatRegistryConfig {
                heartbeat_interval: Duration::from_secs(5),
                dead_timeout_multiplier: 3,
                poll_interval: Duration::from_millis(10),
            },
        )
    }

    async fn running_job(stores: &Stores, id: &str, owner: &str, max_attempts: u32) -> Job {
        stores
            .jobs
            .create(&Job::new(id.to_string(), JobType::Migration, json!({}), max_attempts))
            .await
            .unwrap();
        stores
            .jobs
            .transition(id, &[JobStatus::Queued], JobStatus::Running, JobUpdate::claim(owner))
            .await
            .unwrap()
    }

    async fn heartbeat(stores: &Stores, worker_id: &str, age_secs: i64) {
        let mut hb = WorkerHeartbeat::new(worker_id);
        hb.last_seen = Utc::now() - chrono::Duration::seconds(age_secs);
        stores.heartbeats.record(&hb).await.unwrap();
    }

    #[test]
    fn test_dead_timeout() {
        let config = HeartbeatRegistryConfig::default();
        assert_eq!(config.dead_timeout(), Duration::from_secs(15));
    }

    #[tokio::test]
    async fn test_live_worker_jobs_are_untouched() {
        let stores = Stores::from_backend(Arc::new(InMemoryStore::new()));
        running_job(&stores, "j-live", "w-live", 3).await;
        heartbeat(&stores, "w-live", 1).await;

        let report = registry(&stores).scan_once(Utc::now()).await.unwrap();
        assert!(report.is_empty());
        let job = stores.jobs.get("j-live").await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Running);
    }

    #[tokio::test]
    async fn test_expired_worker_jobs_are_requeued() {
        let stores = Stores::from_backend(Arc::new(InMemoryStore::new()));
        running_job(&stores, "j-orphan", "w-dead", 3).await;
        heartbeat(&stores, "w-dead", 60).await;

        let registry = registry(&stores);
        let report = registry.scan_once(Utc::now()).await.unwrap();
        assert_eq!(report.dead_workers, vec!["w-dead"]);
        assert_eq!(report.requeued, vec!["j-orphan"]);

        let job = stores.jobs.get("j-orphan").await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.attempt, 1);
        assert!(job.owner_worker_id.is_empty());
        assert_eq!(stores.queue.depth(JobType::Migration).await.unwrap(), 1);
        assert!(stores.heartbeats.get("w-dead").await.unwrap().is_none());
        assert!(registry.live_workers(Utc::now()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_exhausted_job_is_dead_lettered() {
        let stores = Stores::from_backend(Arc::new(InMemoryStore::new()));
        running_job(&stores, "j-last", "w-dead", 1).await;
        heartbeat(&stores, "w-dead", 60).await;

        let report = registry(&stores).scan_once(Utc::now()).await.unwrap();
        assert_eq!(report.dead_lettered, vec!["j-last"]);

        let job = stores.jobs.get("j-last").await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Dead);
        assert_eq!(stores.dlq.depth().await.unwrap(), 1);
        assert_eq!(stores.queue.depth(JobType::Migration).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_missing_heartbeat_waits_for_dead_timeout() {
        let stores = Stores::from_backend(Arc::new(InMemoryStore::new()));
        running_job(&stores, "j-new", "w-unknown", 3).await;
        let registry = registry(&stores);

        // 刚认领的作业在Worker第一次心跳前不会被回收
        let report = registry.scan_once(Utc::now()).await.unwrap();
        assert!(report.requeued.is_empty());

        let later = Utc::now() + chrono::Duration::seconds(16);
        let report = registry.scan_once(later).await.unwrap();
        assert_eq!(report.requeued, vec!["j-new"]);
    }

    #[tokio::test]
    async fn test_live_worker_not_reporting_job_is_reclaimed() {
        let stores = Stores::from_backend(Arc::new(InMemoryStore::new()));
        running_job(&stores, "j-forgotten", "w-busy", 3).await;
        running_job(&stores, "j-active", "w-active", 3).await;

        let later = Utc::now() + chrono::Duration::seconds(16);
        let mut busy = WorkerHeartbeat::new("w-busy");
        busy.current_job_id = Some("j-other".to_string());
        busy.last_seen = later;
        stores.heartbeats.record(&busy).await.unwrap();
        let mut active = WorkerHeartbeat::new("w-active");
        active.current_job_id = Some("j-active".to_string());
        active.last_seen = later;
        stores.heartbeats.record(&active).await.unwrap();

        let report = registry(&stores).scan_once(later).await.unwrap();
        assert!(report.dead_workers.is_empty());
        assert_eq!(report.requeued, vec!["j-forgotten"]);

        let forgotten = stores.jobs.get("j-forgotten").await.unwrap().unwrap();
        assert_eq!(forgotten.status, JobStatus::Queued);
        assert_eq!(forgotten.message, "reclaimed from worker w-busy");
        let active = stores.jobs.get("j-active").await.unwrap().unwrap();
        assert_eq!(active.status, JobStatus::Running);
        assert!(stores.heartbeats.get("w-busy").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_queued_job_missing_from_queue_is_restored() {
        let stores = Stores::from_backend(Arc::new(InMemoryStore::new()));
        stores
            .jobs
            .create(&Job::new("j-lost".to_string(), JobType::Migration, json!({}), 3))
            .await
            .unwrap();
        let registry = registry(&stores);

        // 刚提交的作业可能还在入队途中
        let report = registry.scan_once(Utc::now()).await.unwrap();
        assert!(report.restored_queue.is_empty());

        let later = Utc::now() + chrono::Duration::seconds(16);
        let report = registry.scan_once(later).await.unwrap();
        assert_eq!(report.restored_queue, vec!["j-lost"]);
        assert_eq!(stores.queue.depth(JobType::Migration).await.unwrap(), 1);

        let report = registry.scan_once(later).await.unwrap();
        assert!(report.is_empty());
        assert_eq!(stores.queue.depth(JobType::Migration).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_delayed_retry_is_not_restored() {
        let stores = Stores::from_backend(Arc::new(InMemoryStore::new()));
        stores
            .jobs
            .create(&Job::new("j-wait".to_string(), JobType::Backtest, json!({}), 3))
            .await
            .unwrap();
        stores
            .queue
            .schedule(JobType::Backtest, "j-wait", Utc::now() + chrono::Duration::seconds(60))
            .await
            .unwrap();

        let later = Utc::now() + chrono::Duration::seconds(16);
        let report = registry(&stores).scan_once(later).await.unwrap();
        assert!(report.is_empty());
        assert_eq!(stores.queue.depth(JobType::Backtest).await.unwrap(), 0);
        assert_eq!(stores.queue.delayed_depth().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_dead_job_missing_dlq_entry_is_restored() {
        let stores = Stores::from_backend(Arc::new(InMemoryStore::new()));
        running_job(&stores, "j-dead", "w-1", 1).await;
        stores
            .jobs
            .transition(
                "j-dead",
                &[JobStatus::Running],
                JobStatus::Dead,
                JobUpdate::default().expect_owner("w-1").clear_owner().message("boom"),
            )
            .await
            .unwrap();

        let registry = registry(&stores);
        let report = registry.scan_once(Utc::now()).await.unwrap();
        assert_eq!(report.restored_dlq, vec!["j-dead"]);

        let entries = stores.dlq.list().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].reason, "boom");
        assert_eq!(entries[0].attempts, 1);

        assert!(registry.scan_once(Utc::now()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let stores = Stores::from_backend(Arc::new(InMemoryStore::new()));
        running_job(&stores, "j-bg", "w-dead", 3).await;
        heartbeat(&stores, "w-dead", 60).await;

        let mut registry = registry(&stores);
        registry.start();
        assert!(registry.is_running());
        tokio::time::sleep(Duration::from_millis(50)).await;
        registry.stop().await;
        assert!(!registry.is_running());

        let job = stores.jobs.get("j-bg").await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Queued);
    }
}
