use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, error, info};

use jobqueue_domain::{HeartbeatStore, WorkerHeartbeat};
use jobqueue_errors::JobQueueResult;
use jobqueue_infrastructure::ResourceSampler;

use super::WorkerState;

/// 按固定间隔写入Worker心跳，与作业执行互不阻塞
pub struct HeartbeatManager {
    worker_id: String,
    heartbeats: Arc<dyn HeartbeatStore>,
    heartbeat_interval: Duration,
    state: Arc<WorkerState>,
}

impl HeartbeatManager {
    pub fn new(
        worker_id: String,
        heartbeats: Arc<dyn HeartbeatStore>,
        heartbeat_interval: Duration,
        state: Arc<WorkerState>,
    ) -> Self {
        Self {
            worker_id,
            heartbeats,
            heartbeat_interval,
            state,
        }
    }

    /// 写入一次心跳
    pub async fn beat(&self, sampler: &mut ResourceSampler) -> JobQueueResult<WorkerHeartbeat> {
        Self::send_heartbeat(&self.worker_id, &self.heartbeats, &self.state, sampler).await
    }

    async fn send_heartbeat(
        worker_id: &str,
        heartbeats: &Arc<dyn HeartbeatStore>,
        state: &WorkerState,
        sampler: &mut ResourceSampler,
    ) -> JobQueueResult<WorkerHeartbeat> {
        let sample = sampler.sample();
        let heartbeat = WorkerHeartbeat {
            worker_id: worker_id.to_string(),
            last_seen: Utc::now(),
            current_job_id: state.current_job().await,
            cpu_percent: sample.cpu_percent,
            memory_mb: sample.memory_mb,
            jobs_processed: state.jobs_processed(),
        };
        heartbeats.record(&heartbeat).await?;
        debug!(worker_id, current_job = ?heartbeat.current_job_id, "心跳已发送");
        Ok(heartbeat)
    }

    /// 启动心跳循环，收到关闭信号后删除心跳记录并退出
    pub fn start_heartbeat_task(&self, mut shutdown_rx: broadcast::Receiver<()>) -> JoinHandle<()> {
        let period = self.heartbeat_interval;
        let heartbeats = Arc::clone(&self.heartbeats);
        let state = Arc::clone(&self.state);
        let worker_id = self.worker_id.clone();

        tokio::spawn(async move {
            let mut heartbeat_interval = interval(period);
            let mut sampler = ResourceSampler::new();
            loop {
                tokio::select! {
                    _ = heartbeat_interval.tick() => {
                        if let Err(e) = Self::send_heartbeat(&worker_id, &heartbeats, &state, &mut sampler).await {
                            error!(worker_id = %worker_id, "Failed to send heartbeat: {}", e);
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!(worker_id = %worker_id, "Heartbeat task shutting down");
                        break;
                    }
                }
            }

            if let Err(e) = heartbeats.remove(&worker_id).await {
                error!(worker_id = %worker_id, "删除心跳记录失败: {}", e);
            }
        })
    }
}
