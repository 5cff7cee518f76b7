use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use jobqueue_domain::JobQueue;
use jobqueue_errors::JobQueueResult;

/// 把退避到期的重试作业从延迟集合移到对应类型的队尾
pub struct RetryPromoter {
    queue: Arc<dyn JobQueue>,
    promote_interval: Duration,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl RetryPromoter {
    pub fn new(queue: Arc<dyn JobQueue>, promote_interval: Duration) -> Self {
        Self {
            queue,
            promote_interval,
            shutdown_tx: None,
            handle: None,
        }
    }

    pub async fn promote_once(&self) -> JobQueueResult<usize> {
        Self::promote(&self.queue).await
    }

    async fn promote(queue: &Arc<dyn JobQueue>) -> JobQueueResult<usize> {
        let promoted = queue.promote_due(Utc::now()).await?;
        if promoted > 0 {
            debug!("提升了 {} 个到期的重试作业", promoted);
        }
        Ok(promoted)
    }

    pub fn start(&mut self) {
        if self.handle.is_some() {
            warn!("Retry promoter already running");
            return;
        }

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let queue = Arc::clone(&self.queue);
        let period = self.promote_interval;

        self.handle = Some(tokio::spawn(async move {
            let mut ticker = interval(period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = Self::promote(&queue).await {
                            error!("提升重试作业失败: {}", e);
                        }
                    }
                    _ = &mut shutdown_rx => {
                        info!("Retry promoter shutting down");
                        break;
                    }
                }
            }
        }));
        self.shutdown_tx = Some(shutdown_tx);
        info!("Retry promoter started, interval {:?}", period);
    }

    pub async fn stop(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                warn!("Error waiting for retry promoter to stop: {}", e);
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
    use jobqueue_domain::JobType;
    use jobqueue_infrastructure::InMemoryStore;

    #[tokio::test]
    async fn test_promote_once_moves_due_entries() {
        let store = Arc::new(InMemoryStore::new());
        store
            .schedule(JobType::Backtest, "due", Utc::now() - chrono::Duration::milliseconds(1))
            .await
            .unwrap();
        store
            .schedule(JobType::Backtest, "later", Utc::now() + chrono::Duration::seconds(60))
            .await
            .unwrap();

        let promoter = RetryPromoter::new(store.clone(), Duration::from_millis(10));
        assert_eq!(promoter.promote_once().await.unwrap(), 1);
        assert_eq!(JobQueue::depth(store.as_ref(), JobType::Backtest).await.unwrap(), 1);
        assert_eq!(store.delayed_depth().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_background_promotion() {
        let store = Arc::new(InMemoryStore::new());
        let mut promoter = RetryPromoter::new(store.clone(), Duration::from_millis(5));
        promoter.start();

        store
            .schedule(JobType::Migration, "soon", Utc::now() + chrono::Duration::milliseconds(10))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        promoter.stop().await;

        assert_eq!(JobQueue::depth(store.as_ref(), JobType::Migration).await.unwrap(), 1);
        assert!(!promoter.is_running());
    }
}
