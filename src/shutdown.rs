use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::signal;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// 优雅关闭管理器
///
/// 所有后台组件订阅同一个广播通道；关闭后仍然订阅的接收器会立即收到信号。
#[derive(Clone)]
pub struct ShutdownManager {
    shutdown_tx: broadcast::Sender<()>,
    is_shutdown: Arc<AtomicBool>,
    /// 等待组件退出的上限，超过后放弃等待
    drain_timeout: Duration,
}

impl ShutdownManager {
    pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

    pub fn new() -> Self {
        Self::with_drain_timeout(Self::DEFAULT_DRAIN_TIMEOUT)
    }

    pub fn with_drain_timeout(drain_timeout: Duration) -> Self {
        let (shutdown_tx, _) = broadcast::channel(16);
        Self {
            shutdown_tx,
            is_shutdown: Arc::new(AtomicBool::new(false)),
            drain_timeout,
        }
    }

    /// 订阅关闭信号
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        if self.is_shutdown() {
            let (tx, rx) = broadcast::channel(1);
            let _ = tx.send(());
            return rx;
        }
        self.shutdown_tx.subscribe()
    }

    /// 触发关闭，重复调用无效果
    pub fn shutdown(&self) {
        if self.is_shutdown.swap(true, Ordering::SeqCst) {
            debug!("关闭管理器已经触发过关闭");
            return;
        }

        let receivers = self.shutdown_tx.receiver_count();
        // 没有接收者时发送失败，忽略
        let _ = self.shutdown_tx.send(());
        info!("关闭信号已发送给 {} 个订阅者", receivers);
    }

    pub fn is_shutdown(&self) -> bool {
        self.is_shutdown.load(Ordering::SeqCst)
    }

    /// 等待组件任务退出，超时返回 None
    pub async fn drain<T>(&self, handle: JoinHandle<T>) -> Option<T> {
        match tokio::time::timeout(self.drain_timeout, handle).await {
            Ok(Ok(value)) => Some(value),
            Ok(Err(e)) => {
                error!("组件任务异常退出: {}", e);
                None
            }
            Err(_) => {
                warn!("等待组件退出超时（{:?}），强制退出", self.drain_timeout);
                None
            }
        }
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

/// 等待 Ctrl+C 或 SIGTERM
pub async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("安装Ctrl+C信号处理器失败: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("安装SIGTERM信号处理器失败: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("收到Ctrl+C信号"),
        _ = terminate => info!("收到SIGTERM信号"),
    }
}
