use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// 进程级关闭信号, 克隆共享同一状态
#[derive(Clone)]
pub struct ShutdownManager {
    inner: Arc<Inner>,
}

struct Inner {
    signal: broadcast::Sender<()>,
    triggered: AtomicBool,
}

impl ShutdownManager {
    pub fn new() -> Self {
        let (signal, _) = broadcast::channel(1);
        Self {
            inner: Arc::new(Inner {
                signal,
                triggered: AtomicBool::new(false),
            }),
        }
    }

    /// 已触发关闭时返回的接收器会立即收到信号
    pub async fn subscribe(&self) -> broadcast::Receiver<()> {
        let rx = self.inner.signal.subscribe();
        if !self.inner.triggered.load(Ordering::Acquire) {
            return rx;
        }
        let (tx, fired) = broadcast::channel(1);
        let _ = tx.send(());
        fired
    }

    pub async fn shutdown(&self) {
        if self.inner.triggered.swap(true, Ordering::AcqRel) {
            debug!("关闭信号此前已发送");
            return;
        }
        let receivers = self.inner.signal.send(()).unwrap_or(0);
        info!(receivers, "关闭信号已发送");
    }

    pub async fn is_shutdown(&self) -> bool {
        self.inner.triggered.load(Ordering::Acquire)
    }

    /// 限时等待, 超时返回 false
    pub async fn wait_with_timeout<F>(&self, task: F, limit: Duration) -> bool
    where
        F: Future,
    {
        if timeout(limit, task).await.is_ok() {
            return true;
        }
        warn!(timeout_ms = limit.as_millis() as u64, "等待关闭超时");
        false
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_receive_shutdown() {
        let manager = ShutdownManager::new();
        let mut rx1 = manager.subscribe().await;
        let mut rx2 = manager.subscribe().await;

        manager.shutdown().await;

        assert!(rx1.recv().await.is_ok());
        assert!(rx2.recv().await.is_ok());
        assert!(manager.is_shutdown().await);
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let manager = ShutdownManager::new();
        manager.shutdown().await;
        manager.shutdown().await;
        assert!(manager.is_shutdown().await);
    }

    #[tokio::test]
    async fn test_subscribe_after_shutdown_fires_immediately() {
        let manager = ShutdownManager::new();
        manager.shutdown().await;

        let mut rx = manager.subscribe().await;
        assert!(rx.recv().await.is_ok());
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let manager = ShutdownManager::new();
        let clone = manager.clone();
        let mut rx = manager.subscribe().await;

        clone.shutdown().await;
        assert!(rx.recv().await.is_ok());
        assert!(manager.is_shutdown().await);
    }

    #[tokio::test]
    async fn test_wait_with_timeout() {
        let manager = ShutdownManager::new();
        assert!(manager.wait_with_timeout(async {}, Duration::from_millis(100)).await);
        assert!(
            !manager
                .wait_with_timeout(tokio::time::sleep(Duration::from_secs(5)), Duration::from_millis(20))
                .await
        );
    }
}
