use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// 优雅关闭管理器
///
/// 所有工作循环共享同一个取消令牌，触发关闭后各循环在当前一轮结束后退出。
#[derive(Clone, Default)]
pub struct ShutdownManager {
    token: CancellationToken,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// 分发给工作循环的令牌
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// 触发关闭，重复触发无副作用
    pub fn shutdown(&self) {
        if self.token.is_cancelled() {
            debug!("关闭管理器已经触发过关闭");
            return;
        }

        info!("触发系统关闭");
        self.token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn wait_for_shutdown(&self) {
        self.token.cancelled().await;
    }
}

/// 等待 Ctrl+C 或 SIGTERM
pub async fn wait_for_shutdown_signal() -> Result<()> {
    let ctrl_c = async { tokio::signal::ctrl_c().await.context("安装Ctrl+C信号处理器失败") };

    #[cfg(unix)]
    {
        let mut terminate =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .context("安装SIGTERM信号处理器失败")?;

        tokio::select! {
            result = ctrl_c => {
                result?;
                info!("收到Ctrl+C信号");
            }
            _ = terminate.recv() => {
                info!("收到SIGTERM信号");
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await?;
        info!("收到Ctrl+C信号");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_shutdown_cancels_all_clones() {
        let manager = ShutdownManager::new();
        let token = manager.token();
        let clone = manager.clone();

        assert!(!manager.is_shutdown());
        clone.shutdown();
        clone.shutdown();

        assert!(manager.is_shutdown());
        assert!(token.is_cancelled());
        tokio::time::timeout(Duration::from_secs(1), manager.wait_for_shutdown())
            .await
            .unwrap();
    }
}
