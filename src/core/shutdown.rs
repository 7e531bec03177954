//! 退出流程
//!
//! Ctrl+C、SIGTERM、`/quit` 或 stdin 关闭都汇到同一个 CancellationToken：
//! 心跳与空闲看门狗随之退出，随后按顺序执行退出清理（停音频清舞台、写任务快照）。

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::core::TaskBook;
use crate::playback::PlaybackQueue;

/// 退出原因（只记录第一次）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Ctrl+C 或 /quit
    UserInitiated,
    /// SIGTERM
    Signal,
    /// stdin 已关闭
    InputClosed,
}

/// 退出信号
#[derive(Default)]
pub struct ShutdownManager {
    token: CancellationToken,
    reason: Mutex<Option<ShutdownReason>>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// 后台循环共用的取消 token
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn shutdown(&self, reason: ShutdownReason) {
        let mut slot = self.reason.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_none() {
            tracing::info!(?reason, "Shutting down");
            *slot = Some(reason);
        }
        self.token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn reason(&self) -> Option<ShutdownReason> {
        *self.reason.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub async fn wait_for_shutdown(&self) {
        self.token.cancelled().await;
    }

    /// Ctrl+C 与 SIGTERM（unix）都触发退出
    pub fn install_signal_handlers(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                manager.shutdown(ShutdownReason::UserInitiated);
            }
        });

        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                match signal(SignalKind::terminate()) {
                    Ok(mut term) => {
                        term.recv().await;
                        manager.shutdown(ShutdownReason::Signal);
                    }
                    Err(e) => tracing::warn!("SIGTERM handler not installed: {}", e),
                }
            });
        }
    }
}

/// 一项退出清理
#[async_trait::async_trait]
pub trait ShutdownCleanup: Send + Sync {
    async fn cleanup(&self) -> anyhow::Result<()>;

    fn name(&self) -> &'static str;
}

/// 清理结果统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub completed: usize,
    pub failed: usize,
}

/// 按注册顺序执行清理；单项失败或超时不影响后续
pub struct ShutdownCoordinator {
    steps: Vec<Box<dyn ShutdownCleanup>>,
    step_timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            steps: Vec::new(),
            step_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = timeout;
        self
    }

    pub fn register(&mut self, step: impl ShutdownCleanup + 'static) {
        self.steps.push(Box::new(step));
    }

    pub async fn run_cleanup(&self) -> CleanupReport {
        let mut report = CleanupReport::default();
        for step in &self.steps {
            match tokio::time::timeout(self.step_timeout, step.cleanup()).await {
                Ok(Ok(())) => {
                    report.completed += 1;
                    tracing::debug!(step = step.name(), "Cleanup done");
                }
                Ok(Err(e)) => {
                    report.failed += 1;
                    tracing::warn!(step = step.name(), "Cleanup failed: {}", e);
                }
                Err(_) => {
                    report.failed += 1;
                    tracing::warn!(step = step.name(), timeout_ms = self.step_timeout.as_millis() as u64, "Cleanup timed out");
                }
            }
        }
        tracing::info!(completed = report.completed, failed = report.failed, "Shutdown cleanup finished");
        report
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// 写最后一次任务快照
pub struct TaskBookCleanup(pub Arc<TaskBook>);

#[async_trait::async_trait]
impl ShutdownCleanup for TaskBookCleanup {
    async fn cleanup(&self) -> anyhow::Result<()> {
        self.0.flush()?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "task-book"
    }
}

/// 停止音频并回到空闲
pub struct StageCleanup(pub PlaybackQueue);

#[async_trait::async_trait]
impl ShutdownCleanup for StageCleanup {
    async fn cleanup(&self) -> anyhow::Result<()> {
        self.0.stop_to_idle();
        Ok(())
    }

    fn name(&self) -> &'static str {
        "stage"
    }
}
