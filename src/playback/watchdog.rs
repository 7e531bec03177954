//! 空闲看门狗：长时间无活动时把舞台清回空闲
//!
//! 工具执行中或音频播放中不算空闲；流式期间超时只打标记，等流结束再清空。

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::ConversationState;
use crate::playback::PlaybackQueue;

pub const MIN_INACTIVITY_TIMEOUT: Duration = Duration::from_secs(15);
pub const MAX_INACTIVITY_TIMEOUT: Duration = Duration::from_secs(300);

/// 将超时秒数限制到 [15, 300]
pub fn clamp_timeout(secs: u64) -> Duration {
    Duration::from_secs(secs).clamp(MIN_INACTIVITY_TIMEOUT, MAX_INACTIVITY_TIMEOUT)
}

/// 一次检查的结论
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogCheck {
    /// 未到阈值
    Active,
    /// 工具或音频在进行，推迟
    Deferred,
    /// 流式中，等流结束清空
    ClearAfterStream,
    Cleared,
}

pub struct InactivityWatchdog {
    queue: PlaybackQueue,
    state: Arc<ConversationState>,
    timeout: Duration,
}

impl InactivityWatchdog {
    pub fn new(queue: PlaybackQueue, timeout: Duration) -> Self {
        let state = Arc::clone(queue.state());
        Self {
            queue,
            state,
            timeout: timeout.clamp(MIN_INACTIVITY_TIMEOUT, MAX_INACTIVITY_TIMEOUT),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn check(&self) -> WatchdogCheck {
        if self.state.idle_for() < self.timeout {
            return WatchdogCheck::Active;
        }
        if self.state.is_tooling() || self.queue.is_audio_playing() {
            return WatchdogCheck::Deferred;
        }
        if self.state.is_streaming() {
            self.state.request_clear_after_stream();
            return WatchdogCheck::ClearAfterStream;
        }
        self.queue.stop_to_idle();
        WatchdogCheck::Cleared
    }

    /// 单次定时器循环：每次检查后按剩余空闲时间重新计时
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!(timeout_secs = self.timeout.as_secs(), "Inactivity watchdog started");
            loop {
                let idle = self.state.idle_for();
                let wait = if idle < self.timeout {
                    self.timeout - idle
                } else {
                    self.timeout
                };
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(wait) => {}
                }
                match self.check() {
                    WatchdogCheck::Active => {}
                    WatchdogCheck::Deferred => tracing::debug!("Inactivity check deferred"),
                    WatchdogCheck::ClearAfterStream => {
                        tracing::info!("Inactivity timeout during stream, clearing after it ends")
                    }
                    WatchdogCheck::Cleared => tracing::info!("Inactivity timeout, stage reset to idle"),
                }
            }
            tracing::info!("Inactivity watchdog stopped");
        })
    }
}
