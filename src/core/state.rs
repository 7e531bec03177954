//! 会话流状态：是否在流式接收、是否有工具在执行、最近活动时间
//!
//! 编排器写 streaming / tooling，播放队列在展示与开始播音时刷新活动时间；
//! 播放队列、空闲看门狗与后台调度器只读这些标志。

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;

/// 对外只读快照
#[derive(Debug, Clone, Copy)]
pub struct StreamState {
    pub is_streaming: bool,
    pub is_tooling: bool,
    pub last_activity_at: Instant,
}

/// 会话是否忙碌（流式中、正在展示、或队列非空）；调度器据此跳过心跳
pub trait BusySignal: Send + Sync {
    fn is_busy(&self) -> bool;
}

#[derive(Debug)]
pub struct ConversationState {
    streaming: AtomicBool,
    tooling: AtomicUsize,
    /// 超时发生在流式期间：等流结束再清空
    clear_after_stream: AtomicBool,
    last_activity: Mutex<Instant>,
}

impl ConversationState {
    pub fn new() -> Self {
        Self {
            streaming: AtomicBool::new(false),
            tooling: AtomicUsize::new(0),
            clear_after_stream: AtomicBool::new(false),
            last_activity: Mutex::new(Instant::now()),
        }
    }

    pub fn begin_stream(&self) {
        self.streaming.store(true, Ordering::SeqCst);
        self.clear_after_stream.store(false, Ordering::SeqCst);
        self.touch();
    }

    /// 结束流式；返回是否有被推迟的空闲清空需要立即执行
    pub fn end_stream(&self) -> bool {
        self.streaming.store(false, Ordering::SeqCst);
        self.clear_after_stream.swap(false, Ordering::SeqCst)
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming.load(Ordering::SeqCst)
    }

    pub fn request_clear_after_stream(&self) {
        self.clear_after_stream.store(true, Ordering::SeqCst);
    }

    pub fn clear_pending(&self) -> bool {
        self.clear_after_stream.load(Ordering::SeqCst)
    }

    /// 工具开始执行；返回的 guard 释放时计数减一
    pub fn tool_started(self: &Arc<Self>) -> ToolingGuard {
        self.tooling.fetch_add(1, Ordering::SeqCst);
        ToolingGuard {
            state: Arc::clone(self),
        }
    }

    pub fn is_tooling(&self) -> bool {
        self.tooling.load(Ordering::SeqCst) > 0
    }

    pub fn touch(&self) {
        let mut last = self.last_activity.lock().unwrap_or_else(|e| e.into_inner());
        *last = Instant::now();
    }

    pub fn last_activity(&self) -> Instant {
        *self.last_activity.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn idle_for(&self) -> Duration {
        Instant::now().saturating_duration_since(self.last_activity())
    }

    pub fn snapshot(&self) -> StreamState {
        StreamState {
            is_streaming: self.is_streaming(),
            is_tooling: self.is_tooling(),
            last_activity_at: self.last_activity(),
        }
    }
}

impl Default for ConversationState {
    fn default() -> Self {
        Self::new()
    }
}

/// 在途工具计数守卫
#[derive(Debug)]
pub struct ToolingGuard {
    state: Arc<ConversationState>,
}

impl Drop for ToolingGuard {
    fn drop(&mut self) {
        self.state.tooling.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tooling_guard_counts_in_flight_calls() {
        let state = Arc::new(ConversationState::new());
        let a = state.tool_started();
        let b = state.tool_started();
        assert!(state.is_tooling());
        drop(a);
        assert!(state.is_tooling());
        drop(b);
        assert!(!state.is_tooling());
    }

    #[test]
    fn test_deferred_clear_fires_once_at_stream_end() {
        let state = ConversationState::new();
        state.begin_stream();
        state.request_clear_after_stream();
        assert!(state.clear_pending());
        assert!(state.end_stream());
        assert!(!state.end_stream());
        assert!(!state.is_streaming());
    }

    #[test]
    fn test_begin_stream_discards_stale_clear_request() {
        let state = ConversationState::new();
        state.request_clear_after_stream();
        state.begin_stream();
        assert!(!state.end_stream());
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_reports_flags_and_last_activity() {
        let state = Arc::new(ConversationState::new());
        state.begin_stream();
        let started = state.last_activity();
        let guard = state.tool_started();
        tokio::time::sleep(Duration::from_secs(3)).await;

        let snap = state.snapshot();
        assert!(snap.is_streaming);
        assert!(snap.is_tooling);
        assert_eq!(snap.last_activity_at, started);
        assert_eq!(state.idle_for(), Duration::from_secs(3));

        drop(guard);
        state.end_stream();
        state.touch();
        let snap = state.snapshot();
        assert!(!snap.is_streaming && !snap.is_tooling);
        assert!(snap.last_activity_at > started);
    }
}
