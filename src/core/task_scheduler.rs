//! 后台任务调度：心跳驱动的定时任务执行
//!
//! 每次心跳（tick）：
//! 1. 按时间推进 scheduled -> pending / outdated
//! 2. 没有等待中的任务：发一次 Idle 后返回
//! 3. 调度器自身忙（上一个任务未结束）或对话忙：跳过
//! 4. 选一个候选（outdated 优先），标记 running 并异步执行；结束后标记 accomplished
//!
//! 心跳是 sleep 循环，tick 本身同步返回，因此两次 tick 不会重叠。

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::FutureExt;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::tasks::{now_millis, ScheduledTask, TaskBook, TaskId, TaskResult, TaskResultKind};
use crate::core::{BusySignal, CompanionError};

pub const MIN_HEARTBEAT: Duration = Duration::from_secs(1);
pub const MAX_HEARTBEAT: Duration = Duration::from_secs(3600);
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_millis(5000);

/// 心跳间隔限制到 [1s, 1h]
pub fn clamp_heartbeat(ms: u64) -> Duration {
    Duration::from_millis(ms).clamp(MIN_HEARTBEAT, MAX_HEARTBEAT)
}

/// 过期任务的时间信息
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutdatedTiming {
    pub scheduled_at: i64,
    pub outdated_at: i64,
}

/// 任务执行方（通常是对话编排器）
#[async_trait]
pub trait AgentActionInvoker: Send + Sync {
    async fn execute(&self, content: &str) -> Result<(), CompanionError>;
    async fn on_outdated(&self, content: &str, timing: OutdatedTiming) -> Result<(), CompanionError>;
}

/// 调度器事件
#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerEvent {
    TaskStarted { id: TaskId },
    TaskFinished { id: TaskId, result: TaskResult },
    /// 没有待执行任务（每段空闲期只发一次）
    Idle,
}

/// 单次 tick 的结论
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    Idle,
    /// 上一个任务尚未结束
    SchedulerBusy,
    ConversationBusy,
    /// 有等待任务但都还没到点
    NothingDue,
    Started(TaskId),
}

pub struct TaskScheduler {
    book: Arc<TaskBook>,
    invoker: Arc<dyn AgentActionInvoker>,
    conversation: Arc<dyn BusySignal>,
    interval: Duration,
    busy: Arc<AtomicBool>,
    idle_emitted: AtomicBool,
    heartbeat_running: AtomicBool,
    events: broadcast::Sender<SchedulerEvent>,
}

impl TaskScheduler {
    pub fn new(
        book: Arc<TaskBook>,
        invoker: Arc<dyn AgentActionInvoker>,
        conversation: Arc<dyn BusySignal>,
        interval: Duration,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            book,
            invoker,
            conversation,
            interval: interval.clamp(MIN_HEARTBEAT, MAX_HEARTBEAT),
            busy: Arc::new(AtomicBool::new(false)),
            idle_emitted: AtomicBool::new(false),
            heartbeat_running: AtomicBool::new(false),
            events,
        }
    }

    pub fn book(&self) -> &Arc<TaskBook> {
        &self.book
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.events.subscribe()
    }

    pub fn tick(&self) -> TickOutcome {
        self.tick_at(now_millis())
    }

    pub fn tick_at(&self, now: i64) -> TickOutcome {
        self.book.advance(now);

        if !self.book.has_waiting() {
            if !self.idle_emitted.swap(true, Ordering::SeqCst) {
                tracing::info!("Scheduler idle, no pending tasks");
                let _ = self.events.send(SchedulerEvent::Idle);
            }
            return TickOutcome::Idle;
        }
        self.idle_emitted.store(false, Ordering::SeqCst);

        if self.busy.load(Ordering::SeqCst) {
            tracing::debug!("Scheduler busy, skip this tick");
            return TickOutcome::SchedulerBusy;
        }
        if self.conversation.is_busy() {
            tracing::debug!("Conversation busy, skip this tick");
            return TickOutcome::ConversationBusy;
        }

        let Some(candidate) = self.book.pick_one() else {
            return TickOutcome::NothingDue;
        };
        let Some(task) = self.book.mark_running(&candidate.id, now) else {
            return TickOutcome::NothingDue;
        };

        self.busy.store(true, Ordering::SeqCst);
        tracing::info!(id = %task.id, scheduled_at = task.scheduled_at, outdated_at = ?task.outdated_at, "Run start");
        let _ = self.events.send(SchedulerEvent::TaskStarted { id: task.id.clone() });
        let id = task.id.clone();
        self.run_task(task);
        TickOutcome::Started(id)
    }

    fn run_task(&self, task: ScheduledTask) {
        let book = Arc::clone(&self.book);
        let invoker = Arc::clone(&self.invoker);
        let busy = Arc::clone(&self.busy);
        let events = self.events.clone();

        tokio::spawn(async move {
            let outdated = task.is_expired_at(now_millis());
            let kind = if outdated {
                TaskResultKind::Outdated
            } else {
                TaskResultKind::Executed
            };
            let run = async {
                match (outdated, task.outdated_at) {
                    (true, Some(outdated_at)) => {
                        let timing = OutdatedTiming {
                            scheduled_at: task.scheduled_at,
                            outdated_at,
                        };
                        invoker.on_outdated(&task.content, timing).await
                    }
                    _ => invoker.execute(&task.content).await,
                }
            };
            // 执行方 panic 也要落到 accomplished
            let error = match AssertUnwindSafe(run).catch_unwind().await {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e.to_string()),
                Err(_) => Some(CompanionError::SchedulerExecution("task panicked".into()).to_string()),
            };
            let started = task.started_at.unwrap_or_default();
            let result = TaskResult { kind, error };
            book.settle(&task.id, result.clone(), now_millis());
            busy.store(false, Ordering::SeqCst);
            tracing::info!(
                id = %task.id,
                kind = ?result.kind,
                error = ?result.error,
                duration_ms = now_millis() - started,
                "Run finish"
            );
            let _ = events.send(SchedulerEvent::TaskFinished { id: task.id, result });
        });
    }

    /// 启动心跳循环；重复启动无效
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> Option<JoinHandle<()>> {
        if self.heartbeat_running.swap(true, Ordering::SeqCst) {
            tracing::warn!("Heartbeat already running");
            return None;
        }
        Some(tokio::spawn(async move {
            tracing::info!(interval_ms = self.interval.as_millis() as u64, "Heartbeat started");
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.interval) => {}
                }
                self.tick();
            }
            self.heartbeat_running.store(false, Ordering::SeqCst);
            tracing::info!("Heartbeat stopped");
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use crate::core::tasks::TaskStatus;

    #[derive(Default)]
    struct RecordingInvoker {
        executed: Mutex<Vec<String>>,
        outdated: Mutex<Vec<(String, OutdatedTiming)>>,
        delay: Duration,
        fail: bool,
    }

    #[async_trait]
    impl AgentActionInvoker for RecordingInvoker {
        async fn execute(&self, content: &str) -> Result<(), CompanionError> {
            tokio::time::sleep(self.delay).await;
            self.executed.lock().unwrap().push(content.to_string());
            if self.fail {
                return Err(CompanionError::SchedulerExecution("model offline".into()));
            }
            Ok(())
        }

        async fn on_outdated(&self, content: &str, timing: OutdatedTiming) -> Result<(), CompanionError> {
            self.outdated.lock().unwrap().push((content.to_string(), timing));
            Ok(())
        }
    }

    struct PanickingInvoker;

    #[async_trait]
    impl AgentActionInvoker for PanickingInvoker {
        async fn execute(&self, _content: &str) -> Result<(), CompanionError> {
            panic!("invoker blew up");
        }

        async fn on_outdated(&self, _content: &str, _timing: OutdatedTiming) -> Result<(), CompanionError> {
            Ok(())
        }
    }

    struct FlagBusy(AtomicBool);

    impl BusySignal for FlagBusy {
        fn is_busy(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    fn scheduler(invoker: Arc<dyn AgentActionInvoker>) -> (TaskScheduler, Arc<FlagBusy>) {
        let busy = Arc::new(FlagBusy(AtomicBool::new(false)));
        let s = TaskScheduler::new(
            Arc::new(TaskBook::in_memory()),
            invoker,
            busy.clone(),
            DEFAULT_HEARTBEAT,
        );
        (s, busy)
    }

    async fn next_finished(rx: &mut broadcast::Receiver<SchedulerEvent>) -> (TaskId, TaskResult) {
        loop {
            if let SchedulerEvent::TaskFinished { id, result } = rx.recv().await.unwrap() {
                return (id, result);
            }
        }
    }

    #[test]
    fn test_clamp_heartbeat() {
        assert_eq!(clamp_heartbeat(10), Duration::from_secs(1));
        assert_eq!(clamp_heartbeat(5000), Duration::from_secs(5));
        assert_eq!(clamp_heartbeat(u64::MAX), Duration::from_secs(3600));
    }

    #[tokio::test]
    async fn test_due_task_runs_to_accomplished() {
        let invoker = Arc::new(RecordingInvoker::default());
        let (s, _) = scheduler(invoker.clone());
        let mut rx = s.subscribe();
        let id = s.book().add_schedule(0, "打个招呼", None);

        assert_eq!(s.tick(), TickOutcome::Started(id.clone()));
        assert_eq!(s.book().get(&id).unwrap().status, TaskStatus::Running);

        let (done, result) = next_finished(&mut rx).await;
        assert_eq!(done, id);
        assert_eq!(result.kind, TaskResultKind::Executed);
        let task = s.book().get(&id).unwrap();
        assert_eq!(task.status, TaskStatus::Accomplished);
        assert!(task.finished_at.unwrap() > task.started_at.unwrap());
        assert_eq!(*invoker.executed.lock().unwrap(), vec!["打个招呼".to_string()]);
        assert!(!s.is_busy());
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_second_task_while_first_unresolved() {
        let invoker = Arc::new(RecordingInvoker {
            delay: Duration::from_secs(30),
            ..Default::default()
        });
        let (s, _) = scheduler(invoker.clone());
        let mut rx = s.subscribe();
        let first = s.book().add_schedule(0, "first", None);
        let second = s.book().add_schedule(0, "second", None);

        assert!(matches!(s.tick(), TickOutcome::Started(_)));
        assert_eq!(s.tick(), TickOutcome::SchedulerBusy);
        assert_eq!(s.book().get(&second).unwrap().status, TaskStatus::Pending);

        let (done, _) = next_finished(&mut rx).await;
        assert_eq!(done, first);
        assert_eq!(s.tick(), TickOutcome::Started(second));
    }

    #[tokio::test]
    async fn test_conversation_busy_skips_tick() {
        let (s, busy) = scheduler(Arc::new(RecordingInvoker::default()));
        let id = s.book().add_schedule(0, "wait for me", None);
        busy.0.store(true, Ordering::SeqCst);

        assert_eq!(s.tick(), TickOutcome::ConversationBusy);
        assert_eq!(s.book().get(&id).unwrap().status, TaskStatus::Pending);

        busy.0.store(false, Ordering::SeqCst);
        assert_eq!(s.tick(), TickOutcome::Started(id));
    }

    #[tokio::test]
    async fn test_idle_emitted_once_per_idle_period() {
        let (s, _) = scheduler(Arc::new(RecordingInvoker::default()));
        let mut rx = s.subscribe();
        assert_eq!(s.tick(), TickOutcome::Idle);
        assert_eq!(s.tick(), TickOutcome::Idle);
        assert_eq!(rx.try_recv().unwrap(), SchedulerEvent::Idle);
        assert!(rx.try_recv().is_err());

        s.book().add_schedule(60_000, "later", None);
        assert_eq!(s.tick(), TickOutcome::NothingDue);
        s.book().tasks().iter().for_each(|t| {
            s.book().delete_schedule(&t.id);
        });
        assert_eq!(s.tick(), TickOutcome::Idle);
        assert_eq!(rx.try_recv().unwrap(), SchedulerEvent::Idle);
    }

    #[tokio::test]
    async fn test_outdated_task_routes_to_on_outdated() {
        let invoker = Arc::new(RecordingInvoker::default());
        let (s, _) = scheduler(invoker.clone());
        let mut rx = s.subscribe();
        let now = now_millis();
        let id = s.book().add_schedule_at(now - 10_000, 0, "过期提醒", Some(1_000));

        assert_eq!(s.tick_at(now), TickOutcome::Started(id.clone()));
        let (_, result) = next_finished(&mut rx).await;
        assert_eq!(result.kind, TaskResultKind::Outdated);

        let calls = invoker.outdated.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "过期提醒");
        assert_eq!(calls[0].1.outdated_at, now - 9_000);
        assert!(invoker.executed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_execution_error_is_recorded_not_raised() {
        let invoker = Arc::new(RecordingInvoker {
            fail: true,
            ..Default::default()
        });
        let (s, _) = scheduler(invoker);
        let mut rx = s.subscribe();
        let id = s.book().add_schedule(0, "fails", None);
        s.tick();
        let (_, result) = next_finished(&mut rx).await;
        assert!(result.error.unwrap().contains("model offline"));
        assert_eq!(s.book().get(&id).unwrap().status, TaskStatus::Accomplished);
    }

    #[tokio::test]
    async fn test_panicking_invoker_still_settles() {
        let (s, _) = scheduler(Arc::new(PanickingInvoker));
        let mut rx = s.subscribe();
        let id = s.book().add_schedule(0, "boom", None);
        s.tick();
        let (_, result) = next_finished(&mut rx).await;
        assert!(result.error.is_some());
        assert_eq!(s.book().get(&id).unwrap().status, TaskStatus::Accomplished);
        assert!(!s.is_busy());
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_loop_picks_up_due_task() {
        let invoker = Arc::new(RecordingInvoker::default());
        let (s, _) = scheduler(invoker.clone());
        let s = Arc::new(s);
        let mut rx = s.subscribe();
        s.book().add_schedule(0, "beat", None);

        let cancel = CancellationToken::new();
        let handle = Arc::clone(&s).spawn(cancel.clone()).unwrap();
        assert!(Arc::clone(&s).spawn(cancel.clone()).is_none());

        next_finished(&mut rx).await;
        assert_eq!(*invoker.executed.lock().unwrap(), vec!["beat".to_string()]);
        cancel.cancel();
        handle.await.unwrap();
    }
}
