//! 定时任务簿：任务状态机与 JSON 快照持久化
//!
//! 状态流转：
//! - scheduled --(到达 scheduled_at)--> pending
//! - scheduled / pending --(到达 outdated_at)--> outdated
//! - pending / outdated --(心跳选中)--> running
//! - running --(执行结束，无论成败)--> accomplished（终态）
//! - scheduled / pending / outdated --(取消)--> canceled（终态；running 不可取消）
//!
//! 删除与状态无关，是独立操作。每次变更后写一次快照，重启时用 `rehydrate` 恢复悬挂的 running。

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use crate::core::CompanionError;

/// 任务 ID
pub type TaskId = String;

/// 任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Scheduled,
    Pending,
    Running,
    Outdated,
    Accomplished,
    Canceled,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 6] = [
        TaskStatus::Scheduled,
        TaskStatus::Pending,
        TaskStatus::Running,
        TaskStatus::Outdated,
        TaskStatus::Accomplished,
        TaskStatus::Canceled,
    ];

    /// 还在等待执行（心跳关心的状态）
    pub fn is_waiting(self) -> bool {
        matches!(self, Self::Scheduled | Self::Pending | Self::Outdated)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Accomplished | Self::Canceled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Outdated => "outdated",
            Self::Accomplished => "accomplished",
            Self::Canceled => "canceled",
        }
    }
}

/// 结果类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskResultKind {
    Executed,
    Outdated,
    Canceled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskResult {
    pub kind: TaskResultKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// 定时任务（时间均为毫秒时间戳）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledTask {
    pub id: TaskId,
    pub content: String,
    pub scheduled_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outdated_at: Option<i64>,
    pub created_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<i64>,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<TaskResult>,
}

impl ScheduledTask {
    pub fn is_expired_at(&self, now: i64) -> bool {
        self.outdated_at.is_some_and(|at| at <= now)
    }
}

/// 各状态计数
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TaskStats {
    pub counts: BTreeMap<TaskStatus, usize>,
    pub total: usize,
}

impl TaskStats {
    pub fn count(&self, status: TaskStatus) -> usize {
        self.counts.get(&status).copied().unwrap_or(0)
    }
}

/// 心跳推进一轮的结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Advanced {
    pub to_pending: Vec<TaskId>,
    pub to_outdated: Vec<TaskId>,
}

impl Advanced {
    pub fn is_empty(&self) -> bool {
        self.to_pending.is_empty() && self.to_outdated.is_empty()
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct TaskSnapshot {
    #[serde(default = "default_snapshot_version")]
    version: u32,
    #[serde(default)]
    tasks: Vec<ScheduledTask>,
}

fn default_snapshot_version() -> u32 {
    1
}

pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn gen_id() -> TaskId {
    format!("task_{}", uuid::Uuid::new_v4().simple())
}

/// 任务簿：唯一的任务状态持有者
pub struct TaskBook {
    tasks: Mutex<Vec<ScheduledTask>>,
    state_path: Option<PathBuf>,
}

impl TaskBook {
    /// 纯内存任务簿
    pub fn in_memory() -> Self {
        Self {
            tasks: Mutex::new(Vec::new()),
            state_path: None,
        }
    }

    /// 从快照文件加载；文件不存在时为空
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, CompanionError> {
        let path = path.into();
        let tasks = load_snapshot(&path)?;
        tracing::info!(path = %path.display(), count = tasks.len(), "Task book loaded");
        Ok(Self {
            tasks: Mutex::new(tasks),
            state_path: Some(path),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Vec<ScheduledTask>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 立即写一次快照（退出时调用）；纯内存任务簿直接返回
    pub fn flush(&self) -> Result<(), CompanionError> {
        match &self.state_path {
            Some(path) => save_snapshot(path, &self.lock()),
            None => Ok(()),
        }
    }

    fn persist(&self, tasks: &[ScheduledTask]) {
        let Some(path) = &self.state_path else {
            return;
        };
        if let Err(e) = save_snapshot(path, tasks) {
            tracing::warn!("Failed to save task snapshot: {}", e);
        }
    }

    /// 新增任务：`delay_ms` 后变为 pending；`outdated_in_ms` 为到期后的宽限时长
    pub fn add_schedule(&self, delay_ms: i64, content: impl Into<String>, outdated_in_ms: Option<i64>) -> TaskId {
        self.add_schedule_at(now_millis(), delay_ms, content, outdated_in_ms)
    }

    pub fn add_schedule_at(
        &self,
        now: i64,
        delay_ms: i64,
        content: impl Into<String>,
        outdated_in_ms: Option<i64>,
    ) -> TaskId {
        let scheduled_at = now + delay_ms.max(0);
        let task = ScheduledTask {
            id: gen_id(),
            content: content.into(),
            scheduled_at,
            outdated_at: outdated_in_ms.map(|ms| scheduled_at + ms.max(0)),
            created_at: now,
            started_at: None,
            finished_at: None,
            status: TaskStatus::Scheduled,
            result: None,
        };
        let id = task.id.clone();
        tracing::info!(id = %id, scheduled_at, outdated_at = ?task.outdated_at, "Schedule added");

        let mut tasks = self.lock();
        tasks.push(task);
        self.persist(&tasks);
        id
    }

    /// 取消：仅对 scheduled / pending / outdated 生效；返回是否发生了取消
    pub fn cancel_schedule(&self, id: &str) -> bool {
        self.cancel_schedule_at(now_millis(), id)
    }

    pub fn cancel_schedule_at(&self, now: i64, id: &str) -> bool {
        let mut tasks = self.lock();
        let Some(task) = tasks.iter_mut().find(|t| t.id == id) else {
            return false;
        };
        if !task.status.is_waiting() {
            tracing::debug!(id, status = task.status.as_str(), "Cancel ignored");
            return false;
        }
        task.status = TaskStatus::Canceled;
        task.finished_at = Some(now);
        task.result = Some(TaskResult {
            kind: TaskResultKind::Canceled,
            error: None,
        });
        tracing::info!(id, "Schedule canceled");
        self.persist(&tasks);
        true
    }

    /// 删除（不论状态）；返回是否存在
    pub fn delete_schedule(&self, id: &str) -> bool {
        let mut tasks = self.lock();
        let before = tasks.len();
        tasks.retain(|t| t.id != id);
        let removed = tasks.len() != before;
        if removed {
            tracing::info!(id, "Schedule deleted");
            self.persist(&tasks);
        }
        removed
    }

    pub fn get(&self, id: &str) -> Option<ScheduledTask> {
        self.lock().iter().find(|t| t.id == id).cloned()
    }

    pub fn tasks(&self) -> Vec<ScheduledTask> {
        self.lock().clone()
    }

    pub fn stats(&self) -> TaskStats {
        let tasks = self.lock();
        let mut counts: BTreeMap<TaskStatus, usize> = TaskStatus::ALL.iter().map(|s| (*s, 0)).collect();
        for t in tasks.iter() {
            *counts.entry(t.status).or_default() += 1;
        }
        TaskStats {
            counts,
            total: tasks.len(),
        }
    }

    /// 重启恢复：没有 finished_at 的 running 退回 outdated（已过期）或 pending
    pub fn rehydrate(&self) -> usize {
        self.rehydrate_at(now_millis())
    }

    pub fn rehydrate_at(&self, now: i64) -> usize {
        let mut tasks = self.lock();
        let mut recovered = 0;
        for t in tasks.iter_mut() {
            if t.status == TaskStatus::Running && t.finished_at.is_none() {
                t.status = if t.is_expired_at(now) {
                    TaskStatus::Outdated
                } else {
                    TaskStatus::Pending
                };
                t.started_at = None;
                recovered += 1;
            }
        }
        if recovered > 0 {
            tracing::info!(recovered, "Rehydrated interrupted tasks");
            self.persist(&tasks);
        }
        recovered
    }

    /// 按时间推进 scheduled -> pending 与 -> outdated
    pub fn advance(&self, now: i64) -> Advanced {
        let mut tasks = self.lock();
        let mut out = Advanced::default();
        for t in tasks.iter_mut() {
            if t.status == TaskStatus::Scheduled && t.scheduled_at <= now {
                t.status = TaskStatus::Pending;
                out.to_pending.push(t.id.clone());
            }
            if matches!(t.status, TaskStatus::Scheduled | TaskStatus::Pending) && t.is_expired_at(now) {
                t.status = TaskStatus::Outdated;
                out.to_outdated.push(t.id.clone());
            }
        }
        if !out.is_empty() {
            tracing::debug!(pending = ?out.to_pending, outdated = ?out.to_outdated, "Tasks advanced");
            self.persist(&tasks);
        }
        out
    }

    /// 是否还有等待执行的任务
    pub fn has_waiting(&self) -> bool {
        self.lock().iter().any(|t| t.status.is_waiting())
    }

    /// 选一个候选：优先 outdated（outdated_at 升序），否则 pending（scheduled_at 升序）
    pub fn pick_one(&self) -> Option<ScheduledTask> {
        let tasks = self.lock();
        tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Outdated)
            .min_by_key(|t| t.outdated_at.unwrap_or(i64::MAX))
            .or_else(|| {
                tasks
                    .iter()
                    .filter(|t| t.status == TaskStatus::Pending)
                    .min_by_key(|t| t.scheduled_at)
            })
            .cloned()
    }

    /// pending / outdated -> running
    pub fn mark_running(&self, id: &str, now: i64) -> Option<ScheduledTask> {
        let mut tasks = self.lock();
        let task = tasks
            .iter_mut()
            .find(|t| t.id == id && matches!(t.status, TaskStatus::Pending | TaskStatus::Outdated))?;
        task.status = TaskStatus::Running;
        task.started_at = Some(now);
        let started = task.clone();
        self.persist(&tasks);
        Some(started)
    }

    /// running -> accomplished，记录结果
    pub fn settle(&self, id: &str, result: TaskResult, now: i64) {
        let mut tasks = self.lock();
        let Some(task) = tasks
            .iter_mut()
            .find(|t| t.id == id && t.status == TaskStatus::Running)
        else {
            tracing::debug!(id, "Settled task no longer running, result dropped");
            return;
        };
        // 同一毫秒内结束时保证 finished_at > started_at
        let finished = match task.started_at {
            Some(started) if now <= started => started + 1,
            _ => now,
        };
        task.status = TaskStatus::Accomplished;
        task.finished_at = Some(finished);
        task.result = Some(result);
        self.persist(&tasks);
    }
}

fn load_snapshot(path: &Path) -> Result<Vec<ScheduledTask>, CompanionError> {
    let bytes = match std::fs::read(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(CompanionError::Persistence(format!("cannot read task snapshot: {e}"))),
    };
    let snapshot: TaskSnapshot = serde_json::from_slice(&bytes)
        .map_err(|e| CompanionError::Persistence(format!("cannot parse task snapshot: {e}")))?;
    Ok(snapshot.tasks)
}

fn save_snapshot(path: &Path, tasks: &[ScheduledTask]) -> Result<(), CompanionError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| CompanionError::Persistence(format!("cannot create state dir: {e}")))?;
    }
    let snapshot = TaskSnapshot {
        version: default_snapshot_version(),
        tasks: tasks.to_vec(),
    };
    let json = serde_json::to_string_pretty(&snapshot)
        .map_err(|e| CompanionError::Persistence(format!("cannot serialize task snapshot: {e}")))?;
    std::fs::write(path, json).map_err(|e| CompanionError::Persistence(format!("cannot write task snapshot: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    const T0: i64 = 1_700_000_000_000;

    #[test]
    fn test_add_schedule_computes_deadlines() {
        let book = TaskBook::in_memory();
        let id = book.add_schedule_at(T0, 5_000, "提醒喝水", Some(60_000));
        let task = book.get(&id).unwrap();
        assert_eq!(task.status, TaskStatus::Scheduled);
        assert_eq!(task.scheduled_at, T0 + 5_000);
        assert_eq!(task.outdated_at, Some(T0 + 65_000));

        let id = book.add_schedule_at(T0, -30, "立刻", None);
        assert_eq!(book.get(&id).unwrap().scheduled_at, T0);
    }

    #[test]
    fn test_advance_moves_by_timestamp() {
        let book = TaskBook::in_memory();
        let a = book.add_schedule_at(T0, 1_000, "a", None);
        let b = book.add_schedule_at(T0, 1_000, "b", Some(500));
        let c = book.add_schedule_at(T0, 10_000, "c", None);

        let advanced = book.advance(T0 + 2_000);
        assert_eq!(advanced.to_pending, vec![a.clone(), b.clone()]);
        assert_eq!(advanced.to_outdated, vec![b.clone()]);
        assert_eq!(book.get(&a).unwrap().status, TaskStatus::Pending);
        assert_eq!(book.get(&b).unwrap().status, TaskStatus::Outdated);
        assert_eq!(book.get(&c).unwrap().status, TaskStatus::Scheduled);
    }

    #[test]
    fn test_pick_prefers_outdated_then_earliest() {
        let book = TaskBook::in_memory();
        let late = book.add_schedule_at(T0, 0, "late pending", None);
        let early = book.add_schedule_at(T0 - 5_000, 0, "early pending", None);
        book.advance(T0);
        assert_eq!(book.pick_one().unwrap().id, early);

        let stale_b = book.add_schedule_at(T0, 0, "stale b", Some(200));
        let stale_a = book.add_schedule_at(T0, 0, "stale a", Some(100));
        book.advance(T0 + 1_000);
        assert_eq!(book.pick_one().unwrap().id, stale_a);
        book.cancel_schedule_at(T0 + 1_000, &stale_a);
        assert_eq!(book.pick_one().unwrap().id, stale_b);
        book.cancel_schedule_at(T0 + 1_000, &stale_b);
        book.cancel_schedule_at(T0 + 1_000, &early);
        assert_eq!(book.pick_one().unwrap().id, late);
    }

    #[test]
    fn test_running_cannot_be_canceled() {
        let book = TaskBook::in_memory();
        let id = book.add_schedule_at(T0, 0, "run", None);
        book.advance(T0);
        book.mark_running(&id, T0).unwrap();
        assert!(!book.cancel_schedule_at(T0, &id));
        assert_eq!(book.get(&id).unwrap().status, TaskStatus::Running);

        book.settle(
            &id,
            TaskResult {
                kind: TaskResultKind::Executed,
                error: Some("boom".into()),
            },
            T0,
        );
        let task = book.get(&id).unwrap();
        assert_eq!(task.status, TaskStatus::Accomplished);
        assert!(task.finished_at.unwrap() > task.started_at.unwrap());
        assert_eq!(task.result.unwrap().error.as_deref(), Some("boom"));
        assert!(!book.cancel_schedule_at(T0, &id));
    }

    #[test]
    fn test_cancel_and_delete() {
        let book = TaskBook::in_memory();
        let id = book.add_schedule_at(T0, 60_000, "later", None);
        assert!(book.cancel_schedule_at(T0 + 1, &id));
        let task = book.get(&id).unwrap();
        assert_eq!(task.status, TaskStatus::Canceled);
        assert_eq!(task.finished_at, Some(T0 + 1));
        assert_eq!(task.result.unwrap().kind, TaskResultKind::Canceled);

        assert!(book.delete_schedule(&id));
        assert!(!book.delete_schedule(&id));
        assert!(book.tasks().is_empty());
    }

    #[test]
    fn test_stats_counts_every_status() {
        let book = TaskBook::in_memory();
        book.add_schedule_at(T0, 60_000, "a", None);
        let b = book.add_schedule_at(T0, 60_000, "b", None);
        book.cancel_schedule_at(T0, &b);
        let stats = book.stats();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.count(TaskStatus::Scheduled), 1);
        assert_eq!(stats.count(TaskStatus::Canceled), 1);
        assert_eq!(stats.count(TaskStatus::Running), 0);
    }

    #[test]
    fn test_snapshot_roundtrip_and_rehydrate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("schedule.json");

        let (fresh, stale) = {
            let book = TaskBook::open(&path).unwrap();
            let fresh = book.add_schedule_at(T0, 0, "fresh", None);
            let stale = book.add_schedule_at(T0, 0, "stale", Some(1_000));
            book.advance(T0);
            book.mark_running(&fresh, T0).unwrap();
            book.mark_running(&stale, T0).unwrap();
            (fresh, stale)
        };

        let book = TaskBook::open(&path).unwrap();
        assert_eq!(book.get(&fresh).unwrap().status, TaskStatus::Running);
        assert_eq!(book.rehydrate_at(T0 + 5_000), 2);

        let fresh = book.get(&fresh).unwrap();
        assert_eq!(fresh.status, TaskStatus::Pending);
        assert_eq!(fresh.started_at, None);
        assert_eq!(book.get(&stale).unwrap().status, TaskStatus::Outdated);
    }

    #[test]
    fn test_missing_snapshot_is_empty_and_corrupt_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let book = TaskBook::open(dir.path().join("none.json")).unwrap();
        assert!(book.tasks().is_empty());

        let bad = dir.path().join("bad.json");
        std::fs::write(&bad, "{not json").unwrap();
        assert!(matches!(TaskBook::open(&bad), Err(CompanionError::Persistence(_))));
    }

    #[test]
    fn test_task_serializes_camel_case() {
        let book = TaskBook::in_memory();
        let id = book.add_schedule_at(T0, 0, "x", None);
        let json = serde_json::to_value(book.get(&id).unwrap()).unwrap();
        assert_eq!(json["scheduledAt"], T0);
        assert_eq!(json["status"], "scheduled");
        assert!(json.get("outdatedAt").is_none());
    }
}
