//! 核心编排层：错误、会话状态、对话编排、任务簿与心跳调度、优雅关闭

pub mod builder;
pub mod error;
pub mod orchestrator;
pub mod shutdown;
pub mod state;
pub mod task_scheduler;
pub mod tasks;

pub use builder::{Companion, CompanionBuilder};
pub use error::{CompanionError, Containment};
pub use orchestrator::{
    create_llm_from_config, ConversationOrchestrator, OrchestratorSettings, TurnOptions, TurnOutcome,
};
pub use shutdown::{
    CleanupReport, ShutdownCleanup, ShutdownCoordinator, ShutdownManager, ShutdownReason, StageCleanup,
    TaskBookCleanup,
};
pub use state::{BusySignal, ConversationState, StreamState, ToolingGuard};
pub use task_scheduler::{
    AgentActionInvoker, OutdatedTiming, SchedulerEvent, TaskScheduler, TickOutcome,
};
pub use tasks::{ScheduledTask, TaskBook, TaskId, TaskResult, TaskResultKind, TaskStats, TaskStatus};
