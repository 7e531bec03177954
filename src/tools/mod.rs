//! 工具层：注册表、调度器与内置工具

pub mod dispatcher;
pub mod echo;
pub mod registry;
pub mod schedule;

use std::sync::Arc;

use crate::core::TaskBook;

pub use dispatcher::{needs_continuation, PendingToolCall, ToolDispatcher, ToolResult};
pub use echo::EchoTool;
pub use registry::{Tool, ToolOutput, ToolRegistry};
pub use schedule::{AddScheduleTool, CancelScheduleTool, DeleteScheduleTool};

/// 默认工具集：定时任务三件套 + echo
pub fn default_registry(book: Arc<TaskBook>) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(AddScheduleTool::new(Arc::clone(&book)));
    registry.register(CancelScheduleTool::new(Arc::clone(&book)));
    registry.register(DeleteScheduleTool::new(book));
    registry.register(EchoTool);
    registry
}
