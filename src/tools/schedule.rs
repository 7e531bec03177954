//! 定时任务工具：addSchedule / cancelSchedule / deleteSchedule

use std::sync::Arc;

use async_trait::async_trait;

use crate::core::TaskBook;
use crate::tools::{Tool, ToolOutput};

/// 添加定时任务。参数：延迟秒数、过期秒数（-1 或空为不过期）、任务内容
pub struct AddScheduleTool {
    book: Arc<TaskBook>,
}

impl AddScheduleTool {
    pub fn new(book: Arc<TaskBook>) -> Self {
        Self { book }
    }
}

fn parse_seconds(raw: &str) -> Option<f64> {
    raw.trim().parse::<f64>().ok().filter(|n| n.is_finite())
}

/// 非法或负数延迟按 0 处理
fn parse_delay_ms(raw: Option<&String>) -> i64 {
    raw.and_then(|s| parse_seconds(s))
        .filter(|n| *n >= 0.0)
        .map(|n| (n * 1000.0) as i64)
        .unwrap_or(0)
}

/// 空、-1 或非法值都表示不过期
fn parse_outdated_ms(raw: Option<&String>) -> Option<i64> {
    raw.and_then(|s| parse_seconds(s))
        .filter(|n| *n >= 0.0)
        .map(|n| (n * 1000.0) as i64)
}

#[async_trait]
impl Tool for AddScheduleTool {
    fn name(&self) -> &str {
        "addSchedule"
    }

    fn description(&self) -> &str {
        "参数：延迟时间（秒）, 过期时间（秒，-1表示不过期）, 任务内容（字符串，这是你要提醒你自己在未来要做的事情，比如“我需要做xxx”。这个任务内容可以写的很详细）\n  功能：添加一个定时器，到时间会提醒你执行你自己定下的任务。如果这个任务具有时效性，你可以添加过期时间。"
    }

    async fn call(&self, args: Vec<String>) -> Result<ToolOutput, String> {
        let delay_ms = parse_delay_ms(args.first());
        let outdated_ms = parse_outdated_ms(args.get(1));
        // 内容里的逗号会被参数切分拆开，这里拼回去
        let content = args.get(2..).map(|rest| rest.join(", ")).unwrap_or_default();
        let content = content.trim();
        if content.is_empty() {
            return Err("任务内容不能为空".to_string());
        }

        let id = self.book.add_schedule(delay_ms, content, outdated_ms);
        Ok(ToolOutput::done(format!("Successfully added schedule with ID {id}")))
    }
}

/// 取消尚未开始的定时任务
pub struct CancelScheduleTool {
    book: Arc<TaskBook>,
}

impl CancelScheduleTool {
    pub fn new(book: Arc<TaskBook>) -> Self {
        Self { book }
    }
}

#[async_trait]
impl Tool for CancelScheduleTool {
    fn name(&self) -> &str {
        "cancelSchedule"
    }

    fn description(&self) -> &str {
        "参数：任务ID\n  功能：取消一个尚未开始执行的任务（正在执行的任务无法取消）。"
    }

    async fn call(&self, args: Vec<String>) -> Result<ToolOutput, String> {
        let id = args.first().map(|s| s.trim()).unwrap_or_default();
        if id.is_empty() {
            return Err("缺少任务ID".to_string());
        }
        if self.book.cancel_schedule(id) {
            Ok(ToolOutput::done(format!("Successfully canceled schedule with ID {id}")))
        } else {
            Ok(ToolOutput::failed(format!("Schedule {id} not found or not cancelable")))
        }
    }
}

/// 删除任务（不论状态）
pub struct DeleteScheduleTool {
    book: Arc<TaskBook>,
}

impl DeleteScheduleTool {
    pub fn new(book: Arc<TaskBook>) -> Self {
        Self { book }
    }
}

#[async_trait]
impl Tool for DeleteScheduleTool {
    fn name(&self) -> &str {
        "deleteSchedule"
    }

    fn description(&self) -> &str {
        "参数：任务ID\n  功能：删除一个任务（无论其当前状态如何），从任务列表中移除。"
    }

    async fn call(&self, args: Vec<String>) -> Result<ToolOutput, String> {
        let id = args.first().map(|s| s.trim()).unwrap_or_default();
        if id.is_empty() {
            return Err("缺少任务ID".to_string());
        }
        if self.book.delete_schedule(id) {
            Ok(ToolOutput::done(format!("Successfully deleted schedule with ID {id}")))
        } else {
            Ok(ToolOutput::failed(format!("No schedule found with ID {id}")))
        }
    }
}
