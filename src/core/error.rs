//! 错误类型与处置策略
//!
//! 除 StreamTransport 外，其余错误都在发生处就地吸收（丢弃片段、写入工具结果、写入任务 result），
//! 不会跨越流式边界向上抛出；`containment` 给出每类错误的处置方式，供日志与测试使用。

use thiserror::Error;

/// 编排核心可能遇到的错误
#[derive(Error, Debug, Clone)]
pub enum CompanionError {
    /// `<item>` / `<tool>` 载荷格式错误
    #[error("Parse error in <{tag}>: {reason}")]
    Parse { tag: &'static str, reason: String },

    #[error("Tool execution failed: {0}")]
    ToolExecution(String),

    /// 语音合成失败（可选功能，降级为纯文本）
    #[error("Synthesis failed: {0}")]
    Synthesis(String),

    /// 后台任务执行失败（写入 result.error）
    #[error("Scheduled task failed: {0}")]
    SchedulerExecution(String),

    /// 模型流传输失败：唯一会提前结束一轮对话的错误
    #[error("Stream transport error: {0}")]
    StreamTransport(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Persistence error: {0}")]
    Persistence(String),
}

/// 错误的处置方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Containment {
    /// 丢弃当前片段，继续解析
    DropSegment,
    /// 作为 `{ok:false}` 结果参与汇合
    CaptureAsResult,
    /// 降级为纯文本展示
    DegradeToText,
    /// 写入任务 result.error，任务仍然 accomplished
    RecordOnTask,
    /// 结束当前轮次，返回已积累的 transcript 与错误信息
    EndTurn,
    /// 启动/持久化层面的错误，交给调用方
    Propagate,
}

impl CompanionError {
    pub fn containment(&self) -> Containment {
        match self {
            CompanionError::Parse { .. } => Containment::DropSegment,
            CompanionError::ToolExecution(_) => Containment::CaptureAsResult,
            CompanionError::Synthesis(_) => Containment::DegradeToText,
            CompanionError::SchedulerExecution(_) => Containment::RecordOnTask,
            CompanionError::StreamTransport(_) => Containment::EndTurn,
            CompanionError::Config(_) | CompanionError::Persistence(_) => Containment::Propagate,
        }
    }

    /// 是否会终止当前轮次
    pub fn is_turn_fatal(&self) -> bool {
        self.containment() == Containment::EndTurn
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transport_is_turn_fatal() {
        let errors = [
            CompanionError::Parse { tag: "item", reason: "fields".into() },
            CompanionError::ToolExecution("boom".into()),
            CompanionError::Synthesis("503".into()),
            CompanionError::SchedulerExecution("boom".into()),
            CompanionError::Config("missing".into()),
        ];
        for err in errors {
            assert!(!err.is_turn_fatal(), "{err} should be contained");
        }
        assert!(CompanionError::StreamTransport("reset".into()).is_turn_fatal());
    }

    #[test]
    fn test_parse_error_message_names_tag() {
        let err = CompanionError::Parse { tag: "item", reason: "expected 3 fields".into() };
        assert_eq!(err.to_string(), "Parse error in <item>: expected 3 fields");
        assert_eq!(err.containment(), Containment::DropSegment);
    }
}
