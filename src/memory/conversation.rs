//! 短期记忆：会话消息与聊天历史
//!
//! Message 与模型 API 的消息一致（system / user / assistant / tool）；
//! ChatHistory 保存用户可见的 user/assistant 往来，构造请求时只取最近 N 条。

use serde::{Deserialize, Serialize};

/// 消息角色（与 LLM API 一致）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
    /// 工具结果，必须携带 tool_call_id 与识别时分配的调用 ID 对应
    Tool,
}

/// 单条消息
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            tool_call_id: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_call_id: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
            tool_call_id: None,
        }
    }

    pub fn tool(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_call_id: Some(call_id.into()),
        }
    }
}

/// 聊天历史：只追加，构造上下文时按 max_length 取窗口
#[derive(Clone, Debug, Default)]
pub struct ChatHistory {
    messages: Vec<Message>,
}

impl ChatHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, msg: Message) {
        self.messages.push(msg);
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// 最近 max_length 条中的 user / assistant 消息（system 与 tool 不进入窗口）
    pub fn window(&self, max_length: usize) -> Vec<Message> {
        let start = self.messages.len().saturating_sub(max_length);
        self.messages[start..]
            .iter()
            .filter(|m| matches!(m.role, Role::User | Role::Assistant))
            .cloned()
            .collect()
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_keeps_recent_dialogue_only() {
        let mut history = ChatHistory::new();
        history.push(Message::user("one"));
        history.push(Message::assistant("two"));
        history.push(Message::tool("call_1", "{}"));
        history.push(Message::user("three"));

        let window = history.window(3);
        let contents: Vec<&str> = window.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["two", "three"]);
    }

    #[test]
    fn test_tool_message_serializes_call_id() {
        let json = serde_json::to_string(&Message::tool("call_7", "ok")).unwrap();
        assert!(json.contains("\"role\":\"tool\""));
        assert!(json.contains("\"tool_call_id\":\"call_7\""));

        let plain = serde_json::to_string(&Message::user("hi")).unwrap();
        assert!(!plain.contains("tool_call_id"));
    }
}
