//! 记忆层：会话消息、聊天历史与追加式聊天记录

pub mod conversation;
pub mod persistence;

pub use conversation::{ChatHistory, Message, Role};
pub use persistence::{TranscriptEntry, TranscriptLog};
