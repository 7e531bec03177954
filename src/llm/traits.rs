//! 模型流式客户端抽象
//!
//! 所有后端（OpenAI 兼容 / DeepSeek / Mock）实现 ModelStreamClient：按顺序产出文本增量，
//! 以流结束或一个 Err 终止。

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::Stream;
use thiserror::Error;

use crate::core::CompanionError;
use crate::memory::Message;

/// 文本增量流
pub type DeltaStream = Pin<Box<dyn Stream<Item = Result<String, LlmError>> + Send>>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LlmError {
    #[error("model not configured: {0}")]
    NotConfigured(String),
    #[error("request failed: {0}")]
    Request(String),
    #[error("stream interrupted: {0}")]
    Stream(String),
}

impl From<LlmError> for CompanionError {
    fn from(e: LlmError) -> Self {
        CompanionError::StreamTransport(e.to_string())
    }
}

/// 流式模型客户端
#[async_trait]
pub trait ModelStreamClient: Send + Sync {
    async fn stream(&self, messages: &[Message]) -> Result<DeltaStream, LlmError>;

    fn model_name(&self) -> &str {
        "unknown"
    }
}
