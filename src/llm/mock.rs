//! Mock 流式客户端（用于测试与离线运行，无需 API）
//!
//! 每次 `stream` 调用消费一轮脚本：按顺序吐出预设增量，可选在末尾模拟传输中断；
//! 脚本耗尽后回落到“回显最后一条用户消息”。

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{stream, StreamExt};

use crate::llm::{DeltaStream, LlmError, ModelStreamClient};
use crate::memory::{Message, Role};

/// 一轮脚本化输出
#[derive(Debug, Clone, Default)]
pub struct ScriptedRound {
    pub deltas: Vec<String>,
    /// 吐完增量后以该错误中断
    pub fail_with: Option<String>,
    /// 打开流即失败
    pub refuse: Option<String>,
}

impl ScriptedRound {
    pub fn new<S: Into<String>>(deltas: impl IntoIterator<Item = S>) -> Self {
        Self {
            deltas: deltas.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    /// 整段文本按字符数切块
    pub fn chunked(text: &str, chunk_chars: usize) -> Self {
        let chars: Vec<char> = text.chars().collect();
        Self::new(chars.chunks(chunk_chars.max(1)).map(|c| c.iter().collect::<String>()))
    }

    pub fn then_fail(mut self, error: impl Into<String>) -> Self {
        self.fail_with = Some(error.into());
        self
    }

    pub fn refused(error: impl Into<String>) -> Self {
        Self {
            refuse: Some(error.into()),
            ..Default::default()
        }
    }
}

/// Mock 客户端：按轮回放脚本并记录每次请求的消息
#[derive(Debug, Default)]
pub struct MockStreamClient {
    rounds: Mutex<VecDeque<ScriptedRound>>,
    requests: Mutex<Vec<Vec<Message>>>,
    chunk_delay: Duration,
}

impl MockStreamClient {
    pub fn new(rounds: impl IntoIterator<Item = ScriptedRound>) -> Self {
        Self {
            rounds: Mutex::new(rounds.into_iter().collect()),
            ..Default::default()
        }
    }

    /// 每个增量之间的间隔（模拟网络）
    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }

    pub fn push_round(&self, round: ScriptedRound) {
        self.rounds.lock().unwrap_or_else(|e| e.into_inner()).push_back(round);
    }

    /// 已收到的请求（每次 stream 调用一份消息列表）
    pub fn requests(&self) -> Vec<Vec<Message>> {
        self.requests.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn echo_round(messages: &[Message]) -> ScriptedRound {
        let last_user = messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| strip_wrapper(&m.content))
            .unwrap_or("(no input)");
        let text = last_user.replace('|', "｜");
        ScriptedRound::chunked(&format!("<item>{text}|{text}|0</item>"), 4)
    }
}

fn strip_wrapper(content: &str) -> &str {
    content
        .trim()
        .strip_prefix("<userMessage>")
        .and_then(|s| s.strip_suffix("</userMessage>"))
        .unwrap_or(content)
        .trim()
}

#[async_trait]
impl ModelStreamClient for MockStreamClient {
    async fn stream(&self, messages: &[Message]) -> Result<DeltaStream, LlmError> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(messages.to_vec());
        let round = self
            .rounds
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .unwrap_or_else(|| Self::echo_round(messages));

        if let Some(e) = round.refuse {
            return Err(LlmError::Request(e));
        }

        let mut items: Vec<Result<String, LlmError>> = round.deltas.into_iter().map(Ok).collect();
        if let Some(e) = round.fail_with {
            items.push(Err(LlmError::Stream(e)));
        }

        let delay = self.chunk_delay;
        if delay.is_zero() {
            return Ok(Box::pin(stream::iter(items)));
        }
        Ok(Box::pin(stream::iter(items).then(move |item| async move {
            tokio::time::sleep(delay).await;
            item
        })))
    }

    fn model_name(&self) -> &str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn collect(client: &MockStreamClient, messages: &[Message]) -> Vec<Result<String, LlmError>> {
        client.stream(messages).await.unwrap().collect().await
    }

    #[tokio::test]
    async fn test_rounds_replay_in_order_then_echo() {
        let client = MockStreamClient::new([
            ScriptedRound::new(["a", "b"]),
            ScriptedRound::new(["c"]).then_fail("reset by peer"),
        ]);
        let msgs = vec![Message::user("<userMessage>你好</userMessage>")];

        assert_eq!(collect(&client, &msgs).await, vec![Ok("a".into()), Ok("b".into())]);
        let second = collect(&client, &msgs).await;
        assert_eq!(second[0], Ok("c".into()));
        assert!(matches!(second[1], Err(LlmError::Stream(_))));

        let echoed: String = collect(&client, &msgs)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(echoed, "<item>你好|你好|0</item>");
        assert_eq!(client.requests().len(), 3);
    }

    #[tokio::test]
    async fn test_refused_round_fails_on_open() {
        let client = MockStreamClient::new([ScriptedRound::refused("401")]);
        assert!(matches!(client.stream(&[]).await, Err(LlmError::Request(_))));
    }

    #[test]
    fn test_chunked_splits_on_chars() {
        let round = ScriptedRound::chunked("早上好呀", 3);
        assert_eq!(round.deltas, vec!["早上好".to_string(), "呀".to_string()]);
    }
}
