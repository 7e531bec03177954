//! OpenAI 兼容 API 客户端
//!
//! 通过 async_openai 调用任意 OpenAI 兼容端点（可配置 base_url）；支持 DeepSeek、OpenAI、自建代理等。
//! 走服务端流式，逐块产出 `delta.content`。

use async_openai::config::OpenAIConfig;
use async_openai::types::chat::{
    ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
    CreateChatCompletionRequestArgs,
};
use async_openai::Client;
use async_trait::async_trait;
use futures_util::StreamExt;

use crate::config::LlmSection;
use crate::llm::{DeltaStream, LlmError, ModelStreamClient};
use crate::memory::{Message, Role};

/// OpenAI 兼容客户端：持有 Client、model 名与采样参数
pub struct OpenAiClient {
    client: Client<OpenAIConfig>,
    model: String,
    temperature: f32,
    max_tokens: u32,
}

impl OpenAiClient {
    pub fn new(base_url: Option<&str>, model: &str, api_key: &str) -> Self {
        let config = if let Some(url) = base_url {
            OpenAIConfig::new().with_api_base(url).with_api_key(api_key)
        } else {
            OpenAIConfig::new().with_api_key(api_key)
        };

        Self {
            client: Client::with_config(config),
            model: model.to_string(),
            temperature: 0.7,
            max_tokens: 2000,
        }
    }

    /// 按 [llm] 段构建；缺少 API Key 或模型名时返回 NotConfigured
    pub fn from_config(cfg: &LlmSection) -> Result<Self, LlmError> {
        let api_key = cfg
            .resolved_api_key()
            .ok_or_else(|| LlmError::NotConfigured("missing api key".to_string()))?;
        if cfg.model.trim().is_empty() {
            return Err(LlmError::NotConfigured("missing model name".to_string()));
        }
        let mut client = Self::new(Some(&cfg.base_url), &cfg.model, &api_key);
        client.temperature = cfg.temperature;
        client.max_tokens = cfg.max_tokens;
        Ok(client)
    }

    fn to_openai_messages(messages: &[Message]) -> Result<Vec<ChatCompletionRequestMessage>, LlmError> {
        let build_err = |e: async_openai::error::OpenAIError| LlmError::Request(e.to_string());
        messages
            .iter()
            .map(|m| {
                let msg: ChatCompletionRequestMessage = match m.role {
                    Role::System => ChatCompletionRequestSystemMessageArgs::default()
                        .content(m.content.clone())
                        .build()
                        .map_err(build_err)?
                        .into(),
                    Role::User => ChatCompletionRequestUserMessageArgs::default()
                        .content(m.content.clone())
                        .build()
                        .map_err(build_err)?
                        .into(),
                    Role::Assistant => ChatCompletionRequestAssistantMessageArgs::default()
                        .content(m.content.clone())
                        .build()
                        .map_err(build_err)?
                        .into(),
                    // 工具调用走文本标签而非原生 function calling，结果以 user 消息回传
                    Role::Tool => ChatCompletionRequestUserMessageArgs::default()
                        .content(tool_result_text(m))
                        .build()
                        .map_err(build_err)?
                        .into(),
                };
                Ok(msg)
            })
            .collect()
    }
}

fn tool_result_text(m: &Message) -> String {
    match &m.tool_call_id {
        Some(id) => format!("<toolResult id=\"{}\">{}</toolResult>", id, m.content),
        None => format!("<toolResult>{}</toolResult>", m.content),
    }
}

#[async_trait]
impl ModelStreamClient for OpenAiClient {
    async fn stream(&self, messages: &[Message]) -> Result<DeltaStream, LlmError> {
        #[allow(deprecated)]
        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(Self::to_openai_messages(messages)?)
            .temperature(self.temperature)
            .max_tokens(self.max_tokens)
            .build()
            .map_err(|e| LlmError::Request(e.to_string()))?;

        tracing::debug!(model = %self.model, messages = messages.len(), "Open chat stream");
        let stream = self
            .client
            .chat()
            .create_stream(request)
            .await
            .map_err(|e| LlmError::Request(e.to_string()))?;

        let deltas = stream.filter_map(|chunk| async move {
            match chunk {
                Ok(resp) => {
                    let text: String = resp
                        .choices
                        .iter()
                        .filter_map(|c| c.delta.content.as_deref())
                        .collect();
                    (!text.is_empty()).then_some(Ok(text))
                }
                Err(e) => Some(Err(LlmError::Stream(e.to_string()))),
            }
        });
        Ok(Box::pin(deltas))
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_messages_become_tagged_user_messages() {
        let msgs = vec![
            Message::system("sys"),
            Message::user("hi"),
            Message::assistant("<item>好|はい|0</item>"),
            Message::tool("call_1", "{\"name\":\"echo\",\"ok\":true}"),
        ];
        let converted = OpenAiClient::to_openai_messages(&msgs).unwrap();
        assert_eq!(converted.len(), 4);
        assert!(matches!(converted[3], ChatCompletionRequestMessage::User(_)));
        assert_eq!(
            tool_result_text(&msgs[3]),
            "<toolResult id=\"call_1\">{\"name\":\"echo\",\"ok\":true}</toolResult>"
        );
    }

    #[test]
    fn test_from_config_requires_model() {
        let cfg = LlmSection {
            api_key: Some("sk-test".into()),
            model: "  ".into(),
            ..Default::default()
        };
        assert!(matches!(OpenAiClient::from_config(&cfg), Err(LlmError::NotConfigured(_))));

        let cfg = LlmSection {
            api_key: Some("sk-test".into()),
            ..Default::default()
        };
        assert_eq!(OpenAiClient::from_config(&cfg).unwrap().model_name(), "deepseek-chat");
    }
}
