//! DeepSeek API（OpenAI 兼容格式），[llm] 段的默认端点
//!
//! - Base URL: https://api.deepseek.com/v1
//! - 模型: deepseek-chat (常规对话), deepseek-reasoner (思考模式)

pub const DEEPSEEK_BASE_URL: &str = "https://api.deepseek.com/v1";
pub const DEEPSEEK_CHAT: &str = "deepseek-chat";
