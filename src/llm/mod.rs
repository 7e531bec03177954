//! LLM 层：流式客户端抽象与实现（OpenAI 兼容 / DeepSeek / Mock）

pub mod deepseek;
pub mod mock;
pub mod openai;
pub mod traits;

pub use deepseek::{DEEPSEEK_BASE_URL, DEEPSEEK_CHAT};
pub use mock::{MockStreamClient, ScriptedRound};
pub use openai::OpenAiClient;
pub use traits::{DeltaStream, LlmError, ModelStreamClient};
