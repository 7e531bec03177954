//! 流式输出解析：把逐块到达的模型文本切成 `<item>` 展示项与 `<tool>` 调用

pub mod item;
pub mod parser;

pub use item::{ResponseItem, Segment, ToolInvocation};
pub use parser::{split_arguments, ChunkParser, ItemGrammar, StripGrammar, TagGrammar, ToolGrammar};
