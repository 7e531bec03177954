//! Companion - 桌面陪伴角色的对话编排核心
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误、会话状态、对话编排、任务簿与心跳调度、运行时装配、优雅关闭
//! - **llm**: 流式模型客户端抽象与实现（OpenAI 兼容 / DeepSeek / Mock）
//! - **memory**: 会话消息、聊天历史与追加式聊天记录
//! - **observability**: tracing 初始化
//! - **playback**: 播放队列（节奏控制）、音频合成与播放、空闲看门狗
//! - **prompt**: 提示词拼装
//! - **stream**: 流式输出的增量标签解析
//! - **tools**: 工具注册表、调度器与内置工具

pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod playback;
pub mod prompt;
pub mod stream;
pub mod tools;
