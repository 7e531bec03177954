//! 流中识别出的片段类型：展示项与工具调用

use crate::core::CompanionError;
use crate::playback::AudioClip;

/// 一句待展示的回复：中文、译文（用于合成语音）、表情编号、可选音频
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseItem {
    pub text: String,
    pub translated_text: String,
    pub emotion_code: u32,
    pub audio: Option<AudioClip>,
}

impl ResponseItem {
    pub fn new(text: impl Into<String>, translated_text: impl Into<String>, emotion_code: u32) -> Self {
        Self {
            text: text.into(),
            translated_text: translated_text.into(),
            emotion_code,
            audio: None,
        }
    }

    pub fn with_audio(mut self, clip: AudioClip) -> Self {
        self.audio = Some(clip);
        self
    }

    /// 解析 `message|translation|emotionCode`：恰好 3 段，编号为非负整数
    pub fn parse(payload: &str) -> Result<Self, CompanionError> {
        let parts: Vec<&str> = payload.split('|').map(str::trim).collect();
        if parts.len() != 3 {
            return Err(item_error(format!("expected 3 fields, got {}", parts.len())));
        }
        let (message, translation, code) = (parts[0], parts[1], parts[2]);
        if message.is_empty() || translation.is_empty() {
            return Err(item_error("empty message or translation".to_string()));
        }
        let emotion_code = code
            .parse::<u32>()
            .map_err(|_| item_error(format!("emotion code '{code}' is not a non-negative integer")))?;
        Ok(Self::new(message, translation, emotion_code))
    }
}

fn item_error(reason: String) -> CompanionError {
    CompanionError::Parse { tag: "item", reason }
}

/// `<tool>` 标签解析结果（尚未分配调用 ID）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolInvocation {
    pub name: String,
    /// 逗号切分、去空白、去引号后的位置参数
    pub arguments: Vec<String>,
    /// `<arguments>` 原文
    pub raw_arguments: String,
}

/// 一个完整闭合的标签产生的片段
#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    Item(ResponseItem),
    ToolCall(ToolInvocation),
}
