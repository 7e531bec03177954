//! 音频协作方：合成（文字 -> 音频）与播放
//!
//! 播放器的 `play` 在音频播放结束（或出错）时返回，恰好一次；
//! PlaybackQueue 在独立任务中等待它，并通过中止该任务来停止旧音频。

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// 合成得到的一段音频
#[derive(Clone, PartialEq, Eq)]
pub struct AudioClip {
    bytes: Arc<Vec<u8>>,
    /// 如 "audio/wav"
    pub mime: String,
}

impl AudioClip {
    pub fn new(bytes: Vec<u8>, mime: impl Into<String>) -> Self {
        Self {
            bytes: Arc::new(bytes),
            mime: mime.into(),
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl fmt::Debug for AudioClip {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AudioClip")
            .field("mime", &self.mime)
            .field("len", &self.bytes.len())
            .finish()
    }
}

#[derive(Error, Debug, Clone)]
pub enum AudioError {
    #[error("Synthesis failed: {0}")]
    Synthesis(String),
    #[error("Playback failed: {0}")]
    Playback(String),
}

/// 文字转语音
#[async_trait]
pub trait AudioSynthesis: Send + Sync {
    async fn synthesize(&self, text: &str) -> Result<AudioClip, AudioError>;
}

/// 音频播放：返回即表示 onEnded（Ok）或 onError（Err）
#[async_trait]
pub trait AudioPlayer: Send + Sync {
    async fn play(&self, clip: AudioClip) -> Result<(), AudioError>;
}

/// 无声播放器：按固定时长“播放”，用于无音频设备的环境与测试
#[derive(Debug, Clone)]
pub struct NullPlayer {
    duration: Duration,
    fail: bool,
}

impl NullPlayer {
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            fail: false,
        }
    }

    /// 播放到时长后报告错误（模拟解码失败）
    pub fn failing(duration: Duration) -> Self {
        Self {
            duration,
            fail: true,
        }
    }
}

impl Default for NullPlayer {
    fn default() -> Self {
        Self::new(Duration::from_millis(0))
    }
}

#[async_trait]
impl AudioPlayer for NullPlayer {
    async fn play(&self, clip: AudioClip) -> Result<(), AudioError> {
        tokio::time::sleep(self.duration).await;
        if self.fail {
            return Err(AudioError::Playback(format!(
                "cannot decode {} ({} bytes)",
                clip.mime,
                clip.len()
            )));
        }
        Ok(())
    }
}
