//! 播放层：音频协作方、展示节奏队列、语音合成、空闲看门狗

pub mod audio;
pub mod queue;
pub mod synthesis;
pub mod watchdog;

pub use audio::{AudioClip, AudioError, AudioPlayer, AudioSynthesis, NullPlayer};
pub use queue::{PlaybackConfig, PlaybackQueue, StageEvent, StageView, DEFAULT_PACE_DELAY};
pub use synthesis::HttpSynthesis;
pub use watchdog::{InactivityWatchdog, WatchdogCheck};
