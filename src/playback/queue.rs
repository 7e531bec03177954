//! 播放队列：控制展示节奏
//!
//! 推进规则（try_advance）：
//! 1. 正在播音频：什么也不做，等音频结束回调
//! 2. 展示位为空且队列非空：立即展示下一条（首句零延迟）
//! 3. 展示位非空且开启自动播放：挂一个节奏定时器（默认 2000ms），到点展示下一条；
//!    队列已空且流已结束时，到点清空展示并恢复默认表情
//! 4. 关闭自动播放：停住，等外部调用 advance()
//!
//! 带音频的条目在展示时开始播放，之后只由音频结束/出错回调推进，不走定时器。
//! 任意时刻最多一个展示项、最多一个音频。

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::core::{BusySignal, ConversationState};
use crate::playback::{AudioClip, AudioError, AudioPlayer};
use crate::stream::ResponseItem;

/// 默认节奏延迟
pub const DEFAULT_PACE_DELAY: Duration = Duration::from_millis(2000);

#[derive(Debug, Clone)]
pub struct PlaybackConfig {
    pub pace_delay: Duration,
    pub auto_play: bool,
    pub default_emotion: u32,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            pace_delay: DEFAULT_PACE_DELAY,
            auto_play: true,
            default_emotion: 0,
        }
    }
}

/// 舞台事件（UI 订阅）
#[derive(Debug, Clone, PartialEq)]
pub enum StageEvent {
    Displayed(ResponseItem),
    AudioStarted,
    AudioFinished { ok: bool },
    /// 展示位清空，表情恢复默认
    Cleared { emotion: u32 },
}

/// 舞台当前状态
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StageView {
    pub text: Option<String>,
    pub translated_text: Option<String>,
    pub emotion: u32,
    pub queued: usize,
    pub audio_playing: bool,
}

struct ActiveAudio {
    generation: u64,
    task: JoinHandle<()>,
}

/// 节奏定时器；过期唤醒按代号忽略
struct PaceTimer {
    generation: u64,
    task: JoinHandle<()>,
}

struct Slots {
    queue: VecDeque<ResponseItem>,
    current: Option<ResponseItem>,
    emotion: u32,
    audio: Option<ActiveAudio>,
    audio_generation: u64,
    pace_generation: u64,
    pace_timer: Option<PaceTimer>,
    config: PlaybackConfig,
}

struct Inner {
    state: Arc<ConversationState>,
    player: Arc<dyn AudioPlayer>,
    slots: Mutex<Slots>,
    events: broadcast::Sender<StageEvent>,
}

/// 播放队列（可克隆句柄，内部共享）
#[derive(Clone)]
pub struct PlaybackQueue {
    inner: Arc<Inner>,
}

impl PlaybackQueue {
    pub fn new(
        config: PlaybackConfig,
        state: Arc<ConversationState>,
        player: Arc<dyn AudioPlayer>,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(Inner {
                state,
                player,
                slots: Mutex::new(Slots {
                    queue: VecDeque::new(),
                    current: None,
                    emotion: config.default_emotion,
                    audio: None,
                    audio_generation: 0,
                    pace_generation: 0,
                    pace_timer: None,
                    config,
                }),
                events,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slots> {
        self.inner.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, ev: StageEvent) {
        let _ = self.inner.events.send(ev);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StageEvent> {
        self.inner.events.subscribe()
    }

    pub fn state(&self) -> &Arc<ConversationState> {
        &self.inner.state
    }

    /// 入队并尝试推进
    pub fn push(&self, item: ResponseItem) {
        let mut slots = self.lock();
        slots.queue.push_back(item);
        self.advance_locked(&mut slots);
    }

    /// 统一推进入口
    pub fn try_advance(&self) {
        let mut slots = self.lock();
        self.advance_locked(&mut slots);
    }

    /// 外部“下一句”动作：不打断正在播放的音频；展示下一条，或在无后续且流已结束时清空
    pub fn advance(&self) {
        let mut slots = self.lock();
        if slots.audio.is_some() {
            return;
        }
        self.play_next_locked(&mut slots);
    }

    /// 清空待播队列并停止音频（保留当前展示）
    pub fn clear_all(&self) {
        let mut slots = self.lock();
        cancel_pace(&mut slots);
        self.stop_audio_locked(&mut slots);
        slots.queue.clear();
    }

    /// 回到空闲：清空队列、展示位与音频，表情恢复默认，重置活动时间
    pub fn stop_to_idle(&self) {
        let mut slots = self.lock();
        slots.queue.clear();
        self.clear_display_locked(&mut slots);
        drop(slots);
        self.inner.state.touch();
    }

    pub fn set_auto_play(&self, on: bool) {
        let mut slots = self.lock();
        slots.config.auto_play = on;
        if on {
            self.advance_locked(&mut slots);
        } else {
            cancel_pace(&mut slots);
        }
    }

    pub fn is_audio_playing(&self) -> bool {
        self.lock().audio.is_some()
    }

    pub fn current(&self) -> Option<ResponseItem> {
        self.lock().current.clone()
    }

    pub fn queued(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn snapshot(&self) -> StageView {
        let slots = self.lock();
        StageView {
            text: slots.current.as_ref().map(|i| i.text.clone()),
            translated_text: slots.current.as_ref().map(|i| i.translated_text.clone()),
            emotion: slots.emotion,
            queued: slots.queue.len(),
            audio_playing: slots.audio.is_some(),
        }
    }

    fn advance_locked(&self, slots: &mut Slots) {
        if slots.audio.is_some() {
            return;
        }
        if slots.current.is_none() {
            if let Some(item) = slots.queue.pop_front() {
                self.display_locked(slots, item);
            }
            return;
        }
        if !slots.config.auto_play {
            return;
        }
        // 流式期间队列为空：继续展示当前句，等新条目
        if !slots.queue.is_empty() || !self.inner.state.is_streaming() {
            self.arm_pace_locked(slots);
        }
    }

    fn play_next_locked(&self, slots: &mut Slots) {
        cancel_pace(slots);
        if let Some(item) = slots.queue.pop_front() {
            self.display_locked(slots, item);
        } else if self.inner.state.is_streaming() {
            tracing::debug!("Queue drained while streaming, waiting for more items");
        } else if slots.current.is_some() {
            self.clear_display_locked(slots);
        }
    }

    fn display_locked(&self, slots: &mut Slots, item: ResponseItem) {
        cancel_pace(slots);
        slots.emotion = item.emotion_code;
        slots.current = Some(item.clone());
        self.inner.state.touch();
        tracing::debug!(text = %item.text, emotion = item.emotion_code, "Display item");
        let audio = item.audio.clone();
        self.emit(StageEvent::Displayed(item));
        match audio {
            Some(clip) => self.start_audio_locked(slots, clip),
            None => self.advance_locked(slots),
        }
    }

    /// 定时器已在计时则不重新计时：节奏从当前句展示时刻算起
    fn arm_pace_locked(&self, slots: &mut Slots) {
        if slots.pace_timer.as_ref().is_some_and(|t| !t.task.is_finished()) {
            return;
        }
        slots.pace_generation += 1;
        let generation = slots.pace_generation;
        let delay = slots.config.pace_delay;
        let this = self.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            this.on_pace_elapsed(generation);
        });
        slots.pace_timer = Some(PaceTimer { generation, task });
    }

    fn on_pace_elapsed(&self, generation: u64) {
        let mut slots = self.lock();
        // 醒来时句柄已被换成新定时器：这是过期唤醒
        if slots.pace_timer.as_ref().map(|t| t.generation) != Some(generation) {
            tracing::debug!(generation, "Stale pace timer ignored");
            return;
        }
        // 本任务即将结束，交还句柄而不是 abort 自己
        slots.pace_timer = None;
        if slots.audio.is_some() {
            return;
        }
        self.play_next_locked(&mut slots);
    }

    fn start_audio_locked(&self, slots: &mut Slots, clip: AudioClip) {
        self.stop_audio_locked(slots);
        slots.audio_generation += 1;
        let generation = slots.audio_generation;
        self.inner.state.touch();
        self.emit(StageEvent::AudioStarted);

        let this = self.clone();
        let player = Arc::clone(&self.inner.player);
        let task = tokio::spawn(async move {
            let result = player.play(clip).await;
            this.on_audio_done(generation, result);
        });
        slots.audio = Some(ActiveAudio { generation, task });
    }

    fn on_audio_done(&self, generation: u64, result: Result<(), AudioError>) {
        let mut slots = self.lock();
        if slots.audio.as_ref().map(|a| a.generation) != Some(generation) {
            return;
        }
        slots.audio = None;
        if let Err(e) = &result {
            tracing::warn!("Audio playback failed: {}", e);
        }
        self.emit(StageEvent::AudioFinished { ok: result.is_ok() });
        self.advance_locked(&mut slots);
    }

    fn stop_audio_locked(&self, slots: &mut Slots) {
        if let Some(active) = slots.audio.take() {
            active.task.abort();
        }
    }

    fn clear_display_locked(&self, slots: &mut Slots) {
        cancel_pace(slots);
        self.stop_audio_locked(slots);
        let had_content = slots.current.take().is_some();
        let default_emotion = slots.config.default_emotion;
        let emotion_changed = slots.emotion != default_emotion;
        slots.emotion = default_emotion;
        if had_content || emotion_changed {
            self.emit(StageEvent::Cleared {
                emotion: default_emotion,
            });
        }
    }
}

fn cancel_pace(slots: &mut Slots) {
    if let Some(timer) = slots.pace_timer.take() {
        timer.task.abort();
    }
}

impl BusySignal for PlaybackQueue {
    fn is_busy(&self) -> bool {
        if self.inner.state.is_streaming() {
            return true;
        }
        let slots = self.lock();
        slots.current.is_some() || !slots.queue.is_empty()
    }
}
