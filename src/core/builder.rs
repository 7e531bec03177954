//! 陪伴运行时构建器：统一的组件装配
//!
//! 命令行与集成测试共用同一套装配：任务簿 -> 工具注册表 -> 播放队列 -> 编排器 -> 心跳调度器 / 空闲看门狗。

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::core::{
    create_llm_from_config, ConversationOrchestrator, ConversationState, OrchestratorSettings,
    SchedulerEvent, TaskBook, TaskScheduler,
};
use crate::llm::ModelStreamClient;
use crate::memory::TranscriptLog;
use crate::playback::{
    AudioPlayer, HttpSynthesis, InactivityWatchdog, NullPlayer, PlaybackConfig, PlaybackQueue,
};
use crate::tools::{default_registry, ToolRegistry};

/// 构建器：未显式指定的组件按配置创建
pub struct CompanionBuilder {
    config: AppConfig,
    llm: Option<Arc<dyn ModelStreamClient>>,
    player: Option<Arc<dyn AudioPlayer>>,
    book: Option<Arc<TaskBook>>,
    /// false 时不读写磁盘（对话记录与任务快照）
    persistent: bool,
}

impl CompanionBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            llm: None,
            player: None,
            book: None,
            persistent: true,
        }
    }

    /// 指定模型客户端（离线模式与测试）
    pub fn with_llm(mut self, llm: Arc<dyn ModelStreamClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn with_player(mut self, player: Arc<dyn AudioPlayer>) -> Self {
        self.player = Some(player);
        self
    }

    pub fn with_task_book(mut self, book: Arc<TaskBook>) -> Self {
        self.book = Some(book);
        self
    }

    pub fn in_memory(mut self) -> Self {
        self.persistent = false;
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// 打开任务快照并修复上次崩溃时停在 running 的任务
    pub fn build_task_book(&self) -> anyhow::Result<Arc<TaskBook>> {
        if let Some(book) = &self.book {
            return Ok(Arc::clone(book));
        }
        if !self.persistent {
            return Ok(Arc::new(TaskBook::in_memory()));
        }
        let path = self.config.schedule_path();
        let book = TaskBook::open(&path)
            .with_context(|| format!("Failed to open task book at {}", path.display()))?;
        let recovered = book.rehydrate();
        if recovered > 0 {
            tracing::info!(recovered, "Recovered interrupted tasks");
        }
        Ok(Arc::new(book))
    }

    pub fn build_tool_registry(&self, book: Arc<TaskBook>) -> ToolRegistry {
        default_registry(book)
    }

    pub fn build_playback_config(&self) -> PlaybackConfig {
        let conv = &self.config.conversation;
        PlaybackConfig {
            pace_delay: conv.pace_delay(),
            auto_play: conv.auto_play,
            default_emotion: conv.default_emotion,
        }
    }

    fn build_llm(&self) -> Option<Arc<dyn ModelStreamClient>> {
        match &self.llm {
            Some(llm) => Some(Arc::clone(llm)),
            None => create_llm_from_config(&self.config),
        }
    }

    pub fn build(self) -> anyhow::Result<Companion> {
        let book = self.build_task_book()?;
        let registry = Arc::new(self.build_tool_registry(Arc::clone(&book)));
        tracing::info!(tools = ?registry.tool_names(), "Tool registry ready");

        let state = Arc::new(ConversationState::new());
        let player = self
            .player
            .clone()
            .unwrap_or_else(|| Arc::new(NullPlayer::default()));
        let queue = PlaybackQueue::new(self.build_playback_config(), Arc::clone(&state), player);

        let mut orchestrator = ConversationOrchestrator::new(
            self.build_llm(),
            registry,
            queue.clone(),
            OrchestratorSettings::from_config(&self.config),
        );
        if self.config.tts.enabled {
            let synthesis = HttpSynthesis::new(self.config.tts.clone());
            tracing::info!(endpoint = %synthesis.endpoint(), "Speech synthesis enabled");
            orchestrator = orchestrator.with_synthesis(Arc::new(synthesis));
        }
        if self.persistent {
            orchestrator = orchestrator.with_transcript_log(TranscriptLog::new(self.config.transcript_path()));
        }
        let orchestrator = Arc::new(orchestrator);

        let scheduler = Arc::new(TaskScheduler::new(
            Arc::clone(&book),
            orchestrator.clone(),
            Arc::new(queue.clone()),
            self.config.scheduler.heartbeat_interval(),
        ));

        Ok(Companion {
            inactivity_timeout: self.config.conversation.inactivity_timeout(),
            config: self.config,
            book,
            queue,
            orchestrator,
            scheduler,
        })
    }
}

/// 装配好的运行时
pub struct Companion {
    pub config: AppConfig,
    pub book: Arc<TaskBook>,
    pub queue: PlaybackQueue,
    pub orchestrator: Arc<ConversationOrchestrator>,
    pub scheduler: Arc<TaskScheduler>,
    inactivity_timeout: Duration,
}

impl Companion {
    /// 启动心跳与空闲看门狗（以及可选的空闲自省）；都随 token 取消退出
    pub fn start(&self, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        // 先订阅，第一次心跳的 Idle 才不会丢
        if self.config.scheduler.reflect_on_idle {
            handles.push(self.spawn_idle_reflection(cancel.clone()));
        }
        if let Some(h) = Arc::clone(&self.scheduler).spawn(cancel.clone()) {
            handles.push(h);
        }
        let watchdog = InactivityWatchdog::new(self.queue.clone(), self.inactivity_timeout);
        handles.push(watchdog.spawn(cancel));
        handles
    }

    fn spawn_idle_reflection(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let mut events = self.scheduler.subscribe();
        let orchestrator = Arc::clone(&self.orchestrator);
        tokio::spawn(async move {
            loop {
                let ev = tokio::select! {
                    _ = cancel.cancelled() => break,
                    ev = events.recv() => ev,
                };
                match ev {
                    Ok(SchedulerEvent::Idle) => {
                        tracing::info!("Planning next chat while idle");
                        let outcome = orchestrator.reflect_on_idle().await;
                        if let Some(e) = outcome.error {
                            tracing::warn!("Idle reflection failed: {}", e);
                        }
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(n)) => tracing::warn!(skipped = n, "Idle listener lagged"),
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockStreamClient;

    #[tokio::test]
    async fn test_build_in_memory_registers_default_tools() {
        let companion = CompanionBuilder::new(AppConfig::default())
            .with_llm(Arc::new(MockStreamClient::default()))
            .in_memory()
            .build()
            .unwrap();
        let outcome = companion.orchestrator.chat("你好").await;
        assert!(outcome.is_ok());
        assert_eq!(companion.queue.snapshot().text.as_deref(), Some("你好"));
        assert!(companion.book.tasks().is_empty());
    }

    #[tokio::test]
    async fn test_persistent_build_uses_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::default();
        config.app.data_dir = Some(dir.path().to_path_buf());

        let companion = CompanionBuilder::new(config)
            .with_llm(Arc::new(MockStreamClient::default()))
            .build()
            .unwrap();
        companion.book.add_schedule(60_000, "提醒休息", None);
        companion.orchestrator.chat("在吗").await;

        assert!(dir.path().join("schedule.json").exists());
        let log = TranscriptLog::new(dir.path().join("transcript.jsonl"));
        assert_eq!(log.load_messages().unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_injected_book_and_player_are_used() {
        let book = Arc::new(TaskBook::in_memory());
        let id = book.add_schedule(60_000, "提醒休息", None);
        let client = Arc::new(MockStreamClient::default());
        client.push_round(crate::llm::ScriptedRound::new(["<item>好|はい|1</item>"]));

        let companion = CompanionBuilder::new(AppConfig::default())
            .with_llm(client.clone())
            .with_player(Arc::new(NullPlayer::new(Duration::from_secs(3))))
            .with_task_book(Arc::clone(&book))
            .in_memory()
            .build()
            .unwrap();
        assert!(companion.book.get(&id).is_some());

        assert!(companion.orchestrator.chat("一").await.is_ok());
        assert_eq!(companion.queue.snapshot().text.as_deref(), Some("好"));

        let clip = crate::playback::AudioClip::new(vec![0u8; 8], "audio/wav");
        companion.queue.advance();
        companion
            .queue
            .push(crate::stream::ResponseItem::new("晚安", "おやすみ", 0).with_audio(clip));
        assert!(companion.queue.snapshot().audio_playing);
        tokio::time::sleep(Duration::from_millis(2999)).await;
        assert!(companion.queue.snapshot().audio_playing);
        tokio::time::sleep(Duration::from_millis(2)).await;
        assert!(!companion.queue.snapshot().audio_playing);
    }
}
