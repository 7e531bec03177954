//! 对话编排：把一次请求串成完整的轮次
//!
//! 流式增量 -> ChunkParser -> `<item>` 入 PlaybackQueue（可选先合成语音）/ `<tool>` 交给 ToolDispatcher；
//! 一轮输出结束后汇合工具结果，需要续轮时把 tool 消息追加进 transcript 再请求模型，至多 `max_iterations` 轮。
//! 只有模型流传输失败会提前结束轮次，已积累的 transcript 仍会返回。

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures_util::StreamExt;

use crate::config::AppConfig;
use crate::core::task_scheduler::{AgentActionInvoker, OutdatedTiming};
use crate::core::{CompanionError, ConversationState};
use crate::llm::{ModelStreamClient, OpenAiClient};
use crate::memory::{ChatHistory, Message, Role, TranscriptLog};
use crate::playback::{AudioSynthesis, PlaybackQueue};
use crate::prompt::{system_prompt, wrap_schedule, wrap_user_message, Scenario, IDLE_REFLECTION};
use crate::stream::{ChunkParser, ResponseItem, Segment};
use crate::tools::{needs_continuation, ToolDispatcher, ToolRegistry};

/// 从配置创建模型客户端；没有可用的 API Key 时返回 None（对话轮次会以错误结束）
pub fn create_llm_from_config(cfg: &AppConfig) -> Option<Arc<dyn ModelStreamClient>> {
    match OpenAiClient::from_config(&cfg.llm) {
        Ok(client) => {
            tracing::info!(model = %cfg.llm.model, base_url = %cfg.llm.base_url, "Model client ready");
            Some(Arc::new(client))
        }
        Err(e) => {
            tracing::warn!("Model client unavailable: {}", e);
            None
        }
    }
}

/// 编排参数
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub max_iterations: usize,
    pub tool_timeout_secs: u64,
    pub history_max_length: usize,
    pub character_prompt: String,
    /// 后台任务是否可以调用工具
    pub allow_scheduled_tools: bool,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            max_iterations: 2,
            tool_timeout_secs: 30,
            history_max_length: 100,
            character_prompt: String::new(),
            allow_scheduled_tools: false,
        }
    }
}

impl OrchestratorSettings {
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            max_iterations: cfg.tools.max_iterations.max(1),
            tool_timeout_secs: cfg.tools.tool_timeout_secs,
            history_max_length: cfg.conversation.history_max_length,
            character_prompt: cfg.conversation.character_prompt.clone(),
            allow_scheduled_tools: cfg.scheduler.allow_tools,
        }
    }
}

/// 单轮参数
#[derive(Debug, Clone, Copy)]
pub struct TurnOptions {
    pub max_iterations: usize,
    /// false 时 `<tool>` 只被剥离，不执行
    pub dispatch_tools: bool,
}

/// 一轮对话的结果：本轮新增的消息（assistant / tool）与可选的终止错误
#[derive(Debug, Clone, Default)]
pub struct TurnOutcome {
    pub transcript: Vec<Message>,
    pub error: Option<String>,
}

impl TurnOutcome {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    fn failed(error: impl Into<String>) -> Self {
        Self {
            transcript: Vec::new(),
            error: Some(error.into()),
        }
    }

    /// 本轮 assistant 输出拼接
    pub fn assistant_text(&self) -> String {
        self.transcript
            .iter()
            .filter(|m| m.role == Role::Assistant)
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// 对话编排器：每个会话一个实例
pub struct ConversationOrchestrator {
    llm: Option<Arc<dyn ModelStreamClient>>,
    registry: Arc<ToolRegistry>,
    queue: PlaybackQueue,
    state: Arc<ConversationState>,
    synthesis: Option<Arc<dyn AudioSynthesis>>,
    history: Mutex<ChatHistory>,
    transcript_log: Option<TranscriptLog>,
    settings: OrchestratorSettings,
    /// 同一时刻只有一轮在跑（用户对话与后台任务共用）
    turn_lock: tokio::sync::Mutex<()>,
}

impl ConversationOrchestrator {
    pub fn new(
        llm: Option<Arc<dyn ModelStreamClient>>,
        registry: Arc<ToolRegistry>,
        queue: PlaybackQueue,
        settings: OrchestratorSettings,
    ) -> Self {
        let state = Arc::clone(queue.state());
        Self {
            llm,
            registry,
            queue,
            state,
            synthesis: None,
            history: Mutex::new(ChatHistory::new()),
            transcript_log: None,
            settings,
            turn_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn with_synthesis(mut self, synthesis: Arc<dyn AudioSynthesis>) -> Self {
        self.synthesis = Some(synthesis);
        self
    }

    /// 追加写入对话记录；已有记录会载入为历史
    pub fn with_transcript_log(mut self, log: TranscriptLog) -> Self {
        match log.load_messages() {
            Ok(messages) => {
                let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
                for msg in messages {
                    history.push(msg);
                }
            }
            Err(e) => tracing::warn!(path = %log.path().display(), "Failed to load transcript: {}", e),
        }
        self.transcript_log = Some(log);
        self
    }

    pub fn queue(&self) -> &PlaybackQueue {
        &self.queue
    }

    pub fn state(&self) -> &Arc<ConversationState> {
        &self.state
    }

    pub fn history(&self) -> Vec<Message> {
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .messages()
            .to_vec()
    }

    pub fn clear_history(&self) {
        self.history.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    /// 用户发来一条消息
    pub async fn chat(&self, user_text: &str) -> TurnOutcome {
        let _turn = self.turn_lock.lock().await;
        let Some(llm) = self.llm.clone() else {
            return TurnOutcome::failed(
                CompanionError::Config("model client not configured".into()).to_string(),
            );
        };
        let text = user_text.trim();
        if text.is_empty() {
            return TurnOutcome::failed("empty message");
        }

        let mut messages = vec![Message::system(system_prompt(
            Scenario::Chat,
            &self.registry.describe(),
            &self.settings.character_prompt,
        ))];
        messages.extend(
            self.history
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .window(self.settings.history_max_length),
        );
        messages.push(Message::user(wrap_user_message(text)));

        self.state.touch();
        let outcome = self
            .run_turn(
                llm.as_ref(),
                messages,
                TurnOptions {
                    max_iterations: self.settings.max_iterations,
                    dispatch_tools: true,
                },
            )
            .await;

        let user = Message::user(text);
        self.record(&user, &outcome.transcript);
        outcome
    }

    /// 定时任务到点：角色主动开口；不写入对话历史
    pub async fn run_scheduled(&self, content: &str) -> TurnOutcome {
        self.scheduled_turn(content, self.settings.allow_scheduled_tools).await
    }

    /// 调度器空闲：让角色给自己定下一次主动聊天；这一轮总是可以调用工具
    pub async fn reflect_on_idle(&self) -> TurnOutcome {
        self.scheduled_turn(IDLE_REFLECTION, true).await
    }

    async fn scheduled_turn(&self, content: &str, allow_tools: bool) -> TurnOutcome {
        let _turn = self.turn_lock.lock().await;
        let Some(llm) = self.llm.clone() else {
            return TurnOutcome::failed(
                CompanionError::Config("model client not configured".into()).to_string(),
            );
        };

        let tools = if allow_tools { self.registry.describe() } else { Vec::new() };
        let messages = vec![
            Message::system(system_prompt(
                Scenario::Schedule,
                &tools,
                &self.settings.character_prompt,
            )),
            Message::user(wrap_schedule(content)),
        ];
        let options = TurnOptions {
            max_iterations: if allow_tools { self.settings.max_iterations } else { 1 },
            dispatch_tools: allow_tools,
        };
        self.run_turn(llm.as_ref(), messages, options).await
    }

    /// 跑完一轮（可能包含多次模型请求）；结束时根据延迟清空标记决定回到空闲还是继续展示
    pub async fn run_turn(
        &self,
        llm: &dyn ModelStreamClient,
        mut messages: Vec<Message>,
        options: TurnOptions,
    ) -> TurnOutcome {
        self.state.begin_stream();
        let outcome = self.stream_rounds(llm, &mut messages, options).await;
        if self.state.end_stream() {
            tracing::info!("Clearing stage after stream (inactivity timeout fired mid-turn)");
            self.queue.stop_to_idle();
        } else {
            self.queue.try_advance();
        }
        outcome
    }

    async fn stream_rounds(
        &self,
        llm: &dyn ModelStreamClient,
        messages: &mut Vec<Message>,
        options: TurnOptions,
    ) -> TurnOutcome {
        let mut outcome = TurnOutcome::default();
        let max_iterations = options.max_iterations.max(1);

        for round in 1..=max_iterations {
            let mut parser = if options.dispatch_tools {
                ChunkParser::for_chat()
            } else {
                ChunkParser::for_schedule()
            };
            let mut dispatcher = ToolDispatcher::new(
                Arc::clone(&self.registry),
                Arc::clone(&self.state),
                self.settings.tool_timeout_secs,
            );
            let mut raw = String::new();

            let transport_error = match llm.stream(messages).await {
                Ok(mut deltas) => {
                    let mut failed = None;
                    while let Some(delta) = deltas.next().await {
                        match delta {
                            Ok(text) => {
                                raw.push_str(&text);
                                for segment in parser.feed(&text) {
                                    self.handle_segment(segment, &mut dispatcher).await;
                                }
                            }
                            Err(e) => {
                                failed = Some(CompanionError::from(e));
                                break;
                            }
                        }
                    }
                    failed
                }
                Err(e) => Some(CompanionError::from(e)),
            };

            let residual = parser.finish();
            if !residual.trim().is_empty() {
                tracing::debug!(residual = %residual, "Unconsumed model output");
            }

            if let Some(e) = transport_error {
                tracing::warn!(round, "Turn ended early: {}", e);
                // 已发出的工具调用仍然汇合，不泄漏到下一轮
                let _ = dispatcher.join().await;
                if !raw.trim().is_empty() {
                    let msg = Message::assistant(raw);
                    messages.push(msg.clone());
                    outcome.transcript.push(msg);
                }
                outcome.error = Some(e.to_string());
                return outcome;
            }

            let assistant = Message::assistant(raw);
            messages.push(assistant.clone());
            outcome.transcript.push(assistant);

            if !dispatcher.has_pending() {
                break;
            }
            let results = dispatcher.join().await;
            if !needs_continuation(&results) {
                break;
            }
            if round == max_iterations {
                tracing::info!(max_iterations, "Tool continuation limit reached, stopping turn");
                break;
            }
            for result in &results {
                let msg = Message::tool(result.id.clone(), result.message_content());
                messages.push(msg.clone());
                outcome.transcript.push(msg);
            }
            tracing::debug!(round, tools = results.len(), "Continuing turn with tool results");
        }
        outcome
    }

    async fn handle_segment(&self, segment: Segment, dispatcher: &mut ToolDispatcher) {
        match segment {
            Segment::Item(item) => {
                let item = self.attach_audio(item).await;
                self.queue.push(item);
            }
            Segment::ToolCall(invocation) => {
                let id = dispatcher.launch(invocation);
                tracing::debug!(id = %id, "Tool call launched");
            }
        }
    }

    async fn attach_audio(&self, item: ResponseItem) -> ResponseItem {
        let Some(synthesis) = &self.synthesis else {
            return item;
        };
        let text = if item.translated_text.trim().is_empty() {
            item.text.clone()
        } else {
            item.translated_text.clone()
        };
        match synthesis.synthesize(&text).await {
            Ok(clip) => item.with_audio(clip),
            Err(e) => {
                let e = CompanionError::Synthesis(e.to_string());
                tracing::warn!("{}; showing text only", e);
                item
            }
        }
    }

    fn record(&self, user: &Message, transcript: &[Message]) {
        {
            let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
            history.push(user.clone());
            for msg in transcript {
                history.push(msg.clone());
            }
        }
        if let Some(log) = &self.transcript_log {
            if let Err(e) = log.append(user).and_then(|_| log.append_all(transcript)) {
                tracing::warn!("{}", CompanionError::Persistence(e.to_string()));
            }
        }
    }
}

#[async_trait]
impl AgentActionInvoker for ConversationOrchestrator {
    async fn execute(&self, content: &str) -> Result<(), CompanionError> {
        let outcome = self.run_scheduled(content).await;
        match outcome.error {
            None => Ok(()),
            Some(e) => Err(CompanionError::SchedulerExecution(e)),
        }
    }

    async fn on_outdated(&self, content: &str, timing: OutdatedTiming) -> Result<(), CompanionError> {
        tracing::info!(
            scheduled_at = timing.scheduled_at,
            outdated_at = timing.outdated_at,
            "Scheduled task expired before running: {}",
            content
        );
        Ok(())
    }
}
