//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `COMPANION__*` 覆盖（双下划线表示嵌套，如 `COMPANION__LLM__MODEL=deepseek-chat`）。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::llm::deepseek::{DEEPSEEK_BASE_URL, DEEPSEEK_CHAT};

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub conversation: ConversationSection,
    pub tools: ToolsSection,
    pub scheduler: SchedulerSection,
    pub tts: TtsSection,
}

/// [app] 段：应用名、数据目录（对话记录与任务快照）
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppSection {
    pub name: Option<String>,
    /// 未设置时用 ./data
    pub data_dir: Option<PathBuf>,
}

impl AppSection {
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| PathBuf::from("data"))
    }
}

/// [llm] 段：OpenAI 兼容端点
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_model")]
    pub model: String,
    /// 未设置时读 OPENAI_API_KEY / DEEPSEEK_API_KEY
    pub api_key: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

fn default_base_url() -> String {
    DEEPSEEK_BASE_URL.to_string()
}

fn default_model() -> String {
    DEEPSEEK_CHAT.to_string()
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_tokens() -> u32 {
    2000
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            model: default_model(),
            api_key: None,
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
        }
    }
}

impl LlmSection {
    /// 配置优先，其次环境变量；空串视为未配置
    pub fn resolved_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .or_else(|| std::env::var("DEEPSEEK_API_KEY").ok())
            .filter(|k| !k.trim().is_empty())
    }
}

/// [conversation] 段：展示节奏、空闲超时、历史窗口、角色设定
#[derive(Debug, Clone, Deserialize)]
pub struct ConversationSection {
    #[serde(default = "default_pace_delay_ms")]
    pub pace_delay_ms: u64,
    #[serde(default = "default_true")]
    pub auto_play: bool,
    #[serde(default)]
    pub default_emotion: u32,
    #[serde(default = "default_inactivity_timeout_secs")]
    pub inactivity_timeout_secs: u64,
    #[serde(default = "default_history_max_length")]
    pub history_max_length: usize,
    #[serde(default)]
    pub character_prompt: String,
}

fn default_pace_delay_ms() -> u64 {
    2000
}

fn default_true() -> bool {
    true
}

fn default_inactivity_timeout_secs() -> u64 {
    15
}

fn default_history_max_length() -> usize {
    100
}

impl Default for ConversationSection {
    fn default() -> Self {
        Self {
            pace_delay_ms: default_pace_delay_ms(),
            auto_play: true,
            default_emotion: 0,
            inactivity_timeout_secs: default_inactivity_timeout_secs(),
            history_max_length: default_history_max_length(),
            character_prompt: String::new(),
        }
    }
}

impl ConversationSection {
    pub fn pace_delay(&self) -> Duration {
        Duration::from_millis(self.pace_delay_ms)
    }

    /// 限制在 [15s, 300s]
    pub fn inactivity_timeout(&self) -> Duration {
        crate::playback::watchdog::clamp_timeout(self.inactivity_timeout_secs)
    }
}

/// [tools] 段：续轮上限与单次工具超时
#[derive(Debug, Clone, Deserialize)]
pub struct ToolsSection {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    /// 单次工具调用超时（秒）
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,
}

fn default_max_iterations() -> usize {
    2
}

fn default_tool_timeout_secs() -> u64 {
    30
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            tool_timeout_secs: default_tool_timeout_secs(),
        }
    }
}

/// [scheduler] 段：心跳间隔、后台任务是否可调用工具、任务快照路径
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerSection {
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default)]
    pub allow_tools: bool,
    /// 没有待办任务时让角色规划下一次主动聊天
    #[serde(default)]
    pub reflect_on_idle: bool,
    /// 未设置时为 <data_dir>/schedule.json
    pub state_path: Option<PathBuf>,
}

fn default_heartbeat_interval_ms() -> u64 {
    5000
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            allow_tools: false,
            reflect_on_idle: false,
            state_path: None,
        }
    }
}

impl SchedulerSection {
    /// 限制在 [1s, 1h]
    pub fn heartbeat_interval(&self) -> Duration {
        crate::core::task_scheduler::clamp_heartbeat(self.heartbeat_interval_ms)
    }
}

/// 语音合成引擎
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum TtsEngine {
    #[default]
    StyleBertVits2,
    BertVits2,
}

/// [tts] 段：VITS 服务地址与引擎参数
#[derive(Debug, Clone, Deserialize)]
pub struct TtsSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_tts_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub engine: TtsEngine,
    /// Style-Bert-VITS2 音色
    #[serde(default = "default_ident")]
    pub ident: String,
    #[serde(default)]
    pub sdp_ratio: f32,
    #[serde(default = "default_one")]
    pub length_scale: f32,
    #[serde(default)]
    pub bert_vits2: BertVits2Section,
}

fn default_tts_base_url() -> String {
    "127.0.0.1:23456".to_string()
}

fn default_ident() -> String {
    "Anneli".to_string()
}

fn default_one() -> f32 {
    1.0
}

impl Default for TtsSection {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: default_tts_base_url(),
            engine: TtsEngine::default(),
            ident: default_ident(),
            sdp_ratio: 0.0,
            length_scale: 1.0,
            bert_vits2: BertVits2Section::default(),
        }
    }
}

/// [tts.bert_vits2] 段
#[derive(Debug, Clone, Deserialize)]
pub struct BertVits2Section {
    #[serde(default)]
    pub speaker_id: u32,
    #[serde(default = "default_format")]
    pub format: String,
    #[serde(default = "default_lang")]
    pub lang: String,
    #[serde(default = "default_one")]
    pub length: f32,
    #[serde(default = "default_noise")]
    pub noise: f32,
    #[serde(default = "default_noisew")]
    pub noisew: f32,
    #[serde(default = "default_segment_size")]
    pub segment_size: u32,
    #[serde(default = "default_bv2_sdp_ratio")]
    pub sdp_ratio: f32,
}

fn default_format() -> String {
    "wav".to_string()
}

fn default_lang() -> String {
    "zh".to_string()
}

fn default_noise() -> f32 {
    0.33
}

fn default_noisew() -> f32 {
    0.4
}

fn default_segment_size() -> u32 {
    50
}

fn default_bv2_sdp_ratio() -> f32 {
    0.2
}

impl Default for BertVits2Section {
    fn default() -> Self {
        Self {
            speaker_id: 0,
            format: default_format(),
            lang: default_lang(),
            length: 1.0,
            noise: default_noise(),
            noisew: default_noisew(),
            segment_size: default_segment_size(),
            sdp_ratio: default_bv2_sdp_ratio(),
        }
    }
}

impl AppConfig {
    pub fn transcript_path(&self) -> PathBuf {
        self.app.data_dir().join("transcript.jsonl")
    }

    pub fn schedule_path(&self) -> PathBuf {
        self.scheduler
            .state_path
            .clone()
            .unwrap_or_else(|| self.app.data_dir().join("schedule.json"))
    }
}

/// 从 config 目录加载配置，环境变量 COMPANION__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 COMPANION__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("COMPANION")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

/// 加载失败时回退默认配置
pub fn load_config_or_default(config_path: Option<PathBuf>) -> AppConfig {
    match load_config(config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::warn!("Failed to load config, using defaults: {}", e);
            AppConfig::default()
        }
    }
}
