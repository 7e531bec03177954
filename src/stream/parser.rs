//! 增量标签解析器
//!
//! 模型输出按 delta 到达，`feed` 追加后从游标处向右扫描：遇到已注册标签的开头则等待对应闭合标签，
//! 闭合后交给该标签的语法解析成片段；未闭合或只到达一半的开头标签留在缓冲区等下一块。
//! 已扫过的位置不会重复扫描，标签外的普通文本进入 residual。
//! 多个语法按注册顺序组成固定的处理链，`<item>` 与 `<tool>` 可以任意交错。

use std::sync::OnceLock;

use regex::Regex;

use crate::core::CompanionError;
use crate::stream::{ResponseItem, Segment, ToolInvocation};

/// 一种标签语法：标签名 + 载荷解析
pub trait TagGrammar: Send + Sync {
    fn tag(&self) -> &'static str;

    /// Ok(None) 表示识别后静默丢弃
    fn parse(&self, payload: &str) -> Result<Option<Segment>, CompanionError>;
}

/// `<item>message|translation|emotionCode</item>`
#[derive(Debug, Default)]
pub struct ItemGrammar;

impl TagGrammar for ItemGrammar {
    fn tag(&self) -> &'static str {
        "item"
    }

    fn parse(&self, payload: &str) -> Result<Option<Segment>, CompanionError> {
        ResponseItem::parse(payload).map(|item| Some(Segment::Item(item)))
    }
}

/// `<tool><name>..</name><arguments>a, b</arguments></tool>`
#[derive(Debug, Default)]
pub struct ToolGrammar;

static TOOL_NAME_RE: OnceLock<Regex> = OnceLock::new();
static TOOL_ARGS_RE: OnceLock<Regex> = OnceLock::new();

impl TagGrammar for ToolGrammar {
    fn tag(&self) -> &'static str {
        "tool"
    }

    fn parse(&self, payload: &str) -> Result<Option<Segment>, CompanionError> {
        let name_re = TOOL_NAME_RE.get_or_init(|| Regex::new(r"(?s)<name>(.*?)</name>").unwrap());
        let args_re =
            TOOL_ARGS_RE.get_or_init(|| Regex::new(r"(?s)<arguments>(.*?)</arguments>").unwrap());

        let name = name_re
            .captures(payload)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().trim().to_string())
            .filter(|n| !n.is_empty())
            .ok_or_else(|| CompanionError::Parse {
                tag: "tool",
                reason: "missing <name>".to_string(),
            })?;
        let raw_arguments = args_re
            .captures(payload)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
            .unwrap_or_default();

        Ok(Some(Segment::ToolCall(ToolInvocation {
            name,
            arguments: split_arguments(&raw_arguments),
            raw_arguments,
        })))
    }
}

/// 识别并剔除某个标签，不产生片段（后台任务对话中忽略 `<tool>`）
#[derive(Debug)]
pub struct StripGrammar {
    tag: &'static str,
}

impl StripGrammar {
    pub fn new(tag: &'static str) -> Self {
        Self { tag }
    }
}

impl TagGrammar for StripGrammar {
    fn tag(&self) -> &'static str {
        self.tag
    }

    fn parse(&self, _payload: &str) -> Result<Option<Segment>, CompanionError> {
        Ok(None)
    }
}

/// 逗号切分，去空白与成对引号；全空时返回空列表
pub fn split_arguments(raw: &str) -> Vec<String> {
    if raw.trim().is_empty() {
        return Vec::new();
    }
    raw.split(',').map(|a| unquote(a.trim()).to_string()).collect()
}

fn unquote(s: &str) -> &str {
    for (open, close) in [('"', '"'), ('\'', '\''), ('“', '”'), ('‘', '’')] {
        if s.len() >= open.len_utf8() + close.len_utf8() && s.starts_with(open) && s.ends_with(close) {
            return s[open.len_utf8()..s.len() - close.len_utf8()].trim();
        }
    }
    s
}

/// 已识别开头、等待闭合的标签（偏移量相对 pending）
#[derive(Debug, Clone, Copy)]
struct OpenTag {
    grammar: usize,
    start: usize,
    payload_start: usize,
    /// 下次从这里查找闭合标签，已搜索过的载荷不再重复扫描
    search_from: usize,
}

enum OpenMatch {
    Full { grammar: usize, len: usize },
    /// 缓冲区末尾是某个开头标签的前缀
    Partial,
    None,
}

/// 增量标签解析器
pub struct ChunkParser {
    grammars: Vec<Box<dyn TagGrammar>>,
    /// 游标之后尚未消费的输入
    pending: String,
    /// 标签之外、已被消费的普通文本
    residual: String,
    open: Option<OpenTag>,
    dropped: usize,
}

impl ChunkParser {
    pub fn new() -> Self {
        Self {
            grammars: Vec::new(),
            pending: String::new(),
            residual: String::new(),
            open: None,
            dropped: 0,
        }
    }

    /// 用户对话：解析 `<item>` 并派发 `<tool>`
    pub fn for_chat() -> Self {
        Self::new().with_grammar(ItemGrammar).with_grammar(ToolGrammar)
    }

    /// 后台任务对话：解析 `<item>`，`<tool>` 只剔除不执行
    pub fn for_schedule() -> Self {
        Self::new()
            .with_grammar(ItemGrammar)
            .with_grammar(StripGrammar::new("tool"))
    }

    /// 按注册顺序追加语法；同一位置先注册者优先
    pub fn with_grammar(mut self, grammar: impl TagGrammar + 'static) -> Self {
        self.grammars.push(Box::new(grammar));
        self
    }

    /// 追加一块 delta，返回本次新闭合的片段（自左向右）
    pub fn feed(&mut self, delta: &str) -> Vec<Segment> {
        self.pending.push_str(delta);
        let mut segments = Vec::new();
        let mut cursor = 0;

        loop {
            if let Some(open) = self.open {
                let close = format!("</{}>", self.grammars[open.grammar].tag());
                match self.pending[open.search_from..].find(&close) {
                    Some(rel) => {
                        let end = open.search_from + rel;
                        let grammar = &self.grammars[open.grammar];
                        match grammar.parse(&self.pending[open.payload_start..end]) {
                            Ok(Some(seg)) => segments.push(seg),
                            Ok(None) => {}
                            Err(e) => {
                                self.dropped += 1;
                                tracing::warn!(
                                    payload = %&self.pending[open.payload_start..end],
                                    "Dropping segment: {}",
                                    e
                                );
                            }
                        }
                        cursor = end + close.len();
                        self.open = None;
                        continue;
                    }
                    None => {
                        // 闭合标签可能跨块到达：保留末尾 close.len()-1 字节再搜索
                        let back = self.pending.len().saturating_sub(close.len() - 1);
                        let search_from = floor_char_boundary(&self.pending, back).max(open.payload_start);
                        self.open = Some(OpenTag { search_from, ..open });
                        cursor = open.start;
                        break;
                    }
                }
            }

            match self.pending[cursor..].find('<') {
                None => {
                    self.residual.push_str(&self.pending[cursor..]);
                    cursor = self.pending.len();
                    break;
                }
                Some(rel) => {
                    let lt = cursor + rel;
                    self.residual.push_str(&self.pending[cursor..lt]);
                    match self.match_open(&self.pending[lt..]) {
                        OpenMatch::Full { grammar, len } => {
                            self.open = Some(OpenTag {
                                grammar,
                                start: lt,
                                payload_start: lt + len,
                                search_from: lt + len,
                            });
                            cursor = lt;
                        }
                        OpenMatch::Partial => {
                            cursor = lt;
                            break;
                        }
                        OpenMatch::None => {
                            self.residual.push('<');
                            cursor = lt + 1;
                        }
                    }
                }
            }
        }

        self.pending.drain(..cursor);
        if let Some(open) = self.open.as_mut() {
            open.start -= cursor;
            open.payload_start -= cursor;
            open.search_from -= cursor;
        }
        segments
    }

    fn match_open(&self, rest: &str) -> OpenMatch {
        let mut partial = false;
        for (idx, g) in self.grammars.iter().enumerate() {
            let open = format!("<{}>", g.tag());
            if rest.starts_with(&open) {
                return OpenMatch::Full {
                    grammar: idx,
                    len: open.len(),
                };
            }
            if open.starts_with(rest) {
                partial = true;
            }
        }
        if partial {
            OpenMatch::Partial
        } else {
            OpenMatch::None
        }
    }

    /// 去掉已闭合标签后的剩余缓冲：普通文本 + 未闭合部分
    pub fn residual(&self) -> String {
        format!("{}{}", self.residual, self.pending)
    }

    /// 仍在等待闭合的内容
    pub fn pending(&self) -> &str {
        &self.pending
    }

    /// 因格式错误丢弃的片段数
    pub fn dropped(&self) -> usize {
        self.dropped
    }

    /// 流结束：返回剩余缓冲，未闭合的标签记录一条日志
    pub fn finish(self) -> String {
        if !self.pending.is_empty() {
            tracing::debug!(pending = %self.pending, "Stream ended with unterminated tag");
        }
        self.residual()
    }
}

impl Default for ChunkParser {
    fn default() -> Self {
        Self::for_chat()
    }
}

fn floor_char_boundary(s: &str, mut idx: usize) -> usize {
    while idx > 0 && !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}
