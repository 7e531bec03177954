//! 对话持久化
//!
//! 聊天记录以 JSON Lines 追加写入（每行一条 role + content + 可选 tool_call_id + 时间），
//! 只追加、不改写，进程崩溃最多丢失最后一行。

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::memory::{Message, Role};

/// 追加写入的聊天记录文件
#[derive(Debug, Clone)]
pub struct TranscriptLog {
    path: PathBuf,
}

/// 文件中的一行
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// RFC 3339 写入时间
    pub at: String,
}

impl TranscriptLog {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 追加一条消息；父目录不存在时自动创建
    pub fn append(&self, msg: &Message) -> anyhow::Result<()> {
        self.append_all(std::slice::from_ref(msg))
    }

    pub fn append_all(&self, messages: &[Message]) -> anyhow::Result<()> {
        if messages.is_empty() {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let at = chrono::Utc::now().to_rfc3339();
        let mut buf = String::new();
        for m in messages {
            let entry = TranscriptEntry {
                role: m.role,
                content: m.content.clone(),
                tool_call_id: m.tool_call_id.clone(),
                at: at.clone(),
            };
            buf.push_str(&serde_json::to_string(&entry)?);
            buf.push('\n');
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(buf.as_bytes())?;
        Ok(())
    }

    /// 读取全部记录；文件不存在时返回空 Vec，损坏的行跳过
    pub fn load(&self) -> anyhow::Result<Vec<TranscriptEntry>> {
        let data = match std::fs::read_to_string(&self.path) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        Ok(data
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| match serde_json::from_str::<TranscriptEntry>(l) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    tracing::warn!("Skipping corrupt transcript line: {}", e);
                    None
                }
            })
            .collect())
    }

    /// 还原为 Message（丢弃时间戳）
    pub fn load_messages(&self) -> anyhow::Result<Vec<Message>> {
        Ok(self
            .load()?
            .into_iter()
            .map(|e| Message {
                role: e.role,
                content: e.content,
                tool_call_id: e.tool_call_id,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_only_preserves_order_and_call_ids() {
        let dir = tempfile::tempdir().unwrap();
        let log = TranscriptLog::new(dir.path().join("chat").join("transcript.jsonl"));

        log.append(&Message::user("你好")).unwrap();
        log.append_all(&[
            Message::assistant("<item>嗨|やあ|1</item>"),
            Message::tool("call_a", "{\"ok\":true}"),
        ])
        .unwrap();

        let messages = log.load_messages().unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0], Message::user("你好"));
        assert_eq!(messages[2].tool_call_id.as_deref(), Some("call_a"));
        assert_eq!(messages[2].role, Role::Tool);
    }

    #[test]
    fn test_missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let log = TranscriptLog::new(dir.path().join("none.jsonl"));
        assert!(log.load().unwrap().is_empty());
    }

    #[test]
    fn test_corrupt_line_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.jsonl");
        let log = TranscriptLog::new(&path);
        log.append(&Message::user("a")).unwrap();
        std::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .unwrap()
            .write_all(b"{not json\n")
            .unwrap();
        log.append(&Message::user("b")).unwrap();

        let contents: Vec<String> = log.load().unwrap().into_iter().map(|e| e.content).collect();
        assert_eq!(contents, vec!["a", "b"]);
    }
}
