//! 工具调度器
//!
//! 识别到 `<tool>` 时立即分配调用 ID 并在后台任务中执行，不阻塞流式接收；
//! 一轮模型输出结束后 `join` 等待本轮全部调用（单个失败不影响其他调用），
//! 每次调用输出结构化审计日志（JSON）。

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::core::{CompanionError, ConversationState};
use crate::stream::ToolInvocation;
use crate::tools::{ToolOutput, ToolRegistry};

/// 在途调用
pub struct PendingToolCall {
    pub id: String,
    pub name: String,
    pub raw_arguments: String,
    pub started_at: Instant,
    handle: JoinHandle<ToolOutput>,
}

/// 汇合后的调用结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolResult {
    pub id: String,
    pub name: String,
    pub ok: bool,
    pub data: Option<String>,
    pub error: Option<String>,
    pub continue_turn: bool,
}

#[derive(Serialize)]
struct ToolMessageBody<'a> {
    name: &'a str,
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a str>,
}

impl ToolResult {
    /// tool 消息正文：`{"name","ok","result","error"}`
    pub fn message_content(&self) -> String {
        let body = ToolMessageBody {
            name: &self.name,
            ok: self.ok,
            result: self.data.as_deref(),
            error: self.error.as_deref(),
        };
        serde_json::to_string(&body).unwrap_or_else(|_| format!("{{\"name\":\"{}\",\"ok\":{}}}", self.name, self.ok))
    }
}

/// 是否有结果要求续轮
pub fn needs_continuation(results: &[ToolResult]) -> bool {
    results.iter().any(|r| r.continue_turn)
}

/// 每轮新建一个；持有本轮全部在途调用
pub struct ToolDispatcher {
    registry: Arc<ToolRegistry>,
    state: Arc<ConversationState>,
    timeout: Duration,
    pending: Vec<PendingToolCall>,
}

impl ToolDispatcher {
    pub fn new(registry: Arc<ToolRegistry>, state: Arc<ConversationState>, timeout_secs: u64) -> Self {
        Self {
            registry,
            state,
            timeout: Duration::from_secs(timeout_secs.max(1)),
            pending: Vec::new(),
        }
    }

    /// 立即启动调用并返回调用 ID
    pub fn launch(&mut self, invocation: ToolInvocation) -> String {
        let id = format!("call_{}", uuid::Uuid::new_v4().simple());
        let ToolInvocation {
            name,
            arguments,
            raw_arguments,
        } = invocation;
        tracing::info!(id = %id, tool = %name, args = ?arguments, "Tool call launched");

        let guard = self.state.tool_started();
        let registry = Arc::clone(&self.registry);
        let limit = self.timeout;
        let tool_name = name.clone();
        let handle = tokio::spawn(async move {
            let _guard = guard;
            match timeout(limit, registry.call_by_name(&tool_name, arguments)).await {
                Ok(out) => out,
                Err(_) => ToolOutput::failed(
                    CompanionError::ToolExecution(format!("{} timed out after {}s", tool_name, limit.as_secs()))
                        .to_string(),
                ),
            }
        });

        self.pending.push(PendingToolCall {
            id: id.clone(),
            name,
            raw_arguments,
            started_at: Instant::now(),
            handle,
        });
        id
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn pending(&self) -> &[PendingToolCall] {
        &self.pending
    }

    /// 等待本轮全部调用，按启动顺序返回
    pub async fn join(&mut self) -> Vec<ToolResult> {
        let mut results = Vec::with_capacity(self.pending.len());
        for call in self.pending.drain(..) {
            let output = match call.handle.await {
                Ok(out) => out,
                Err(e) => ToolOutput::failed(CompanionError::ToolExecution(e.to_string()).to_string()),
            };
            let duration_ms = call.started_at.elapsed().as_millis() as u64;
            let audit = serde_json::json!({
                "event": "tool_audit",
                "tool": call.name,
                "id": call.id,
                "ok": output.ok,
                "continue": output.continue_turn,
                "duration_ms": duration_ms,
                "args_preview": args_preview(&call.raw_arguments),
            });
            tracing::info!(audit = %audit.to_string(), "tool");

            results.push(ToolResult {
                id: call.id,
                name: call.name,
                ok: output.ok,
                data: output.result,
                error: output.error,
                continue_turn: output.continue_turn,
            });
        }
        results
    }
}

impl Drop for ToolDispatcher {
    fn drop(&mut self) {
        for call in &self.pending {
            call.handle.abort();
        }
    }
}

fn args_preview(raw: &str) -> String {
    if raw.chars().count() > 200 {
        format!("{}...", raw.chars().take(200).collect::<String>())
    } else {
        raw.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use crate::tools::{EchoTool, Tool};

    struct Slow {
        delay: Duration,
        finished: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Tool for Slow {
        fn name(&self) -> &str {
            "slow"
        }

        fn description(&self) -> &str {
            "sleeps"
        }

        async fn call(&self, _args: Vec<String>) -> Result<ToolOutput, String> {
            tokio::time::sleep(self.delay).await;
            self.finished.fetch_add(1, Ordering::SeqCst);
            Ok(ToolOutput::done("slept"))
        }
    }

    struct Panics;

    #[async_trait]
    impl Tool for Panics {
        fn name(&self) -> &str {
            "panics"
        }

        fn description(&self) -> &str {
            ""
        }

        async fn call(&self, _args: Vec<String>) -> Result<ToolOutput, String> {
            panic!("tool crashed");
        }
    }

    fn invocation(name: &str, args: &[&str]) -> ToolInvocation {
        ToolInvocation {
            name: name.to_string(),
            arguments: args.iter().map(|s| s.to_string()).collect(),
            raw_arguments: args.join(","),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_launch_is_non_blocking_and_join_waits_all() {
        let finished = Arc::new(AtomicUsize::new(0));
        let mut registry = ToolRegistry::new();
        registry.register(Slow {
            delay: Duration::from_secs(5),
            finished: finished.clone(),
        });
        registry.register(EchoTool);
        let state = Arc::new(ConversationState::new());
        let mut dispatcher = ToolDispatcher::new(Arc::new(registry), state.clone(), 30);

        let slow_id = dispatcher.launch(invocation("slow", &[]));
        let echo_id = dispatcher.launch(invocation("echo", &["a", "b"]));
        let missing_id = dispatcher.launch(invocation("missing", &[]));
        assert!(state.is_tooling());
        assert_eq!(finished.load(Ordering::SeqCst), 0);

        let results = dispatcher.join().await;
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        assert!(!state.is_tooling());
        assert!(!dispatcher.has_pending());

        let ids: Vec<&str> = results.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec![slow_id.as_str(), echo_id.as_str(), missing_id.as_str()]);
        assert!(results[0].ok && !results[0].continue_turn);
        assert_eq!(results[1].data.as_deref(), Some("a, b"));
        assert!(results[1].continue_turn);
        assert!(!results[2].ok);
        assert_eq!(results[2].error.as_deref(), Some("Unknown tool: missing"));
        assert!(needs_continuation(&results));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_and_panic_are_contained() {
        let mut registry = ToolRegistry::new();
        registry.register(Slow {
            delay: Duration::from_secs(120),
            finished: Arc::new(AtomicUsize::new(0)),
        });
        registry.register(Panics);
        registry.register(EchoTool);
        let state = Arc::new(ConversationState::new());
        let mut dispatcher = ToolDispatcher::new(Arc::new(registry), state.clone(), 10);

        dispatcher.launch(invocation("slow", &[]));
        dispatcher.launch(invocation("panics", &[]));
        dispatcher.launch(invocation("echo", &["still here"]));
        let results = dispatcher.join().await;

        assert!(results[0].error.as_deref().unwrap().contains("timed out"));
        assert!(!results[1].ok);
        assert_eq!(results[2].data.as_deref(), Some("still here"));
        assert!(!state.is_tooling());
    }

    #[tokio::test]
    async fn test_ids_assigned_at_launch_carry_through_join() {
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool);
        let mut dispatcher = ToolDispatcher::new(Arc::new(registry), Arc::new(ConversationState::new()), 5);

        let first = dispatcher.launch(invocation("echo", &["一"]));
        let second = dispatcher.launch(invocation("missing", &[]));
        let launched: Vec<(&str, &str)> = dispatcher
            .pending()
            .iter()
            .map(|call| (call.id.as_str(), call.name.as_str()))
            .collect();
        assert_eq!(launched, vec![(first.as_str(), "echo"), (second.as_str(), "missing")]);

        let results = dispatcher.join().await;
        let ids: Vec<&str> = results.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec![first.as_str(), second.as_str()]);
        assert!(results[0].ok);
        assert!(!results[1].ok);
        assert!(!dispatcher.has_pending());
    }

    #[test]
    fn test_message_content_shape() {
        let result = ToolResult {
            id: "call_1".into(),
            name: "echo".into(),
            ok: true,
            data: Some("hi".into()),
            error: None,
            continue_turn: true,
        };
        let json: serde_json::Value = serde_json::from_str(&result.message_content()).unwrap();
        assert_eq!(json, serde_json::json!({"name": "echo", "ok": true, "result": "hi"}));
    }
}
