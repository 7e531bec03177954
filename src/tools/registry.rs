//! 工具注册表
//!
//! 所有工具实现 Tool trait（name / description / call），由 ToolRegistry 按名注册与查找；
//! 参数是 `<arguments>` 切分后的位置字符串。未注册或调用失败一律返回 `ok: false`，不向外抛错。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

/// 工具执行结果；`continue_turn` 为 true 时编排器会带着结果再请求一轮模型
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolOutput {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(rename = "continue")]
    pub continue_turn: bool,
}

impl ToolOutput {
    /// 成功，不需要续轮
    pub fn done(result: impl Into<String>) -> Self {
        Self {
            ok: true,
            result: Some(result.into()),
            error: None,
            continue_turn: false,
        }
    }

    /// 成功，并把结果交回模型
    pub fn reply(result: impl Into<String>) -> Self {
        Self {
            continue_turn: true,
            ..Self::done(result)
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            result: None,
            error: Some(error.into()),
            continue_turn: false,
        }
    }
}

/// 工具 trait：名称、描述（供模型理解，会渲染进系统提示词）、异步调用
#[async_trait]
pub trait Tool: Send + Sync {
    /// 工具名称（`<name>` 的内容）
    fn name(&self) -> &str;

    /// 工具描述；含“参数：/功能：”时原样展示，否则作为“功能：”展示
    fn description(&self) -> &str;

    async fn call(&self, args: Vec<String>) -> Result<ToolOutput, String>;
}

/// 工具注册表：按名称存储 Arc<dyn Tool>
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        let name = tool.name().to_string();
        self.tools.insert(name, Arc::new(tool));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// 按名调用；未注册名与工具内部错误都转为 `ok: false`
    pub async fn call_by_name(&self, name: &str, args: Vec<String>) -> ToolOutput {
        let Some(tool) = self.get(name) else {
            return ToolOutput::failed(format!("Unknown tool: {name}"));
        };
        match tool.call(args).await {
            Ok(out) => out,
            Err(e) => {
                tracing::warn!(tool = name, "Tool failed: {}", e);
                ToolOutput::failed(e)
            }
        }
    }

    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// 提示词中的工具列表（每个工具一段 `- 名称：xxx`）
    pub fn describe(&self) -> Vec<String> {
        self.tool_names()
            .iter()
            .filter_map(|name| self.tools.get(name))
            .map(|tool| {
                let base = format!("- 名称：{}", tool.name());
                let desc = tool.description().trim();
                if desc.is_empty() {
                    return base;
                }
                if desc.contains("参数：") || desc.contains("功能：") {
                    format!("{base}\n  {desc}")
                } else {
                    format!("{base}\n  功能：{desc}")
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::EchoTool;

    struct Broken;

    #[async_trait]
    impl Tool for Broken {
        fn name(&self) -> &str {
            "broken"
        }

        fn description(&self) -> &str {
            ""
        }

        async fn call(&self, _args: Vec<String>) -> Result<ToolOutput, String> {
            Err("disk on fire".to_string())
        }
    }

    #[tokio::test]
    async fn test_unknown_tool_is_failed_output() {
        let registry = ToolRegistry::new();
        let out = registry.call_by_name("nope", vec![]).await;
        assert_eq!(out, ToolOutput::failed("Unknown tool: nope"));
    }

    #[tokio::test]
    async fn test_tool_error_becomes_failed_output() {
        let mut registry = ToolRegistry::new();
        registry.register(Broken);
        let out = registry.call_by_name("broken", vec![]).await;
        assert!(!out.ok);
        assert_eq!(out.error.as_deref(), Some("disk on fire"));
        assert!(!out.continue_turn);
    }

    #[test]
    fn test_describe_lists_sorted_tools() {
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool);
        registry.register(Broken);
        let lines = registry.describe();
        assert_eq!(lines[0], "- 名称：broken");
        assert!(lines[1].starts_with("- 名称：echo\n  功能："));
    }

    #[test]
    fn test_output_serializes_continue_key() {
        let json = serde_json::to_value(ToolOutput::reply("hi")).unwrap();
        assert_eq!(json["continue"], true);
        assert!(json.get("error").is_none());
    }
}
