//! Echo 工具（诊断用）：把参数原样交回模型

use async_trait::async_trait;

use crate::tools::{Tool, ToolOutput};

/// Echo 工具：回显参数并请求续轮
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "原样返回传入的参数（诊断用）"
    }

    async fn call(&self, args: Vec<String>) -> Result<ToolOutput, String> {
        if args.is_empty() {
            return Ok(ToolOutput::reply("(empty)"));
        }
        Ok(ToolOutput::reply(args.join(", ")))
    }
}
