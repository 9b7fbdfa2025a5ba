//! 错误恢复引擎
//!
//! 根据 AgentError 类型返回 RecoveryAction：工具层错误反馈给模型自行修正，传输层与沙箱不可用则终止。

use crate::core::{AgentError, RecoveryAction};
use crate::sandbox::SandboxError;
use crate::tools::ToolError;

#[derive(Debug, Default, Clone)]
pub struct RecoveryEngine;

impl RecoveryEngine {
    pub fn new() -> Self {
        Self
    }

    pub fn handle(&self, err: &AgentError) -> RecoveryAction {
        match err {
            // 分配重试已耗尽，继续推理也无法执行代码
            AgentError::Tool(ToolError::Sandbox(SandboxError::Unavailable { .. })) => RecoveryAction::Abort,
            AgentError::Tool(tool_err) => RecoveryAction::RetryWithPrompt(tool_feedback(tool_err)),
            _ => RecoveryAction::Abort,
        }
    }
}

fn tool_feedback(err: &ToolError) -> String {
    match err {
        ToolError::UnknownTool(name) => format!(
            "Error: there is no tool named '{name}'. Use only the tools listed in the instructions."
        ),
        ToolError::InvalidArguments { tool, message } => format!(
            "Error: invalid arguments for tool '{tool}': {message}. \
             Provide the arguments as a JSON object matching the tool's parameters and try again."
        ),
        ToolError::Execution { tool, message } => format!(
            "Error executing tool '{tool}': {message}. Please correct your approach and try again."
        ),
        ToolError::Timeout { tool, secs } => format!(
            "Error: tool '{tool}' did not finish within {secs}s. Try a smaller or faster request."
        ),
        ToolError::Sandbox(e) => format!(
            "Error: the code sandbox failed: {e}. The interpreter state will be restored on the next call; retry the code."
        ),
    }
}
