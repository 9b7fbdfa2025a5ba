//! Agent 错误类型与恢复动作
//!
//! 与 RecoveryEngine 配合：工具层错误转成反馈给模型的提示（RetryWithPrompt），其余错误终止当前运行（Abort）。

use thiserror::Error;

use crate::llm::LlmError;
use crate::sandbox::SandboxError;
use crate::tools::ToolError;

/// 推理运行过程中可能出现的错误
#[derive(Error, Debug)]
pub enum AgentError {
    /// 模型请求失败（已按重试策略重试）
    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    /// 工具调用失败：未知工具、参数错误、执行错误或超时
    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    #[error("Sandbox error: {0}")]
    Sandbox(#[from] SandboxError),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Cancelled")]
    Cancelled,

    /// beam search 的所有候选均生成失败
    #[error("No viable candidate among {0} generated")]
    NoViableCandidate(usize),

    /// 集成模式下所有 agent 均失败
    #[error("All {count} agents failed: {failures}")]
    AllAgentsFailed { count: usize, failures: String },

    /// worker 池中的单元 panic 或超时
    #[error("Worker error: {0}")]
    Worker(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// 恢复引擎根据错误类型给出的建议动作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// 将说明作为工具结果反馈给模型，循环继续
    RetryWithPrompt(String),
    /// 终止当前运行
    Abort,
}
