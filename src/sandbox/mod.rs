//! 代码沙箱层：沙箱与提供方抽象、分支树管理、按运行隔离的存储
//!
//! - **CodeSandbox**：有状态的 Python 执行环境（run 之间保留变量）
//! - **SandboxProvider**：分配 / 释放沙箱（远程服务或内存 Mock）
//! - **SandboxBranchManager**：可分叉的命令分支树，惰性分配沙箱并重放历史
//! - **SandboxStore**：按运行 id 持有分支管理器，显式清理

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod branch;
pub mod mock;
pub mod remote;
pub mod store;

pub use branch::{BranchId, BranchLease, BranchManagerConfig, SandboxBranchManager};
pub use mock::{MockSandbox, MockSandboxProvider};
pub use remote::HttpSandboxProvider;
pub use store::SandboxStore;

/// 解释器内抛出的异常
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionError {
    pub name: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub traceback: String,
}

/// 一次执行的结果
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionOutput {
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    /// 结构化结果（如最后一个表达式的值）的文本表示
    #[serde(default)]
    pub results: Vec<String>,
    #[serde(default)]
    pub error: Option<ExecutionError>,
}

impl ExecutionOutput {
    /// 渲染为给模型看的工具结果
    pub fn render(&self) -> String {
        let mut sections = Vec::new();
        if !self.stdout.trim().is_empty() {
            sections.push(format!("stdout:\n{}", self.stdout.trim_end()));
        }
        if !self.stderr.trim().is_empty() {
            sections.push(format!("stderr:\n{}", self.stderr.trim_end()));
        }
        if !self.results.is_empty() {
            sections.push(format!("results:\n{}", self.results.join("\n")));
        }
        if let Some(err) = &self.error {
            let mut text = format!("error: {}: {}", err.name, err.message);
            if !err.traceback.trim().is_empty() {
                text.push('\n');
                text.push_str(err.traceback.trim_end());
            }
            sections.push(text);
        }
        if sections.is_empty() {
            "(no output)".to_string()
        } else {
            sections.join("\n\n")
        }
    }
}

#[derive(Error, Debug)]
pub enum SandboxError {
    /// 分配重试耗尽
    #[error("sandbox unavailable after {attempts} attempts: {message}")]
    Unavailable { attempts: u32, message: String },

    #[error("sandbox request failed: {0}")]
    Transport(String),

    /// 单次执行超过时限；沙箱状态未知，已释放
    #[error("sandbox call timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("branch not found: {0}")]
    BranchNotFound(BranchId),

    #[error("replay of branch {branch} failed at command {index}: {message}")]
    Replay {
        branch: BranchId,
        index: usize,
        message: String,
    },

    #[error("branch lineage of {0} is corrupt")]
    CorruptLineage(BranchId),
}

/// 有状态的代码执行环境
#[async_trait]
pub trait CodeSandbox: Send + Sync {
    fn id(&self) -> &str;

    /// 执行代码；解释器异常放在 ExecutionOutput::error，只有沙箱本身失败才返回 Err
    async fn run(&self, code: &str, timeout: Option<Duration>) -> Result<ExecutionOutput, SandboxError>;
}

/// 沙箱分配方
#[async_trait]
pub trait SandboxProvider: Send + Sync {
    async fn allocate(&self) -> Result<Arc<dyn CodeSandbox>, SandboxError>;

    async fn release(&self, sandbox: Arc<dyn CodeSandbox>);
}
