//! 工具注册表
//!
//! 工具集合是封闭的：模型给出的 (name, arguments) 先解析为 [`ToolInvocation`]，参数形状在这一步检查；
//! 执行时由注册表注入环境上下文（运行 id、分支管理器、当前分支、后端凭据），调用方只传模型参数。

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

use crate::memory::FunctionCall;
use crate::sandbox::{BranchId, SandboxBranchManager, SandboxError};
use crate::tools::python::{self, PythonArgs};
use crate::tools::schema::ToolSpec;
use crate::tools::web::{self, WebArgs, WebLookup};
use crate::tools::wolfram::{self, WolframArgs, WolframClient};

pub const PYTHON_TOOL: &str = "python";
pub const WEB_TOOL: &str = "find_datapoint_on_web";
pub const WOLFRAM_TOOL: &str = "wolfram";

#[derive(Error, Debug)]
pub enum ToolError {
    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("invalid arguments for {tool}: {message}")]
    InvalidArguments { tool: String, message: String },

    #[error("{tool} failed: {message}")]
    Execution { tool: String, message: String },

    #[error("{tool} timed out after {secs}s")]
    Timeout { tool: String, secs: u64 },

    #[error(transparent)]
    Sandbox(#[from] SandboxError),
}

/// 已校验参数的工具调用
#[derive(Debug, Clone, PartialEq)]
pub enum ToolInvocation {
    Python(PythonArgs),
    Web(WebArgs),
    Wolfram(WolframArgs),
}

impl ToolInvocation {
    pub fn parse(name: &str, args: Value) -> Result<Self, ToolError> {
        match name {
            PYTHON_TOOL => decode(name, args).map(Self::Python),
            WEB_TOOL => decode(name, args).map(Self::Web),
            WOLFRAM_TOOL => decode(name, args).map(Self::Wolfram),
            other => Err(ToolError::UnknownTool(other.to_string())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Python(_) => PYTHON_TOOL,
            Self::Web(_) => WEB_TOOL,
            Self::Wolfram(_) => WOLFRAM_TOOL,
        }
    }
}

fn decode<T: DeserializeOwned>(tool: &str, args: Value) -> Result<T, ToolError> {
    serde_json::from_value(args).map_err(|e| ToolError::InvalidArguments {
        tool: tool.to_string(),
        message: e.to_string(),
    })
}

/// 解析模型给出的 JSON 参数字符串；空串、非法 JSON、非对象均为 InvalidArguments
pub fn parse_arguments(call: &FunctionCall) -> Result<Value, ToolError> {
    let invalid = |message: String| ToolError::InvalidArguments {
        tool: call.name.clone(),
        message,
    };
    if call.arguments.trim().is_empty() {
        return Err(invalid("arguments are missing".to_string()));
    }
    let value: Value = serde_json::from_str(&call.arguments)
        .map_err(|e| invalid(format!("arguments are not valid JSON ({e})")))?;
    if !value.is_object() {
        return Err(invalid("arguments must be a JSON object".to_string()));
    }
    Ok(value)
}

/// 注入给工具的运行上下文
#[derive(Clone)]
pub struct ToolContext {
    pub run_id: String,
    pub branches: Arc<SandboxBranchManager>,
    pub branch: BranchId,
    /// 单次工具调用的时限，由执行器设置；python 的请求时限不超过它
    pub call_timeout: Option<Duration>,
}

impl ToolContext {
    /// 以根分支为当前分支
    pub fn new(run_id: impl Into<String>, branches: Arc<SandboxBranchManager>) -> Self {
        Self {
            run_id: run_id.into(),
            branch: branches.root(),
            branches,
            call_timeout: None,
        }
    }

    pub fn with_call_timeout(mut self, limit: Duration) -> Self {
        self.call_timeout = Some(limit);
        self
    }

    pub fn on_branch(&self, branch: BranchId) -> Self {
        Self {
            branch,
            ..self.clone()
        }
    }
}

/// 思考工具注册表：python、网页检索，以及可选的 wolfram
pub struct ToolRegistry {
    web: Arc<dyn WebLookup>,
    wolfram: Option<Arc<dyn WolframClient>>,
}

impl ToolRegistry {
    pub fn new(web: Arc<dyn WebLookup>) -> Self {
        Self { web, wolfram: None }
    }

    pub fn with_wolfram(mut self, wolfram: Arc<dyn WolframClient>) -> Self {
        self.wolfram = Some(wolfram);
        self
    }

    pub fn has_wolfram(&self) -> bool {
        self.wolfram.is_some()
    }

    /// 提供给模型的思考工具描述
    pub fn thinking_tools(&self) -> Vec<ToolSpec> {
        let mut tools = vec![python::spec(), web::spec()];
        if self.has_wolfram() {
            tools.push(wolfram::spec());
        }
        tools
    }

    pub async fn execute(&self, name: &str, args: Value, ctx: &ToolContext) -> Result<String, ToolError> {
        match ToolInvocation::parse(name, args)? {
            ToolInvocation::Python(args) => python::run(&args, ctx).await,
            ToolInvocation::Web(args) => {
                self.web
                    .lookup(&args.query)
                    .await
                    .map_err(|message| ToolError::Execution {
                        tool: WEB_TOOL.to_string(),
                        message,
                    })
            }
            ToolInvocation::Wolfram(args) => {
                let client = self
                    .wolfram
                    .as_ref()
                    .ok_or_else(|| ToolError::UnknownTool(WOLFRAM_TOOL.to_string()))?;
                client.query(&args).await.map_err(|message| ToolError::Execution {
                    tool: WOLFRAM_TOOL.to_string(),
                    message,
                })
            }
        }
    }
}
