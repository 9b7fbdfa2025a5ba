//! python 工具：在当前分支的沙箱中执行代码
//!
//! 沙箱由分支管理器按需分配并重放历史；解释器异常作为正常结果返回给模型，只有沙箱本身失败才是错误。

use std::time::Duration;

use schemars::JsonSchema;
use serde::Deserialize;

use crate::tools::schema::{parameters_schema, ToolSpec};
use crate::tools::{ToolContext, ToolError, PYTHON_TOOL};

#[derive(Debug, Clone, PartialEq, Deserialize, JsonSchema)]
pub struct PythonArgs {
    /// Python source to execute. Variables, imports and definitions persist between calls.
    pub code: String,
    /// Optional execution timeout in seconds.
    #[serde(default)]
    pub timeout: Option<u64>,
}

pub fn spec() -> ToolSpec {
    ToolSpec::function(
        PYTHON_TOOL,
        "Execute Python code in a stateful interpreter. State persists across calls. \
         Returns stdout, stderr, the value of the last expression and any exception with its traceback.",
        parameters_schema::<PythonArgs>(),
    )
}

pub async fn run(args: &PythonArgs, ctx: &ToolContext) -> Result<String, ToolError> {
    if args.code.trim().is_empty() {
        return Err(ToolError::InvalidArguments {
            tool: PYTHON_TOOL.to_string(),
            message: "`code` must not be empty".to_string(),
        });
    }
    let timeout = effective_timeout(args.timeout.map(Duration::from_secs), ctx.call_timeout);
    let output = ctx.branches.execute(&ctx.branch, &args.code, timeout).await?;
    tracing::debug!(run_id = %ctx.run_id, branch = %ctx.branch, failed = output.error.is_some(), "python executed");
    Ok(output.render())
}

/// 请求时限与调用时限取较小者；两者都没有时不限时
fn effective_timeout(requested: Option<Duration>, cap: Option<Duration>) -> Option<Duration> {
    match (requested, cap) {
        (Some(requested), Some(cap)) => Some(requested.min(cap)),
        (requested, cap) => requested.or(cap),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::{BranchManagerConfig, MockSandboxProvider, SandboxBranchManager};
    use std::sync::Arc;

    fn context() -> ToolContext {
        let manager = SandboxBranchManager::new(
            Arc::new(MockSandboxProvider::new()),
            BranchManagerConfig::default(),
        );
        ToolContext::new("run-1", Arc::new(manager))
    }

    #[tokio::test]
    async fn test_python_records_into_branch() {
        let ctx = context();
        let args = PythonArgs {
            code: "print(6)".to_string(),
            timeout: None,
        };
        let out = run(&args, &ctx).await.unwrap();
        assert!(out.contains("ran: print(6)"));
        assert_eq!(ctx.branches.effective_history(&ctx.branch).unwrap(), vec!["print(6)"]);
    }

    #[tokio::test]
    async fn test_python_interpreter_error_is_a_result() {
        let ctx = context();
        let args = PythonArgs {
            code: "raise ValueError()".to_string(),
            timeout: Some(5),
        };
        let out = run(&args, &ctx).await.unwrap();
        assert!(out.contains("error: RuntimeError"));
    }

    #[test]
    fn test_effective_timeout_is_capped() {
        let secs = Duration::from_secs;
        assert_eq!(effective_timeout(Some(secs(120)), Some(secs(60))), Some(secs(60)));
        assert_eq!(effective_timeout(Some(secs(5)), Some(secs(60))), Some(secs(5)));
        assert_eq!(effective_timeout(None, Some(secs(60))), Some(secs(60)));
        assert_eq!(effective_timeout(Some(secs(5)), None), Some(secs(5)));
        assert_eq!(effective_timeout(None, None), None);
    }

    #[tokio::test]
    async fn test_python_empty_code_rejected() {
        let ctx = context();
        let args = PythonArgs {
            code: "  ".to_string(),
            timeout: None,
        };
        assert!(matches!(
            run(&args, &ctx).await,
            Err(ToolError::InvalidArguments { .. })
        ));
    }
}
