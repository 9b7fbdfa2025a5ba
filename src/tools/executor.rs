//! 工具执行器
//!
//! 持有 ToolRegistry 与全局超时，execute(tool_name, args, ctx) 在超时内调用 registry.execute，
//! 失败或超时转为 AgentError::Tool；每次调用输出结构化审计日志（JSON）。

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::time::timeout;

use crate::core::AgentError;
use crate::tools::{ToolContext, ToolError, ToolRegistry, ToolSpec};

/// 工具执行器：对每次调用施加超时，并将结果映射为 AgentError
#[derive(Clone)]
pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
    timeout: Duration,
}

impl ToolExecutor {
    pub fn new(registry: Arc<ToolRegistry>, timeout_secs: u64) -> Self {
        Self {
            registry,
            timeout: Duration::from_secs(timeout_secs),
        }
    }

    /// 执行指定工具；超时返回 ToolError::Timeout，工具失败保持原 ToolError；输出 JSON 审计日志
    pub async fn execute(&self, tool_name: &str, args: Value, ctx: &ToolContext) -> Result<String, AgentError> {
        let start = Instant::now();
        let args_preview = args_preview(&args);
        let ctx = ctx.clone().with_call_timeout(self.timeout);
        let result = timeout(self.timeout, self.registry.execute(tool_name, args, &ctx)).await;

        let (ok, outcome): (bool, &str) = match &result {
            Ok(Ok(_)) => (true, "ok"),
            Ok(Err(_)) => (false, "error"),
            Err(_) => (false, "timeout"),
        };
        let duration_ms = start.elapsed().as_millis() as u64;
        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": tool_name,
            "run_id": ctx.run_id,
            "branch": ctx.branch.as_str(),
            "ok": ok,
            "outcome": outcome,
            "duration_ms": duration_ms,
            "args_preview": args_preview,
        });
        tracing::info!(audit = %audit.to_string(), "tool");

        match result {
            Ok(Ok(content)) => Ok(content),
            Ok(Err(e)) => Err(AgentError::Tool(e)),
            Err(_) => Err(AgentError::Tool(ToolError::Timeout {
                tool: tool_name.to_string(),
                secs: self.timeout.as_secs(),
            })),
        }
    }

    pub fn thinking_tools(&self) -> Vec<ToolSpec> {
        self.registry.thinking_tools()
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }
}

fn args_preview(args: &Value) -> String {
    let s = args.to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::{BranchManagerConfig, MockSandboxProvider, SandboxBranchManager};
    use crate::tools::{WebLookup, WEB_TOOL};
    use async_trait::async_trait;
    use serde_json::json;

    struct SlowLookup;

    #[async_trait]
    impl WebLookup for SlowLookup {
        async fn lookup(&self, _query: &str) -> Result<String, String> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok("late".to_string())
        }
    }

    fn executor(timeout: Duration) -> ToolExecutor {
        ToolExecutor {
            registry: Arc::new(ToolRegistry::new(Arc::new(SlowLookup))),
            timeout,
        }
    }

    fn context() -> ToolContext {
        let manager = SandboxBranchManager::new(
            Arc::new(MockSandboxProvider::new()),
            BranchManagerConfig::default(),
        );
        ToolContext::new("run-exec", Arc::new(manager))
    }

    #[tokio::test]
    async fn test_executor_timeout() {
        let exec = executor(Duration::from_millis(20));
        let err = exec
            .execute(WEB_TOOL, json!({"query": "slow"}), &context())
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Tool(ToolError::Timeout { .. })));
    }

    #[tokio::test]
    async fn test_executor_unknown_tool() {
        let exec = executor(Duration::from_secs(1));
        let err = exec.execute("rm", json!({}), &context()).await.unwrap_err();
        assert!(matches!(err, AgentError::Tool(ToolError::UnknownTool(_))));
    }

    #[test]
    fn test_args_preview_truncates() {
        let long = json!({"code": "x".repeat(500)});
        assert!(args_preview(&long).ends_with("..."));
        assert_eq!(args_preview(&json!({"a": 1})), r#"{"a":1}"#);
    }
}
