//! 集成测试共用的替身：固定网页检索、按模型名分发的 LLM 工厂、Mock 沙箱运行时

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use reasoner::config::{AgentConfig, AppConfig};
use reasoner::core::AgentError;
use reasoner::llm::LlmClient;
use reasoner::memory::{Message, ToolCall};
use reasoner::sandbox::{BranchManagerConfig, MockSandboxProvider, SandboxBranchManager};
use reasoner::tools::{ToolExecutor, ToolRegistry, WebLookup};
use reasoner::{LlmFactory, Runtime};

pub struct StaticLookup;

#[async_trait]
impl WebLookup for StaticLookup {
    async fn lookup(&self, query: &str) -> Result<String, String> {
        Ok(format!("web answer for: {query}"))
    }
}

/// 按 agent.model 取客户端；未登记的模型报配置错误
#[derive(Default)]
pub struct MockFactory {
    clients: HashMap<String, Arc<dyn LlmClient>>,
}

impl MockFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, model: &str, client: Arc<dyn LlmClient>) -> Self {
        self.clients.insert(model.to_string(), client);
        self
    }
}

impl LlmFactory for MockFactory {
    fn create(&self, agent: &AgentConfig) -> Result<Arc<dyn LlmClient>, AgentError> {
        self.clients
            .get(&agent.model)
            .cloned()
            .ok_or_else(|| AgentError::Config(format!("no client for {}", agent.model)))
    }
}

pub fn agent(model: &str) -> AgentConfig {
    AgentConfig::new(model, "http://localhost:1/v1/chat/completions", Some("sk-test".to_string()))
}

pub fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.sandbox.allocation_backoff_ms = 1;
    config.tools.tool_timeout_secs = 5;
    config
}

pub fn executor() -> ToolExecutor {
    ToolExecutor::new(Arc::new(ToolRegistry::new(Arc::new(StaticLookup))), 5)
}

pub fn branches() -> (Arc<MockSandboxProvider>, Arc<SandboxBranchManager>) {
    let provider = Arc::new(MockSandboxProvider::new());
    let manager = SandboxBranchManager::new(
        provider.clone(),
        BranchManagerConfig {
            allocation_attempts: 3,
            allocation_backoff: std::time::Duration::from_millis(1),
        },
    );
    (provider, Arc::new(manager))
}

pub fn runtime(config: AppConfig, factory: MockFactory) -> (Arc<MockSandboxProvider>, Runtime) {
    let provider = Arc::new(MockSandboxProvider::new());
    let runtime = Runtime::new(
        config,
        Arc::new(factory),
        ToolRegistry::new(Arc::new(StaticLookup)),
        provider.clone(),
    );
    (provider, runtime)
}

pub fn python_call(id: &str, code: &str) -> Message {
    let args = serde_json::json!({ "code": code }).to_string();
    Message::assistant_with_tool_calls(None, vec![ToolCall::new(id, "python", args)])
}
