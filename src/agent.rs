//! 运行时：由配置组装 LLM、工具、沙箱存储与示例链检索，对外提供两个入口
//!
//! - `complete_reasoning_task`：单个 agent 跑一次完整推理
//! - `ensemble`：多个 agent 并行推理后由协调者综合
//!
//! 每次推理分配独立的 run_id 与分支管理器，结束时释放该运行的全部沙箱。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use crate::config::{AgentConfig, AppConfig, LlmSection};
use crate::core::AgentError;
use crate::llm::{create_embedder_from_config, LlmClient, OpenAiClient, RetryConfig, RetryingLlmClient};
use crate::memory::{write_conversation_log, ChainMemory, ConversationLog, JsonChainStore, Message, SimilarityStore};
use crate::react::{
    AgentRunner, BeamSettings, EnsembleCoordinator, EnsembleResult, LoopSettings, ReactEvent, ReasoningLoop, TaskInput,
};
use crate::sandbox::{BranchManagerConfig, HttpSandboxProvider, SandboxProvider, SandboxStore};
use crate::tools::{PerplexityLookup, ToolExecutor, ToolRegistry, ToolSpec, WolframAlpha};

/// 按 AgentConfig 创建 LLM 客户端
pub trait LlmFactory: Send + Sync {
    fn create(&self, agent: &AgentConfig) -> Result<Arc<dyn LlmClient>, AgentError>;
}

/// OpenAI 兼容端点 + 指数退避重试
pub struct HttpLlmFactory {
    timeout_secs: u64,
    retry: RetryConfig,
}

impl HttpLlmFactory {
    pub fn from_config(llm: &LlmSection) -> Self {
        Self {
            timeout_secs: llm.request_timeout_secs,
            retry: llm.retry.to_retry_config(),
        }
    }
}

impl LlmFactory for HttpLlmFactory {
    fn create(&self, agent: &AgentConfig) -> Result<Arc<dyn LlmClient>, AgentError> {
        let key = agent
            .resolved_api_key()
            .ok_or_else(|| AgentError::Config(format!("no API key for model {}", agent.model)))?;
        let client = OpenAiClient::new(&agent.api_url, &key, self.timeout_secs)?;
        Ok(Arc::new(RetryingLlmClient::new(Arc::new(client), self.retry.clone())))
    }
}

/// 一次推理的任务
#[derive(Debug, Clone)]
pub struct ReasoningTask {
    pub task: String,
    /// 图片 URL 或 data URI
    pub image: Option<String>,
    pub output_tools: Vec<ToolSpec>,
    /// 是否检索相似的历史链作为示例
    pub use_chain_memory: bool,
}

impl ReasoningTask {
    pub fn new(task: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            image: None,
            output_tools: Vec::new(),
            use_chain_memory: true,
        }
    }

    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = Some(image.into());
        self
    }

    pub fn with_output_tools(mut self, tools: Vec<ToolSpec>) -> Self {
        self.output_tools = tools;
        self
    }

    pub fn without_chain_memory(mut self) -> Self {
        self.use_chain_memory = false;
        self
    }
}

/// 一次推理的结果
#[derive(Debug, Clone)]
pub struct ReasoningResult {
    pub run_id: String,
    pub agent: AgentConfig,
    pub final_answer: Message,
    /// 从任务 system 消息开始的记录（不含注入的示例）
    pub transcript: Vec<Message>,
    pub thinking_tools: Vec<ToolSpec>,
    pub output_tools: Vec<ToolSpec>,
    pub steps: usize,
    pub forced: bool,
}

pub struct Runtime {
    config: AppConfig,
    llm_factory: Arc<dyn LlmFactory>,
    tools: Arc<ToolRegistry>,
    sandboxes: Arc<SandboxStore>,
    chains: ChainMemory,
    chain_store: Option<Arc<JsonChainStore>>,
    cancel_token: CancellationToken,
    event_tx: Option<UnboundedSender<ReactEvent>>,
}

impl Runtime {
    /// 按配置创建真实后端：OpenAI 兼容 LLM、Perplexity 检索、可选 Wolfram、远程沙箱、可选链存储
    pub fn from_config(config: AppConfig) -> Result<Self, AgentError> {
        let factory = Arc::new(HttpLlmFactory::from_config(&config.llm));

        let web = PerplexityLookup::new(&config.tools.web).map_err(AgentError::Config)?;
        let mut registry = ToolRegistry::new(Arc::new(web));
        if let Some(app_id) = config.tools.wolfram.resolved_app_id() {
            let wolfram = WolframAlpha::new(app_id, config.tools.web.timeout_secs).map_err(AgentError::Config)?;
            registry = registry.with_wolfram(Arc::new(wolfram));
        }

        let provider = HttpSandboxProvider::from_config(&config.sandbox)?;

        let chain_store = config.memory.chain_store_path.as_ref().and_then(|path| {
            let embedder = create_embedder_from_config(
                config.memory.embedding_base_url.as_deref(),
                &config.memory.embedding_model,
                config.llm.api_key.as_deref(),
            );
            if embedder.is_none() {
                tracing::warn!("chain store configured but no embedding key; retrieval disabled");
            }
            embedder.map(|e| Arc::new(JsonChainStore::new(path, e)))
        });

        let mut runtime = Self::new(config, factory, registry, Arc::new(provider));
        if let Some(store) = chain_store {
            runtime = runtime.with_chain_store(store);
        }
        Ok(runtime)
    }

    pub fn new(
        config: AppConfig,
        llm_factory: Arc<dyn LlmFactory>,
        tools: ToolRegistry,
        sandbox_provider: Arc<dyn SandboxProvider>,
    ) -> Self {
        let branch_config = BranchManagerConfig {
            allocation_attempts: config.sandbox.allocation_attempts,
            allocation_backoff: Duration::from_millis(config.sandbox.allocation_backoff_ms),
        };
        Self {
            sandboxes: Arc::new(SandboxStore::new(sandbox_provider, branch_config)),
            config,
            llm_factory,
            tools: Arc::new(tools),
            chains: ChainMemory::disabled(),
            chain_store: None,
            cancel_token: CancellationToken::new(),
            event_tx: None,
        }
    }

    /// 检索与写回都使用该存储
    pub fn with_chain_store(mut self, store: Arc<JsonChainStore>) -> Self {
        self.chains = ChainMemory::new(store.clone(), self.config.memory.similar_chains);
        self.chain_store = Some(store);
        self
    }

    /// 只用于检索
    pub fn with_similarity_store(mut self, store: Arc<dyn SimilarityStore>) -> Self {
        self.chains = ChainMemory::new(store, self.config.memory.similar_chains);
        self
    }

    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel_token = token;
        self
    }

    pub fn with_event_tx(mut self, tx: UnboundedSender<ReactEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn sandboxes(&self) -> &SandboxStore {
        &self.sandboxes
    }

    fn loop_settings(&self, agent: &AgentConfig) -> LoopSettings {
        let reasoning = &self.config.reasoning;
        LoopSettings {
            agent: agent.clone(),
            max_reasoning_steps: reasoning.max_reasoning_steps,
            reflection_mode: reasoning.reflection_mode,
            beam: reasoning.beam_candidates.filter(|n| *n >= 2).map(|candidates| BeamSettings {
                candidates,
                temperature_spread: self.config.beam.temperature_spread,
                judge_temperature: self.config.beam.judge_temperature,
            }),
            max_idle: Duration::from_secs(self.config.sandbox.max_idle_secs),
        }
    }

    pub async fn complete_reasoning_task(
        &self,
        agent: &AgentConfig,
        task: &ReasoningTask,
    ) -> Result<ReasoningResult, AgentError> {
        let run_id = uuid::Uuid::new_v4().to_string();
        let llm = self.llm_factory.create(agent)?;
        let executor = ToolExecutor::new(self.tools.clone(), self.config.tools.tool_timeout_secs);

        let examples = if task.use_chain_memory {
            self.chains.examples(&task.task, &executor.thinking_tools()).await
        } else {
            Vec::new()
        };

        let branches = self.sandboxes.get_or_create(&run_id).await;
        let mut reasoning = ReasoningLoop::new(llm, executor, branches, self.loop_settings(agent))
            .with_run_id(run_id.clone())
            .with_cancel_token(self.cancel_token.child_token());
        if let Some(tx) = &self.event_tx {
            reasoning = reasoning.with_event_tx(tx.clone());
        }

        let mut guard = RunCleanup::new(self.sandboxes.clone(), &run_id);
        let outcome = reasoning
            .run(TaskInput {
                task: task.task.clone(),
                image: task.image.clone(),
                output_tools: task.output_tools.clone(),
                examples,
            })
            .await;
        guard.disarm();
        self.sandboxes.clear(&run_id).await;
        let outcome = outcome?;

        let result = ReasoningResult {
            run_id,
            agent: agent.clone(),
            final_answer: outcome.final_answer.clone(),
            transcript: outcome.conversation.transcript().to_vec(),
            thinking_tools: outcome.thinking_tools.clone(),
            output_tools: task.output_tools.clone(),
            steps: outcome.steps,
            forced: outcome.forced(),
        };
        self.after_run(task, &result).await;
        Ok(result)
    }

    /// 可选的对话日志与链存储写回；失败只记录告警
    async fn after_run(&self, task: &ReasoningTask, result: &ReasoningResult) {
        if self.config.reasoning.log_conversation {
            let log = ConversationLog {
                run_id: result.run_id.clone(),
                task: task.task.clone(),
                model: result.agent.model.clone(),
                temperature: result.agent.temperature,
                top_p: result.agent.top_p,
                max_tokens: result.agent.max_tokens,
                transcript: result.transcript.clone(),
                final_response: result.final_answer.clone(),
                thinking_tools: result.thinking_tools.clone(),
                output_tools: result.output_tools.clone(),
                saved_at: chrono::Utc::now(),
            };
            match write_conversation_log(&self.config.reasoning.log_dir, &log) {
                Ok(path) => tracing::info!(path = %path.display(), "conversation logged"),
                Err(e) => tracing::warn!(error = %e, "failed to write conversation log"),
            }
        }

        if self.config.memory.save_chains && task.use_chain_memory && !result.forced {
            if let Some(store) = &self.chain_store {
                if let Err(e) = store
                    .save(&task.task, &result.transcript, &result.final_answer, &result.thinking_tools)
                    .await
                {
                    tracing::warn!(error = %e, "failed to save chain");
                }
            }
        }
    }

    /// 以 [ensemble] 配置的 agents 并行推理，再由协调者（默认 [llm]）综合
    pub async fn ensemble(self: Arc<Self>, task: &ReasoningTask) -> Result<EnsembleResult, AgentError> {
        let ensemble = &self.config.ensemble;
        if ensemble.agents.is_empty() {
            return Err(AgentError::Config("no [[ensemble.agents]] configured".to_string()));
        }
        let coordinator = ensemble
            .coordinator
            .clone()
            .unwrap_or_else(|| self.config.llm.agent());
        let runner: Arc<dyn AgentRunner> = self.clone();
        EnsembleCoordinator::new(runner)
            .with_max_workers(ensemble.max_workers)
            .with_agent_timeout(ensemble.agent_timeout_secs.map(Duration::from_secs))
            .run(task, &ensemble.agents, &coordinator)
            .await
    }
}

/// 运行在结束前被丢弃（如集成模式超时）时，后台释放该运行的沙箱
struct RunCleanup {
    store: Arc<SandboxStore>,
    run_id: Option<String>,
}

impl RunCleanup {
    fn new(store: Arc<SandboxStore>, run_id: &str) -> Self {
        Self {
            store,
            run_id: Some(run_id.to_string()),
        }
    }

    fn disarm(&mut self) {
        self.run_id = None;
    }
}

impl Drop for RunCleanup {
    fn drop(&mut self) {
        let Some(run_id) = self.run_id.take() else {
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let store = self.store.clone();
        tracing::debug!(run_id = %run_id, "run dropped before completion, releasing sandboxes");
        handle.spawn(async move { store.clear(&run_id).await });
    }
}

#[async_trait]
impl AgentRunner for Runtime {
    async fn run_agent(&self, agent: &AgentConfig, task: &ReasoningTask) -> Result<ReasoningResult, AgentError> {
        self.complete_reasoning_task(agent, task).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_factory_requires_key() {
        let factory = HttpLlmFactory::from_config(&LlmSection::default());
        let url = "http://localhost:1/v1/chat/completions";
        let agent = AgentConfig::new("m", url, Some("sk-test".to_string()));
        assert!(factory.create(&agent).is_ok());

        // 空白 key 视为未配置，不会回退到环境变量
        let keyless = AgentConfig::new("m", url, Some("  ".to_string()));
        assert!(matches!(factory.create(&keyless), Err(AgentError::Config(_))));
    }

    #[test]
    fn test_reasoning_task_builder() {
        let task = ReasoningTask::new("2 + 2")
            .with_image("data:image/png;base64,AAAA")
            .without_chain_memory();
        assert_eq!(task.task, "2 + 2");
        assert!(task.image.is_some());
        assert!(!task.use_chain_memory);
    }
}
