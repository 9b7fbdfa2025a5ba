//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `REASONER__*` 覆盖（双下划线表示嵌套，如 `REASONER__LLM__MODEL=gpt-4o`）。

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::llm::RetryConfig;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub llm: LlmSection,
    pub reasoning: ReasoningSection,
    pub beam: BeamSection,
    pub ensemble: EnsembleSection,
    pub sandbox: SandboxSection,
    pub tools: ToolsSection,
    pub memory: MemorySection,
}

/// 单个模型端点配置（集成模式下每个 agent 与 coordinator 各一份）
#[derive(Clone, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_api_url")]
    pub api_url: String,
    /// 未设置时回退到 OPENAI_API_KEY
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

impl AgentConfig {
    pub fn new(model: impl Into<String>, api_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            model: model.into(),
            api_url: api_url.into(),
            api_key,
            ..Self::default()
        }
    }

    /// 显式 key 优先，其次环境变量 OPENAI_API_KEY；空串视为未配置
    pub fn resolved_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .filter(|k| !k.trim().is_empty())
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            api_url: default_api_url(),
            api_key: None,
            temperature: default_temperature(),
            top_p: default_top_p(),
            max_tokens: default_max_tokens(),
        }
    }
}

impl fmt::Debug for AgentConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentConfig")
            .field("model", &self.model)
            .field("api_url", &self.api_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "***"))
            .field("temperature", &self.temperature)
            .field("top_p", &self.top_p)
            .field("max_tokens", &self.max_tokens)
            .finish()
    }
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_api_url() -> String {
    "https://api.openai.com/v1/chat/completions".to_string()
}

fn default_temperature() -> f32 {
    0.7
}

fn default_top_p() -> f32 {
    1.0
}

fn default_max_tokens() -> u32 {
    500
}

/// [llm] 段：默认模型端点、请求超时与重试
#[derive(Clone, Deserialize)]
pub struct LlmSection {
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_api_url")]
    pub api_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default)]
    pub retry: RetrySection,
}

impl LlmSection {
    /// 以本段为默认 agent
    pub fn agent(&self) -> AgentConfig {
        AgentConfig {
            model: self.model.clone(),
            api_url: self.api_url.clone(),
            api_key: self.api_key.clone(),
            temperature: self.temperature,
            top_p: self.top_p,
            max_tokens: self.max_tokens,
        }
    }
}

impl Default for LlmSection {
    fn default() -> Self {
        let agent = AgentConfig::default();
        Self {
            model: agent.model,
            api_url: agent.api_url,
            api_key: None,
            temperature: agent.temperature,
            top_p: agent.top_p,
            max_tokens: agent.max_tokens,
            request_timeout_secs: default_request_timeout_secs(),
            retry: RetrySection::default(),
        }
    }
}

impl fmt::Debug for LlmSection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LlmSection")
            .field("agent", &self.agent())
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("retry", &self.retry)
            .finish()
    }
}

fn default_request_timeout_secs() -> u64 {
    120
}

/// [llm.retry] 段：非 2xx / 网络错误的指数退避
#[derive(Debug, Clone, Deserialize)]
pub struct RetrySection {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl RetrySection {
    pub fn to_retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_attempts,
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
        }
    }
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    1000
}

fn default_max_backoff_ms() -> u64 {
    16_000
}

/// [reasoning] 段：步数上限、反思模式、beam 宽度、对话日志
#[derive(Debug, Clone, Deserialize)]
pub struct ReasoningSection {
    #[serde(default)]
    pub max_reasoning_steps: Option<usize>,
    #[serde(default)]
    pub reflection_mode: bool,
    /// 小于 2 或未设置时不启用 beam search
    #[serde(default)]
    pub beam_candidates: Option<usize>,
    #[serde(default)]
    pub log_conversation: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
}

impl Default for ReasoningSection {
    fn default() -> Self {
        Self {
            max_reasoning_steps: None,
            reflection_mode: false,
            beam_candidates: None,
            log_conversation: false,
            log_dir: default_log_dir(),
        }
    }
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

/// [beam] 段：候选温度扰动幅度与评审温度
#[derive(Debug, Clone, Deserialize)]
pub struct BeamSection {
    #[serde(default = "default_temperature_spread")]
    pub temperature_spread: f32,
    #[serde(default = "default_judge_temperature")]
    pub judge_temperature: f32,
}

impl Default for BeamSection {
    fn default() -> Self {
        Self {
            temperature_spread: default_temperature_spread(),
            judge_temperature: default_judge_temperature(),
        }
    }
}

fn default_temperature_spread() -> f32 {
    0.3
}

fn default_judge_temperature() -> f32 {
    0.3
}

/// [ensemble] 段：并行 agent 列表、coordinator 与并发上限
#[derive(Debug, Clone, Deserialize, Default)]
pub struct EnsembleSection {
    /// 未设置时等于 agent 数量
    #[serde(default)]
    pub max_workers: Option<usize>,
    #[serde(default)]
    pub agent_timeout_secs: Option<u64>,
    #[serde(default)]
    pub agents: Vec<AgentConfig>,
    /// 未设置时使用 [llm] 段
    #[serde(default)]
    pub coordinator: Option<AgentConfig>,
}

/// [sandbox] 段：远程代码沙箱服务、分配重试与空闲回收
#[derive(Clone, Deserialize)]
pub struct SandboxSection {
    #[serde(default = "default_sandbox_endpoint")]
    pub endpoint: String,
    /// 未设置时回退到 SANDBOX_API_KEY
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_sandbox_lifetime_secs")]
    pub lifetime_secs: u64,
    #[serde(default = "default_allocation_attempts")]
    pub allocation_attempts: u32,
    #[serde(default = "default_allocation_backoff_ms")]
    pub allocation_backoff_ms: u64,
    #[serde(default = "default_max_idle_secs")]
    pub max_idle_secs: u64,
}

impl SandboxSection {
    pub fn resolved_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .or_else(|| std::env::var("SANDBOX_API_KEY").ok())
            .filter(|k| !k.trim().is_empty())
    }
}

impl Default for SandboxSection {
    fn default() -> Self {
        Self {
            endpoint: default_sandbox_endpoint(),
            api_key: None,
            lifetime_secs: default_sandbox_lifetime_secs(),
            allocation_attempts: default_allocation_attempts(),
            allocation_backoff_ms: default_allocation_backoff_ms(),
            max_idle_secs: default_max_idle_secs(),
        }
    }
}

impl fmt::Debug for SandboxSection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SandboxSection")
            .field("endpoint", &self.endpoint)
            .field("lifetime_secs", &self.lifetime_secs)
            .field("allocation_attempts", &self.allocation_attempts)
            .field("allocation_backoff_ms", &self.allocation_backoff_ms)
            .field("max_idle_secs", &self.max_idle_secs)
            .finish()
    }
}

fn default_sandbox_endpoint() -> String {
    "http://127.0.0.1:8787".to_string()
}

fn default_sandbox_lifetime_secs() -> u64 {
    600
}

fn default_allocation_attempts() -> u32 {
    3
}

fn default_allocation_backoff_ms() -> u64 {
    500
}

fn default_max_idle_secs() -> u64 {
    300
}

/// [tools] 段：单次工具超时、web 检索与 Wolfram|Alpha
#[derive(Debug, Clone, Deserialize)]
pub struct ToolsSection {
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,
    #[serde(default)]
    pub web: WebSection,
    #[serde(default)]
    pub wolfram: WolframSection,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            tool_timeout_secs: default_tool_timeout_secs(),
            web: WebSection::default(),
            wolfram: WolframSection::default(),
        }
    }
}

fn default_tool_timeout_secs() -> u64 {
    60
}

/// [tools.web] 段：Perplexity 风格的 chat 检索端点
#[derive(Clone, Deserialize)]
pub struct WebSection {
    #[serde(default = "default_web_api_url")]
    pub api_url: String,
    #[serde(default = "default_web_model")]
    pub model: String,
    /// 未设置时回退到 PERPLEXITY_API_KEY
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_web_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_result_chars")]
    pub max_result_chars: usize,
}

impl WebSection {
    pub fn resolved_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .or_else(|| std::env::var("PERPLEXITY_API_KEY").ok())
            .filter(|k| !k.trim().is_empty())
    }
}

impl Default for WebSection {
    fn default() -> Self {
        Self {
            api_url: default_web_api_url(),
            model: default_web_model(),
            api_key: None,
            timeout_secs: default_web_timeout_secs(),
            max_result_chars: default_max_result_chars(),
        }
    }
}

impl fmt::Debug for WebSection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSection")
            .field("api_url", &self.api_url)
            .field("model", &self.model)
            .field("timeout_secs", &self.timeout_secs)
            .field("max_result_chars", &self.max_result_chars)
            .finish()
    }
}

fn default_web_api_url() -> String {
    "https://api.perplexity.ai/chat/completions".to_string()
}

fn default_web_model() -> String {
    "sonar".to_string()
}

fn default_web_timeout_secs() -> u64 {
    30
}

fn default_max_result_chars() -> usize {
    8000
}

/// [tools.wolfram] 段：未解析出 app_id 时不向模型提供 wolfram 工具
#[derive(Clone, Deserialize, Default)]
pub struct WolframSection {
    /// 未设置时回退到 WOLFRAM_APP_ID
    #[serde(default)]
    pub app_id: Option<String>,
}

impl WolframSection {
    pub fn resolved_app_id(&self) -> Option<String> {
        self.app_id
            .clone()
            .or_else(|| std::env::var("WOLFRAM_APP_ID").ok())
            .filter(|k| !k.trim().is_empty())
    }
}

impl fmt::Debug for WolframSection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WolframSection")
            .field("app_id", &self.app_id.as_ref().map(|_| "***"))
            .finish()
    }
}

/// [memory] 段：历史成功推理链检索
#[derive(Debug, Clone, Deserialize)]
pub struct MemorySection {
    /// 未设置时不做检索
    #[serde(default)]
    pub chain_store_path: Option<PathBuf>,
    #[serde(default = "default_similar_chains")]
    pub similar_chains: usize,
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
    #[serde(default)]
    pub embedding_base_url: Option<String>,
    /// 运行成功后是否写回链存储
    #[serde(default)]
    pub save_chains: bool,
}

impl Default for MemorySection {
    fn default() -> Self {
        Self {
            chain_store_path: None,
            similar_chains: default_similar_chains(),
            embedding_model: default_embedding_model(),
            embedding_base_url: None,
            save_chains: false,
        }
    }
}

fn default_similar_chains() -> usize {
    3
}

fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}

/// 从 config 目录加载配置，环境变量 REASONER__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 REASONER__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("REASONER")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
