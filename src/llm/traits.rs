//! LLM 客户端抽象
//!
//! 所有后端（OpenAI 兼容 HTTP / Mock）实现 LlmClient::chat：一次请求返回一条 assistant 消息。
//! RetryingLlmClient 为任意后端叠加指数退避重试，重试耗尽后把次数带进错误。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::config::AgentConfig;
use crate::memory::Message;
use crate::tools::ToolSpec;

/// chat-completions 请求体
#[derive(Clone, Debug, Serialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolSpec>,
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
}

impl ChatRequest {
    /// 以 agent 的模型与采样参数构造请求
    pub fn new(agent: &AgentConfig, messages: Vec<Message>, tools: Vec<ToolSpec>) -> Self {
        Self {
            model: agent.model.clone(),
            messages,
            tools,
            max_tokens: agent.max_tokens,
            temperature: agent.temperature,
            top_p: agent.top_p,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }
}

/// LLM 调用错误
#[derive(Error, Debug)]
pub enum LlmError {
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("request failed: {0}")]
    Request(String),

    #[error("request timed out after {0}s")]
    Timeout(u64),

    #[error("invalid response: {0}")]
    Decode(String),

    #[error("response contained no choices")]
    EmptyResponse,

    #[error("gave up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: Box<LlmError> },
}

impl LlmError {
    /// 传输层失败（非 2xx、网络、超时）可重试；响应格式问题重试也无用
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LlmError::Status { .. } | LlmError::Request(_) | LlmError::Timeout(_)
        )
    }
}

/// LLM 客户端 trait
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn chat(&self, request: &ChatRequest) -> Result<Message, LlmError>;
}

/// 指数退避参数：第 n 次失败后等待 initial * 2^(n-1)，不超过 max_backoff
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryConfig {
    pub fn backoff_for(&self, failed_attempt: u32) -> Duration {
        let exponent = failed_attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(16),
        }
    }
}

/// 带重试的客户端包装
pub struct RetryingLlmClient {
    inner: Arc<dyn LlmClient>,
    config: RetryConfig,
}

impl RetryingLlmClient {
    pub fn new(inner: Arc<dyn LlmClient>, config: RetryConfig) -> Self {
        Self { inner, config }
    }
}

#[async_trait]
impl LlmClient for RetryingLlmClient {
    async fn chat(&self, request: &ChatRequest) -> Result<Message, LlmError> {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.inner.chat(request).await {
                Ok(message) => return Ok(message),
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    let delay = self.config.backoff_for(attempt);
                    tracing::warn!(
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "LLM request failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) if e.is_retryable() => {
                    return Err(LlmError::RetriesExhausted {
                        attempts: attempt,
                        last: Box::new(e),
                    })
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlmClient;

    fn fast_retry(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
        }
    }

    fn server_error() -> LlmError {
        LlmError::Status {
            status: 503,
            body: "overloaded".to_string(),
        }
    }

    fn request() -> ChatRequest {
        ChatRequest::new(&AgentConfig::default(), vec![Message::user("hi")], vec![])
    }

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let cfg = RetryConfig {
            max_attempts: 10,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(500),
        };
        assert_eq!(cfg.backoff_for(1), Duration::from_millis(100));
        assert_eq!(cfg.backoff_for(2), Duration::from_millis(200));
        assert_eq!(cfg.backoff_for(3), Duration::from_millis(400));
        assert_eq!(cfg.backoff_for(4), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_retries_then_succeeds() {
        let mock = Arc::new(MockLlmClient::with_script(vec![
            Err(server_error()),
            Ok(Message::assistant("recovered")),
        ]));
        let client = RetryingLlmClient::new(mock.clone(), fast_retry(3));
        let reply = client.chat(&request()).await.unwrap();
        assert_eq!(reply.content_text(), "recovered");
        assert_eq!(mock.request_count(), 2);
    }

    #[tokio::test]
    async fn test_exhausted_reports_attempts() {
        let mock = Arc::new(MockLlmClient::with_script(vec![
            Err(server_error()),
            Err(server_error()),
            Err(server_error()),
        ]));
        let client = RetryingLlmClient::new(mock.clone(), fast_retry(3));
        match client.chat(&request()).await {
            Err(LlmError::RetriesExhausted { attempts, last }) => {
                assert_eq!(attempts, 3);
                assert!(matches!(*last, LlmError::Status { status: 503, .. }));
            }
            other => panic!("expected RetriesExhausted, got {other:?}"),
        }
        assert_eq!(mock.request_count(), 3);
    }

    #[tokio::test]
    async fn test_decode_error_not_retried() {
        let mock = Arc::new(MockLlmClient::with_script(vec![Err(LlmError::Decode(
            "bad json".to_string(),
        ))]));
        let client = RetryingLlmClient::new(mock.clone(), fast_retry(3));
        assert!(matches!(
            client.chat(&request()).await,
            Err(LlmError::Decode(_))
        ));
        assert_eq!(mock.request_count(), 1);
    }

    #[test]
    fn test_request_omits_empty_tools() {
        let json = serde_json::to_value(request()).unwrap();
        assert!(json.get("tools").is_none());
        assert_eq!(json["model"], "gpt-4o-mini");
        assert_eq!(json["max_tokens"], 500);
    }
}
