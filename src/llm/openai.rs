//! OpenAI 兼容 chat-completions 客户端
//!
//! 直接以 reqwest 发送 JSON：请求体即 ChatRequest，消息格式含 tool_calls / tool_call_id；
//! 任意 OpenAI 兼容端点（OpenAI、DeepSeek、OpenRouter、自建代理）均可使用，api_url 为完整的 completions 地址。
//!
//! chat 不走 async_openai：它按 base_url 拼接 `/chat/completions`，无法使用配置里的完整地址；
//! 它的强类型请求与响应也会拒绝兼容端点的非标准字段（如 `reasoning_content`、`tool_calls: null`），
//! 而历史消息本身已是线上格式，无需再转换。async_openai 仍用于 embedding（见 `llm::embedding`）。

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::llm::{ChatRequest, LlmClient, LlmError};
use crate::memory::{Message, Role};

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Message,
}

#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

/// OpenAI 兼容客户端：持有 HTTP 客户端、端点与 key
pub struct OpenAiClient {
    http: reqwest::Client,
    api_url: String,
    api_key: String,
    timeout_secs: u64,
}

impl OpenAiClient {
    pub fn new(api_url: &str, api_key: &str, timeout_secs: u64) -> Result<Self, LlmError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| LlmError::Request(e.to_string()))?;
        Ok(Self {
            http,
            api_url: api_url.to_string(),
            api_key: api_key.to_string(),
            timeout_secs,
        })
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn chat(&self, request: &ChatRequest) -> Result<Message, LlmError> {
        let response = self
            .http
            .post(&self.api_url)
            .bearer_auth(&self.api_key)
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::Timeout(self.timeout_secs)
                } else {
                    LlmError::Request(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| LlmError::Request(e.to_string()))?;
        decode_completion(&request.model, &bytes)
    }
}

/// 解析响应体，取第一个 choice 的消息；角色统一为 assistant
fn decode_completion(model: &str, bytes: &[u8]) -> Result<Message, LlmError> {
    let body: ChatCompletionResponse =
        serde_json::from_slice(bytes).map_err(|e| LlmError::Decode(e.to_string()))?;

    if let Some(usage) = &body.usage {
        tracing::debug!(
            model = %model,
            prompt_tokens = usage.prompt_tokens,
            completion_tokens = usage.completion_tokens,
            "chat completion"
        );
    }

    let mut message = body
        .choices
        .into_iter()
        .next()
        .map(|c| c.message)
        .ok_or(LlmError::EmptyResponse)?;
    message.role = Role::Assistant;
    Ok(message)
}
