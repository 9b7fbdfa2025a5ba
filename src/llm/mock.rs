//! Mock LLM 客户端（用于测试与离线运行，无需 API）
//!
//! 回复来源按优先级：预置脚本队列 → 自定义 responder → 默认回显最后一条 user 消息并附 `<DONE>`。
//! 所有请求都会被记录，便于断言请求次数、工具集与消息内容。

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::llm::{ChatRequest, LlmClient, LlmError};
use crate::memory::{Message, Role};

type Responder = Box<dyn Fn(&ChatRequest) -> Result<Message, LlmError> + Send + Sync>;

/// 可编排的 Mock 客户端
#[derive(Default)]
pub struct MockLlmClient {
    script: Mutex<VecDeque<Result<Message, LlmError>>>,
    responder: Option<Responder>,
    delay: Option<Duration>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// 按顺序返回脚本中的回复，脚本耗尽后走 responder / 默认回显
    pub fn with_script(replies: impl IntoIterator<Item = Result<Message, LlmError>>) -> Self {
        Self {
            script: Mutex::new(replies.into_iter().collect()),
            ..Self::default()
        }
    }

    /// 根据请求内容决定回复（并发场景下与调用顺序无关）
    pub fn with_responder(
        responder: impl Fn(&ChatRequest) -> Result<Message, LlmError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            responder: Some(Box::new(responder)),
            ..Self::default()
        }
    }

    /// 每次回复前等待，模拟慢速端点
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn push_reply(&self, reply: Result<Message, LlmError>) {
        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(reply);
    }

    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn chat(&self, request: &ChatRequest) -> Result<Message, LlmError> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request.clone());

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let scripted = self
            .script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        if let Some(reply) = scripted {
            return reply;
        }
        if let Some(responder) = &self.responder {
            return responder(request);
        }

        let last_user = request
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content_text())
            .unwrap_or_else(|| "(no input)".to_string());
        Ok(Message::assistant(format!("Echo from Mock: {last_user} <DONE>")))
    }
}
