//! 远程沙箱服务客户端（REST）
//!
//! - `POST {endpoint}/sandboxes`，body `{"lifetime_secs": n}` → `{"id": "..."}`
//! - `POST {endpoint}/sandboxes/{id}/execute`，body `{"code": "...", "timeout_secs": n}` → ExecutionOutput
//! - `DELETE {endpoint}/sandboxes/{id}`
//!
//! 设置了 api_key 时以 `X-API-Key` 头鉴权。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::config::SandboxSection;
use crate::sandbox::{CodeSandbox, ExecutionOutput, SandboxError, SandboxProvider};

#[derive(Debug, Deserialize)]
struct CreatedSandbox {
    id: String,
}

#[derive(Clone)]
struct Endpoint {
    http: reqwest::Client,
    base: String,
    api_key: Option<String>,
}

impl Endpoint {
    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let builder = self.http.request(method, format!("{}{}", self.base, path));
        match &self.api_key {
            Some(key) => builder.header("X-API-Key", key),
            None => builder,
        }
    }
}

async fn check(response: reqwest::Response) -> Result<reqwest::Response, SandboxError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(SandboxError::Transport(format!("HTTP {}: {}", status.as_u16(), body)))
}

/// 远程服务上的一个沙箱
pub struct RemoteSandbox {
    id: String,
    endpoint: Endpoint,
}

#[async_trait]
impl CodeSandbox for RemoteSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    async fn run(&self, code: &str, timeout: Option<Duration>) -> Result<ExecutionOutput, SandboxError> {
        let mut body = json!({ "code": code });
        if let Some(timeout) = timeout {
            body["timeout_secs"] = json!(timeout.as_secs());
        }
        let mut request = self
            .endpoint
            .request(reqwest::Method::POST, &format!("/sandboxes/{}/execute", self.id))
            .json(&body);
        if let Some(timeout) = timeout {
            // 留出网络往返余量
            request = request.timeout(timeout + Duration::from_secs(10));
        }
        let response = request
            .send()
            .await
            .map_err(|e| SandboxError::Transport(e.to_string()))?;
        check(response)
            .await?
            .json::<ExecutionOutput>()
            .await
            .map_err(|e| SandboxError::Transport(format!("invalid execute response: {e}")))
    }
}

/// 通过 HTTP 分配 / 释放远程沙箱
pub struct HttpSandboxProvider {
    endpoint: Endpoint,
    lifetime_secs: u64,
}

impl HttpSandboxProvider {
    pub fn new(endpoint: &str, api_key: Option<String>, lifetime_secs: u64) -> Result<Self, SandboxError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| SandboxError::Transport(e.to_string()))?;
        Ok(Self {
            endpoint: Endpoint {
                http,
                base: endpoint.trim_end_matches('/').to_string(),
                api_key,
            },
            lifetime_secs,
        })
    }

    pub fn from_config(cfg: &SandboxSection) -> Result<Self, SandboxError> {
        Self::new(&cfg.endpoint, cfg.resolved_api_key(), cfg.lifetime_secs)
    }
}

#[async_trait]
impl SandboxProvider for HttpSandboxProvider {
    async fn allocate(&self) -> Result<Arc<dyn CodeSandbox>, SandboxError> {
        let response = self
            .endpoint
            .request(reqwest::Method::POST, "/sandboxes")
            .json(&json!({ "lifetime_secs": self.lifetime_secs }))
            .send()
            .await
            .map_err(|e| SandboxError::Transport(e.to_string()))?;
        let created: CreatedSandbox = check(response)
            .await?
            .json()
            .await
            .map_err(|e| SandboxError::Transport(format!("invalid create response: {e}")))?;
        tracing::debug!(sandbox = %created.id, "sandbox allocated");
        Ok(Arc::new(RemoteSandbox {
            id: created.id,
            endpoint: self.endpoint.clone(),
        }))
    }

    async fn release(&self, sandbox: Arc<dyn CodeSandbox>) {
        let path = format!("/sandboxes/{}", sandbox.id());
        let result = self
            .endpoint
            .request(reqwest::Method::DELETE, &path)
            .send()
            .await;
        match result {
            Ok(response) if response.status().is_success() => {
                tracing::debug!(sandbox = sandbox.id(), "sandbox released");
            }
            Ok(response) => {
                tracing::warn!(sandbox = sandbox.id(), status = response.status().as_u16(), "sandbox release rejected");
            }
            Err(e) => tracing::warn!(sandbox = sandbox.id(), error = %e, "sandbox release failed"),
        }
    }
}
