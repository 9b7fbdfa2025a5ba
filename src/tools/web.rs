//! find_datapoint_on_web 工具：经 Perplexity 风格的 chat 端点检索事实
//!
//! 返回回答正文与引用列表；超过 max_result_chars 时截断并追加 ...[truncated]。

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::json;

use crate::config::WebSection;
use crate::tools::schema::{parameters_schema, ToolSpec};
use crate::tools::WEB_TOOL;

#[derive(Debug, Clone, PartialEq, Deserialize, JsonSchema)]
pub struct WebArgs {
    /// A precise question or data point to look up, e.g. "population of Lyon in 2020".
    pub query: String,
}

pub fn spec() -> ToolSpec {
    ToolSpec::function(
        WEB_TOOL,
        "Look up a single fact or data point on the web. Returns a short answer with its sources.",
        parameters_schema::<WebArgs>(),
    )
}

/// 网页检索后端
#[async_trait]
pub trait WebLookup: Send + Sync {
    async fn lookup(&self, query: &str) -> Result<String, String>;
}

#[derive(Debug, Deserialize)]
struct LookupResponse {
    #[serde(default)]
    choices: Vec<LookupChoice>,
    #[serde(default)]
    citations: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct LookupChoice {
    message: LookupMessage,
}

#[derive(Debug, Deserialize)]
struct LookupMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Perplexity chat-completions 检索
pub struct PerplexityLookup {
    client: Client,
    api_url: String,
    model: String,
    api_key: Option<String>,
    max_result_chars: usize,
}

impl PerplexityLookup {
    pub fn new(cfg: &WebSection) -> Result<Self, String> {
        let client = Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .build()
            .map_err(|e| e.to_string())?;
        Ok(Self {
            client,
            api_url: cfg.api_url.clone(),
            model: cfg.model.clone(),
            api_key: cfg.resolved_api_key(),
            max_result_chars: cfg.max_result_chars,
        })
    }
}

#[async_trait]
impl WebLookup for PerplexityLookup {
    async fn lookup(&self, query: &str) -> Result<String, String> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| "web lookup is not configured (missing API key)".to_string())?;
        let body = json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": "Answer with the requested data point and nothing else. Be precise and cite sources."},
                {"role": "user", "content": query},
            ],
        });
        let response = self
            .client
            .post(&self.api_url)
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| format!("request failed: {e}"))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(format!("HTTP {}: {}", status.as_u16(), truncate(&text, 300)));
        }
        let parsed: LookupResponse = response
            .json()
            .await
            .map_err(|e| format!("invalid response: {e}"))?;
        Ok(truncate(&format_answer(parsed)?, self.max_result_chars))
    }
}

fn format_answer(response: LookupResponse) -> Result<String, String> {
    let answer = response
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .filter(|c| !c.trim().is_empty())
        .ok_or_else(|| "empty answer".to_string())?;
    if response.citations.is_empty() {
        return Ok(answer);
    }
    let sources: Vec<String> = response
        .citations
        .iter()
        .enumerate()
        .map(|(i, url)| format!("[{}] {}", i + 1, url))
        .collect();
    Ok(format!("{answer}\n\nSources:\n{}", sources.join("\n")))
}

/// 按字符数截断
pub(crate) fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars).collect();
    out.push_str("\n...[truncated]");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_answer_with_citations() {
        let response: LookupResponse = serde_json::from_str(
            r#"{"choices":[{"message":{"role":"assistant","content":"About 522,000."}}],
                "citations":["https://example.org/lyon"]}"#,
        )
        .unwrap();
        let text = format_answer(response).unwrap();
        assert!(text.starts_with("About 522,000."));
        assert!(text.ends_with("[1] https://example.org/lyon"));
    }

    #[test]
    fn test_format_answer_empty() {
        let response: LookupResponse = serde_json::from_str(r#"{"choices":[]}"#).unwrap();
        assert!(format_answer(response).is_err());
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        let long = "x".repeat(20);
        let out = truncate(&long, 5);
        assert!(out.starts_with("xxxxx\n"));
        assert!(out.ends_with("[truncated]"));
    }

    #[tokio::test]
    async fn test_lookup_without_key_fails() {
        let lookup = PerplexityLookup::new(&WebSection::default()).unwrap();
        if lookup.api_key.is_none() {
            assert!(lookup.lookup("anything").await.is_err());
        }
    }
}
