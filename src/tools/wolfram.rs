//! wolfram 工具：Wolfram|Alpha v2 query API（JSON 输出），将 pods 渲染为纯文本
//!
//! 只有配置了 app id 时才向模型提供该工具。

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;

use crate::tools::schema::{parameters_schema, ToolSpec};
use crate::tools::WOLFRAM_TOOL;

const QUERY_URL: &str = "https://api.wolframalpha.com/v2/query";

#[derive(Debug, Clone, PartialEq, Deserialize, JsonSchema)]
pub struct WolframArgs {
    /// Natural-language or Wolfram Language query, e.g. "integrate x^2 sin x".
    pub query: String,
    /// Only return these pod ids (e.g. ["Result", "Solution"]).
    #[serde(default)]
    pub include_pods: Option<Vec<String>>,
    /// Maximum width in pixels for plaintext output.
    #[serde(default)]
    pub max_width: Option<u32>,
}

pub fn spec() -> ToolSpec {
    ToolSpec::function(
        WOLFRAM_TOOL,
        "Query Wolfram|Alpha for symbolic math, unit conversions and scientific data. Returns the result pods as text.",
        parameters_schema::<WolframArgs>(),
    )
}

#[async_trait]
pub trait WolframClient: Send + Sync {
    async fn query(&self, args: &WolframArgs) -> Result<String, String>;
}

pub struct WolframAlpha {
    client: Client,
    app_id: String,
}

impl WolframAlpha {
    pub fn new(app_id: String, timeout_secs: u64) -> Result<Self, String> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| e.to_string())?;
        Ok(Self { client, app_id })
    }
}

#[async_trait]
impl WolframClient for WolframAlpha {
    async fn query(&self, args: &WolframArgs) -> Result<String, String> {
        let mut params: Vec<(&str, String)> = vec![
            ("appid", self.app_id.clone()),
            ("input", args.query.clone()),
            ("output", "json".to_string()),
            ("format", "plaintext".to_string()),
        ];
        for pod in args.include_pods.iter().flatten() {
            params.push(("includepodid", pod.clone()));
        }
        if let Some(width) = args.max_width {
            params.push(("maxwidth", width.to_string()));
        }

        let response = self
            .client
            .get(QUERY_URL)
            .query(&params)
            .send()
            .await
            .map_err(|e| format!("request failed: {e}"))?;
        let status = response.status();
        if !status.is_success() {
            return Err(format!("HTTP {}", status.as_u16()));
        }
        let body: Value = response
            .json()
            .await
            .map_err(|e| format!("invalid response: {e}"))?;
        render_pods(&body)
    }
}

/// 把 queryresult.pods 渲染成 "Title:\n  text" 段落
pub fn render_pods(body: &Value) -> Result<String, String> {
    let result = body
        .get("queryresult")
        .ok_or_else(|| "missing queryresult".to_string())?;
    if result.get("error").and_then(Value::as_bool) == Some(true) {
        let msg = result
            .pointer("/error/msg")
            .and_then(Value::as_str)
            .unwrap_or("query error");
        return Err(msg.to_string());
    }
    if result.get("success").and_then(Value::as_bool) != Some(true) {
        return Err("Wolfram|Alpha did not understand the query; try rephrasing it".to_string());
    }

    let mut sections = Vec::new();
    for pod in result.get("pods").and_then(Value::as_array).into_iter().flatten() {
        let title = pod.get("title").and_then(Value::as_str).unwrap_or("Pod");
        let lines: Vec<&str> = pod
            .get("subpods")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(|s| s.get("plaintext").and_then(Value::as_str))
            .filter(|t| !t.trim().is_empty())
            .collect();
        if lines.is_empty() {
            continue;
        }
        let body = lines
            .iter()
            .map(|l| format!("  {}", l.replace('\n', "\n  ")))
            .collect::<Vec<_>>()
            .join("\n");
        sections.push(format!("{title}:\n{body}"));
    }
    if sections.is_empty() {
        return Err("no plaintext pods in result".to_string());
    }
    Ok(sections.join("\n\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_render_pods() {
        let body = json!({
            "queryresult": {
                "success": true,
                "error": false,
                "pods": [
                    {"title": "Input", "subpods": [{"plaintext": "2 + 2×2"}]},
                    {"title": "Result", "subpods": [{"plaintext": "6"}]},
                    {"title": "Plot", "subpods": [{"plaintext": ""}]}
                ]
            }
        });
        let text = render_pods(&body).unwrap();
        assert_eq!(text, "Input:\n  2 + 2×2\n\nResult:\n  6");
    }

    #[test]
    fn test_render_pods_failure() {
        let body = json!({"queryresult": {"success": false, "error": false}});
        assert!(render_pods(&body).is_err());
        let body = json!({"queryresult": {"success": false, "error": {"code": "1", "msg": "Invalid appid"}}});
        // error 为对象时按未理解处理
        assert!(render_pods(&body).is_err());
    }
}
