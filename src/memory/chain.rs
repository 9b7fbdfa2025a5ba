//! 示例链检索适配器
//!
//! 相似度检索由外部存储实现（[`SimilarityStore`]）；这里只负责把检索到的链整理成注入到任务前的示例消息。
//! 检索失败不影响推理：记录告警并返回空。

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::memory::Message;
use crate::tools::ToolSpec;

/// 一条已完成任务的完整记录
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Chain {
    pub task: String,
    pub messages: Vec<Message>,
    #[serde(default)]
    pub tools: Vec<ToolSpec>,
}

#[async_trait]
pub trait SimilarityStore: Send + Sync {
    /// 与 task 最相似的 k 条链，按相似度降序
    async fn similar(&self, task: &str, k: usize) -> Result<Vec<Chain>, String>;
}

#[derive(Clone, Default)]
pub struct ChainMemory {
    store: Option<Arc<dyn SimilarityStore>>,
    k: usize,
}

impl ChainMemory {
    pub fn new(store: Arc<dyn SimilarityStore>, k: usize) -> Self {
        Self { store: Some(store), k }
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn is_enabled(&self) -> bool {
        self.store.is_some() && self.k > 0
    }

    /// 检索相似链并整理为示例消息
    pub async fn examples(&self, task: &str, current_tools: &[ToolSpec]) -> Vec<Message> {
        let Some(store) = self.store.as_ref().filter(|_| self.k > 0) else {
            return Vec::new();
        };
        match store.similar(task, self.k).await {
            Ok(chains) => {
                tracing::debug!(found = chains.len(), "similar chains retrieved");
                prepare_examples_messages(&chains, current_tools)
            }
            Err(e) => {
                tracing::warn!(error = %e, "chain retrieval failed, continuing without examples");
                Vec::new()
            }
        }
    }
}

/// 每条链：一条 system 头（任务与工具可用性 ✓/✗）+ 其历史；文本中的任务标记统一改写为 EXAMPLE_TASK
pub fn prepare_examples_messages(chains: &[Chain], current_tools: &[ToolSpec]) -> Vec<Message> {
    let mut messages = Vec::new();
    for chain in chains {
        messages.push(Message::system(crate::react::prompts::example_header(
            &chain.task,
            &tool_availability(&chain.tools, current_tools),
        )));
        for msg in &chain.messages {
            let mut msg = msg.clone();
            msg.content = msg.content.map(|c| c.map_text(rewrite_task_markers));
            messages.push(msg);
        }
    }
    messages
}

fn rewrite_task_markers(text: &str) -> String {
    text.replace("CURRENT_TASK", "TASK")
        .replace("EXAMPLE_TASK", "TASK")
        .replace("TASK", "EXAMPLE_TASK")
}

/// 按名称排序，逐个标注当前是否可用
fn tool_availability(chain_tools: &[ToolSpec], current_tools: &[ToolSpec]) -> String {
    let mut names: Vec<&str> = chain_tools.iter().map(ToolSpec::name).collect();
    names.sort_unstable();
    names.dedup();
    if names.is_empty() {
        return "(none)".to_string();
    }
    names
        .into_iter()
        .map(|name| {
            let mark = if current_tools.iter().any(|t| t.name() == name) {
                "✓"
            } else {
                "✗"
            };
            format!("{name} {mark}")
        })
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct FixedStore(Vec<Chain>);

    #[async_trait]
    impl SimilarityStore for FixedStore {
        async fn similar(&self, _task: &str, k: usize) -> Result<Vec<Chain>, String> {
            Ok(self.0.iter().take(k).cloned().collect())
        }
    }

    struct BrokenStore;

    #[async_trait]
    impl SimilarityStore for BrokenStore {
        async fn similar(&self, _task: &str, _k: usize) -> Result<Vec<Chain>, String> {
            Err("corrupt index".to_string())
        }
    }

    fn spec(name: &str) -> ToolSpec {
        ToolSpec::function(name, "", json!({}))
    }

    fn chain() -> Chain {
        Chain {
            task: "integrate x^2".to_string(),
            messages: vec![
                Message::system("CURRENT_TASK: integrate x^2"),
                Message::assistant("The TASK asks for an antiderivative."),
            ],
            tools: vec![spec("wolfram"), spec("python")],
        }
    }

    #[test]
    fn test_prepare_examples_rewrites_markers() {
        let messages = prepare_examples_messages(&[chain()], &[spec("python")]);
        assert_eq!(messages.len(), 3);
        let header = messages[0].content_text();
        assert!(header.contains("python ✓, wolfram ✗"));
        assert_eq!(messages[1].content_text(), "EXAMPLE_TASK: integrate x^2");
        assert_eq!(messages[2].content_text(), "The EXAMPLE_TASK asks for an antiderivative.");
    }

    #[test]
    fn test_rewrite_is_stable() {
        let once = rewrite_task_markers("EXAMPLE_TASK and CURRENT_TASK");
        assert_eq!(once, "EXAMPLE_TASK and EXAMPLE_TASK");
        assert_eq!(rewrite_task_markers(&once), once);
    }

    #[tokio::test]
    async fn test_examples_from_store() {
        let memory = ChainMemory::new(Arc::new(FixedStore(vec![chain(), chain()])), 1);
        let messages = memory.examples("integrate x^3", &[spec("python")]).await;
        assert_eq!(messages.len(), 3);
    }

    #[tokio::test]
    async fn test_store_failure_yields_no_examples() {
        let memory = ChainMemory::new(Arc::new(BrokenStore), 3);
        assert!(memory.examples("anything", &[]).await.is_empty());
        assert!(ChainMemory::disabled().examples("anything", &[]).await.is_empty());
    }
}
