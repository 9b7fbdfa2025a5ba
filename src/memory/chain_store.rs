//! JSON 文件链存储：按任务嵌入做余弦相似度检索
//!
//! 单文件 JSON 数组，每条记录含任务、嵌入、推理记录、最终回答、工具集与保存时间。
//! 保存时过长的 tool 消息替换为占位文本以节省 token。文件不存在或损坏时检索返回空。

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::llm::EmbeddingProvider;
use crate::memory::chain::{Chain, SimilarityStore};
use crate::memory::{Message, MessageContent, Role};
use crate::tools::ToolSpec;

/// tool 消息超过该字符数时被替换
const MAX_TOOL_CHARS: usize = 1500;
const REDACTED: &str = "[redacted for token savings]";

#[derive(Clone, Debug, Serialize, Deserialize)]
struct StoredChain {
    task: String,
    embedding: Vec<f32>,
    messages: Vec<Message>,
    #[serde(default)]
    final_answer: Option<String>,
    #[serde(default)]
    tools: Vec<ToolSpec>,
    saved_at: DateTime<Utc>,
}

pub struct JsonChainStore {
    path: PathBuf,
    embedder: Arc<dyn EmbeddingProvider>,
    write_lock: Mutex<()>,
}

impl JsonChainStore {
    pub fn new(path: impl AsRef<Path>, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            embedder,
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> anyhow::Result<Vec<StoredChain>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(data) if data.trim().is_empty() => Ok(Vec::new()),
            Ok(data) => serde_json::from_str(&data)
                .with_context(|| format!("chain store {} is corrupt", self.path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// 追加一条链；写入先落临时文件再重命名
    pub async fn save(
        &self,
        task: &str,
        transcript: &[Message],
        final_answer: &Message,
        tools: &[ToolSpec],
    ) -> anyhow::Result<()> {
        let embedding = self
            .embedder
            .embed(task)
            .await
            .map_err(|e| anyhow::anyhow!("embedding failed: {e}"))?;

        let _guard = self.write_lock.lock().await;
        let mut chains = self.load().await?;
        chains.push(StoredChain {
            task: task.to_string(),
            embedding,
            messages: transcript.iter().map(redact).collect(),
            final_answer: Some(final_answer.content_text()),
            tools: tools.to_vec(),
            saved_at: Utc::now(),
        });

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_string_pretty(&chains)?).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        tracing::debug!(path = %self.path.display(), total = chains.len(), "chain saved");
        Ok(())
    }

    pub async fn len(&self) -> usize {
        self.load().await.map(|c| c.len()).unwrap_or(0)
    }
}

#[async_trait]
impl SimilarityStore for JsonChainStore {
    async fn similar(&self, task: &str, k: usize) -> Result<Vec<Chain>, String> {
        let chains = match self.load().await {
            Ok(chains) => chains,
            Err(e) => {
                tracing::warn!(error = %e, "chain store unreadable");
                return Ok(Vec::new());
            }
        };
        if chains.is_empty() || k == 0 {
            return Ok(Vec::new());
        }
        let query = self.embedder.embed(task).await?;
        let mut scored: Vec<(f32, StoredChain)> = chains
            .into_iter()
            .map(|c| (cosine_similarity(&query, &c.embedding), c))
            .collect();
        scored.sort_by(|a, b| b.0.total_cmp(&a.0));
        Ok(scored
            .into_iter()
            .take(k)
            .map(|(_, c)| Chain {
                task: c.task,
                messages: c.messages,
                tools: c.tools,
            })
            .collect())
    }
}

fn redact(msg: &Message) -> Message {
    let mut msg = msg.clone();
    if msg.role == Role::Tool && msg.content_text().chars().count() > MAX_TOOL_CHARS {
        msg.content = Some(MessageContent::Text(REDACTED.to_string()));
    }
    msg
}

/// 长度不同或零向量时为 0
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        dot / (na * nb)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 按关键词给出二维向量
    struct KeywordEmbedder;

    #[async_trait]
    impl EmbeddingProvider for KeywordEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>, String> {
            let math = if text.contains("integral") { 1.0 } else { 0.0 };
            let geo = if text.contains("capital") { 1.0 } else { 0.0 };
            Ok(vec![math, geo])
        }
    }

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }

    #[tokio::test]
    async fn test_save_and_rank() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonChainStore::new(dir.path().join("chains.json"), Arc::new(KeywordEmbedder));
        let answer = Message::assistant("done");

        store
            .save("capital of France", &[Message::user("q")], &answer, &[])
            .await
            .unwrap();
        store
            .save(
                "integral of x",
                &[Message::tool("c1", "x".repeat(2000)), Message::tool("c2", "short")],
                &answer,
                &[],
            )
            .await
            .unwrap();
        assert_eq!(store.len().await, 2);

        let found = store.similar("an integral please", 1).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].task, "integral of x");
        assert_eq!(found[0].messages[0].content_text(), REDACTED);
        assert_eq!(found[0].messages[1].content_text(), "short");
    }

    #[tokio::test]
    async fn test_missing_or_corrupt_store_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chains.json");
        let store = JsonChainStore::new(&path, Arc::new(KeywordEmbedder));
        assert!(store.similar("integral", 3).await.unwrap().is_empty());

        std::fs::write(&path, "{ not json").unwrap();
        assert!(store.similar("integral", 3).await.unwrap().is_empty());
        assert!(store
            .save("integral", &[], &Message::assistant("x"), &[])
            .await
            .is_err());
    }
}
