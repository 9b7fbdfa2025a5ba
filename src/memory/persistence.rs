//! 对话日志
//!
//! 每次运行写一个 `conversation_<时间戳>_<id>.json`，记录任务、模型参数、推理记录、最终回复与两组工具。

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::memory::Message;
use crate::tools::ToolSpec;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationLog {
    pub run_id: String,
    pub task: String,
    pub model: String,
    pub temperature: f32,
    pub top_p: f32,
    pub max_tokens: u32,
    pub transcript: Vec<Message>,
    /// 最终回复（含可能的输出工具调用）
    pub final_response: Message,
    pub thinking_tools: Vec<ToolSpec>,
    #[serde(default)]
    pub output_tools: Vec<ToolSpec>,
    pub saved_at: DateTime<Utc>,
}

/// 写入日志文件；目录不存在时自动创建，返回文件路径
pub fn write_conversation_log(dir: impl AsRef<Path>, log: &ConversationLog) -> anyhow::Result<PathBuf> {
    let dir = dir.as_ref();
    std::fs::create_dir_all(dir)?;
    let short_id: String = log.run_id.chars().filter(|c| *c != '-').take(8).collect();
    let file = dir.join(format!(
        "conversation_{}_{}.json",
        log.saved_at.format("%Y%m%d_%H%M%S"),
        short_id
    ));
    std::fs::write(&file, serde_json::to_string_pretty(log)?)?;
    Ok(file)
}
