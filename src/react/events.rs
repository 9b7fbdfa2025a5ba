//! 推理过程事件：用于流式展示步骤、思考、工具调用、观察与最终回答

use serde::Serialize;

/// 单步过程事件（可序列化为 JSON 供前端展示）
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReactEvent {
    /// 步数更新；max_steps 为 None 表示不限
    StepUpdate { step: usize, max_steps: Option<usize> },
    /// 模型本步的文本内容
    ThinkingContent { text: String },
    ToolCall {
        tool: String,
        args: serde_json::Value,
    },
    /// 工具返回（预览，避免过长）
    Observation { tool: String, preview: String },
    /// 工具失败，已反馈给模型
    ToolFailure { tool: String, reason: String },
    /// beam search 选中的候选
    BeamSelected {
        chosen: usize,
        candidates: usize,
        explanation: String,
    },
    /// 步数耗尽，强制结束
    ForcedCompletion { step: usize },
    FinalAnswer { text: String },
}
