//! 推理循环使用的提示词
//!
//! 措辞不影响控制流；循环只依赖这里返回的文本被追加到哪条历史。

use crate::tools::{tool_names, ToolSpec};

pub const STEP_PROMPT: &str = "Think about the next step towards solving the task. \
Use a tool if it helps. When the task is fully solved, say <DONE>.";

pub const REFLECT_PROMPT: &str = "Reflect on your previous step: check the result for mistakes \
and decide whether the approach is still right. Then continue. When the task is fully solved, say <DONE>.";

pub const FORCED_COMPLETION_NOTICE: &str =
    "The maximum number of reasoning steps has been reached. Tools are no longer available.";

pub const FORCED_COMPLETION_PROMPT: &str =
    "Using everything above, give your best final answer to the task now.";

pub const FINAL_PROMPT: &str = "Now write the final answer to the task for the user. \
Be complete and self-contained; do not refer to the reasoning steps.";

pub const IMAGE_INTRO: &str = "Here is the image:";

/// 任务 system 消息（即对话边界）
pub fn task_system_prompt(task: &str, thinking_tools: &[ToolSpec], output_tools: &[ToolSpec]) -> String {
    let mut prompt = format!(
        "You are a careful problem solver working step by step.\n\n\
         CURRENT_TASK: {task}\n\n\
         Tools for reasoning: {}.\n\
         The python tool keeps its state between calls.",
        tool_names(thinking_tools)
    );
    if !output_tools.is_empty() {
        prompt.push_str(&format!(
            "\nOutput tools (only for the final answer, not while reasoning): {}.",
            tool_names(output_tools)
        ));
    }
    prompt
}

/// 示例链的 system 头：任务与各工具是否可用
pub fn example_header(task: &str, availability: &str) -> String {
    format!(
        "The following is an example of a previously solved task.\n\
         EXAMPLE_TASK: {task}\n\
         Tools available then compared to now: {availability}"
    )
}

/// 评审 N 个候选下一步
pub fn judge_prompt(candidates: &[String]) -> String {
    let mut prompt = String::from(
        "Several candidate next steps were proposed for the conversation above. \
         Choose the one that makes the most progress with the fewest errors.\n",
    );
    for (i, candidate) in candidates.iter().enumerate() {
        prompt.push_str(&format!("\n--- Candidate {i} ---\n{candidate}\n"));
    }
    prompt.push_str(
        "\nReply in the form <index>|<explanation>, for example `1|it verifies the result`. \
         Reply with nothing else.",
    );
    prompt
}

/// 集成模式协调者的任务
pub fn synthesis_task(task: &str, agent_sections: &str) -> String {
    format!(
        "Several independent agents attempted the task below. Their reasoning and final answers follow.\n\
         Compare them, resolve disagreements (verify with tools where useful) and produce the single best answer.\n\n\
         TASK: {task}\n\n{agent_sections}"
    )
}
