//! 推理主循环
//!
//! Stepping → (AwaitingToolResult) → Stepping … → Done | ForcedCompletion。
//! 每步先追加「下一步」提示（反思模式下偶数步改为「反思」提示），在完整历史上请求模型；
//! 回复中的工具调用按模型给出的顺序逐个执行，结果以 tool 消息追加；回复文本命中结束短语即 Done。
//! Done 之后再请求一次面向用户的最终回答；步数超过上限则直接强制结束，强制结束的回复即结果。
//!
//! 可选 beam search：把「取一个下一步」替换为「并发生成 N 个候选、各自在分叉分支执行 python、评审选一个」。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::config::AgentConfig;
use crate::core::{AgentError, RecoveryAction, RecoveryEngine, WorkerPool};
use crate::llm::{ChatRequest, LlmClient};
use crate::memory::{repair_tool_pairing, Conversation, Message, ToolCall};
use crate::react::beam::{BeamSearchCoordinator, BeamSettings};
use crate::react::prompts;
use crate::react::ReactEvent;
use crate::sandbox::{BranchId, SandboxBranchManager};
use crate::tools::{parse_arguments, ToolContext, ToolExecutor, ToolSpec};

/// 结束短语（小写，子串匹配，不区分大小写）
pub const TERMINATION_PHRASES: &[&str] = &[
    "<done>",
    "there is no next step.",
    "this conversation is complete",
    "the conversation has ended.",
    "this conversation is finished.",
    "the conversation has concluded.",
];

/// Observation 预览最大字符数
const OBSERVATION_PREVIEW_CHARS: usize = 200;
/// 思考内容展示最大字符数
const THINKING_PREVIEW_CHARS: usize = 800;

pub fn is_termination(text: &str) -> bool {
    let lower = text.to_lowercase();
    TERMINATION_PHRASES.iter().any(|p| lower.contains(p))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Stepping,
    AwaitingToolResult,
    ForcedCompletion,
    Done,
}

/// 单次运行的输入
#[derive(Debug, Clone, Default)]
pub struct TaskInput {
    pub task: String,
    /// 图片 URL 或 data URI
    pub image: Option<String>,
    /// 仅用于最终回答的工具
    pub output_tools: Vec<ToolSpec>,
    /// 注入在任务 system 消息之前的示例消息
    pub examples: Vec<Message>,
}

#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub agent: AgentConfig,
    pub max_reasoning_steps: Option<usize>,
    pub reflection_mode: bool,
    pub beam: Option<BeamSettings>,
    /// 每步开始时回收空闲超过该时长的分支
    pub max_idle: Duration,
}

impl LoopSettings {
    pub fn new(agent: AgentConfig) -> Self {
        Self {
            agent,
            max_reasoning_steps: None,
            reflection_mode: false,
            beam: None,
            max_idle: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoopOutcome {
    pub final_answer: Message,
    pub conversation: Conversation,
    /// 实际发出的步请求数
    pub steps: usize,
    pub state: LoopState,
    /// 结束时所在分支
    pub branch: BranchId,
    pub thinking_tools: Vec<ToolSpec>,
}

impl LoopOutcome {
    pub fn forced(&self) -> bool {
        self.state == LoopState::ForcedCompletion
    }
}

pub struct ReasoningLoop {
    llm: Arc<dyn LlmClient>,
    executor: ToolExecutor,
    branches: Arc<SandboxBranchManager>,
    recovery: RecoveryEngine,
    settings: LoopSettings,
    run_id: String,
    cancel_token: CancellationToken,
    event_tx: Option<UnboundedSender<ReactEvent>>,
}

impl ReasoningLoop {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        executor: ToolExecutor,
        branches: Arc<SandboxBranchManager>,
        settings: LoopSettings,
    ) -> Self {
        Self {
            llm,
            executor,
            branches,
            recovery: RecoveryEngine::new(),
            settings,
            run_id: uuid::Uuid::new_v4().to_string(),
            cancel_token: CancellationToken::new(),
            event_tx: None,
        }
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = run_id.into();
        self
    }

    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel_token = token;
        self
    }

    pub fn with_event_tx(mut self, tx: UnboundedSender<ReactEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    fn emit(&self, event: ReactEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(event);
        }
    }

    fn beam(&self) -> Option<BeamSearchCoordinator> {
        let settings = self.settings.beam.clone().filter(|b| b.candidates >= 2)?;
        let pool = WorkerPool::new(settings.candidates);
        Some(BeamSearchCoordinator::new(
            self.llm.clone(),
            self.executor.clone(),
            pool,
            settings,
        ))
    }

    pub async fn run(&self, input: TaskInput) -> Result<LoopOutcome, AgentError> {
        let span = tracing::info_span!(
            "reasoning",
            run_id = %self.run_id,
            model = %self.settings.agent.model
        );
        self.run_inner(input).instrument(span).await
    }

    async fn run_inner(&self, input: TaskInput) -> Result<LoopOutcome, AgentError> {
        let thinking_tools = self.executor.thinking_tools();
        let mut conversation = Conversation::new();
        for example in input.examples {
            conversation.push_context(example);
        }
        conversation.begin_task(Message::system(prompts::task_system_prompt(
            &input.task,
            &thinking_tools,
            &input.output_tools,
        )));
        if let Some(image) = &input.image {
            conversation.push_context(Message::user_with_image(prompts::IMAGE_INTRO, image.clone()));
        }

        let beam = self.beam();
        let mut ctx = ToolContext::new(self.run_id.clone(), self.branches.clone());
        let mut state = LoopState::Stepping;
        let mut step = 0usize;

        while state == LoopState::Stepping {
            if self.cancel_token.is_cancelled() {
                tracing::info!(step, "reasoning cancelled");
                return Err(AgentError::Cancelled);
            }
            step += 1;
            if self.settings.max_reasoning_steps.is_some_and(|max| step > max) {
                state = LoopState::ForcedCompletion;
                break;
            }
            self.emit(ReactEvent::StepUpdate {
                step,
                max_steps: self.settings.max_reasoning_steps,
            });
            tracing::debug!(step, branch = %ctx.branch, "step");

            self.branches.evict(&ctx.branch, self.settings.max_idle).await;

            let prompt = if self.settings.reflection_mode && step % 2 == 0 {
                prompts::REFLECT_PROMPT
            } else {
                prompts::STEP_PROMPT
            };
            conversation.push(Message::user(prompt));

            let (reply, mut executed) = match &beam {
                Some(beam) => {
                    let outcome = beam
                        .step(&self.settings.agent, conversation.full(), &thinking_tools, &ctx)
                        .await?;
                    self.emit(ReactEvent::BeamSelected {
                        chosen: outcome.chosen,
                        candidates: outcome.candidates,
                        explanation: outcome.explanation.clone(),
                    });
                    ctx = ctx.on_branch(outcome.branch);
                    (outcome.message, outcome.tool_results)
                }
                None => {
                    let request = ChatRequest::new(
                        &self.settings.agent,
                        conversation.full().to_vec(),
                        thinking_tools.clone(),
                    );
                    (self.llm.chat(&request).await?, HashMap::new())
                }
            };
            conversation.push(reply.clone());

            let text = reply.content_text();
            if !text.trim().is_empty() {
                self.emit(ReactEvent::ThinkingContent {
                    text: preview(&text, THINKING_PREVIEW_CHARS),
                });
            }

            if !reply.tool_calls.is_empty() {
                state = LoopState::AwaitingToolResult;
                tracing::debug!(step, ?state, calls = reply.tool_calls.len(), "executing tool calls");
                for call in &reply.tool_calls {
                    let content = match executed.remove(&call.id) {
                        Some(result) => result,
                        None => self.dispatch(call, &ctx).await?,
                    };
                    conversation.push(Message::tool(call.id.clone(), content));
                }
            }

            state = if is_termination(&text) {
                LoopState::Done
            } else {
                LoopState::Stepping
            };
        }

        let steps = if state == LoopState::ForcedCompletion { step - 1 } else { step };
        let final_answer = match state {
            LoopState::ForcedCompletion => self.force_completion(&mut conversation, steps).await?,
            _ => self.final_answer(&mut conversation, &thinking_tools, &input.output_tools).await?,
        };
        self.emit(ReactEvent::FinalAnswer {
            text: final_answer.content_text(),
        });
        tracing::info!(steps, forced = state == LoopState::ForcedCompletion, "reasoning finished");

        Ok(LoopOutcome {
            final_answer,
            conversation,
            steps,
            state,
            branch: ctx.branch,
            thinking_tools,
        })
    }

    /// 执行一个工具调用；可恢复的错误转为反馈文本，其余错误终止运行
    async fn dispatch(&self, call: &ToolCall, ctx: &ToolContext) -> Result<String, AgentError> {
        let name = call.name();
        let result = match parse_arguments(&call.function) {
            Ok(args) => {
                self.emit(ReactEvent::ToolCall {
                    tool: name.to_string(),
                    args: args.clone(),
                });
                self.executor.execute(name, args, ctx).await
            }
            Err(e) => Err(AgentError::Tool(e)),
        };

        match result {
            Ok(content) => {
                self.emit(ReactEvent::Observation {
                    tool: name.to_string(),
                    preview: preview(&content, OBSERVATION_PREVIEW_CHARS),
                });
                Ok(content)
            }
            Err(err) => match self.recovery.handle(&err) {
                RecoveryAction::RetryWithPrompt(feedback) => {
                    tracing::warn!(tool = name, error = %err, "tool call failed, feeding error back");
                    self.emit(ReactEvent::ToolFailure {
                        tool: name.to_string(),
                        reason: err.to_string(),
                    });
                    Ok(feedback)
                }
                RecoveryAction::Abort => Err(err),
            },
        }
    }

    async fn force_completion(&self, conversation: &mut Conversation, steps: usize) -> Result<Message, AgentError> {
        tracing::warn!(steps, "step budget exhausted, forcing completion");
        self.emit(ReactEvent::ForcedCompletion { step: steps });
        conversation.push(Message::system(prompts::FORCED_COMPLETION_NOTICE));
        conversation.push(Message::user(prompts::FORCED_COMPLETION_PROMPT));
        let request = ChatRequest::new(
            &self.settings.agent,
            repair_tool_pairing(conversation.full()),
            Vec::new(),
        );
        let mut reply = self.llm.chat(&request).await?;
        reply.tool_calls.clear();
        conversation.push(reply.clone());
        Ok(reply)
    }

    /// 最终回答请求：不追加到对话；只给输出工具（若有），否则给思考工具
    async fn final_answer(
        &self,
        conversation: &mut Conversation,
        thinking_tools: &[ToolSpec],
        output_tools: &[ToolSpec],
    ) -> Result<Message, AgentError> {
        conversation.push(Message::user(prompts::FINAL_PROMPT));
        let tools = if output_tools.is_empty() {
            thinking_tools.to_vec()
        } else {
            output_tools.to_vec()
        };
        let request = ChatRequest::new(
            &self.settings.agent,
            repair_tool_pairing(conversation.full()),
            tools,
        );
        Ok(self.llm.chat(&request).await?)
    }
}

fn preview(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        format!("{}...", text.chars().take(max_chars).collect::<String>())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_termination_phrases() {
        assert!(is_termination("The answer is 6. <DONE>"));
        assert!(is_termination("There is no next step."));
        assert!(is_termination("I think THIS CONVERSATION IS COMPLETE now"));
        assert!(!is_termination("The project was abandoned"));
        assert!(!is_termination("done"));
        assert!(!is_termination(""));
    }

    #[test]
    fn test_preview() {
        assert_eq!(preview("abc", 5), "abc");
        assert_eq!(preview("abcdef", 3), "abc...");
    }
}
