//! Beam search：一步内并发生成 N 个候选，各自在分叉分支中执行 python，评审后选一个
//!
//! - 候选 i 的温度为 `base + spread * i / N`，避免重复内容；
//! - 生成失败的候选记为失败占位，批大小始终为 N；
//! - 每个含 python 调用的候选从当前分支分叉，候选之间看不到彼此的沙箱；
//! - 评审回复按 `<index>|<explanation>` 解析，解析失败取 0；选中失败占位时取编号最小的可用候选；
//! - 选中后立即删除本步新建的其它分支。评审请求本身失败则删除全部新分支并向上传播。

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use regex::Regex;
use tracing::Instrument;

use crate::config::AgentConfig;
use crate::core::{AgentError, RecoveryAction, RecoveryEngine, WorkerPool};
use crate::llm::{ChatRequest, LlmClient};
use crate::memory::Message;
use crate::react::prompts;
use crate::sandbox::BranchId;
use crate::tools::{parse_arguments, ToolContext, ToolError, ToolExecutor, ToolSpec, PYTHON_TOOL};

#[derive(Debug, Clone)]
pub struct BeamSettings {
    pub candidates: usize,
    pub temperature_spread: f32,
    pub judge_temperature: f32,
}

/// 一个候选下一步
#[derive(Debug, Clone)]
pub struct Candidate {
    pub index: usize,
    pub message: Option<Message>,
    /// 执行 python 时分叉出的分支
    pub branch: Option<BranchId>,
    /// tool_call_id → 已执行的结果
    pub tool_results: HashMap<String, String>,
    pub failure: Option<String>,
}

impl Candidate {
    fn failed(index: usize, reason: String) -> Self {
        Self {
            index,
            message: None,
            branch: None,
            tool_results: HashMap::new(),
            failure: Some(reason),
        }
    }

    pub fn is_viable(&self) -> bool {
        self.failure.is_none() && self.message.is_some()
    }

    /// 给评审看的候选描述
    fn describe(&self) -> String {
        let Some(message) = self.message.as_ref().filter(|_| self.is_viable()) else {
            return format!(
                "(this candidate failed: {})",
                self.failure.as_deref().unwrap_or("no message")
            );
        };
        let mut text = message.content_text();
        for call in &message.tool_calls {
            text.push_str(&format!("\nTool call: {}({})", call.name(), call.function.arguments));
            if let Some(result) = self.tool_results.get(&call.id) {
                text.push_str(&format!("\nResult:\n{result}"));
            }
        }
        if text.trim().is_empty() {
            text = "(empty)".to_string();
        }
        text
    }
}

/// 被采纳的候选
#[derive(Debug, Clone)]
pub struct BeamOutcome {
    pub message: Message,
    /// 采纳后所在分支（候选未分叉时为原分支）
    pub branch: BranchId,
    pub tool_results: HashMap<String, String>,
    pub chosen: usize,
    pub candidates: usize,
    pub explanation: String,
}

pub struct BeamSearchCoordinator {
    llm: Arc<dyn LlmClient>,
    executor: ToolExecutor,
    pool: WorkerPool,
    settings: BeamSettings,
}

impl BeamSearchCoordinator {
    pub fn new(llm: Arc<dyn LlmClient>, executor: ToolExecutor, pool: WorkerPool, settings: BeamSettings) -> Self {
        Self {
            llm,
            executor,
            pool,
            settings,
        }
    }

    pub async fn step(
        &self,
        agent: &AgentConfig,
        history: &[Message],
        tools: &[ToolSpec],
        ctx: &ToolContext,
    ) -> Result<BeamOutcome, AgentError> {
        let span = tracing::info_span!("beam_step", candidates = self.settings.candidates, branch = %ctx.branch);
        self.step_inner(agent, history, tools, ctx).instrument(span).await
    }

    async fn step_inner(
        &self,
        agent: &AgentConfig,
        history: &[Message],
        tools: &[ToolSpec],
        ctx: &ToolContext,
    ) -> Result<BeamOutcome, AgentError> {
        let n = self.settings.candidates.max(1);
        let units: Vec<_> = (0..n)
            .map(|i| {
                let llm = self.llm.clone();
                let executor = self.executor.clone();
                let ctx = ctx.clone();
                let temperature = agent.temperature + self.settings.temperature_spread * i as f32 / n as f32;
                let request = ChatRequest::new(agent, history.to_vec(), tools.to_vec()).with_temperature(temperature);
                move || generate_candidate(i, llm, executor, request, ctx)
            })
            .collect();

        let mut candidates: Vec<Candidate> = (0..n)
            .map(|i| Candidate::failed(i, "not reported".to_string()))
            .collect();
        for outcome in self.pool.run_all(units).await {
            candidates[outcome.index] = match outcome.result {
                Ok(candidate) => candidate,
                Err(e) => {
                    tracing::warn!(candidate = outcome.index, error = %e, "candidate generation failed");
                    Candidate::failed(outcome.index, e.to_string())
                }
            };
        }
        let new_branches: Vec<BranchId> = candidates.iter().filter_map(|c| c.branch.clone()).collect();

        if !candidates.iter().any(Candidate::is_viable) {
            ctx.branches.discard(&new_branches).await;
            return Err(AgentError::NoViableCandidate(n));
        }

        let descriptions: Vec<String> = candidates.iter().map(Candidate::describe).collect();
        let mut judge_history = history.to_vec();
        judge_history.push(Message::user(prompts::judge_prompt(&descriptions)));
        let judge_request =
            ChatRequest::new(agent, judge_history, Vec::new()).with_temperature(self.settings.judge_temperature);
        let verdict = match self.llm.chat(&judge_request).await {
            Ok(reply) => reply.content_text(),
            Err(e) => {
                ctx.branches.discard(&new_branches).await;
                return Err(e.into());
            }
        };

        let parsed = parse_verdict(&verdict);
        if parsed.is_none() {
            tracing::warn!(verdict = %verdict, "judge verdict unparsable, using candidate 0");
        }
        let (picked, explanation) = parsed.unwrap_or_else(|| (0, String::new()));
        let chosen = select_winner(Some(picked), &candidates).ok_or(AgentError::NoViableCandidate(n))?;
        if chosen != picked {
            tracing::warn!(picked, chosen, "judge picked an unusable candidate");
        }

        let winner = candidates.swap_remove(chosen);
        let losers: Vec<BranchId> = new_branches
            .into_iter()
            .filter(|b| Some(b) != winner.branch.as_ref())
            .collect();
        ctx.branches.discard(&losers).await;

        let message = winner.message.ok_or(AgentError::NoViableCandidate(n))?;
        tracing::info!(chosen, candidates = n, "beam candidate selected");
        Ok(BeamOutcome {
            message,
            branch: winner.branch.unwrap_or_else(|| ctx.branch.clone()),
            tool_results: winner.tool_results,
            chosen,
            candidates: n,
            explanation,
        })
    }
}

/// 生成一个候选，并在其自己的分叉中按顺序执行全部 python 调用
async fn generate_candidate(
    index: usize,
    llm: Arc<dyn LlmClient>,
    executor: ToolExecutor,
    request: ChatRequest,
    ctx: ToolContext,
) -> Result<Candidate, AgentError> {
    let message = llm.chat(&request).await?;
    let python_calls: Vec<_> = message
        .tool_calls
        .iter()
        .filter(|c| c.name() == PYTHON_TOOL)
        .cloned()
        .collect();
    let mut candidate = Candidate {
        index,
        message: Some(message),
        branch: None,
        tool_results: HashMap::new(),
        failure: None,
    };
    if python_calls.is_empty() {
        return Ok(candidate);
    }

    let branch = ctx.branches.fork(&ctx.branch)?;
    candidate.branch = Some(branch.clone());
    let fork_ctx = ctx.on_branch(branch);
    let recovery = RecoveryEngine::new();
    for call in python_calls {
        let result = match parse_arguments(&call.function) {
            Ok(args) => executor.execute(PYTHON_TOOL, args, &fork_ctx).await,
            Err(e) => Err(AgentError::Tool(e)),
        };
        let content = match result {
            Ok(content) => content,
            Err(AgentError::Tool(e @ (ToolError::Sandbox(_) | ToolError::Timeout { .. }))) => {
                tracing::warn!(candidate = index, error = %e, "candidate sandbox failed");
                candidate.failure = Some(e.to_string());
                return Ok(candidate);
            }
            Err(e) => match recovery.handle(&e) {
                RecoveryAction::RetryWithPrompt(feedback) => feedback,
                RecoveryAction::Abort => {
                    candidate.failure = Some(e.to_string());
                    return Ok(candidate);
                }
            },
        };
        candidate.tool_results.insert(call.id.clone(), content);
    }
    Ok(candidate)
}

fn verdict_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"(?s)^\s*(\d+)\s*\|(.*)").ok())
        .as_ref()
}

/// 解析 `<index>|<explanation>`
pub fn parse_verdict(text: &str) -> Option<(usize, String)> {
    let caps = verdict_pattern()?.captures(text)?;
    let index = caps.get(1)?.as_str().parse().ok()?;
    let explanation = caps.get(2).map(|m| m.as_str().trim().to_string()).unwrap_or_default();
    Some((index, explanation))
}

/// 评审选择越界或不可用时回退：先回退到 0，再回退到编号最小的可用候选
pub fn select_winner(verdict: Option<usize>, candidates: &[Candidate]) -> Option<usize> {
    let picked = verdict.filter(|i| *i < candidates.len()).unwrap_or(0);
    if candidates.get(picked).is_some_and(Candidate::is_viable) {
        return Some(picked);
    }
    candidates.iter().position(Candidate::is_viable)
}
