//! 集成模式：多个 agent 并行独立求解，再由协调者综合
//!
//! 扇出经 WorkerPool（并发上限、单 agent 超时）；单个 agent 失败只记录并排除，全部失败才报错。
//! 扇入在全部 agent 上报后进行：把每个成功 agent 的推理记录与最终回答拼进综合任务，
//! 以协调者配置再跑一次完整推理（不检索示例链）。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::Instrument;

use crate::agent::{ReasoningResult, ReasoningTask};
use crate::config::AgentConfig;
use crate::core::{AgentError, WorkerPool};
use crate::memory::{Message, Role};
use crate::react::prompts;

/// 运行单个 agent 的完整推理
#[async_trait]
pub trait AgentRunner: Send + Sync {
    async fn run_agent(&self, agent: &AgentConfig, task: &ReasoningTask) -> Result<ReasoningResult, AgentError>;
}

/// 被排除的 agent
#[derive(Debug, Clone)]
pub struct AgentFailure {
    pub model: String,
    pub error: String,
}

#[derive(Debug, Clone)]
pub struct EnsembleResult {
    /// 协调者的最终回答
    pub answer: Message,
    pub coordinator: ReasoningResult,
    /// 成功的 agent，按提交顺序
    pub agents: Vec<ReasoningResult>,
    pub failures: Vec<AgentFailure>,
}

pub struct EnsembleCoordinator {
    runner: Arc<dyn AgentRunner>,
    max_workers: Option<usize>,
    agent_timeout: Option<Duration>,
}

impl EnsembleCoordinator {
    pub fn new(runner: Arc<dyn AgentRunner>) -> Self {
        Self {
            runner,
            max_workers: None,
            agent_timeout: None,
        }
    }

    pub fn with_max_workers(mut self, max_workers: Option<usize>) -> Self {
        self.max_workers = max_workers;
        self
    }

    pub fn with_agent_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.agent_timeout = timeout;
        self
    }

    pub async fn run(
        &self,
        task: &ReasoningTask,
        agents: &[AgentConfig],
        coordinator: &AgentConfig,
    ) -> Result<EnsembleResult, AgentError> {
        if agents.is_empty() {
            return Err(AgentError::Config("ensemble needs at least one agent".to_string()));
        }
        let span = tracing::info_span!("ensemble", agents = agents.len());
        self.run_inner(task, agents, coordinator).instrument(span).await
    }

    async fn run_inner(
        &self,
        task: &ReasoningTask,
        agents: &[AgentConfig],
        coordinator: &AgentConfig,
    ) -> Result<EnsembleResult, AgentError> {
        let pool = WorkerPool::new(self.max_workers.unwrap_or(agents.len())).with_unit_timeout(self.agent_timeout);
        let units: Vec<_> = agents
            .iter()
            .map(|agent| {
                let runner = self.runner.clone();
                let agent = agent.clone();
                let task = task.clone();
                move || async move { runner.run_agent(&agent, &task).await }
            })
            .collect();

        let mut outcomes = pool.run_all(units).await;
        outcomes.sort_by_key(|o| o.index);

        let mut runs = Vec::new();
        let mut failures = Vec::new();
        for outcome in outcomes {
            let model = agents[outcome.index].model.clone();
            match outcome.result {
                Ok(run) => runs.push(run),
                Err(e) => {
                    tracing::warn!(agent = outcome.index, model = %model, error = %e, "agent excluded from ensemble");
                    failures.push(AgentFailure {
                        model,
                        error: e.to_string(),
                    });
                }
            }
        }

        if runs.is_empty() {
            let summary = failures
                .iter()
                .map(|f| format!("{}: {}", f.model, f.error))
                .collect::<Vec<_>>()
                .join("; ");
            return Err(AgentError::AllAgentsFailed {
                count: failures.len(),
                failures: summary,
            });
        }
        tracing::info!(succeeded = runs.len(), failed = failures.len(), "agents finished, synthesizing");

        let synthesis = ReasoningTask {
            task: prompts::synthesis_task(&task.task, &format_agent_results(&runs)),
            image: task.image.clone(),
            output_tools: task.output_tools.clone(),
            use_chain_memory: false,
        };
        let coordinator_run = self.runner.run_agent(coordinator, &synthesis).await?;
        Ok(EnsembleResult {
            answer: coordinator_run.final_answer.clone(),
            coordinator: coordinator_run,
            agents: runs,
            failures,
        })
    }
}

/// 每个 agent 一节：推理记录 + 最终回答
pub fn format_agent_results(runs: &[ReasoningResult]) -> String {
    runs.iter()
        .enumerate()
        .map(|(i, run)| {
            format!(
                "## Agent {} ({})\n### Reasoning\n{}\n### Final answer\n{}",
                i + 1,
                run.agent.model,
                render_transcript(&run.transcript),
                run.final_answer.content_text()
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// 把推理记录渲染为文本；任务 system 消息不重复
pub fn render_transcript(messages: &[Message]) -> String {
    let mut lines = Vec::new();
    for msg in messages.iter().filter(|m| m.role != Role::System) {
        let role = match msg.role {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        };
        let text = msg.content_text();
        if !text.trim().is_empty() {
            lines.push(format!("[{role}] {}", text.trim()));
        }
        for call in &msg.tool_calls {
            lines.push(format!("[{role}] Tool call: {}({})", call.name(), call.function.arguments));
        }
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::ToolCall;

    #[test]
    fn test_render_transcript_skips_system() {
        let messages = vec![
            Message::system("CURRENT_TASK: 2 + 2"),
            Message::user("Think about the next step"),
            Message::assistant_with_tool_calls(
                Some("compute".to_string()),
                vec![ToolCall::new("c1", "python", r#"{"code":"2+2"}"#)],
            ),
            Message::tool("c1", "4"),
        ];
        let text = render_transcript(&messages);
        assert!(!text.contains("CURRENT_TASK"));
        assert!(text.contains("[assistant] Tool call: python({\"code\":\"2+2\"})"));
        assert!(text.ends_with("[tool] 4"));
    }
}
