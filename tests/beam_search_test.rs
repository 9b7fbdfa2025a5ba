//! Beam search 集成测试：候选失败回退、评审解析回退、分叉隔离与败者分支清理

mod common;

use std::sync::Arc;
use std::time::Duration;

use reasoner::config::AgentConfig;
use reasoner::core::{AgentError, WorkerPool};
use reasoner::llm::{ChatRequest, LlmError, MockLlmClient};
use reasoner::memory::{Message, Role};
use reasoner::react::prompts::FINAL_PROMPT;
use reasoner::react::{BeamSearchCoordinator, BeamSettings, LoopSettings, ReactEvent, ReasoningLoop, TaskInput};
use reasoner::sandbox::{BranchId, BranchManagerConfig, MockSandboxProvider, SandboxBranchManager};
use reasoner::tools::{ToolContext, ToolExecutor, ToolRegistry};

use common::{agent, branches, executor, python_call, StaticLookup};

const CANDIDATES: usize = 3;

/// 基础温度 0、扰动 3：候选 i 的温度恰为 i
fn beam_agent() -> AgentConfig {
    let mut agent = agent("test-model");
    agent.temperature = 0.0;
    agent
}

fn beam_settings() -> BeamSettings {
    BeamSettings {
        candidates: CANDIDATES,
        temperature_spread: CANDIDATES as f32,
        judge_temperature: 0.0,
    }
}

fn is_judge(request: &ChatRequest) -> bool {
    request
        .messages
        .last()
        .is_some_and(|m| m.content_text().contains("--- Candidate 0 ---"))
}

fn candidate_index(request: &ChatRequest) -> usize {
    request.temperature.round() as usize
}

fn history() -> Vec<Message> {
    vec![Message::system("CURRENT_TASK: 2 + 2 * 2"), Message::user("next step")]
}

fn coordinator(llm: Arc<MockLlmClient>) -> BeamSearchCoordinator {
    BeamSearchCoordinator::new(llm, executor(), WorkerPool::new(CANDIDATES), beam_settings())
}

#[tokio::test]
async fn test_failed_candidate_is_never_chosen() {
    let llm = Arc::new(MockLlmClient::with_responder(|request| {
        if is_judge(request) {
            return Ok(Message::assistant("0|the first one looks best"));
        }
        match candidate_index(request) {
            0 => Err(LlmError::Status {
                status: 500,
                body: "overloaded".to_string(),
            }),
            i => Ok(Message::assistant(format!("candidate {i}"))),
        }
    }));
    let (_, manager) = branches();
    let ctx = ToolContext::new("run-1", manager);

    let outcome = coordinator(llm.clone())
        .step(&beam_agent(), &history(), &executor().thinking_tools(), &ctx)
        .await
        .unwrap();

    assert_eq!(outcome.chosen, 1);
    assert_eq!(outcome.candidates, CANDIDATES);
    assert_eq!(outcome.message.content_text(), "candidate 1");
    assert_eq!(outcome.explanation, "the first one looks best");
    assert_eq!(outcome.branch, BranchId::root());

    let requests = llm.requests();
    assert_eq!(requests.len(), CANDIDATES + 1);
    let judge = requests.iter().find(|r| is_judge(r)).unwrap();
    assert!(judge.tools.is_empty());
    assert!(judge.messages.last().unwrap().content_text().contains("HTTP 500"));
}

#[tokio::test]
async fn test_unparsable_verdict_selects_first_candidate() {
    let llm = Arc::new(MockLlmClient::with_responder(|request| {
        if is_judge(request) {
            return Ok(Message::assistant("I prefer the second candidate."));
        }
        Ok(Message::assistant(format!("candidate {}", candidate_index(request))))
    }));
    let (_, manager) = branches();
    let ctx = ToolContext::new("run-1", manager);

    let outcome = coordinator(llm)
        .step(&beam_agent(), &history(), &[], &ctx)
        .await
        .unwrap();
    assert_eq!(outcome.chosen, 0);
    assert_eq!(outcome.message.content_text(), "candidate 0");
}

#[tokio::test]
async fn test_candidate_temperatures_are_spread() {
    let llm = Arc::new(MockLlmClient::with_responder(|request| {
        if is_judge(request) {
            return Ok(Message::assistant("2|ok"));
        }
        Ok(Message::assistant("step"))
    }));
    let (_, manager) = branches();
    let ctx = ToolContext::new("run-1", manager);

    coordinator(llm.clone())
        .step(&beam_agent(), &history(), &[], &ctx)
        .await
        .unwrap();

    let mut temperatures: Vec<usize> = llm
        .requests()
        .iter()
        .filter(|r| !is_judge(r))
        .map(candidate_index)
        .collect();
    temperatures.sort_unstable();
    assert_eq!(temperatures, vec![0, 1, 2]);
}

#[tokio::test]
async fn test_all_candidates_failed() {
    let llm = Arc::new(MockLlmClient::with_responder(|_| {
        Err(LlmError::Request("connection refused".to_string()))
    }));
    let (_, manager) = branches();
    let ctx = ToolContext::new("run-1", manager);

    let err = coordinator(llm.clone())
        .step(&beam_agent(), &history(), &[], &ctx)
        .await
        .unwrap_err();
    assert!(matches!(err, AgentError::NoViableCandidate(CANDIDATES)));
    assert_eq!(llm.request_count(), CANDIDATES, "judge is not consulted");
}

#[tokio::test]
async fn test_python_candidates_fork_and_losers_are_discarded() {
    let llm = Arc::new(MockLlmClient::with_responder(|request| {
        if is_judge(request) {
            return Ok(Message::assistant("2|uses the largest value"));
        }
        let i = candidate_index(request);
        Ok(python_call(&format!("c{i}"), &format!("x = {i}")))
    }));
    let (provider, manager) = branches();
    let ctx = ToolContext::new("run-1", manager.clone());

    let outcome = coordinator(llm.clone())
        .step(&beam_agent(), &history(), &executor().thinking_tools(), &ctx)
        .await
        .unwrap();

    assert_eq!(outcome.chosen, 2);
    assert!(!outcome.branch.is_root());
    assert!(outcome.tool_results["c2"].contains("ran: x = 2"));
    assert_eq!(manager.effective_history(&outcome.branch).unwrap(), vec!["x = 2"]);
    assert!(manager.own_commands(&BranchId::root()).unwrap().is_empty());

    let mut expected = vec![BranchId::root(), outcome.branch.clone()];
    expected.sort();
    assert_eq!(manager.branch_ids(), expected);

    // 每个候选各自分配一个沙箱，只看得到自己的代码
    let sandboxes = provider.sandboxes();
    assert_eq!(sandboxes.len(), CANDIDATES);
    for sandbox in &sandboxes {
        assert_eq!(sandbox.executed().len(), 1);
    }
    assert_eq!(provider.live_count(), 1);

    let judge = llm.requests().into_iter().find(is_judge).unwrap();
    assert!(judge.messages.last().unwrap().content_text().contains("ran: x = 1"));
}

#[tokio::test]
async fn test_judge_failure_discards_all_new_branches() {
    let llm = Arc::new(MockLlmClient::with_responder(|request| {
        if is_judge(request) {
            return Err(LlmError::Timeout(30));
        }
        let i = candidate_index(request);
        Ok(python_call(&format!("c{i}"), &format!("x = {i}")))
    }));
    let (provider, manager) = branches();
    let ctx = ToolContext::new("run-1", manager.clone());

    let err = coordinator(llm)
        .step(&beam_agent(), &history(), &executor().thinking_tools(), &ctx)
        .await
        .unwrap_err();
    assert!(matches!(err, AgentError::Llm(LlmError::Timeout(30))));
    assert_eq!(manager.branch_ids(), vec![BranchId::root()]);
    assert_eq!(provider.live_count(), 0);
}

#[tokio::test]
async fn test_reasoning_loop_with_beam() {
    let llm = Arc::new(MockLlmClient::with_responder(|request| {
        if is_judge(request) {
            return Ok(Message::assistant("1|verifies the result"));
        }
        if request.messages.last().is_some_and(|m| m.content_text() == FINAL_PROMPT) {
            return Ok(Message::assistant("6"));
        }
        let i = candidate_index(request);
        if i == 1 {
            return Ok(Message::assistant_with_tool_calls(
                Some("The answer is 6. <DONE>".to_string()),
                python_call("c1", "print(2 + 2 * 2)").tool_calls,
            ));
        }
        Ok(Message::assistant(format!("candidate {i}")))
    }));
    let (_, manager) = branches();
    let mut settings = LoopSettings::new(beam_agent());
    settings.beam = Some(beam_settings());
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let reasoning = ReasoningLoop::new(llm.clone(), executor(), manager.clone(), settings).with_event_tx(tx);

    let outcome = reasoning
        .run(TaskInput {
            task: "2 + 2 * 2".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();

    assert_eq!(outcome.steps, 1);
    assert_eq!(outcome.final_answer.content_text(), "6");
    assert!(!outcome.branch.is_root());
    assert_eq!(manager.effective_history(&outcome.branch).unwrap(), vec!["print(2 + 2 * 2)"]);

    // 候选已执行的 python 结果直接写入对话，不再重复执行
    let tool_msg = outcome
        .conversation
        .visible()
        .iter()
        .find(|m| m.role == Role::Tool)
        .unwrap();
    assert!(tool_msg.content_text().contains("ran: print(2 + 2 * 2)"));

    let mut selected = None;
    while let Ok(event) = rx.try_recv() {
        if let ReactEvent::BeamSelected { chosen, .. } = event {
            selected = Some(chosen);
        }
    }
    assert_eq!(selected, Some(1));
}

#[tokio::test]
async fn test_timed_out_candidate_is_failed_and_discarded() {
    let llm = Arc::new(MockLlmClient::with_responder(|request| {
        if is_judge(request) {
            return Ok(Message::assistant("1|the slow one"));
        }
        match candidate_index(request) {
            1 => Ok(python_call("c1", "x = 1  #slow")),
            i => Ok(Message::assistant(format!("candidate {i}"))),
        }
    }));
    let provider = Arc::new(MockSandboxProvider::new().with_slow_delay(Duration::from_secs(3)));
    let manager = Arc::new(SandboxBranchManager::new(
        provider.clone(),
        BranchManagerConfig {
            allocation_attempts: 1,
            allocation_backoff: Duration::from_millis(1),
        },
    ));
    let ctx = ToolContext::new("run-1", manager.clone());
    let executor = ToolExecutor::new(Arc::new(ToolRegistry::new(Arc::new(StaticLookup))), 1);
    let tools = executor.thinking_tools();
    let coordinator = BeamSearchCoordinator::new(llm.clone(), executor, WorkerPool::new(CANDIDATES), beam_settings());

    let outcome = coordinator
        .step(&beam_agent(), &history(), &tools, &ctx)
        .await
        .unwrap();

    assert_eq!(outcome.chosen, 0);
    assert_eq!(outcome.message.content_text(), "candidate 0");
    assert_eq!(outcome.branch, BranchId::root());
    let judge = llm.requests().into_iter().find(is_judge).unwrap();
    assert!(judge.messages.last().unwrap().content_text().contains("timed out"));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(manager.branch_ids(), vec![BranchId::root()]);
    assert_eq!(provider.live_count(), 0);
    assert_eq!(provider.released_ids().len(), 1);
}
