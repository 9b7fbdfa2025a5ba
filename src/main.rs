//! Reasoner 命令行入口
//!
//! `reasoner <task>` 输出最终回答；`reasoner --ensemble <task>` 按 [ensemble] 配置并行推理，
//! 输出协调者回答及各 agent 的回答。Ctrl-C 在下一个步边界取消推理。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;

use reasoner::config::load_config;
use reasoner::{observability, ReasoningTask, Runtime};

#[derive(Parser)]
#[command(name = "reasoner", version, about = "Multi-step LLM reasoning with tools, forkable sandboxes and ensembles")]
struct Cli {
    /// 任务文本
    task: String,

    /// 配置文件（叠加在 config/default.toml 之上）
    #[arg(long)]
    config: Option<PathBuf>,

    /// 集成模式
    #[arg(long)]
    ensemble: bool,

    /// 图片 URL 或 data URI
    #[arg(long)]
    image: Option<String>,

    /// 最大推理步数
    #[arg(long)]
    steps: Option<usize>,

    /// beam search 候选数（< 2 关闭）
    #[arg(long)]
    beam: Option<usize>,

    /// 反思模式：偶数步改为反思提示
    #[arg(long)]
    reflect: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();
    let cli = Cli::parse();

    let mut config = load_config(cli.config.clone()).context("Failed to load config")?;
    if cli.steps.is_some() {
        config.reasoning.max_reasoning_steps = cli.steps;
    }
    if cli.beam.is_some() {
        config.reasoning.beam_candidates = cli.beam;
    }
    if cli.reflect {
        config.reasoning.reflection_mode = true;
    }

    let cancel = CancellationToken::new();
    let runtime = Runtime::from_config(config)
        .context("Failed to build runtime")?
        .with_cancel_token(cancel.clone());
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, cancelling");
            cancel.cancel();
        }
    });

    let mut task = ReasoningTask::new(cli.task);
    if let Some(image) = cli.image {
        task = task.with_image(image);
    }

    if cli.ensemble {
        let result = Arc::new(runtime)
            .ensemble(&task)
            .await
            .context("Ensemble run failed")?;
        println!("{}", result.answer.content_text());
        for run in &result.agents {
            println!("\n--- {} ---\n{}", run.agent.model, run.final_answer.content_text());
        }
        for failure in &result.failures {
            println!("\n--- {} (failed) ---\n{}", failure.model, failure.error);
        }
    } else {
        let agent = runtime.config().llm.agent();
        let result = runtime
            .complete_reasoning_task(&agent, &task)
            .await
            .context("Reasoning failed")?;
        println!("{}", result.final_answer.content_text());
    }
    Ok(())
}
