//! Reasoner - 多步推理引擎
//!
//! 模块划分：
//! - **agent**: 运行时，按配置组装各层；单 agent 推理与集成推理入口
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误与恢复、有界 worker 池
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / Mock / 嵌入）
//! - **memory**: 对话、示例链检索与存储、对话日志
//! - **observability**: 日志初始化
//! - **react**: 推理主循环、beam search、集成协调
//! - **sandbox**: 代码沙箱、分支树管理、按运行隔离的存储
//! - **tools**: python / 网页检索 / wolfram 工具与执行器

pub mod agent;
pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod react;
pub mod sandbox;
pub mod tools;

pub use agent::{HttpLlmFactory, LlmFactory, ReasoningResult, ReasoningTask, Runtime};
