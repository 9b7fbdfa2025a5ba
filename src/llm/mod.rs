//! LLM 层：客户端抽象、重试包装与实现（OpenAI 兼容 HTTP / Mock / 嵌入）

pub mod embedding;
pub mod mock;
pub mod openai;
pub mod traits;

pub use embedding::{create_embedder_from_config, EmbeddingProvider, OpenAiEmbedder};
pub use mock::MockLlmClient;
pub use openai::OpenAiClient;
pub use traits::{ChatRequest, LlmClient, LlmError, RetryConfig, RetryingLlmClient};
