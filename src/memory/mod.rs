//! 记忆层：对话（两条视图与显式边界）、示例链检索、链存储、对话日志

pub mod chain;
pub mod chain_store;
pub mod conversation;
pub mod persistence;

pub use chain::{prepare_examples_messages, Chain, ChainMemory, SimilarityStore};
pub use chain_store::{cosine_similarity, JsonChainStore};
pub use conversation::{
    repair_tool_pairing, ContentPart, Conversation, FunctionCall, ImageUrl, Message, MessageContent, Role, ToolCall,
};
pub use persistence::{write_conversation_log, ConversationLog};
