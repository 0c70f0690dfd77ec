pub mod agent;
pub mod config;
pub mod embeddings;
pub mod error;
pub mod llm;
pub mod mcp;
pub mod processing;
pub mod recognizer;
pub mod search;
pub mod storage;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

// Re-export primary types for convenience
pub use agent::{
    Agent, AgentComponents, AgentConfigurer, AgentState, AgentStatus, Attachment,
    ConversationGraph, ConversationState, Progress, RunConfig, ServiceConfigurer, StreamItem,
    StreamMode, TurnInput,
};
pub use config::AgentConfig;
pub use error::{AgentError, NotReadyReason};
pub use search::{LexicalIndex, LexicalIndexBuilder};
pub use types::Passage;

// Re-export common types
pub use uuid::Uuid;
