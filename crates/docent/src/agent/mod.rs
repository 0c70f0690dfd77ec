//! Conversation agent: turn graph, prompt selection, tools, checkpoints and
//! the lifecycle wrapped around them.

pub mod builtin_tools;
pub mod checkpoint;
pub mod configurer;
pub mod graph;
pub mod lifecycle;
pub mod prompt;
pub mod state;
pub mod tools;

pub use builtin_tools::{HybridSearchTool, LexicalSearchTool, RecognitionTool, VectorSearchTool};
pub use checkpoint::{
    CheckpointMetadata, CheckpointSource, Checkpointer, FileCheckpointer, HistoryFilter, InMemoryCheckpointer,
    StateSnapshot,
};
pub use configurer::{AgentComponents, AgentConfigurer, Collaborators, ServiceConfigurer};
pub use graph::{route_entry, ConversationGraph, Node, RunConfig, StreamItem, StreamMode, Topology};
pub use lifecycle::Agent;
pub use prompt::{select_variant, Branch, FixedReply, MessageKind, PromptVariant};
pub use state::{AgentState, AgentStatus, Attachment, ConversationState, Progress, ProgressStatus, TurnInput};
pub use tools::{execute_tool_call, AgentTool, ToolInput, ToolRegistry, ToolResult};
