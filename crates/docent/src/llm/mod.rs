//! Chat model abstraction.
//!
//! Nodes of the conversation graph only see [`ChatModel`]; the concrete
//! OpenAI-compatible client lives in [`openai`].

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

pub mod openai;

pub use openai::OpenAiChatModel;

/// A single message in a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: Option<String>,
    /// Tool calls requested by the assistant (only present when role=Assistant)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    /// ID of the tool call this message is responding to (only present when role=Tool)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Name of the tool (only present when role=Tool)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ChatMessage {
    fn with_role(role: ChatRole, content: Option<String>) -> Self {
        Self {
            role,
            content,
            tool_calls: None,
            tool_call_id: None,
            name: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::with_role(ChatRole::System, Some(content.into()))
    }
    pub fn user(content: impl Into<String>) -> Self {
        Self::with_role(ChatRole::User, Some(content.into()))
    }
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::with_role(ChatRole::Assistant, Some(content.into()))
    }
    pub fn assistant_tool_calls(tool_calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls: Some(tool_calls),
            ..Self::with_role(ChatRole::Assistant, None)
        }
    }
    pub fn tool_result(
        tool_call_id: impl Into<String>,
        name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            tool_call_id: Some(tool_call_id.into()),
            name: Some(name.into()),
            ..Self::with_role(ChatRole::Tool, Some(content.into()))
        }
    }

    /// Tool calls still waiting for results. Empty for anything but an assistant message.
    pub fn pending_tool_calls(&self) -> &[ToolCall] {
        match (&self.role, &self.tool_calls) {
            (ChatRole::Assistant, Some(calls)) => calls,
            _ => &[],
        }
    }

    pub fn text(&self) -> &str {
        self.content.as_deref().unwrap_or("")
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    #[serde(alias = "human")]
    User,
    Assistant,
    Tool,
}

/// A tool call emitted by the LLM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Unique ID for this tool call (used to correlate with tool result)
    pub id: String,
    pub name: String,
    /// JSON arguments string
    pub arguments: String,
}

/// Schema describing a tool the LLM can call (OpenAI-compatible format).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    /// JSON Schema for the tool's parameters
    pub parameters: JsonValue,
}

/// What the model produced for one invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatResponse {
    Content(String),
    ToolCalls(Vec<ToolCall>),
}

impl ChatResponse {
    pub fn into_message(self) -> ChatMessage {
        match self {
            Self::Content(text) => ChatMessage::assistant(text),
            Self::ToolCalls(calls) => ChatMessage::assistant_tool_calls(calls),
        }
    }
}

/// Opaque prompt -> message call. Implementations never retry.
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn invoke(&self, messages: &[ChatMessage], tools: &[ToolSchema]) -> Result<ChatResponse>;

    fn model_name(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_tool_calls_only_on_assistant() {
        let call = ToolCall {
            id: "call_1".into(),
            name: "lexical_search".into(),
            arguments: "{}".into(),
        };
        let msg = ChatResponse::ToolCalls(vec![call.clone()]).into_message();
        assert_eq!(msg.role, ChatRole::Assistant);
        assert_eq!(msg.pending_tool_calls(), &[call]);

        let result = ChatMessage::tool_result("call_1", "lexical_search", "[]");
        assert!(result.pending_tool_calls().is_empty());
        assert_eq!(result.text(), "[]");
    }

    #[test]
    fn test_role_accepts_human_alias() {
        let msg: ChatMessage =
            serde_json::from_value(serde_json::json!({"role": "human", "content": "hi"})).unwrap();
        assert_eq!(msg.role, ChatRole::User);
        let back = serde_json::to_value(&msg).unwrap();
        assert_eq!(back["role"], "user");
        assert!(back.get("tool_calls").is_none());
    }
}
