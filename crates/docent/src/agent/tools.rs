//! Agent Tools - Tools the conversation graph can call

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::llm::{ChatMessage, ToolCall, ToolSchema};

/// Input for a tool execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInput {
    pub tool_id: String,
    pub parameters: serde_json::Value,
}

impl ToolInput {
    /// Required string parameter.
    pub fn str_param(&self, key: &str) -> Result<&str> {
        self.parameters
            .get(key)
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow!("Missing required string parameter `{}`", key))
    }
}

/// Result from tool execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub success: bool,
    /// Text handed back to the model.
    pub output: String,
    pub data: serde_json::Value,
    pub error: Option<String>,
}

impl ToolResult {
    pub fn ok(output: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            success: true,
            output: output.into(),
            data,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        let error = error.into();
        Self {
            success: false,
            output: format!("Tool error: {}", error),
            data: serde_json::json!({}),
            error: Some(error),
        }
    }
}

/// Trait for tools that agents can use
#[async_trait]
pub trait AgentTool: Send + Sync {
    /// Name the model calls the tool by.
    fn id(&self) -> &str;

    fn description(&self) -> &str;

    /// Parameter schema (JSON Schema format)
    fn parameters_schema(&self) -> serde_json::Value;

    async fn execute(&self, input: ToolInput) -> Result<ToolResult>;
}

/// Registry of available tools
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn AgentTool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. A later tool with the same id replaces the earlier one.
    pub fn register(&mut self, tool: Arc<dyn AgentTool>) {
        if self.tools.contains_key(tool.id()) {
            tracing::warn!(tool = %tool.id(), "Replacing tool with duplicate id");
        }
        self.tools.insert(tool.id().to_string(), tool);
    }

    pub fn get(&self, tool_id: &str) -> Option<Arc<dyn AgentTool>> {
        self.tools.get(tool_id).cloned()
    }

    pub fn contains(&self, tool_id: &str) -> bool {
        self.tools.contains_key(tool_id)
    }

    pub fn list(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Schemas in OpenAI function format, sorted by id.
    pub fn schemas(&self) -> Vec<ToolSchema> {
        self.tools
            .values()
            .map(|tool| ToolSchema {
                name: tool.id().to_string(),
                description: tool.description().to_string(),
                parameters: tool.parameters_schema(),
            })
            .collect()
    }
}

/// Execute a single tool call against the registry and wrap the outcome as a
/// tool-result message. Failures and timeouts become error text for the model.
pub async fn execute_tool_call(registry: &ToolRegistry, tool_call: &ToolCall, timeout: Duration) -> ChatMessage {
    let result = match registry.get(&tool_call.name) {
        None => ToolResult::failed(format!("Unknown tool: {}", tool_call.name)),
        Some(tool) => {
            let parameters: serde_json::Value =
                serde_json::from_str(&tool_call.arguments).unwrap_or(serde_json::json!({}));
            let input = ToolInput {
                tool_id: tool_call.name.clone(),
                parameters,
            };

            match tokio::time::timeout(timeout, tool.execute(input)).await {
                Ok(Ok(result)) => result,
                Ok(Err(e)) => ToolResult::failed(e.to_string()),
                Err(_) => ToolResult::failed(format!(
                    "Tool '{}' timed out after {}s",
                    tool_call.name,
                    timeout.as_secs()
                )),
            }
        }
    };

    if !result.success {
        tracing::warn!(
            tool = %tool_call.name,
            error = result.error.as_deref().unwrap_or_default(),
            "Tool call failed"
        );
    }
    ChatMessage::tool_result(&tool_call.id, &tool_call.name, result.output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::EchoTool;

    fn call(name: &str, arguments: &str) -> ToolCall {
        ToolCall {
            id: "call_1".into(),
            name: name.into(),
            arguments: arguments.into(),
        }
    }

    #[tokio::test]
    async fn test_execute_known_tool() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool::new("echo")));
        let msg = execute_tool_call(&registry, &call("echo", r#"{"query":"pump"}"#), Duration::from_secs(5)).await;
        assert_eq!(msg.tool_call_id.as_deref(), Some("call_1"));
        assert_eq!(msg.name.as_deref(), Some("echo"));
        assert_eq!(msg.text(), "echo: pump");
    }

    #[tokio::test]
    async fn test_unknown_tool_becomes_error_message() {
        let registry = ToolRegistry::new();
        let msg = execute_tool_call(&registry, &call("nope", "{}"), Duration::from_secs(5)).await;
        assert_eq!(msg.text(), "Tool error: Unknown tool: nope");
    }

    #[tokio::test]
    async fn test_tool_failure_and_timeout() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool::new("echo")));
        registry.register(Arc::new(EchoTool::slow("slow", Duration::from_secs(5))));

        let missing_arg = execute_tool_call(&registry, &call("echo", "not json"), Duration::from_secs(5)).await;
        assert!(missing_arg.text().starts_with("Tool error: Missing required string parameter"));

        let timed_out = execute_tool_call(&registry, &call("slow", r#"{"query":"x"}"#), Duration::from_millis(20)).await;
        assert!(timed_out.text().contains("timed out"));
    }

    #[test]
    fn test_schemas_sorted() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool::new("zeta")));
        registry.register(Arc::new(EchoTool::new("alpha")));
        let names: Vec<String> = registry.schemas().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
        assert_eq!(registry.len(), 2);
    }
}
