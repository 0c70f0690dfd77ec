//! Model Context Protocol tool provider.
//!
//! Each configured server is connected once per `configure`; its tools are
//! wrapped as [`AgentTool`]s. Listing failures never fail configuration: the
//! provider degrades to an empty tool set.

use anyhow::Result;
use async_trait::async_trait;
use futures::future::{join_all, try_join_all};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::agent::tools::{AgentTool, ToolInput, ToolResult};
use crate::config::{McpConfig, McpTransport};

pub mod transport;

pub use transport::{HttpMcpClient, StdioMcpClient};

pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Tool definition as returned by `tools/list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpToolDefinition {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(rename = "inputSchema", default = "empty_schema")]
    pub input_schema: Value,
}

fn empty_schema() -> Value {
    json!({ "type": "object", "properties": {} })
}

#[async_trait]
pub trait McpClient: Send + Sync {
    fn server_name(&self) -> &str;

    async fn list_tools(&self) -> Result<Vec<McpToolDefinition>>;

    /// Raw `tools/call` result.
    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value>;

    async fn close(&self);
}

/// Text items of a `tools/call` result joined by newlines. Non-text content
/// is passed through as JSON.
fn result_text(result: &Value) -> String {
    let Some(items) = result.get("content").and_then(|c| c.as_array()) else {
        return result.to_string();
    };
    items
        .iter()
        .map(|item| match item.get("text").and_then(|t| t.as_str()) {
            Some(text) => text.to_string(),
            None => item.to_string(),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// One remote tool exposed to the graph.
pub struct McpTool {
    client: Arc<dyn McpClient>,
    definition: McpToolDefinition,
    description: String,
}

impl McpTool {
    pub fn new(client: Arc<dyn McpClient>, definition: McpToolDefinition) -> Self {
        let description = definition
            .description
            .clone()
            .unwrap_or_else(|| format!("Tool {} provided by {}", definition.name, client.server_name()));
        Self {
            client,
            definition,
            description,
        }
    }
}

#[async_trait]
impl AgentTool for McpTool {
    fn id(&self) -> &str {
        &self.definition.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters_schema(&self) -> Value {
        self.definition.input_schema.clone()
    }

    async fn execute(&self, input: ToolInput) -> Result<ToolResult> {
        let result = self.client.call_tool(&self.definition.name, input.parameters).await?;
        let text = result_text(&result);
        if result.get("isError").and_then(|v| v.as_bool()).unwrap_or(false) {
            return Ok(ToolResult::failed(text));
        }
        Ok(ToolResult::ok(text, result))
    }
}

/// Connected MCP servers for one configuration generation.
#[derive(Default)]
pub struct McpSession {
    clients: Vec<Arc<dyn McpClient>>,
}

impl McpSession {
    /// Connect every configured server. A server that fails to start is
    /// logged and left out.
    pub async fn connect(config: &McpConfig) -> Self {
        let attempts = config.connections.iter().map(|(name, server)| async move {
            let client: Result<Arc<dyn McpClient>> = match server.transport {
                McpTransport::Stdio => StdioMcpClient::connect(name, server)
                    .await
                    .map(|c| Arc::new(c) as Arc<dyn McpClient>),
                McpTransport::StreamableHttp => HttpMcpClient::connect(name, server)
                    .await
                    .map(|c| Arc::new(c) as Arc<dyn McpClient>),
            };
            client
                .map_err(|e| tracing::warn!(server = %name, error = %e, "Failed to connect MCP server"))
                .ok()
        });

        let clients: Vec<Arc<dyn McpClient>> = join_all(attempts).await.into_iter().flatten().collect();
        if !config.connections.is_empty() {
            tracing::info!(
                configured = config.connections.len(),
                connected = clients.len(),
                "MCP servers connected"
            );
        }
        Self { clients }
    }

    pub fn from_clients(clients: Vec<Arc<dyn McpClient>>) -> Self {
        Self { clients }
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Tools from every server, or none at all if any listing fails.
    pub async fn get_tools(&self) -> Vec<Arc<dyn AgentTool>> {
        let listings = try_join_all(self.clients.iter().map(|client| async move {
            let definitions = client.list_tools().await?;
            Ok::<_, anyhow::Error>(
                definitions
                    .into_iter()
                    .map(|d| Arc::new(McpTool::new(Arc::clone(client), d)) as Arc<dyn AgentTool>)
                    .collect::<Vec<_>>(),
            )
        }))
        .await;

        match listings {
            Ok(listings) => listings.into_iter().flatten().collect(),
            Err(e) => {
                tracing::warn!("Failed to get tools from MCP servers.");
                tracing::debug!(error = %e, "MCP tool listing error");
                Vec::new()
            }
        }
    }

    pub async fn close(&self) {
        join_all(self.clients.iter().map(|c| c.close())).await;
    }
}
