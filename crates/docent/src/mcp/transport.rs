//! MCP transports: child process over stdio, and streamable HTTP.

use anyhow::{anyhow, bail, Context as AnyhowContext, Result};
use async_trait::async_trait;
use parking_lot::Mutex as SyncMutex;
use serde_json::{json, Value};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;

use super::{McpClient, McpToolDefinition, PROTOCOL_VERSION};
use crate::config::McpServerConfig;

fn request(id: u64, method: &str, params: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": method,
        "params": params,
    })
}

fn initialize_params() -> Value {
    json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION")
        }
    })
}

/// `result` of a JSON-RPC response, or its `error` as an `Err`.
fn into_result(response: Value) -> Result<Value> {
    if let Some(error) = response.get("error") {
        let message = error.get("message").and_then(|m| m.as_str()).unwrap_or("unknown error");
        bail!("MCP error: {}", message);
    }
    response
        .get("result")
        .cloned()
        .ok_or_else(|| anyhow!("Invalid response from server: {}", response))
}

fn parse_tools(result: Value) -> Result<Vec<McpToolDefinition>> {
    match result.get("tools") {
        Some(tools) => Ok(serde_json::from_value(tools.clone())?),
        None => Ok(Vec::new()),
    }
}

struct Pipes {
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

/// Stdio-based MCP client.
pub struct StdioMcpClient {
    name: String,
    timeout: Duration,
    process: SyncMutex<Option<Child>>,
    pipes: Mutex<Pipes>,
    request_id: AtomicU64,
}

impl StdioMcpClient {
    pub async fn connect(name: &str, config: &McpServerConfig) -> Result<Self> {
        let command = config
            .command
            .as_deref()
            .ok_or_else(|| anyhow!("MCP server {} has no command", name))?;
        let mut cmd = Command::new(command);
        cmd.args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());
        if let Some(ref cwd) = config.cwd {
            cmd.current_dir(cwd);
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn MCP server: {}", name))?;
        let stdin = child.stdin.take().ok_or_else(|| anyhow!("Failed to get stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| anyhow!("Failed to get stdout"))?;

        let client = Self {
            name: name.to_string(),
            timeout: Duration::from_secs(config.timeout_secs),
            process: SyncMutex::new(Some(child)),
            pipes: Mutex::new(Pipes {
                stdin,
                stdout: BufReader::new(stdout),
            }),
            request_id: AtomicU64::new(1),
        };
        client.initialize().await?;
        Ok(client)
    }

    async fn initialize(&self) -> Result<()> {
        self.call("initialize", initialize_params()).await?;
        let notification = json!({
            "jsonrpc": "2.0",
            "method": "notifications/initialized"
        });
        let mut pipes = self.pipes.lock().await;
        write_line(&mut pipes.stdin, &notification).await
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.request_id.fetch_add(1, Ordering::SeqCst);
        let exchange = async {
            let mut pipes = self.pipes.lock().await;
            write_line(&mut pipes.stdin, &request(id, method, params)).await?;
            read_response(&mut pipes.stdout, id).await
        };
        let response = tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| anyhow!("MCP server {} timed out on {}", self.name, method))??;
        into_result(response)
    }
}

async fn write_line(stdin: &mut ChildStdin, message: &Value) -> Result<()> {
    let line = serde_json::to_string(message)?;
    stdin.write_all(line.as_bytes()).await?;
    stdin.write_all(b"\n").await?;
    stdin.flush().await?;
    Ok(())
}

/// Read lines until the response for `id`; notifications in between are skipped.
async fn read_response(stdout: &mut BufReader<ChildStdout>, id: u64) -> Result<Value> {
    loop {
        let mut line = String::new();
        if stdout.read_line(&mut line).await? == 0 {
            bail!("Connection closed by server");
        }
        let Ok(message) = serde_json::from_str::<Value>(line.trim()) else {
            continue;
        };
        if message.get("id").and_then(|v| v.as_u64()) == Some(id) {
            return Ok(message);
        }
    }
}

#[async_trait]
impl McpClient for StdioMcpClient {
    fn server_name(&self) -> &str {
        &self.name
    }

    async fn list_tools(&self) -> Result<Vec<McpToolDefinition>> {
        parse_tools(self.call("tools/list", json!({})).await?)
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value> {
        self.call("tools/call", json!({ "name": name, "arguments": arguments }))
            .await
    }

    async fn close(&self) {
        let process = self.process.lock().take();
        if let Some(mut process) = process {
            let _ = process.start_kill();
            tracing::debug!(server = %self.name, "MCP server process stopped");
        }
    }
}

impl Drop for StdioMcpClient {
    fn drop(&mut self) {
        if let Some(mut process) = self.process.get_mut().take() {
            let _ = process.start_kill();
        }
    }
}

const SESSION_HEADER: &str = "Mcp-Session-Id";

/// Streamable-HTTP MCP client. Each request is a POST; the server answers
/// with JSON or a short SSE stream.
pub struct HttpMcpClient {
    name: String,
    url: String,
    client: reqwest::Client,
    session_id: SyncMutex<Option<String>>,
    request_id: AtomicU64,
}

impl HttpMcpClient {
    pub async fn connect(name: &str, config: &McpServerConfig) -> Result<Self> {
        let url = config
            .url
            .clone()
            .ok_or_else(|| anyhow!("MCP server {} has no url", name))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(Duration::from_secs(15))
            .build()
            .context("Failed to create HTTP client")?;

        let this = Self {
            name: name.to_string(),
            url,
            client,
            session_id: SyncMutex::new(None),
            request_id: AtomicU64::new(1),
        };
        this.call("initialize", initialize_params()).await?;
        this.post(&json!({ "jsonrpc": "2.0", "method": "notifications/initialized" }))
            .await?;
        Ok(this)
    }

    async fn post(&self, body: &Value) -> Result<reqwest::Response> {
        let mut builder = self
            .client
            .post(&self.url)
            .header("Accept", "application/json, text/event-stream")
            .json(body);
        let session = self.session_id.lock().clone();
        if let Some(session) = session {
            builder = builder.header(SESSION_HEADER, session);
        }
        let response = builder
            .send()
            .await
            .with_context(|| format!("Failed to reach MCP server {}", self.name))?;

        if !response.status().is_success() {
            bail!("MCP server {} returned {}", self.name, response.status());
        }
        if let Some(session) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            *self.session_id.lock() = Some(session.to_string());
        }
        Ok(response)
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.request_id.fetch_add(1, Ordering::SeqCst);
        let response = self.post(&request(id, method, params)).await?;
        let is_sse = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("text/event-stream"));
        let body = response.text().await?;

        let message = if is_sse {
            sse_response(&body, id)?
        } else {
            serde_json::from_str(&body).context("MCP server returned invalid JSON")?
        };
        into_result(message)
    }
}

/// Pick the JSON-RPC response for `id` out of an SSE body.
fn sse_response(body: &str, id: u64) -> Result<Value> {
    body.lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .filter_map(|data| serde_json::from_str::<Value>(data.trim()).ok())
        .find(|message| message.get("id").and_then(|v| v.as_u64()) == Some(id))
        .ok_or_else(|| anyhow!("No response for request {} in event stream", id))
}

#[async_trait]
impl McpClient for HttpMcpClient {
    fn server_name(&self) -> &str {
        &self.name
    }

    async fn list_tools(&self) -> Result<Vec<McpToolDefinition>> {
        parse_tools(self.call("tools/list", json!({})).await?)
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value> {
        self.call("tools/call", json!({ "name": name, "arguments": arguments }))
            .await
    }

    async fn close(&self) {
        let session = self.session_id.lock().take();
        let Some(session) = session else {
            return;
        };
        let result = self
            .client
            .delete(&self.url)
            .header(SESSION_HEADER, session)
            .send()
            .await;
        if let Err(e) = result {
            tracing::debug!(server = %self.name, error = %e, "Failed to close MCP session");
        }
    }
}
