use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use std::time::Duration;

use super::{ChatMessage, ChatModel, ChatResponse, ChatRole, ToolCall, ToolSchema};
use crate::config::LlmConfig;

/// Chat completions over any OpenAI-compatible HTTP API.
pub struct OpenAiChatModel {
    base_url: String,
    api_key: Option<String>,
    model: String,
    max_tokens: usize,
    temperature: f32,
    client: Client,
}

impl OpenAiChatModel {
    pub fn from_config(config: &LlmConfig) -> Result<Self> {
        let api_key = read_api_key(config.api_key_env.as_deref())?;
        let client = http_client(config.timeout_secs)?;

        tracing::info!(
            model = %config.model,
            base_url = %config.base_url,
            "Creating OpenAI-compatible chat model"
        );

        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            client,
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }
}

/// Shared HTTP client settings for model-serving endpoints.
pub(crate) fn http_client(timeout_secs: u64) -> Result<Client> {
    Client::builder()
        .connect_timeout(Duration::from_secs(15))
        .timeout(Duration::from_secs(timeout_secs))
        .pool_idle_timeout(Duration::from_secs(90))
        .build()
        .context("Failed to build HTTP client")
}

/// Resolve an API key from the named environment variable.
pub(crate) fn read_api_key(env_var: Option<&str>) -> Result<Option<String>> {
    match env_var {
        None => Ok(None),
        Some(name) => std::env::var(name)
            .map(Some)
            .map_err(|_| anyhow!("Environment variable {} is not set", name)),
    }
}

/// Parse a response body as JSON, returning a clear error if the server returned HTML
/// (e.g. a gateway error page) instead of valid JSON.
pub(crate) async fn parse_json_response<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
    endpoint: &str,
) -> Result<T> {
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| anyhow!("Failed to read response body from {}: {}", endpoint, e))?;

    if !status.is_success() {
        let preview: String = body.chars().take(300).collect();
        return Err(anyhow!("{} returned HTTP {}: {}", endpoint, status, preview));
    }

    let trimmed = body.trim_start();
    if trimmed.starts_with('<') {
        let preview: String = trimmed.chars().take(200).collect();
        return Err(anyhow!(
            "Endpoint {} returned HTML instead of JSON (HTTP {}). Response: {}",
            endpoint,
            status,
            preview
        ));
    }

    serde_json::from_str::<T>(&body).map_err(|e| {
        let preview: String = body.chars().take(300).collect();
        anyhow!(
            "Failed to parse JSON from {} (HTTP {}): {}. Response body: {}",
            endpoint,
            status,
            e,
            preview
        )
    })
}

pub(crate) fn map_send_error(endpoint: &str, e: reqwest::Error) -> anyhow::Error {
    if e.is_timeout() {
        anyhow!("Request to {} timed out", endpoint)
    } else if e.is_connect() {
        anyhow!("Failed to connect to {}: {}", endpoint, e)
    } else {
        anyhow!("Request to {} failed: {}", endpoint, e)
    }
}

fn format_messages(messages: &[ChatMessage]) -> Vec<serde_json::Value> {
    messages
        .iter()
        .map(|m| {
            let role = match m.role {
                ChatRole::System => "system",
                ChatRole::User => "user",
                ChatRole::Assistant => "assistant",
                ChatRole::Tool => "tool",
            };
            let mut msg = json!({ "role": role });
            msg["content"] = match m.content {
                Some(ref content) => json!(content),
                None => serde_json::Value::Null,
            };
            if let Some(ref calls) = m.tool_calls {
                msg["tool_calls"] = json!(calls
                    .iter()
                    .map(|tc| json!({
                        "id": tc.id,
                        "type": "function",
                        "function": {
                            "name": tc.name,
                            "arguments": tc.arguments,
                        }
                    }))
                    .collect::<Vec<_>>());
            }
            if let Some(ref id) = m.tool_call_id {
                msg["tool_call_id"] = json!(id);
            }
            msg
        })
        .collect()
}

fn format_tools(tools: &[ToolSchema]) -> Vec<serde_json::Value> {
    tools
        .iter()
        .map(|t| {
            json!({
                "type": "function",
                "function": {
                    "name": t.name,
                    "description": t.description,
                    "parameters": t.parameters,
                }
            })
        })
        .collect()
}

fn parse_choice(body: &serde_json::Value) -> Result<ChatResponse> {
    let choice = body
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .ok_or_else(|| anyhow!("Chat response has no choices"))?;

    if let Some(tool_calls) = choice["tool_calls"].as_array() {
        let calls: Vec<ToolCall> = tool_calls
            .iter()
            .filter_map(|tc| {
                Some(ToolCall {
                    id: tc["id"].as_str()?.to_string(),
                    name: tc["function"]["name"].as_str()?.to_string(),
                    arguments: tc["function"]["arguments"].as_str()?.to_string(),
                })
            })
            .collect();
        if !calls.is_empty() {
            return Ok(ChatResponse::ToolCalls(calls));
        }
    }

    let content = choice["content"].as_str().unwrap_or("").to_string();
    Ok(ChatResponse::Content(content))
}

#[async_trait]
impl ChatModel for OpenAiChatModel {
    async fn invoke(&self, messages: &[ChatMessage], tools: &[ToolSchema]) -> Result<ChatResponse> {
        let mut request = json!({
            "model": self.model,
            "messages": format_messages(messages),
            "max_tokens": self.max_tokens,
            "temperature": self.temperature,
            "stream": false
        });

        if !tools.is_empty() {
            request["tools"] = json!(format_tools(tools));
            request["tool_choice"] = json!("auto");
        }

        let endpoint = self.endpoint();
        let mut builder = self.client.post(&endpoint).json(&request);
        if let Some(ref key) = self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| map_send_error(&endpoint, e))?;

        let body: serde_json::Value = parse_json_response(response, &endpoint).await?;
        parse_choice(&body)
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_messages_carries_tool_correlation() {
        let call = ToolCall {
            id: "call_9".into(),
            name: "vector_search".into(),
            arguments: r#"{"query":"pump"}"#.into(),
        };
        let formatted = format_messages(&[
            ChatMessage::assistant_tool_calls(vec![call]),
            ChatMessage::tool_result("call_9", "vector_search", "found"),
        ]);
        assert_eq!(formatted[0]["role"], "assistant");
        assert!(formatted[0]["content"].is_null());
        assert_eq!(formatted[0]["tool_calls"][0]["function"]["name"], "vector_search");
        assert_eq!(formatted[1]["role"], "tool");
        assert_eq!(formatted[1]["tool_call_id"], "call_9");
    }

    #[test]
    fn test_parse_choice_prefers_tool_calls() {
        let body = json!({
            "choices": [{
                "message": {
                    "content": null,
                    "tool_calls": [{
                        "id": "call_1",
                        "type": "function",
                        "function": {"name": "lexical_search", "arguments": "{\"query\":\"x\"}"}
                    }]
                }
            }]
        });
        match parse_choice(&body).unwrap() {
            ChatResponse::ToolCalls(calls) => assert_eq!(calls[0].name, "lexical_search"),
            other => panic!("unexpected response: {:?}", other),
        }
    }

    #[test]
    fn test_parse_choice_content_and_missing_choices() {
        let body = json!({"choices": [{"message": {"content": "hello"}}]});
        assert_eq!(parse_choice(&body).unwrap(), ChatResponse::Content("hello".into()));
        assert!(parse_choice(&json!({"error": "boom"})).is_err());
    }

    #[test]
    fn test_read_api_key_missing_variable() {
        assert!(read_api_key(None).unwrap().is_none());
        assert!(read_api_key(Some("DOCENT_TEST_SURELY_UNSET_KEY")).is_err());
    }
}
