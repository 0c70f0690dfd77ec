//! Turn state machine.
//!
//! `Start -> {Respond, Suggest}`, then each branch loops through its own tool
//! node (`Respond <-> RespondTools`, `Suggest <-> SuggestTools`) until the
//! model answers without a tool call. Tool edges exist only when at least one
//! tool is registered.

use chrono::Utc;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::checkpoint::{CheckpointMetadata, CheckpointSource, HistoryFilter, StateSnapshot};
use super::configurer::AgentComponents;
use super::prompt::{render, select_variant, Branch, MessageKind, PromptContext};
use super::state::{ConversationState, TurnInput};
use super::tools::execute_tool_call;
use crate::error::{AgentError, AgentResult};
use crate::llm::{ChatMessage, ChatRole};

pub const DEFAULT_RECURSION_LIMIT: usize = 25;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Node {
    Start,
    Respond,
    Suggest,
    RespondTools,
    SuggestTools,
    End,
}

impl Node {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Start => "__start__",
            Self::Respond => Branch::Respond.node_name(),
            Self::Suggest => Branch::Suggest.node_name(),
            Self::RespondTools => "respond_tools",
            Self::SuggestTools => "suggest_questions_tools",
            Self::End => "__end__",
        }
    }

    fn branch(&self) -> Option<Branch> {
        match self {
            Self::Respond => Some(Branch::Respond),
            Self::Suggest => Some(Branch::Suggest),
            _ => None,
        }
    }

    fn tools_for(branch: Branch) -> Self {
        match branch {
            Branch::Respond => Self::RespondTools,
            Branch::Suggest => Self::SuggestTools,
        }
    }

    fn caller_of(tools: Node) -> Option<Self> {
        match tools {
            Self::RespondTools => Some(Self::Respond),
            Self::SuggestTools => Some(Self::Suggest),
            _ => None,
        }
    }
}

/// Node/edge layout fixed at build time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    edges: Vec<(Node, Node)>,
}

impl Topology {
    pub fn new(tools_enabled: bool) -> Self {
        let mut edges = vec![
            (Node::Start, Node::Respond),
            (Node::Start, Node::Suggest),
            (Node::Respond, Node::End),
            (Node::Suggest, Node::End),
        ];
        if tools_enabled {
            edges.extend([
                (Node::Respond, Node::RespondTools),
                (Node::RespondTools, Node::Respond),
                (Node::Suggest, Node::SuggestTools),
                (Node::SuggestTools, Node::Suggest),
            ]);
        }
        Self { edges }
    }

    pub fn edges(&self) -> &[(Node, Node)] {
        &self.edges
    }

    pub fn has_edge(&self, from: Node, to: Node) -> bool {
        self.edges.contains(&(from, to))
    }

    pub fn reaches_tools(&self) -> bool {
        self.edges
            .iter()
            .any(|(_, to)| matches!(to, Node::RespondTools | Node::SuggestTools))
    }
}

/// Entry routing: a non-blank human message is answered, anything else gets
/// attachment suggestions.
pub fn route_entry(messages: &[ChatMessage]) -> Node {
    match messages.last() {
        Some(m) if m.role == ChatRole::User && !m.text().trim().is_empty() => Node::Respond,
        _ => Node::Suggest,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    pub thread_id: String,
    /// Resume from this checkpoint instead of the thread's latest one.
    #[serde(default)]
    pub checkpoint_id: Option<String>,
    /// Node executions allowed per turn. Falls back to the configured runtime limit.
    #[serde(default)]
    pub recursion_limit: Option<usize>,
}

impl RunConfig {
    pub fn new(thread_id: impl Into<String>) -> Self {
        Self {
            thread_id: thread_id.into(),
            checkpoint_id: None,
            recursion_limit: None,
        }
    }

    pub fn with_checkpoint(mut self, checkpoint_id: impl Into<String>) -> Self {
        self.checkpoint_id = Some(checkpoint_id.into());
        self
    }

    pub fn with_recursion_limit(mut self, limit: usize) -> Self {
        self.recursion_limit = Some(limit);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamMode {
    /// Full state after the input and after every node.
    #[default]
    Values,
    /// Node name plus the messages that node appended.
    Updates,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StreamItem {
    Values(ConversationState),
    Updates { node: String, messages: Vec<ChatMessage> },
}

type StreamSender = mpsc::Sender<AgentResult<StreamItem>>;

/// Where a step's output goes besides the checkpointer.
struct Sink<'a> {
    mode: StreamMode,
    tx: Option<&'a StreamSender>,
}

impl Sink<'_> {
    /// False once the receiver is gone.
    async fn emit(&self, node: Node, state: &ConversationState, appended: &[ChatMessage]) -> bool {
        let Some(tx) = self.tx else {
            return true;
        };
        let item = match self.mode {
            StreamMode::Values => StreamItem::Values(state.clone()),
            StreamMode::Updates if node == Node::Start => return true,
            StreamMode::Updates => StreamItem::Updates {
                node: node.name().to_string(),
                messages: appended.to_vec(),
            },
        };
        tx.send(Ok(item)).await.is_ok()
    }
}

pub struct ConversationGraph {
    components: AgentComponents,
    topology: Topology,
}

impl ConversationGraph {
    pub fn new(components: AgentComponents) -> Self {
        let topology = Topology::new(!components.tools.is_empty());
        tracing::info!(
            agent = %components.agent_name,
            tools = components.tools.len(),
            tool_edges = topology.reaches_tools(),
            "Conversation graph built"
        );
        Self { components, topology }
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn components(&self) -> &AgentComponents {
        &self.components
    }

    /// Run a turn in a background task. Dropping the receiver abandons the turn
    /// after the node in flight finishes.
    pub fn stream(self: &Arc<Self>, input: TurnInput, config: RunConfig, mode: StreamMode) -> mpsc::Receiver<AgentResult<StreamItem>> {
        let (tx, rx) = mpsc::channel(32);
        let graph = Arc::clone(self);
        tokio::spawn(async move {
            let sink = Sink { mode, tx: Some(&tx) };
            if let Err(e) = graph.run(input, &config, &sink).await {
                tracing::warn!(thread_id = %config.thread_id, error = %e, "Turn failed");
                let _ = tx.send(Err(e)).await;
            }
        });
        rx
    }

    /// Run a turn to completion and return the final state.
    pub async fn invoke(&self, input: TurnInput, config: &RunConfig) -> AgentResult<ConversationState> {
        let sink = Sink {
            mode: StreamMode::Values,
            tx: None,
        };
        self.run(input, config, &sink).await
    }

    pub async fn get_state(&self, config: &RunConfig) -> AgentResult<Option<StateSnapshot>> {
        let Some(ref checkpointer) = self.components.checkpointer else {
            return Ok(None);
        };
        Ok(checkpointer
            .get(&config.thread_id, config.checkpoint_id.as_deref())
            .await?)
    }

    pub async fn get_state_history(&self, config: &RunConfig, filter: &HistoryFilter) -> AgentResult<Vec<StateSnapshot>> {
        let Some(ref checkpointer) = self.components.checkpointer else {
            return Ok(Vec::new());
        };
        Ok(checkpointer.list(&config.thread_id, filter).await?)
    }

    async fn run(&self, input: TurnInput, config: &RunConfig, sink: &Sink<'_>) -> AgentResult<ConversationState> {
        let thread_id = config.thread_id.as_str();
        let previous = self.get_state(config).await?;
        let mut parent = previous.as_ref().map(|s| s.checkpoint_id.clone());
        let mut state = previous.map(|s| s.values).unwrap_or_default();

        state.messages.extend(input.messages.iter().cloned());
        state.attachment = input.attachment.clone();

        let mut node = route_entry(&state.messages);
        tracing::debug!(thread_id, entry = node.name(), "Turn started");

        let mut step: i64 = -1;
        let writes = json!({ "__input__": input });
        parent = Some(
            self.checkpoint(thread_id, parent, &state, node, step, CheckpointSource::Input, writes)
                .await?,
        );
        if !sink.emit(Node::Start, &state, &[]).await {
            return Ok(state);
        }

        let limit = config.recursion_limit.unwrap_or(self.components.recursion_limit);
        let mut executed = 0usize;
        while node != Node::End {
            if executed >= limit {
                return Err(AgentError::RecursionLimit(limit));
            }
            let (appended, next) = self.execute(node, &state).await?;
            state.messages.extend(appended.iter().cloned());
            executed += 1;
            step += 1;

            let mut writes = serde_json::Map::new();
            writes.insert(node.name().to_string(), json!({ "messages": appended }));
            let writes = serde_json::Value::Object(writes);
            parent = Some(
                self.checkpoint(thread_id, parent, &state, next, step, CheckpointSource::Loop, writes)
                    .await?,
            );
            if !sink.emit(node, &state, &appended).await {
                tracing::debug!(thread_id, "Stream receiver dropped, abandoning turn");
                return Ok(state);
            }
            node = next;
        }

        tracing::debug!(thread_id, steps = executed, "Turn finished");
        Ok(state)
    }

    /// Run one node and return the messages it appended plus the next node.
    async fn execute(&self, node: Node, state: &ConversationState) -> AgentResult<(Vec<ChatMessage>, Node)> {
        if let Some(branch) = node.branch() {
            let message = self.decide(branch, state).await?;
            let tools_node = Node::tools_for(branch);
            let next = if !message.pending_tool_calls().is_empty() && self.topology.has_edge(node, tools_node) {
                tools_node
            } else {
                Node::End
            };
            return Ok((vec![message], next));
        }

        let Some(caller) = Node::caller_of(node) else {
            return Ok((Vec::new(), Node::End));
        };
        let calls = state
            .last_message()
            .map(|m| m.pending_tool_calls().to_vec())
            .unwrap_or_default();
        let timeout = self.components.tool_timeout;
        let results = join_all(
            calls
                .iter()
                .map(|call| execute_tool_call(&self.components.tools, call, timeout)),
        )
        .await;
        Ok((results, caller))
    }

    async fn decide(&self, branch: Branch, state: &ConversationState) -> AgentResult<ChatMessage> {
        let c = &self.components;
        let variant = select_variant(
            branch,
            state.attachment.is_some(),
            c.recognition_available,
            MessageKind::of(state.last_message()),
        );
        let ctx = PromptContext {
            language: c.language,
            prompts: &c.prompts,
            attachment: state.attachment.as_ref(),
            history: &state.messages,
        };
        let prompt = render(branch, variant, &ctx);
        let schemas = if variant.offers_tools() {
            c.tools.schemas()
        } else {
            Vec::new()
        };
        tracing::debug!(node = branch.node_name(), ?variant, messages = prompt.len(), "Invoking chat model");

        let response = c.chat_model.invoke(&prompt, &schemas).await?;
        tracing::debug!(node = branch.node_name(), ?response, "Chat model responded");
        Ok(response.into_message())
    }

    #[allow(clippy::too_many_arguments)]
    async fn checkpoint(
        &self,
        thread_id: &str,
        parent: Option<String>,
        state: &ConversationState,
        next: Node,
        step: i64,
        source: CheckpointSource,
        writes: serde_json::Value,
    ) -> AgentResult<String> {
        let checkpoint_id = Uuid::new_v4().to_string();
        let Some(ref checkpointer) = self.components.checkpointer else {
            return Ok(checkpoint_id);
        };
        let next = if next == Node::End {
            Vec::new()
        } else {
            vec![next.name().to_string()]
        };
        checkpointer
            .put(StateSnapshot {
                thread_id: thread_id.to_string(),
                checkpoint_id: checkpoint_id.clone(),
                parent_checkpoint_id: parent,
                values: state.clone(),
                next,
                metadata: CheckpointMetadata { step, source, writes },
                created_at: Utc::now(),
            })
            .await?;
        Ok(checkpoint_id)
    }
}
