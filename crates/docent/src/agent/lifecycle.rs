//! Operational state of the agent: configuration, graph construction, the
//! ON/OFF/RESTART status and the guard every turn-serving call passes.
//!
//! The guard is a cooperative check. A turn that passed it keeps running if a
//! restart or lexical sync starts afterwards.

use anyhow::anyhow;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::checkpoint::{HistoryFilter, StateSnapshot};
use super::configurer::AgentConfigurer;
use super::graph::{ConversationGraph, RunConfig, StreamItem, StreamMode};
use super::state::{AgentState, AgentStatus, ConversationState, Progress, ProgressStatus, TurnInput};
use crate::error::{AgentError, AgentResult, NotReadyReason};
use crate::processing::SemanticChunker;
use crate::storage::{FileMetadata, VectorStore};
use crate::types::Passage;

const RESTART_PROGRESS: [Progress; 3] = [
    Progress {
        status: ProgressStatus::Restarting,
        percentage: 0.0,
    },
    Progress {
        status: ProgressStatus::Restarting,
        percentage: 0.6,
    },
    Progress {
        status: ProgressStatus::Restarted,
        percentage: 1.0,
    },
];

pub struct Agent {
    configurer: Arc<dyn AgentConfigurer>,
    configured: AtomicBool,
    graph: RwLock<Option<Arc<ConversationGraph>>>,
    status: RwLock<AgentState>,
}

impl Agent {
    pub fn new(configurer: Arc<dyn AgentConfigurer>) -> Self {
        Self {
            configurer,
            configured: AtomicBool::new(false),
            graph: RwLock::new(None),
            status: RwLock::new(AgentState::On),
        }
    }

    pub fn configurer(&self) -> &Arc<dyn AgentConfigurer> {
        &self.configurer
    }

    /// Configure collaborators. Without `force`, a configured agent is left as is.
    pub async fn configure(&self, force: bool) -> AgentResult<()> {
        if self.configured.load(Ordering::SeqCst) && !force {
            tracing::debug!("Not forcefully configuring the agent. Skipping...");
            return Ok(());
        }
        tracing::info!("Configuring agent...");
        self.configurer.configure().await?;
        self.configured.store(true, Ordering::SeqCst);
        tracing::info!("Agent configured successfully!");
        Ok(())
    }

    /// Rebuild the conversation graph from the current components.
    pub fn build_graph(&self) -> AgentResult<()> {
        if !self.configured.load(Ordering::SeqCst) {
            return Err(AgentError::NotReady(NotReadyReason::NotConfigured));
        }
        let components = self.configurer.components()?;
        *self.graph.write() = Some(Arc::new(ConversationGraph::new(components)));
        Ok(())
    }

    /// The active graph, if every precondition for serving a turn holds.
    pub fn check_graph_available(&self) -> AgentResult<Arc<ConversationGraph>> {
        if !self.configured.load(Ordering::SeqCst) {
            return Err(AgentError::NotReady(NotReadyReason::NotConfigured));
        }
        let graph = self
            .graph
            .read()
            .clone()
            .ok_or(AgentError::NotReady(NotReadyReason::GraphNotBuilt))?;
        match *self.status.read() {
            AgentState::Off => Err(AgentError::NotReady(NotReadyReason::TurnedOff)),
            AgentState::Restart => Err(AgentError::NotReady(NotReadyReason::Restarting)),
            AgentState::On => Ok(graph),
        }
    }

    /// Force a reconfigure and graph rebuild, reporting progress through
    /// `on_progress`. On failure the previous status is restored.
    pub async fn restart(&self, mut on_progress: impl FnMut(Progress) + Send) -> AgentResult<()> {
        tracing::info!("Restarting agent...");
        on_progress(RESTART_PROGRESS[0]);

        let previous = self.set_status(AgentState::Restart);
        let result = async {
            self.configure(true).await?;
            on_progress(RESTART_PROGRESS[1]);
            self.build_graph()
        }
        .await;
        if let Err(e) = result {
            self.set_status(previous);
            tracing::warn!(error = %e, "Agent restart failed");
            return Err(e);
        }

        self.set_status(AgentState::On);
        on_progress(RESTART_PROGRESS[2]);
        tracing::info!("Agent restarted successfully!");
        Ok(())
    }

    /// Rebuild the lexical index. Turns are refused while it runs.
    pub async fn sync_bm25(&self) -> AgentResult<()> {
        let previous = self.set_status(AgentState::Restart);
        match self.configurer.sync_lexical_index().await {
            Ok(()) => {
                self.set_status(AgentState::On);
                Ok(())
            }
            Err(e) => {
                self.set_status(previous);
                Err(e)
            }
        }
    }

    pub async fn shutdown(&self) -> AgentResult<()> {
        tracing::info!("Shutting down agent...");
        self.configurer.destroy().await?;
        self.set_status(AgentState::Off);
        tracing::info!("Agent shut down");
        Ok(())
    }

    pub fn turn_on(&self) {
        self.set_status(AgentState::On);
    }

    pub fn turn_off(&self) {
        self.set_status(AgentState::Off);
    }

    fn set_status(&self, status: AgentState) -> AgentState {
        let previous = std::mem::replace(&mut *self.status.write(), status);
        if previous != status {
            tracing::debug!(from = %previous, to = %status, "Agent status changed");
        }
        previous
    }

    pub fn status(&self) -> AgentStatus {
        AgentStatus {
            status: *self.status.read(),
            bm25_last_sync: self.configurer.lexical_last_sync(),
            available_vector_stores: self.configurer.vector_stores().names(),
        }
    }

    pub fn stream(&self, input: TurnInput, config: RunConfig, mode: StreamMode) -> AgentResult<mpsc::Receiver<AgentResult<StreamItem>>> {
        let graph = self.check_graph_available()?;
        Ok(graph.stream(input, config, mode))
    }

    pub async fn invoke(&self, input: TurnInput, config: &RunConfig) -> AgentResult<ConversationState> {
        let graph = self.check_graph_available()?;
        graph.invoke(input, config).await
    }

    pub async fn get_state_history(&self, config: &RunConfig, filter: &HistoryFilter) -> AgentResult<Vec<StateSnapshot>> {
        let graph = self.check_graph_available()?;
        graph.get_state_history(config, filter).await
    }

    /// Latest snapshot of the thread, or the one named by `config.checkpoint_id`.
    pub async fn get_state(&self, config: &RunConfig) -> AgentResult<Option<StateSnapshot>> {
        let graph = self.check_graph_available()?;
        graph.get_state(config).await
    }

    pub async fn delete_thread(&self, thread_id: &str) -> AgentResult<()> {
        let checkpointer = self
            .configurer
            .checkpointer()
            .ok_or_else(|| AgentError::configuration("Checkpointer is still not configured yet."))?;
        checkpointer.delete_thread(thread_id).await?;
        tracing::info!(thread_id, "Thread deleted");
        Ok(())
    }

    fn vector_store(&self, store_name: &str) -> AgentResult<Arc<dyn VectorStore>> {
        self.configurer
            .vector_stores()
            .get(store_name)
            .ok_or_else(|| AgentError::configuration(format!("No vector store {} configured.", store_name)))
    }

    /// Convert a file, split it semantically and add the chunks to a vector
    /// store. Returns the ids of the added chunks.
    pub async fn embed_document(&self, store_name: &str, file: &FileMetadata) -> AgentResult<Vec<String>> {
        let store = self.vector_store(store_name)?;
        tracing::debug!(file = %file.name, store = store_name, "Embedding document...");

        let converted = self
            .configurer
            .converter()
            .convert(std::slice::from_ref(&file.path))
            .await?;
        let passages: Vec<Passage> = converted
            .into_iter()
            .map(|doc| {
                Passage::new(doc.markdown)
                    .with_metadata("source", file.name.as_str())
                    .with_metadata("id", file.id.to_string())
                    .with_metadata("total_pages", doc.page_count)
                    .with_metadata("mime_type", file.mime_type.as_str())
                    .with_metadata("path", file.path.to_string_lossy().into_owned())
            })
            .collect();

        let chunks = SemanticChunker::new(store.embeddings())
            .split_passages(&passages)
            .await?;
        if chunks.is_empty() {
            return Err(anyhow!("No text could be extracted from {}", file.name).into());
        }
        let ids: Vec<String> = chunks
            .iter()
            .map(|c| c.id.clone().unwrap_or_else(|| Uuid::new_v4().to_string()))
            .collect();

        let added = store.add_documents(chunks, ids).await?;
        tracing::info!(file = %file.name, store = store_name, chunks = added.len(), "Document embedded");
        Ok(added)
    }

    pub async fn unembed_document(&self, store_name: &str, chunk_ids: &[String]) -> AgentResult<()> {
        let store = self.vector_store(store_name)?;
        store.delete(chunk_ids).await?;
        tracing::info!(store = store_name, chunks = chunk_ids.len(), "Document unembedded");
        Ok(())
    }
}
