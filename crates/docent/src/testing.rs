//! Deterministic fakes shared by unit tests.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::agent::checkpoint::{Checkpointer, InMemoryCheckpointer};
use crate::agent::configurer::{AgentComponents, AgentConfigurer};
use crate::agent::tools::{AgentTool, ToolInput, ToolRegistry, ToolResult};
use crate::config::{Language, PromptConfig};
use crate::embeddings::EmbeddingModel;
use crate::error::AgentResult;
use crate::llm::{ChatMessage, ChatModel, ChatResponse, ToolSchema};
use crate::processing::{ConvertedDocument, DocumentConverter};
use crate::recognizer::{RecognitionRequest, Recognizer, RecognizingResult};
use crate::storage::{DocumentRecord, DocumentRepository, FileMetadata, FileService, VectorStore, VectorStoreRegistry};
use crate::types::{Passage, ScoredPassage};

/// Bag-of-words hashing embeddings: identical texts map to identical vectors
/// and shared words raise cosine similarity.
pub struct HashEmbeddings {
    dim: usize,
}

impl HashEmbeddings {
    pub fn new(dim: usize) -> Self {
        Self { dim }
    }

    fn embed(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dim];
        for word in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            let mut hash: u64 = 0xcbf29ce484222325;
            for byte in word.to_lowercase().bytes() {
                hash ^= byte as u64;
                hash = hash.wrapping_mul(0x100000001b3);
            }
            vector[(hash % self.dim as u64) as usize] += 1.0;
        }
        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|x| *x /= norm);
        }
        vector
    }
}

#[async_trait]
impl EmbeddingModel for HashEmbeddings {
    async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.embed(text))
    }

    async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed(t)).collect())
    }

    fn model_name(&self) -> &str {
        "hash"
    }
}

/// Document repository and file service over in-memory maps.
#[derive(Default)]
pub struct MemoryDocuments {
    documents: RwLock<Vec<DocumentRecord>>,
    files: RwLock<HashMap<Uuid, FileMetadata>>,
}

impl MemoryDocuments {
    pub fn add_file(&self, id: Uuid, name: &str, path: &str) {
        self.files.write().insert(
            id,
            FileMetadata {
                id,
                name: name.to_string(),
                mime_type: "application/pdf".to_string(),
                path: PathBuf::from(path),
            },
        );
    }

    pub fn insert(&self, document: DocumentRecord) {
        let mut documents = self.documents.write();
        documents.retain(|d| d.id != document.id);
        documents.push(document);
    }

    pub fn get(&self, id: Uuid) -> Option<DocumentRecord> {
        self.documents.read().iter().find(|d| d.id == id).cloned()
    }

    /// Poll until the background bookkeeping write lands.
    pub async fn wait_for_indexed(&self, id: Uuid) -> bool {
        for _ in 0..200 {
            if self.get(id).is_some_and(|d| d.embedded_to_bm25) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }
}

#[async_trait]
impl DocumentRepository for MemoryDocuments {
    async fn get_all_embedded(&self) -> Result<Vec<DocumentRecord>> {
        Ok(self
            .documents
            .read()
            .iter()
            .filter(|d| d.embedded_to_vs.is_some())
            .cloned()
            .collect())
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Option<DocumentRecord>> {
        Ok(self.get(id))
    }

    async fn save_all(&self, documents: Vec<DocumentRecord>) -> Result<()> {
        for document in documents {
            self.insert(document);
        }
        Ok(())
    }
}

#[async_trait]
impl FileService for MemoryDocuments {
    async fn get_metadata_by_id(&self, id: Uuid) -> Result<Option<FileMetadata>> {
        Ok(self.files.read().get(&id).cloned())
    }
}

/// Converts every path to the same single-page text.
pub struct StaticConverter {
    text: String,
}

impl StaticConverter {
    pub fn new(text: &str) -> Self {
        Self { text: text.to_string() }
    }
}

#[async_trait]
impl DocumentConverter for StaticConverter {
    async fn convert(&self, paths: &[PathBuf]) -> Result<Vec<ConvertedDocument>> {
        Ok(paths
            .iter()
            .map(|_| ConvertedDocument {
                markdown: self.text.clone(),
                page_count: 1,
            })
            .collect())
    }
}

/// Vector store whose every call fails.
pub struct FailingVectorStore {
    embeddings: Arc<dyn EmbeddingModel>,
}

impl FailingVectorStore {
    pub fn new(embeddings: Arc<dyn EmbeddingModel>) -> Self {
        Self { embeddings }
    }
}

#[async_trait]
impl VectorStore for FailingVectorStore {
    async fn add_documents(&self, _passages: Vec<Passage>, _ids: Vec<String>) -> Result<Vec<String>> {
        Err(anyhow!("vector store unavailable"))
    }

    async fn delete(&self, _ids: &[String]) -> Result<()> {
        Err(anyhow!("vector store unavailable"))
    }

    async fn get_by_ids(&self, _ids: &[String]) -> Result<Vec<Passage>> {
        Err(anyhow!("vector store unavailable"))
    }

    async fn similarity_search(&self, _query: &str, _k: usize) -> Result<Vec<ScoredPassage>> {
        Err(anyhow!("vector store unavailable"))
    }

    fn embeddings(&self) -> Arc<dyn EmbeddingModel> {
        Arc::clone(&self.embeddings)
    }
}

/// Tool answering `echo: {query}`, optionally after a delay.
pub struct EchoTool {
    id: String,
    delay: Option<Duration>,
}

impl EchoTool {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            delay: None,
        }
    }

    pub fn slow(id: &str, delay: Duration) -> Self {
        Self {
            id: id.to_string(),
            delay: Some(delay),
        }
    }
}

#[async_trait]
impl AgentTool for EchoTool {
    fn id(&self) -> &str {
        &self.id
    }

    fn description(&self) -> &str {
        "Echo the query back"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": { "query": { "type": "string" } },
            "required": ["query"]
        })
    }

    async fn execute(&self, input: ToolInput) -> Result<ToolResult> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let query = input.str_param("query")?;
        Ok(ToolResult::ok(
            format!("echo: {}", query),
            serde_json::json!({ "query": query }),
        ))
    }
}

/// Recognizer that always predicts the given classes.
pub struct StaticRecognizer {
    classes: Vec<String>,
}

impl StaticRecognizer {
    pub fn new(classes: &[&str]) -> Self {
        Self {
            classes: classes.iter().map(|c| c.to_string()).collect(),
        }
    }
}

#[async_trait]
impl Recognizer for StaticRecognizer {
    async fn predict(&self, _request: &RecognitionRequest) -> Result<RecognizingResult> {
        Ok(RecognizingResult {
            classes: self.classes.clone(),
            probabilities: Some(vec![0.9; self.classes.len()]),
            inference_time: 0.01,
        })
    }
}

/// Chat model replaying queued responses and recording every call.
pub struct ScriptedChatModel {
    responses: Mutex<VecDeque<ChatResponse>>,
    repeat: Option<ChatResponse>,
    calls: Mutex<Vec<(Vec<ChatMessage>, Vec<ToolSchema>)>>,
}

impl ScriptedChatModel {
    /// Fails once the queue is exhausted.
    pub fn new(responses: Vec<ChatResponse>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            repeat: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn repeating(response: ChatResponse) -> Self {
        Self {
            repeat: Some(response),
            ..Self::new(Vec::new())
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn last_prompt(&self) -> Vec<ChatMessage> {
        self.calls.lock().last().map(|(m, _)| m.clone()).unwrap_or_default()
    }

    pub fn tools_offered(&self, call: usize) -> Vec<ToolSchema> {
        self.calls.lock().get(call).map(|(_, t)| t.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl ChatModel for ScriptedChatModel {
    async fn invoke(&self, messages: &[ChatMessage], tools: &[ToolSchema]) -> Result<ChatResponse> {
        self.calls.lock().push((messages.to_vec(), tools.to_vec()));
        let next = self.responses.lock().pop_front();
        next.or_else(|| self.repeat.clone())
            .ok_or_else(|| anyhow!("model endpoint unreachable"))
    }

    fn model_name(&self) -> &str {
        "scripted"
    }
}

pub fn prompts() -> PromptConfig {
    PromptConfig {
        respond_prompt: "You are a maintenance assistant.".into(),
        suggest_questions_prompt: "Comment on the attachment and suggest questions.".into(),
    }
}

/// Graph inputs with an in-memory checkpointer.
pub fn components(model: Arc<ScriptedChatModel>, tools: ToolRegistry, recognition_available: bool) -> AgentComponents {
    AgentComponents {
        agent_name: "test-agent".into(),
        language: Language::En,
        prompts: prompts(),
        chat_model: model,
        tools,
        recognition_available,
        checkpointer: Some(Arc::new(InMemoryCheckpointer::new())),
        tool_timeout: Duration::from_secs(5),
        recursion_limit: crate::agent::graph::DEFAULT_RECURSION_LIMIT,
    }
}

/// Configurer handing out fixed components and counting lifecycle calls.
pub struct StaticConfigurer {
    components: AgentComponents,
    vector_stores: RwLock<VectorStoreRegistry>,
    converter: Arc<dyn DocumentConverter>,
    last_sync: RwLock<Option<DateTime<Utc>>>,
    pub configure_calls: AtomicUsize,
    pub destroy_calls: AtomicUsize,
    pub sync_calls: AtomicUsize,
    pub fail_configure: AtomicBool,
    /// When set, `sync_lexical_index` signals `sync_started` and waits for `sync_release`.
    pub gate_sync: AtomicBool,
    pub sync_started: Notify,
    pub sync_release: Notify,
}

impl StaticConfigurer {
    pub fn new(components: AgentComponents) -> Self {
        Self {
            components,
            vector_stores: RwLock::new(VectorStoreRegistry::new()),
            converter: Arc::new(StaticConverter::new("")),
            last_sync: RwLock::new(None),
            configure_calls: AtomicUsize::new(0),
            destroy_calls: AtomicUsize::new(0),
            sync_calls: AtomicUsize::new(0),
            fail_configure: AtomicBool::new(false),
            gate_sync: AtomicBool::new(false),
            sync_started: Notify::new(),
            sync_release: Notify::new(),
        }
    }

    pub fn with_converter(mut self, text: &str) -> Self {
        self.converter = Arc::new(StaticConverter::new(text));
        self
    }

    pub fn add_vector_store(&self, name: &str, store: Arc<dyn VectorStore>) {
        self.vector_stores.write().insert(name, store);
    }
}

#[async_trait]
impl AgentConfigurer for StaticConfigurer {
    async fn configure(&self) -> AgentResult<()> {
        self.configure_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_configure.load(Ordering::SeqCst) {
            return Err(anyhow!("llm endpoint unreachable").into());
        }
        Ok(())
    }

    async fn destroy(&self) -> AgentResult<()> {
        self.destroy_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn sync_lexical_index(&self) -> AgentResult<()> {
        self.sync_calls.fetch_add(1, Ordering::SeqCst);
        if self.gate_sync.load(Ordering::SeqCst) {
            self.sync_started.notify_one();
            self.sync_release.notified().await;
        }
        *self.last_sync.write() = Some(Utc::now());
        Ok(())
    }

    fn components(&self) -> AgentResult<AgentComponents> {
        Ok(self.components.clone())
    }

    fn checkpointer(&self) -> Option<Arc<dyn Checkpointer>> {
        self.components.checkpointer.clone()
    }

    fn lexical_last_sync(&self) -> Option<DateTime<Utc>> {
        *self.last_sync.read()
    }

    fn vector_stores(&self) -> VectorStoreRegistry {
        self.vector_stores.read().clone()
    }

    fn converter(&self) -> Arc<dyn DocumentConverter> {
        Arc::clone(&self.converter)
    }
}
