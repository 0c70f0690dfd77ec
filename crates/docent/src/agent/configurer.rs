//! Builds every collaborator the agent needs from `agent.json`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use super::builtin_tools::{HybridSearchTool, LexicalSearchTool, RecognitionTool, VectorSearchTool};
use super::checkpoint::Checkpointer;
use super::tools::ToolRegistry;
use crate::config::{config_dir_from_env, resolve_path, AgentConfig, Language, PromptConfig};
use crate::embeddings::{EmbeddingModel, HttpEmbeddings};
use crate::error::{AgentError, AgentResult};
use crate::llm::{ChatModel, OpenAiChatModel};
use crate::mcp::McpSession;
use crate::processing::{DocumentConverter, NormalizerOptions, TextNormalizer};
use crate::recognizer::{HttpRecognizer, RecognizerOutput};
use crate::search::{LexicalIndexBuilder, LexicalSettings, LexicalSources, RebuildOutcome};
use crate::storage::{DocumentRepository, FileService, LanceVectorStore, VectorStore, VectorStoreRegistry};

/// Everything the conversation graph runs with.
#[derive(Clone)]
pub struct AgentComponents {
    pub agent_name: String,
    pub language: Language,
    pub prompts: PromptConfig,
    pub chat_model: Arc<dyn ChatModel>,
    pub tools: ToolRegistry,
    /// Whether an attachment recognition tool is registered.
    pub recognition_available: bool,
    pub checkpointer: Option<Arc<dyn Checkpointer>>,
    pub tool_timeout: Duration,
    pub recursion_limit: usize,
}

#[async_trait]
pub trait AgentConfigurer: Send + Sync {
    /// Build (or rebuild) every collaborator from configuration.
    async fn configure(&self) -> AgentResult<()>;

    /// Release what `configure` acquired.
    async fn destroy(&self) -> AgentResult<()>;

    async fn sync_lexical_index(&self) -> AgentResult<()>;

    /// Fails with a configuration error before the first successful `configure`.
    fn components(&self) -> AgentResult<AgentComponents>;

    fn checkpointer(&self) -> Option<Arc<dyn Checkpointer>>;

    fn lexical_last_sync(&self) -> Option<DateTime<Utc>>;

    fn vector_stores(&self) -> VectorStoreRegistry;

    fn converter(&self) -> Arc<dyn DocumentConverter>;
}

/// Services the configurer does not build itself.
#[derive(Clone)]
pub struct Collaborators {
    pub documents: Arc<dyn DocumentRepository>,
    pub files: Arc<dyn FileService>,
    pub converter: Arc<dyn DocumentConverter>,
    pub checkpointer: Option<Arc<dyn Checkpointer>>,
}

struct Configured {
    components: AgentComponents,
    vector_stores: VectorStoreRegistry,
    mcp: Arc<McpSession>,
}

pub struct ServiceConfigurer {
    config_dir: PathBuf,
    collaborators: Collaborators,
    lexical: Arc<LexicalIndexBuilder>,
    current: RwLock<Option<Configured>>,
}

impl ServiceConfigurer {
    pub fn new(config_dir: impl Into<PathBuf>, collaborators: Collaborators) -> Self {
        let lexical = Arc::new(LexicalIndexBuilder::new(LexicalSources {
            documents: collaborators.documents.clone(),
            files: collaborators.files.clone(),
            converter: collaborators.converter.clone(),
        }));
        Self {
            config_dir: config_dir.into(),
            collaborators,
            lexical,
            current: RwLock::new(None),
        }
    }

    /// Config folder taken from `AGENT_CONFIG_PATH`.
    pub fn from_env(collaborators: Collaborators) -> AgentResult<Self> {
        Ok(Self::new(config_dir_from_env()?, collaborators))
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn lexical_index(&self) -> Arc<LexicalIndexBuilder> {
        Arc::clone(&self.lexical)
    }

    async fn open_vector_stores(
        &self,
        config: &AgentConfig,
        embeddings: &HashMap<String, Arc<dyn EmbeddingModel>>,
    ) -> AgentResult<VectorStoreRegistry> {
        let mut registry = VectorStoreRegistry::new();
        for store in &config.vector_stores {
            let model = embeddings.get(&store.embeddings).cloned().ok_or_else(|| {
                AgentError::configuration(format!("No {} embeddings model has configured yet.", store.embeddings))
            })?;
            let path = resolve_path(&self.config_dir, &store.path);
            let opened = LanceVectorStore::open(&path, &store.table, model).await?;
            tracing::debug!(store = %store.name, path = %path.display(), "Vector store opened");
            registry.insert(store.name.clone(), Arc::new(opened));
        }
        Ok(registry)
    }

    /// Lexical settings for `config`, or `None` without a bm25 retriever.
    /// Nothing is installed here.
    fn lexical_settings(
        &self,
        config: &AgentConfig,
        embeddings: &HashMap<String, Arc<dyn EmbeddingModel>>,
        vector_stores: &VectorStoreRegistry,
    ) -> AgentResult<Option<LexicalSettings>> {
        let Some(ref bm25) = config.retrievers.bm25 else {
            return Ok(None);
        };
        let model = embeddings.get(&bm25.embeddings_model).cloned().ok_or_else(|| {
            AgentError::configuration(format!("No {} embeddings model has configured yet.", bm25.embeddings_model))
        })?;
        let normalizer = TextNormalizer::new(NormalizerOptions {
            remove_emoji: bm25.enable_remove_emoji,
            remove_emoticons: bm25.enable_remove_emoticon,
            stopwords_path: bm25
                .removal_words_path
                .as_ref()
                .map(|p| resolve_path(&self.config_dir, p)),
        })?;
        Ok(Some(LexicalSettings {
            k: bm25.k,
            normalizer,
            embeddings: model,
            vector_stores: vector_stores.clone(),
        }))
    }

    fn build_tools(
        &self,
        config: &AgentConfig,
        vector_stores: &VectorStoreRegistry,
        lexical_enabled: bool,
    ) -> AgentResult<(ToolRegistry, bool)> {
        let mut tools = ToolRegistry::new();

        let recognition_available = match config.image_recognizer {
            Some(ref recognizer) => {
                let client = HttpRecognizer::from_config(recognizer)?;
                let known = RecognizerOutput::new(true, recognizer.classes.clone());
                tools.register(Arc::new(RecognitionTool::new(Arc::new(client), known)));
                true
            }
            None => false,
        };

        if lexical_enabled {
            tools.register(Arc::new(LexicalSearchTool::new(Arc::clone(&self.lexical))));
        }

        for retriever in &config.retrievers.vector {
            let store = vector_stores.get(&retriever.store).ok_or_else(|| {
                AgentError::configuration(format!("No vector store {} configured.", retriever.store))
            })?;
            let description = retriever
                .description
                .clone()
                .unwrap_or_else(|| format!("Search the {} knowledge base for relevant passages.", retriever.store));
            let tool = VectorSearchTool::new(&retriever.name, description, store, retriever.k);
            if retriever.hybrid {
                tools.register(Arc::new(HybridSearchTool::new(tool, Arc::clone(&self.lexical))));
            } else {
                tools.register(Arc::new(tool));
            }
        }

        Ok((tools, recognition_available))
    }
}

#[async_trait]
impl AgentConfigurer for ServiceConfigurer {
    async fn configure(&self) -> AgentResult<()> {
        let config = AgentConfig::load(&self.config_dir)?;
        config.validate().map_err(AgentError::Configuration)?;
        tracing::info!(agent = %config.agent_name, dir = %self.config_dir.display(), "Loading agent configuration");

        let chat_model = OpenAiChatModel::from_config(&config.llm)?;

        let mut embeddings: HashMap<String, Arc<dyn EmbeddingModel>> = HashMap::new();
        for cfg in &config.embeddings {
            embeddings.insert(cfg.name.clone(), Arc::new(HttpEmbeddings::from_config(cfg)?));
        }
        let vector_stores = self.open_vector_stores(&config, &embeddings).await?;
        let lexical = self.lexical_settings(&config, &embeddings, &vector_stores)?;
        let (mut tools, recognition_available) = self.build_tools(&config, &vector_stores, lexical.is_some())?;

        let mcp = Arc::new(McpSession::connect(&config.mcp).await);
        for tool in mcp.get_tools().await {
            tools.register(tool);
        }

        // The previous collaborators keep serving until this point.
        match lexical {
            Some(settings) => {
                if let Err(e) = self.lexical.sync_with(settings).await {
                    tracing::warn!(error = %e, "Lexical sync failed. Keeping the previous configuration");
                    mcp.close().await;
                    return Err(e);
                }
            }
            None => self.lexical.reset(),
        }
        self.destroy().await?;

        tracing::info!(
            tools = ?tools.list(),
            vector_stores = ?vector_stores.names(),
            recognition = recognition_available,
            "Agent collaborators configured"
        );
        let components = AgentComponents {
            agent_name: config.agent_name.clone(),
            language: config.language,
            prompts: config.prompt.clone(),
            chat_model: Arc::new(chat_model),
            tools,
            recognition_available,
            checkpointer: self.collaborators.checkpointer.clone(),
            tool_timeout: Duration::from_secs(config.runtime.tool_timeout_secs),
            recursion_limit: config.runtime.recursion_limit,
        };
        *self.current.write() = Some(Configured {
            components,
            vector_stores,
            mcp,
        });
        Ok(())
    }

    async fn destroy(&self) -> AgentResult<()> {
        let mcp = self.current.read().as_ref().map(|c| Arc::clone(&c.mcp));
        if let Some(mcp) = mcp {
            mcp.close().await;
        }
        Ok(())
    }

    async fn sync_lexical_index(&self) -> AgentResult<()> {
        if !self.lexical.is_configured() {
            tracing::info!("No lexical retriever configured. Skipping sync...");
            return Ok(());
        }
        match self.lexical.sync().await? {
            RebuildOutcome::Skipped => tracing::info!("Lexical index unchanged"),
            RebuildOutcome::Rebuilt { chunks, synced_at } => {
                tracing::info!(chunks, %synced_at, "Lexical index synced")
            }
        }
        Ok(())
    }

    fn components(&self) -> AgentResult<AgentComponents> {
        self.current
            .read()
            .as_ref()
            .map(|c| c.components.clone())
            .ok_or_else(|| AgentError::configuration("The agent collaborators have not been configured yet."))
    }

    fn checkpointer(&self) -> Option<Arc<dyn Checkpointer>> {
        self.collaborators.checkpointer.clone()
    }

    fn lexical_last_sync(&self) -> Option<DateTime<Utc>> {
        self.lexical.last_sync()
    }

    fn vector_stores(&self) -> VectorStoreRegistry {
        self.current
            .read()
            .as_ref()
            .map(|c| c.vector_stores.clone())
            .unwrap_or_default()
    }

    fn converter(&self) -> Arc<dyn DocumentConverter> {
        Arc::clone(&self.collaborators.converter)
    }
}
