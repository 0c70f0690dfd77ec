//! Rebuilds the lexical index from the two document populations.
//!
//! Uploaded documents are resolved to files and converted to markdown;
//! external documents contribute the chunks already embedded in their vector
//! store. Everything gathered is re-chunked semantically, normalized and
//! indexed. The new index replaces the active one in a single swap, so readers
//! holding the previous `Arc<LexicalIndex>` keep a consistent view.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use futures::future::{join_all, try_join_all};
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

use super::lexical_index::LexicalIndex;
use crate::embeddings::EmbeddingModel;
use crate::error::{AgentError, AgentResult};
use crate::processing::{DocumentConverter, SemanticChunker, TextNormalizer};
use crate::storage::{DocumentRecord, DocumentRepository, DocumentSource, FileService, VectorStoreRegistry};
use crate::types::Passage;

/// Collaborators the builder reads from.
#[derive(Clone)]
pub struct LexicalSources {
    pub documents: Arc<dyn DocumentRepository>,
    pub files: Arc<dyn FileService>,
    pub converter: Arc<dyn DocumentConverter>,
}

/// Per-configuration inputs, replaced on every reconfigure.
#[derive(Clone)]
pub struct LexicalSettings {
    pub k: usize,
    pub normalizer: TextNormalizer,
    /// Similarity signal for semantic chunking.
    pub embeddings: Arc<dyn EmbeddingModel>,
    pub vector_stores: VectorStoreRegistry,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RebuildOutcome {
    /// Nothing was gathered; the active index and timestamp are untouched.
    Skipped,
    Rebuilt {
        chunks: usize,
        synced_at: DateTime<Utc>,
    },
}

struct Gathered {
    passages: Vec<Passage>,
    contributors: Vec<Uuid>,
}

pub struct LexicalIndexBuilder {
    sources: LexicalSources,
    settings: RwLock<Option<Arc<LexicalSettings>>>,
    active: RwLock<Option<Arc<LexicalIndex>>>,
    last_sync: RwLock<Option<DateTime<Utc>>>,
    rebuild_lock: tokio::sync::Mutex<()>,
}

impl LexicalIndexBuilder {
    pub fn new(sources: LexicalSources) -> Self {
        Self {
            sources,
            settings: RwLock::new(None),
            active: RwLock::new(None),
            last_sync: RwLock::new(None),
            rebuild_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Install new settings. The active index keeps serving until the next rebuild.
    pub fn reconfigure(&self, settings: LexicalSettings) {
        *self.settings.write() = Some(Arc::new(settings));
    }

    /// Drop settings and the active index.
    pub fn reset(&self) {
        *self.settings.write() = None;
        *self.active.write() = None;
    }

    pub fn is_configured(&self) -> bool {
        self.settings.read().is_some()
    }

    /// Index currently serving queries, if any was built.
    pub fn active(&self) -> Option<Arc<LexicalIndex>> {
        self.active.read().clone()
    }

    pub fn last_sync(&self) -> Option<DateTime<Utc>> {
        *self.last_sync.read()
    }

    /// Rebuild from every document the repository reports as embedded.
    pub async fn sync(&self) -> AgentResult<RebuildOutcome> {
        let documents = self
            .sources
            .documents
            .get_all_embedded()
            .await
            .context("Failed to list embedded documents")?;
        self.rebuild(documents).await
    }

    /// Sync with `settings` and install them only if the sync succeeds.
    /// On failure the previous settings and index stay active.
    pub async fn sync_with(&self, settings: LexicalSettings) -> AgentResult<RebuildOutcome> {
        let settings = Arc::new(settings);
        let documents = self
            .sources
            .documents
            .get_all_embedded()
            .await
            .context("Failed to list embedded documents")?;
        let _guard = self.rebuild_lock.lock().await;
        let outcome = self.rebuild_with(&settings, documents).await?;
        *self.settings.write() = Some(settings);
        Ok(outcome)
    }

    pub async fn rebuild(&self, documents: Vec<DocumentRecord>) -> AgentResult<RebuildOutcome> {
        let settings = self
            .settings
            .read()
            .clone()
            .ok_or_else(|| AgentError::configuration("The lexical index has not been configured."))?;
        let _guard = self.rebuild_lock.lock().await;
        self.rebuild_with(&settings, documents).await
    }

    /// Callers hold `rebuild_lock`.
    async fn rebuild_with(&self, settings: &LexicalSettings, documents: Vec<DocumentRecord>) -> AgentResult<RebuildOutcome> {
        if documents.is_empty() {
            tracing::info!("No document for building the lexical index. Skipping...");
            return Ok(RebuildOutcome::Skipped);
        }

        let (uploaded, external): (Vec<_>, Vec<_>) = documents
            .iter()
            .partition(|doc| doc.source == DocumentSource::Uploaded);

        let (from_uploaded, from_external) = tokio::try_join!(
            self.gather_uploaded(&uploaded),
            gather_external(&external, &settings.vector_stores),
        )?;

        let mut passages = from_uploaded.passages;
        passages.extend(from_external.passages);
        if passages.is_empty() {
            tracing::info!("No chunks for building the lexical index. Skipping...");
            return Ok(RebuildOutcome::Skipped);
        }

        let chunker = SemanticChunker::new(Arc::clone(&settings.embeddings));
        let chunks = chunker.split_passages(&passages).await?;
        let chunk_count = chunks.len();

        let normalizer = settings.normalizer.clone();
        let k = settings.k;
        let index = tokio::task::spawn_blocking(move || LexicalIndex::build(&chunks, normalizer, k))
            .await
            .context("Lexical index build task panicked")??;

        let synced_at = Utc::now();
        *self.active.write() = Some(Arc::new(index));
        *self.last_sync.write() = Some(synced_at);
        tracing::info!(passages = passages.len(), chunks = chunk_count, "Lexical index rebuilt");

        let contributors: HashSet<Uuid> = from_uploaded
            .contributors
            .into_iter()
            .chain(from_external.contributors)
            .collect();
        self.mark_indexed(&documents, &contributors);

        Ok(RebuildOutcome::Rebuilt {
            chunks: chunk_count,
            synced_at,
        })
    }

    /// Fire-and-forget bookkeeping; a failed write is logged only.
    fn mark_indexed(&self, documents: &[DocumentRecord], contributors: &HashSet<Uuid>) {
        let marked: Vec<DocumentRecord> = documents
            .iter()
            .filter(|doc| contributors.contains(&doc.id))
            .cloned()
            .map(|mut doc| {
                doc.embedded_to_bm25 = true;
                doc
            })
            .collect();
        if marked.is_empty() {
            return;
        }

        let repository = Arc::clone(&self.sources.documents);
        tokio::spawn(async move {
            let count = marked.len();
            match repository.save_all(marked).await {
                Ok(()) => tracing::debug!(count, "Marked documents as lexically indexed"),
                Err(e) => tracing::warn!(error = %e, "Failed to mark documents as lexically indexed"),
            }
        });
    }

    /// Unresolvable files are skipped; a conversion failure fails the branch.
    async fn gather_uploaded(&self, documents: &[&DocumentRecord]) -> Result<Gathered> {
        if documents.is_empty() {
            return Ok(Gathered {
                passages: Vec::new(),
                contributors: Vec::new(),
            });
        }
        tracing::debug!(count = documents.len(), "Collecting passages from uploaded documents");

        let lookups = documents.iter().map(|doc| async move {
            let Some(file_id) = doc.file_id else {
                tracing::warn!(document_id = %doc.id, "Uploaded document has no file id. Skipping...");
                return None;
            };
            match self.sources.files.get_metadata_by_id(file_id).await {
                Ok(Some(file)) => Some((doc.id, file)),
                Ok(None) => {
                    tracing::warn!(document_id = %doc.id, %file_id, "File not found. Skipping...");
                    None
                }
                Err(e) => {
                    tracing::warn!(document_id = %doc.id, %file_id, error = %e, "File lookup failed. Skipping...");
                    None
                }
            }
        });
        let files: Vec<_> = join_all(lookups).await.into_iter().flatten().collect();
        if files.is_empty() {
            return Ok(Gathered {
                passages: Vec::new(),
                contributors: Vec::new(),
            });
        }

        let paths: Vec<_> = files.iter().map(|(_, file)| file.path.clone()).collect();
        let converted = self
            .sources
            .converter
            .convert(&paths)
            .await
            .context("Failed to convert uploaded documents")?;
        if converted.len() != files.len() {
            bail!(
                "Converter returned {} documents for {} files",
                converted.len(),
                files.len()
            );
        }

        let mut passages = Vec::with_capacity(files.len());
        let mut contributors = Vec::with_capacity(files.len());
        for ((document_id, file), result) in files.into_iter().zip(converted) {
            passages.push(
                Passage::new(result.markdown)
                    .with_metadata("source", file.name)
                    .with_metadata("id", file.id.to_string())
                    .with_metadata("total_pages", result.page_count)
                    .with_metadata("mime_type", file.mime_type)
                    .with_metadata("path", file.path.display().to_string()),
            );
            contributors.push(document_id);
        }
        Ok(Gathered {
            passages,
            contributors,
        })
    }
}

/// Unknown stores are skipped with a warning; any fetch failure fails the branch.
async fn gather_external(documents: &[&DocumentRecord], stores: &VectorStoreRegistry) -> Result<Gathered> {
    if documents.is_empty() {
        return Ok(Gathered {
            passages: Vec::new(),
            contributors: Vec::new(),
        });
    }
    tracing::debug!(count = documents.len(), "Collecting chunks from external documents");

    let mut fetches = Vec::new();
    for doc in documents {
        let store_name = doc.embedded_to_vs.as_deref().unwrap_or_default();
        let Some(store) = stores.get(store_name) else {
            tracing::warn!(
                document_id = %doc.id,
                store = %store_name,
                "Cannot use document for the lexical index: vector store is not configured"
            );
            continue;
        };
        let chunk_ids = doc.chunk_ids();
        let document_id = doc.id;
        let store_name = store_name.to_string();
        fetches.push(async move {
            let passages = store.get_by_ids(&chunk_ids).await.with_context(|| {
                format!("Failed to fetch chunks of document {} from store {}", document_id, store_name)
            })?;
            Ok::<_, anyhow::Error>((document_id, passages))
        });
    }

    let mut gathered = Gathered {
        passages: Vec::new(),
        contributors: Vec::new(),
    };
    for (document_id, passages) in try_join_all(fetches).await? {
        if !passages.is_empty() {
            gathered.contributors.push(document_id);
            gathered.passages.extend(passages);
        }
    }
    Ok(gathered)
}
