use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

/// Where a document came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DocumentSource {
    /// Uploaded file, resolved to bytes through the [`FileService`].
    Uploaded,
    /// Already chunked and embedded into a vector store.
    External,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRef {
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub id: Uuid,
    pub name: String,
    pub source: DocumentSource,
    #[serde(default)]
    pub mime_type: Option<String>,
    /// Set for uploaded documents.
    #[serde(default)]
    pub file_id: Option<Uuid>,
    /// Vector store the chunks were embedded into.
    #[serde(default)]
    pub embedded_to_vs: Option<String>,
    #[serde(default)]
    pub chunks: Vec<ChunkRef>,
    #[serde(default)]
    pub embedded_to_bm25: bool,
}

impl DocumentRecord {
    pub fn chunk_ids(&self) -> Vec<String> {
        self.chunks.iter().map(|c| c.id.clone()).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub id: Uuid,
    pub name: String,
    pub mime_type: String,
    pub path: PathBuf,
}

#[async_trait]
pub trait DocumentRepository: Send + Sync {
    /// Documents embedded into some vector store (the lexical rebuild population).
    async fn get_all_embedded(&self) -> Result<Vec<DocumentRecord>>;

    async fn get_by_id(&self, id: Uuid) -> Result<Option<DocumentRecord>>;

    /// Insert or replace by id.
    async fn save_all(&self, documents: Vec<DocumentRecord>) -> Result<()>;
}

#[async_trait]
pub trait FileService: Send + Sync {
    async fn get_metadata_by_id(&self, id: Uuid) -> Result<Option<FileMetadata>>;
}
