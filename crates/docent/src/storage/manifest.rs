use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

use super::documents::{DocumentRecord, DocumentRepository, FileMetadata, FileService};

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct ManifestData {
    #[serde(default)]
    documents: Vec<DocumentRecord>,
    #[serde(default)]
    files: Vec<FileMetadata>,
}

/// Document and file bookkeeping in a single JSON file.
pub struct JsonManifest {
    path: PathBuf,
    data: RwLock<ManifestData>,
}

impl JsonManifest {
    /// Open the manifest at `path`, starting empty if the file does not exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let data = if path.exists() {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read manifest {}", path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse manifest {}", path.display()))?
        } else {
            ManifestData::default()
        };

        tracing::debug!(
            path = %path.display(),
            documents = data.documents.len(),
            files = data.files.len(),
            "Opened document manifest"
        );
        Ok(Self {
            path,
            data: RwLock::new(data),
        })
    }

    /// Register an uploaded file.
    pub fn add_file(&self, file: FileMetadata) -> Result<()> {
        let snapshot = {
            let mut data = self.data.write();
            data.files.retain(|f| f.id != file.id);
            data.files.push(file);
            data.clone()
        };
        self.persist(&snapshot)
    }

    pub fn documents(&self) -> Vec<DocumentRecord> {
        self.data.read().documents.clone()
    }

    fn persist(&self, data: &ManifestData) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(data).context("Failed to serialize manifest")?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json).with_context(|| format!("Failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;
        Ok(())
    }
}

#[async_trait]
impl DocumentRepository for JsonManifest {
    async fn get_all_embedded(&self) -> Result<Vec<DocumentRecord>> {
        Ok(self
            .data
            .read()
            .documents
            .iter()
            .filter(|d| d.embedded_to_vs.is_some())
            .cloned()
            .collect())
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Option<DocumentRecord>> {
        Ok(self.data.read().documents.iter().find(|d| d.id == id).cloned())
    }

    async fn save_all(&self, documents: Vec<DocumentRecord>) -> Result<()> {
        let snapshot = {
            let mut data = self.data.write();
            for doc in documents {
                match data.documents.iter_mut().find(|d| d.id == doc.id) {
                    Some(existing) => *existing = doc,
                    None => data.documents.push(doc),
                }
            }
            data.clone()
        };
        self.persist(&snapshot)
    }
}

#[async_trait]
impl FileService for JsonManifest {
    async fn get_metadata_by_id(&self, id: Uuid) -> Result<Option<FileMetadata>> {
        Ok(self.data.read().files.iter().find(|f| f.id == id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::documents::{ChunkRef, DocumentSource};

    fn record(source: DocumentSource, store: Option<&str>) -> DocumentRecord {
        DocumentRecord {
            id: Uuid::new_v4(),
            name: "manual".into(),
            source,
            mime_type: Some("application/pdf".into()),
            file_id: None,
            embedded_to_vs: store.map(str::to_string),
            chunks: vec![ChunkRef { id: "c1".into() }],
            embedded_to_bm25: false,
        }
    }

    #[tokio::test]
    async fn test_save_all_upserts_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.json");
        let manifest = JsonManifest::open(&path).unwrap();

        let mut embedded = record(DocumentSource::External, Some("s1"));
        let pending = record(DocumentSource::Uploaded, None);
        manifest.save_all(vec![embedded.clone(), pending]).await.unwrap();

        embedded.embedded_to_bm25 = true;
        manifest.save_all(vec![embedded.clone()]).await.unwrap();

        let reopened = JsonManifest::open(&path).unwrap();
        assert_eq!(reopened.documents().len(), 2);
        let all = reopened.get_all_embedded().await.unwrap();
        assert_eq!(all.len(), 1);
        assert!(all[0].embedded_to_bm25);
        assert!(reopened.get_by_id(embedded.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_file_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = JsonManifest::open(dir.path().join("m.json")).unwrap();
        let file = FileMetadata {
            id: Uuid::new_v4(),
            name: "a.txt".into(),
            mime_type: "text/plain".into(),
            path: dir.path().join("a.txt"),
        };
        manifest.add_file(file.clone()).unwrap();
        assert_eq!(manifest.get_metadata_by_id(file.id).await.unwrap(), Some(file));
        assert!(manifest.get_metadata_by_id(Uuid::new_v4()).await.unwrap().is_none());
    }
}
