use anyhow::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::embeddings::EmbeddingModel;
use crate::types::{Passage, ScoredPassage};

#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Embed and store passages under the given ids. Returns the ids written.
    async fn add_documents(&self, passages: Vec<Passage>, ids: Vec<String>) -> Result<Vec<String>>;

    async fn delete(&self, ids: &[String]) -> Result<()>;

    /// Previously stored passages; unknown ids are absent from the result.
    async fn get_by_ids(&self, ids: &[String]) -> Result<Vec<Passage>>;

    async fn similarity_search(&self, query: &str, k: usize) -> Result<Vec<ScoredPassage>>;

    fn embeddings(&self) -> Arc<dyn EmbeddingModel>;
}

/// Vector stores keyed by configured name.
#[derive(Clone, Default)]
pub struct VectorStoreRegistry {
    stores: BTreeMap<String, Arc<dyn VectorStore>>,
}

impl VectorStoreRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, store: Arc<dyn VectorStore>) {
        self.stores.insert(name.into(), store);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn VectorStore>> {
        self.stores.get(name).cloned()
    }

    /// Configured names in sorted order.
    pub fn names(&self) -> Vec<String> {
        self.stores.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.stores.is_empty()
    }
}
