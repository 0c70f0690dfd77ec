use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use super::vector_store::VectorStore;
use crate::embeddings::{cosine_similarity, EmbeddingModel};
use crate::types::{Passage, ScoredPassage};

struct Entry {
    passage: Passage,
    vector: Vec<f32>,
}

/// Brute-force cosine search over an in-process map.
pub struct InMemoryVectorStore {
    embeddings: Arc<dyn EmbeddingModel>,
    entries: RwLock<HashMap<String, Entry>>,
}

impl InMemoryVectorStore {
    pub fn new(embeddings: Arc<dyn EmbeddingModel>) -> Self {
        Self {
            embeddings,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn add_documents(&self, passages: Vec<Passage>, ids: Vec<String>) -> Result<Vec<String>> {
        if passages.len() != ids.len() {
            return Err(anyhow!(
                "Got {} passages but {} ids",
                passages.len(),
                ids.len()
            ));
        }
        let texts: Vec<String> = passages.iter().map(|p| p.text.clone()).collect();
        let vectors = self.embeddings.embed_documents(&texts).await?;

        let mut entries = self.entries.write();
        for ((mut passage, id), vector) in passages.into_iter().zip(ids.iter()).zip(vectors) {
            passage.id = Some(id.clone());
            entries.insert(id.clone(), Entry { passage, vector });
        }
        Ok(ids)
    }

    async fn delete(&self, ids: &[String]) -> Result<()> {
        let mut entries = self.entries.write();
        for id in ids {
            entries.remove(id);
        }
        Ok(())
    }

    async fn get_by_ids(&self, ids: &[String]) -> Result<Vec<Passage>> {
        let entries = self.entries.read();
        Ok(ids
            .iter()
            .filter_map(|id| entries.get(id).map(|e| e.passage.clone()))
            .collect())
    }

    async fn similarity_search(&self, query: &str, k: usize) -> Result<Vec<ScoredPassage>> {
        let query_vector = self.embeddings.embed_query(query).await?;
        let entries = self.entries.read();
        let mut scored: Vec<ScoredPassage> = entries
            .values()
            .map(|e| ScoredPassage {
                passage: e.passage.clone(),
                score: cosine_similarity(&query_vector, &e.vector),
            })
            .collect();
        scored.sort_by(|a, b| b.score.total_cmp(&a.score));
        scored.truncate(k);
        Ok(scored)
    }

    fn embeddings(&self) -> Arc<dyn EmbeddingModel> {
        Arc::clone(&self.embeddings)
    }
}
