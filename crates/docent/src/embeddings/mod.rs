pub mod remote;

use anyhow::Result;
use async_trait::async_trait;

pub use remote::HttpEmbeddings;

/// Unified embedding model trait
#[async_trait]
pub trait EmbeddingModel: Send + Sync {
    /// Embed a search query
    async fn embed_query(&self, text: &str) -> Result<Vec<f32>>;

    /// Batch embed documents for ingestion
    async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    fn model_name(&self) -> &str;
}

/// Cosine similarity; zero when either vector has no magnitude.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}
