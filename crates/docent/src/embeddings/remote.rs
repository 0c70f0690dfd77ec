use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;

use super::EmbeddingModel;
use crate::config::EmbeddingsConfig;
use crate::llm::openai::{http_client, map_send_error, parse_json_response, read_api_key};

const BATCH_SIZE: usize = 64;

/// Embeddings from an OpenAI-compatible `/embeddings` endpoint.
pub struct HttpEmbeddings {
    name: String,
    base_url: String,
    model: String,
    api_key: Option<String>,
    client: Client,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingItem>,
}

#[derive(Deserialize)]
struct EmbeddingItem {
    index: usize,
    embedding: Vec<f32>,
}

impl HttpEmbeddings {
    pub fn from_config(config: &EmbeddingsConfig) -> Result<Self> {
        Ok(Self {
            name: config.name.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key: read_api_key(config.api_key_env.as_deref())?,
            client: http_client(60)?,
        })
    }

    /// Configured name, as referenced by vector stores and the lexical index.
    pub fn name(&self) -> &str {
        &self.name
    }

    async fn request(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>> {
        let endpoint = format!("{}/embeddings", self.base_url);
        let mut builder = self
            .client
            .post(&endpoint)
            .json(&json!({ "model": self.model, "input": inputs }));
        if let Some(ref key) = self.api_key {
            builder = builder.bearer_auth(key);
        }
        let response = builder
            .send()
            .await
            .map_err(|e| map_send_error(&endpoint, e))?;
        let mut body: EmbeddingResponse = parse_json_response(response, &endpoint).await?;

        if body.data.len() != inputs.len() {
            return Err(anyhow!(
                "Embedding endpoint returned {} vectors for {} inputs",
                body.data.len(),
                inputs.len()
            ));
        }
        body.data.sort_by_key(|item| item.index);
        Ok(body.data.into_iter().map(|item| item.embedding).collect())
    }
}

#[async_trait]
impl EmbeddingModel for HttpEmbeddings {
    async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.request(&[text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| anyhow!("Embedding endpoint returned no vector"))
    }

    async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut all = Vec::with_capacity(texts.len());
        for batch in texts.chunks(BATCH_SIZE) {
            all.extend(self.request(batch).await?);
        }
        tracing::debug!(model = %self.model, count = all.len(), "Embedded documents");
        Ok(all)
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}
