use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;

use super::tools::{AgentTool, ToolInput, ToolResult};
use crate::recognizer::{RecognitionRequest, Recognizer, RecognizerOutput};
use crate::search::{reciprocal_rank_fusion, LexicalIndexBuilder, RRF_K};
use crate::storage::VectorStore;
use crate::types::Passage;

pub const RECOGNITION_TOOL_ID: &str = "recognize_attachment";
pub const LEXICAL_TOOL_ID: &str = "lexical_search";

fn query_schema(description: &str) -> serde_json::Value {
    json!({
        "type": "object",
        "properties": {
            "query": { "type": "string", "description": description }
        },
        "required": ["query"]
    })
}

/// Passages as `[source] text` blocks, plus structured data.
fn format_passages<'a>(passages: impl IntoIterator<Item = (&'a Passage, f32)>) -> ToolResult {
    let mut blocks = Vec::new();
    let mut data = Vec::new();
    for (passage, score) in passages {
        let source = passage.source().unwrap_or("unknown");
        blocks.push(format!("[{}]\n{}", source, passage.text));
        data.push(json!({
            "id": passage.id,
            "source": source,
            "score": score,
            "content": passage.text,
        }));
    }
    if blocks.is_empty() {
        return ToolResult::ok("No relevant passages found.", json!([]));
    }
    ToolResult::ok(blocks.join("\n\n"), json!(data))
}

/// Classifies the turn's attachment (images only).
pub struct RecognitionTool {
    recognizer: Arc<dyn Recognizer>,
    known_classes: RecognizerOutput,
}

impl RecognitionTool {
    pub fn new(recognizer: Arc<dyn Recognizer>, known_classes: RecognizerOutput) -> Self {
        Self {
            recognizer,
            known_classes,
        }
    }
}

#[async_trait]
impl AgentTool for RecognitionTool {
    fn id(&self) -> &str {
        RECOGNITION_TOOL_ID
    }

    fn description(&self) -> &str {
        "Recognize what an image attachment shows. Use it for attachments whose mime_type starts with `image/`."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "url": { "type": "string", "description": "The `url` field of the attachment information" },
                "mime_type": { "type": "string", "description": "The `mime_type` field of the attachment information" }
            },
            "required": ["url", "mime_type"]
        })
    }

    async fn execute(&self, input: ToolInput) -> Result<ToolResult> {
        let mime_type = input.str_param("mime_type")?;
        if !mime_type.starts_with("image/") {
            return Ok(ToolResult::failed(format!(
                "Unsupported attachment type {}; only images can be recognized",
                mime_type
            )));
        }
        let request = RecognitionRequest {
            url: input.str_param("url")?.to_string(),
            mime_type: mime_type.to_string(),
        };

        let result = self.recognizer.predict(&request).await?;
        let classes: Vec<serde_json::Value> = result
            .classes
            .iter()
            .enumerate()
            .map(|(i, name)| {
                json!({
                    "name": name,
                    "probability": result.probabilities.as_ref().and_then(|p| p.get(i)),
                    "description": self.known_classes.describe(name),
                })
            })
            .collect();

        let data = json!({ "classes": classes, "inference_time": result.inference_time });
        Ok(ToolResult::ok(data.to_string(), data))
    }
}

/// BM25 search over the active lexical index.
pub struct LexicalSearchTool {
    index: Arc<LexicalIndexBuilder>,
}

impl LexicalSearchTool {
    pub fn new(index: Arc<LexicalIndexBuilder>) -> Self {
        Self { index }
    }
}

#[async_trait]
impl AgentTool for LexicalSearchTool {
    fn id(&self) -> &str {
        LEXICAL_TOOL_ID
    }

    fn description(&self) -> &str {
        "Keyword search over the knowledge base documents. Best for exact names, codes and rare terms."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        query_schema("Keywords to search for")
    }

    async fn execute(&self, input: ToolInput) -> Result<ToolResult> {
        let query = input.str_param("query")?;
        let Some(index) = self.index.active() else {
            return Ok(ToolResult::failed("The lexical index has not been built yet."));
        };
        let hits = index.search(query)?;
        Ok(format_passages(hits.iter().map(|h| (&h.passage, h.score))))
    }
}

/// Embedding similarity search over one vector store.
pub struct VectorSearchTool {
    name: String,
    description: String,
    store: Arc<dyn VectorStore>,
    k: usize,
}

impl VectorSearchTool {
    pub fn new(name: impl Into<String>, description: impl Into<String>, store: Arc<dyn VectorStore>, k: usize) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            store,
            k,
        }
    }
}

#[async_trait]
impl AgentTool for VectorSearchTool {
    fn id(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters_schema(&self) -> serde_json::Value {
        query_schema("Natural-language search query")
    }

    async fn execute(&self, input: ToolInput) -> Result<ToolResult> {
        let query = input.str_param("query")?;
        let hits = self.store.similarity_search(query, self.k).await?;
        Ok(format_passages(hits.iter().map(|h| (&h.passage, h.score))))
    }
}

/// Vector and lexical results merged with reciprocal rank fusion. Falls back
/// to vector results alone while no lexical index is built.
pub struct HybridSearchTool {
    vector: VectorSearchTool,
    index: Arc<LexicalIndexBuilder>,
}

impl HybridSearchTool {
    pub fn new(vector: VectorSearchTool, index: Arc<LexicalIndexBuilder>) -> Self {
        Self { vector, index }
    }
}

#[async_trait]
impl AgentTool for HybridSearchTool {
    fn id(&self) -> &str {
        self.vector.id()
    }

    fn description(&self) -> &str {
        self.vector.description()
    }

    fn parameters_schema(&self) -> serde_json::Value {
        self.vector.parameters_schema()
    }

    async fn execute(&self, input: ToolInput) -> Result<ToolResult> {
        let query = input.str_param("query")?;
        let k = self.vector.k;
        let vector_hits = self.vector.store.similarity_search(query, k).await?;
        let lexical_hits = match self.index.active() {
            Some(index) => index.search_top(query, k)?,
            None => Vec::new(),
        };

        let fused = reciprocal_rank_fusion(vector_hits, lexical_hits, RRF_K, k);
        Ok(format_passages(fused.iter().map(|f| (&f.passage, f.score))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::{LexicalSettings, LexicalSources};
    use crate::storage::{ChunkRef, DocumentRecord, DocumentSource, InMemoryVectorStore, VectorStoreRegistry};
    use crate::testing::{HashEmbeddings, MemoryDocuments, StaticConverter, StaticRecognizer};
    use crate::processing::TextNormalizer;

    fn input(parameters: serde_json::Value) -> ToolInput {
        ToolInput {
            tool_id: "t".into(),
            parameters,
        }
    }

    async fn store_with(texts: &[(&str, &str)]) -> Arc<InMemoryVectorStore> {
        let store = Arc::new(InMemoryVectorStore::new(Arc::new(HashEmbeddings::new(64))));
        let passages = texts
            .iter()
            .map(|(_, text)| Passage::new(*text).with_metadata("source", "manual.pdf"))
            .collect();
        let ids = texts.iter().map(|(id, _)| id.to_string()).collect();
        store.add_documents(passages, ids).await.unwrap();
        store
    }

    fn builder(store: Arc<InMemoryVectorStore>) -> Arc<LexicalIndexBuilder> {
        let documents = Arc::new(MemoryDocuments::default());
        let builder = Arc::new(LexicalIndexBuilder::new(LexicalSources {
            documents: documents.clone(),
            files: documents,
            converter: Arc::new(StaticConverter::new("")),
        }));
        let mut registry = VectorStoreRegistry::new();
        registry.insert("s1", store.clone());
        builder.reconfigure(LexicalSettings {
            k: 2,
            normalizer: TextNormalizer::default(),
            embeddings: store.embeddings(),
            vector_stores: registry,
        });
        builder
    }

    #[tokio::test]
    async fn test_lexical_tool_before_and_after_build() {
        let store = store_with(&[("c1", "Seal replacement for pump P-100.")]).await;
        let builder = builder(store);
        let tool = LexicalSearchTool::new(builder.clone());

        let before = tool.execute(input(json!({"query": "seal"}))).await.unwrap();
        assert!(!before.success);

        let doc = DocumentRecord {
            id: uuid::Uuid::new_v4(),
            name: "manual".into(),
            source: DocumentSource::External,
            mime_type: None,
            file_id: None,
            embedded_to_vs: Some("s1".into()),
            chunks: vec![ChunkRef { id: "c1".into() }],
            embedded_to_bm25: false,
        };
        builder.rebuild(vec![doc]).await.unwrap();

        let after = tool.execute(input(json!({"query": "seal"}))).await.unwrap();
        assert!(after.success);
        assert!(after.output.starts_with("[manual.pdf]"));
        assert!(after.output.contains("P-100"));
    }

    #[tokio::test]
    async fn test_vector_tool_requires_query() {
        let store = store_with(&[("c1", "anything")]).await;
        let tool = VectorSearchTool::new("search_manuals", "Search manuals", store, 2);
        assert!(tool.execute(input(json!({}))).await.is_err());
        let ok = tool.execute(input(json!({"query": "anything"}))).await.unwrap();
        assert_eq!(ok.data.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_hybrid_tool_without_lexical_index_uses_vector_hits() {
        let store = store_with(&[("c1", "pump seal"), ("c2", "holiday plan")]).await;
        let index = builder(store.clone());
        let tool = HybridSearchTool::new(VectorSearchTool::new("hybrid", "Hybrid search", store, 1), index);
        let result = tool.execute(input(json!({"query": "pump seal"}))).await.unwrap();
        let data = result.data.as_array().unwrap();
        assert_eq!(data.len(), 1);
        assert_eq!(data[0]["id"], "c1");
    }

    #[tokio::test]
    async fn test_recognition_tool() {
        let known = RecognizerOutput::new(
            true,
            vec![crate::recognizer::ClassDescriptor {
                name: "pump".into(),
                description: "Centrifugal pump".into(),
            }],
        );
        let tool = RecognitionTool::new(Arc::new(StaticRecognizer::new(&["pump"])), known);

        let rejected = tool
            .execute(input(json!({"url": "/files/a.pdf", "mime_type": "application/pdf"})))
            .await
            .unwrap();
        assert!(!rejected.success);

        let result = tool
            .execute(input(json!({"url": "/files/a.png", "mime_type": "image/png"})))
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.data["classes"][0]["description"], "Centrifugal pump");
    }
}
