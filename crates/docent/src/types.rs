use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A unit of retrievable text with provenance metadata.
///
/// Produced by the document converter, by vector stores (previously embedded
/// chunks) and by the semantic chunker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Passage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub text: String,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Passage {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            id: None,
            text: text.into(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// `source` metadata entry, if present.
    pub fn source(&self) -> Option<&str> {
        self.metadata.get("source").and_then(|v| v.as_str())
    }
}

/// A passage returned by a retriever, with its retrieval score.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredPassage {
    pub passage: Passage,
    pub score: f32,
}
