use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};

use crate::error::{AgentError, AgentResult};
use crate::recognizer::ClassDescriptor;

/// Environment variable naming the folder that holds `agent.json`.
pub const CONFIG_PATH_ENV: &str = "AGENT_CONFIG_PATH";
pub const CONFIG_FILE_NAME: &str = "agent.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub agent_name: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub language: Language,
    pub llm: LlmConfig,
    pub prompt: PromptConfig,
    #[serde(default)]
    pub image_recognizer: Option<RecognizerConfig>,
    #[serde(default)]
    pub embeddings: Vec<EmbeddingsConfig>,
    #[serde(default)]
    pub vector_stores: Vec<VectorStoreConfig>,
    #[serde(default)]
    pub retrievers: RetrieversConfig,
    #[serde(default)]
    pub mcp: McpConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

/// Response language. Serialized as an ISO 639-1 code.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    #[default]
    En,
    Vi,
    Fr,
    De,
    Es,
    Ja,
    Ko,
    Zh,
}

impl Language {
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::En => "English",
            Self::Vi => "Vietnamese",
            Self::Fr => "French",
            Self::De => "German",
            Self::Es => "Spanish",
            Self::Ja => "Japanese",
            Self::Ko => "Korean",
            Self::Zh => "Chinese",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Base URL of an OpenAI-compatible API, e.g. `https://api.openai.com/v1`.
    #[serde(default = "default_openai_base_url")]
    pub base_url: String,
    pub model: String,
    /// Environment variable holding the API key. Unset means no auth header.
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_request_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptConfig {
    pub respond_prompt: String,
    pub suggest_questions_prompt: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecognizerConfig {
    pub endpoint: String,
    /// Classes the recognizer predicts, surfaced to the model with each result.
    #[serde(default)]
    pub classes: Vec<ClassDescriptor>,
    #[serde(default = "default_request_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingsConfig {
    pub name: String,
    #[serde(default = "default_openai_base_url")]
    pub base_url: String,
    pub model: String,
    #[serde(default)]
    pub api_key_env: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorStoreConfig {
    pub name: String,
    /// LanceDB directory. Relative paths resolve against the config dir.
    pub path: PathBuf,
    #[serde(default = "default_table_name")]
    pub table: String,
    /// Name of an entry in `embeddings`.
    pub embeddings: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetrieversConfig {
    #[serde(default)]
    pub bm25: Option<Bm25Config>,
    #[serde(default)]
    pub vector: Vec<VectorRetrieverConfig>,
}

/// Lexical index settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bm25Config {
    /// Embeddings used by the semantic chunker before indexing.
    pub embeddings_model: String,
    #[serde(default = "default_k")]
    pub k: usize,
    #[serde(default)]
    pub enable_remove_emoji: bool,
    #[serde(default)]
    pub enable_remove_emoticon: bool,
    /// Stop-word list, one word per line. Relative to the config dir.
    #[serde(default)]
    pub removal_words_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorRetrieverConfig {
    /// Tool name exposed to the model.
    pub name: String,
    pub store: String,
    #[serde(default = "default_k")]
    pub k: usize,
    #[serde(default)]
    pub description: Option<String>,
    /// Fuse results with the lexical index (reciprocal rank fusion).
    #[serde(default)]
    pub hybrid: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct McpConfig {
    #[serde(default)]
    pub connections: BTreeMap<String, McpServerConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum McpTransport {
    Stdio,
    StreamableHttp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpServerConfig {
    #[serde(rename = "type")]
    pub transport: McpTransport,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_request_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub tool_timeout_secs: u64,
    /// Maximum node executions per turn.
    pub recursion_limit: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            tool_timeout_secs: 30,
            recursion_limit: crate::agent::graph::DEFAULT_RECURSION_LIMIT,
        }
    }
}

fn default_openai_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_max_tokens() -> usize {
    2048
}

fn default_temperature() -> f32 {
    0.2
}

fn default_request_timeout_secs() -> u64 {
    120
}

fn default_table_name() -> String {
    "documents".to_string()
}

fn default_k() -> usize {
    4
}

/// Read the config folder from `AGENT_CONFIG_PATH`.
pub fn config_dir_from_env() -> AgentResult<PathBuf> {
    std::env::var(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .map_err(|_| AgentError::configuration(format!("Missing the {} environment variable.", CONFIG_PATH_ENV)))
}

/// Resolve `path` against `base` unless it is already absolute.
pub fn resolve_path(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

impl AgentConfig {
    /// Validate config values, returning errors for clearly broken configurations.
    pub fn validate(&self) -> Result<(), String> {
        if self.agent_name.trim().is_empty() {
            return Err("agent_name must not be empty".into());
        }
        if self.llm.model.trim().is_empty() {
            return Err("llm.model must not be empty".into());
        }
        if self.runtime.recursion_limit == 0 {
            return Err("runtime.recursion_limit must be > 0".into());
        }

        let embeddings: HashSet<&str> = self.embeddings.iter().map(|e| e.name.as_str()).collect();
        if embeddings.len() != self.embeddings.len() {
            return Err("embeddings names must be unique".into());
        }

        let mut stores = HashSet::new();
        for store in &self.vector_stores {
            if store.name.trim().is_empty() {
                return Err("vector_stores[].name must not be empty".into());
            }
            if !stores.insert(store.name.as_str()) {
                return Err(format!("duplicate vector store name: {}", store.name));
            }
            if !embeddings.contains(store.embeddings.as_str()) {
                return Err(format!(
                    "vector store {} references unknown embeddings {}",
                    store.name, store.embeddings
                ));
            }
        }

        if let Some(ref bm25) = self.retrievers.bm25 {
            if bm25.k == 0 {
                return Err("retrievers.bm25.k must be > 0".into());
            }
            if !embeddings.contains(bm25.embeddings_model.as_str()) {
                return Err(format!(
                    "retrievers.bm25 references unknown embeddings {}",
                    bm25.embeddings_model
                ));
            }
        }

        for retriever in &self.retrievers.vector {
            if retriever.k == 0 {
                return Err(format!("retriever {}: k must be > 0", retriever.name));
            }
            if !stores.contains(retriever.store.as_str()) {
                return Err(format!(
                    "retriever {} references unknown vector store {}",
                    retriever.name, retriever.store
                ));
            }
            if retriever.hybrid && self.retrievers.bm25.is_none() {
                return Err(format!(
                    "retriever {} is hybrid but retrievers.bm25 is not configured",
                    retriever.name
                ));
            }
        }

        Ok(())
    }

    /// Load config from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file {}: {}", path.display(), e))?;
        let config: Self = serde_json::from_str(&content)
            .map_err(|e| format!("Failed to parse config {}: {}", path.display(), e))?;
        config.validate()?;
        Ok(config)
    }

    /// Load `agent.json` from the given config folder.
    pub fn load(config_dir: &Path) -> AgentResult<Self> {
        Self::from_file(&config_dir.join(CONFIG_FILE_NAME)).map_err(AgentError::Configuration)
    }

    pub fn vector_store(&self, name: &str) -> Option<&VectorStoreConfig> {
        self.vector_stores.iter().find(|s| s.name == name)
    }

    pub fn embeddings(&self, name: &str) -> Option<&EmbeddingsConfig> {
        self.embeddings.iter().find(|e| e.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> serde_json::Value {
        serde_json::json!({
            "agent_name": "docent",
            "language": "vi",
            "llm": { "model": "gpt-4o-mini" },
            "prompt": {
                "respond_prompt": "You are a helpful assistant.",
                "suggest_questions_prompt": "Suggest questions."
            },
            "embeddings": [{ "name": "e5", "model": "text-embedding-3-small" }],
            "vector_stores": [{ "name": "s1", "path": "lance", "embeddings": "e5" }],
            "retrievers": {
                "bm25": { "embeddings_model": "e5", "k": 3 },
                "vector": [{ "name": "search_manuals", "store": "s1", "hybrid": true }]
            }
        })
    }

    #[test]
    fn test_parse_applies_defaults() {
        let config: AgentConfig = serde_json::from_value(sample()).unwrap();
        assert_eq!(config.language, Language::Vi);
        assert_eq!(config.language.display_name(), "Vietnamese");
        assert_eq!(config.llm.base_url, "https://api.openai.com/v1");
        assert_eq!(config.vector_stores[0].table, "documents");
        assert_eq!(config.retrievers.vector[0].k, 4);
        assert_eq!(config.runtime.recursion_limit, 25);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_unknown_store_reference() {
        let mut value = sample();
        value["retrievers"]["vector"][0]["store"] = serde_json::json!("missing");
        let config: AgentConfig = serde_json::from_value(value).unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.contains("unknown vector store missing"));
    }

    #[test]
    fn test_validate_rejects_zero_k() {
        let mut value = sample();
        value["retrievers"]["bm25"]["k"] = serde_json::json!(0);
        let config: AgentConfig = serde_json::from_value(value).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_missing_file_is_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = AgentConfig::load(dir.path()).unwrap_err();
        assert!(matches!(err, AgentError::Configuration(_)));
    }

    #[test]
    fn test_load_from_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE_NAME), sample().to_string()).unwrap();
        let config = AgentConfig::load(dir.path()).unwrap();
        assert_eq!(config.agent_name, "docent");
        assert!(config.vector_store("s1").is_some());
        assert!(config.embeddings("e5").is_some());
    }

    #[test]
    fn test_resolve_path() {
        let base = Path::new("/etc/docent");
        assert_eq!(resolve_path(base, Path::new("stop.txt")), PathBuf::from("/etc/docent/stop.txt"));
        assert_eq!(resolve_path(base, Path::new("/tmp/stop.txt")), PathBuf::from("/tmp/stop.txt"));
    }
}
