use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::config::RecognizerConfig;
use crate::llm::openai::{http_client, map_send_error, parse_json_response};

/// A class the recognizer can predict, with text used to search for related information.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassDescriptor {
    pub name: String,
    pub description: String,
}

/// Classes known to a recognizer; duplicates by name are dropped, first one wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawRecognizerOutput")]
pub struct RecognizerOutput {
    pub is_configured: bool,
    pub classes: Vec<ClassDescriptor>,
}

#[derive(Deserialize)]
struct RawRecognizerOutput {
    #[serde(default)]
    is_configured: bool,
    classes: Vec<ClassDescriptor>,
}

impl From<RawRecognizerOutput> for RecognizerOutput {
    fn from(raw: RawRecognizerOutput) -> Self {
        Self::new(raw.is_configured, raw.classes)
    }
}

impl RecognizerOutput {
    pub fn new(is_configured: bool, classes: Vec<ClassDescriptor>) -> Self {
        let mut seen = HashSet::new();
        let classes = classes
            .into_iter()
            .filter(|c| seen.insert(c.name.clone()))
            .collect();
        Self {
            is_configured,
            classes,
        }
    }

    pub fn describe(&self, name: &str) -> Option<&str> {
        self.classes
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.description.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecognitionRequest {
    pub url: String,
    pub mime_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecognizingResult {
    pub classes: Vec<String>,
    #[serde(default)]
    pub probabilities: Option<Vec<f32>>,
    /// Seconds.
    pub inference_time: f32,
}

#[async_trait]
pub trait Recognizer: Send + Sync {
    async fn predict(&self, request: &RecognitionRequest) -> Result<RecognizingResult>;
}

/// Recognizer served over HTTP: `POST {endpoint}` with a [`RecognitionRequest`] body.
pub struct HttpRecognizer {
    endpoint: String,
    client: Client,
}

impl HttpRecognizer {
    pub fn from_config(config: &RecognizerConfig) -> Result<Self> {
        Ok(Self {
            endpoint: config.endpoint.clone(),
            client: http_client(config.timeout_secs)?,
        })
    }
}

#[async_trait]
impl Recognizer for HttpRecognizer {
    async fn predict(&self, request: &RecognitionRequest) -> Result<RecognizingResult> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(request)
            .send()
            .await
            .map_err(|e| map_send_error(&self.endpoint, e))?;
        let result: RecognizingResult = parse_json_response(response, &self.endpoint).await?;

        if let Some(ref probabilities) = result.probabilities {
            if probabilities.len() != result.classes.len() {
                return Err(anyhow!(
                    "Recognizer returned {} classes but {} probabilities",
                    result.classes.len(),
                    probabilities.len()
                ));
            }
        }
        tracing::debug!(classes = ?result.classes, inference_time = result.inference_time, "Recognition done");
        Ok(result)
    }
}
