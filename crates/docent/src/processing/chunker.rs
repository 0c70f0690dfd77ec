use anyhow::Result;
use std::sync::Arc;
use uuid::Uuid;

use crate::embeddings::{cosine_similarity, EmbeddingModel};
use crate::types::Passage;

const DEFAULT_BREAKPOINT_PERCENTILE: f32 = 95.0;

/// Splits text where the embedding distance between neighbouring sentence
/// windows jumps above a percentile of all distances.
pub struct SemanticChunker {
    embeddings: Arc<dyn EmbeddingModel>,
    buffer_size: usize,
    breakpoint_percentile: f32,
}

impl SemanticChunker {
    pub fn new(embeddings: Arc<dyn EmbeddingModel>) -> Self {
        Self {
            embeddings,
            buffer_size: 1,
            breakpoint_percentile: DEFAULT_BREAKPOINT_PERCENTILE,
        }
    }

    pub fn with_breakpoint_percentile(mut self, percentile: f32) -> Self {
        self.breakpoint_percentile = percentile.clamp(0.0, 100.0);
        self
    }

    /// Split one text into chunk strings.
    pub async fn split_text(&self, text: &str) -> Result<Vec<String>> {
        let sentences = split_sentences(text);
        if sentences.len() <= 1 {
            return Ok(sentences.into_iter().map(str::to_string).collect());
        }

        let windows = combine_sentences(&sentences, self.buffer_size);
        let vectors = self.embeddings.embed_documents(&windows).await?;
        let distances: Vec<f32> = vectors
            .windows(2)
            .map(|pair| 1.0 - cosine_similarity(&pair[0], &pair[1]))
            .collect();
        let threshold = percentile(&distances, self.breakpoint_percentile);

        let mut chunks = Vec::new();
        let mut start = 0;
        for (i, distance) in distances.iter().enumerate() {
            if *distance > threshold {
                chunks.push(sentences[start..=i].join(" "));
                start = i + 1;
            }
        }
        if start < sentences.len() {
            chunks.push(sentences[start..].join(" "));
        }
        Ok(chunks)
    }

    /// Split passages into chunks that inherit their source metadata and get fresh ids.
    pub async fn split_passages(&self, passages: &[Passage]) -> Result<Vec<Passage>> {
        let mut out = Vec::new();
        for passage in passages {
            for text in self.split_text(&passage.text).await? {
                out.push(Passage {
                    id: Some(Uuid::new_v4().to_string()),
                    text,
                    metadata: passage.metadata.clone(),
                });
            }
        }
        tracing::debug!(input = passages.len(), chunks = out.len(), "Semantic chunking complete");
        Ok(out)
    }
}

/// Sentence boundaries: `.`, `?` or `!` followed by whitespace.
fn split_sentences(text: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut start = 0;
    let mut chars = text.char_indices().peekable();

    while let Some((i, c)) = chars.next() {
        if !matches!(c, '.' | '?' | '!') {
            continue;
        }
        let Some(&(next_i, next_c)) = chars.peek() else {
            break;
        };
        if !next_c.is_whitespace() {
            continue;
        }
        let sentence = text[start..=i].trim();
        if !sentence.is_empty() {
            sentences.push(sentence);
        }
        start = next_i;
    }

    let tail = text[start..].trim();
    if !tail.is_empty() {
        sentences.push(tail);
    }
    sentences
}

/// Each sentence joined with `buffer` neighbours on both sides.
fn combine_sentences(sentences: &[&str], buffer: usize) -> Vec<String> {
    (0..sentences.len())
        .map(|i| {
            let lo = i.saturating_sub(buffer);
            let hi = (i + buffer + 1).min(sentences.len());
            sentences[lo..hi].join(" ")
        })
        .collect()
}

/// Linear-interpolated percentile (same convention as numpy's default).
fn percentile(values: &[f32], p: f32) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let rank = (p / 100.0) * (sorted.len() - 1) as f32;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    let frac = rank - lo as f32;
    sorted[lo] + (sorted[hi] - sorted[lo]) * frac
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::HashEmbeddings;

    #[test]
    fn test_split_sentences() {
        let s = split_sentences("First one. Second?  Third!Not split. v1.2 stays");
        assert_eq!(s, vec!["First one.", "Second?", "Third!Not split.", "v1.2 stays"]);
        assert!(split_sentences("   ").is_empty());
    }

    #[test]
    fn test_combine_sentences_buffer_one() {
        let combined = combine_sentences(&["a", "b", "c"], 1);
        assert_eq!(combined, vec!["a b", "a b c", "b c"]);
    }

    #[test]
    fn test_percentile_interpolates() {
        assert_eq!(percentile(&[1.0, 2.0, 3.0, 4.0, 5.0], 50.0), 3.0);
        assert!((percentile(&[0.0, 10.0], 95.0) - 9.5).abs() < 1e-5);
        assert_eq!(percentile(&[], 95.0), 0.0);
    }

    #[tokio::test]
    async fn test_single_sentence_is_one_chunk() {
        let chunker = SemanticChunker::new(Arc::new(HashEmbeddings::new(16)));
        let chunks = chunker.split_text("Only one sentence here").await.unwrap();
        assert_eq!(chunks, vec!["Only one sentence here"]);
    }

    #[tokio::test]
    async fn test_split_passages_keeps_all_text_and_metadata() {
        let chunker = SemanticChunker::new(Arc::new(HashEmbeddings::new(32)));
        let text = "Pumps move water. Pumps need power. Cats sleep a lot. Cats chase mice. Trains run on rails.";
        let source = Passage::new(text).with_metadata("source", "manual.pdf");
        let chunks = chunker.split_passages(&[source]).await.unwrap();

        assert!(!chunks.is_empty());
        let rejoined: Vec<&str> = chunks.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(rejoined.join(" "), text);
        for chunk in &chunks {
            assert_eq!(chunk.source(), Some("manual.pdf"));
            assert!(chunk.id.is_some());
        }
    }
}
