use std::collections::HashMap;

use crate::types::{Passage, ScoredPassage};

/// Which retriever produced a fused result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HybridSource {
    Vector,
    Lexical,
    Both,
}

#[derive(Debug, Clone)]
pub struct FusedPassage {
    pub passage: Passage,
    pub score: f32,
    pub source: HybridSource,
}

/// Constant from the original RRF paper.
pub const RRF_K: usize = 60;

fn fusion_key(passage: &Passage) -> String {
    passage.id.clone().unwrap_or_else(|| passage.text.clone())
}

/// Reciprocal Rank Fusion: merges ranked lists without score normalization.
/// Formula: rrf_score(doc) = Σ 1/(k + rank_i) for each list containing doc
pub fn reciprocal_rank_fusion(
    vector_results: Vec<ScoredPassage>,
    lexical_results: Vec<ScoredPassage>,
    k: usize,
    top_k: usize,
) -> Vec<FusedPassage> {
    let mut scores: HashMap<String, FusedPassage> = HashMap::new();

    let lists = [
        (vector_results, HybridSource::Vector),
        (lexical_results, HybridSource::Lexical),
    ];
    for (results, origin) in lists {
        for (rank, hit) in results.into_iter().enumerate() {
            let rrf = 1.0 / (k as f32 + rank as f32 + 1.0);
            scores
                .entry(fusion_key(&hit.passage))
                .and_modify(|fused| {
                    fused.score += rrf;
                    if fused.source != origin {
                        fused.source = HybridSource::Both;
                    }
                })
                .or_insert(FusedPassage {
                    passage: hit.passage,
                    score: rrf,
                    source: origin,
                });
        }
    }

    let mut merged: Vec<FusedPassage> = scores.into_values().collect();
    merged.sort_by(|a, b| b.score.total_cmp(&a.score));
    merged.truncate(top_k);
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(id: &str) -> ScoredPassage {
        ScoredPassage {
            passage: Passage::new(format!("text {}", id)).with_id(id),
            score: 0.0,
        }
    }

    #[test]
    fn test_rrf_rewards_agreement() {
        let vector = vec![hit("a"), hit("b"), hit("c")];
        let lexical = vec![hit("b"), hit("d")];
        let fused = reciprocal_rank_fusion(vector, lexical, RRF_K, 3);

        assert_eq!(fused.len(), 3);
        assert_eq!(fused[0].passage.id.as_deref(), Some("b"));
        assert_eq!(fused[0].source, HybridSource::Both);
        let expected = 1.0 / 62.0 + 1.0 / 61.0;
        assert!((fused[0].score - expected).abs() < 1e-6);
        assert_eq!(fused[1].passage.id.as_deref(), Some("a"));
        assert_eq!(fused[1].source, HybridSource::Vector);
    }

    #[test]
    fn test_rrf_empty_inputs() {
        assert!(reciprocal_rank_fusion(vec![], vec![], RRF_K, 5).is_empty());
    }
}
