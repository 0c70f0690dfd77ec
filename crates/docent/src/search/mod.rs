pub mod hybrid;
pub mod lexical_index;
pub mod lexical_sync;

pub use hybrid::{reciprocal_rank_fusion, FusedPassage, HybridSource, RRF_K};
pub use lexical_index::LexicalIndex;
pub use lexical_sync::{LexicalIndexBuilder, LexicalSettings, LexicalSources, RebuildOutcome};
