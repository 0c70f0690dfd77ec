pub mod chunker;
pub mod converter;
pub mod normalizer;

pub use chunker::SemanticChunker;
pub use converter::{ConvertedDocument, DocumentConverter, LocalDocumentConverter};
pub use normalizer::{NormalizerOptions, TextNormalizer};
