pub mod documents;
pub mod lance_store;
pub mod manifest;
pub mod memory_store;
pub mod vector_store;

pub use documents::{ChunkRef, DocumentRecord, DocumentRepository, DocumentSource, FileMetadata, FileService};
pub use lance_store::LanceVectorStore;
pub use manifest::JsonManifest;
pub use memory_store::InMemoryVectorStore;
pub use vector_store::{VectorStore, VectorStoreRegistry};
