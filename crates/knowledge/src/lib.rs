//! Knowledge base indexing and retrieval.
//!
//! Documents are converted to text, chunked, embedded and stored in a
//! vector engine (Chroma or Milvus), one collection per knowledge base.
//! Queries run a vector recall followed by optional reranking.
//!
//! [`KnowledgeBaseManager`] is the entry point; it routes each call to the
//! [`KnowledgeBase`] of the backend owning the knowledge base id.

pub mod backend;
pub mod base;
pub mod chunk;
pub mod convert;
pub mod engine;
pub mod manager;
pub mod metadata;
pub mod models;
pub mod prepare;
pub mod queue;
pub mod registry;
pub mod retrieval;
pub mod types;

#[cfg(test)]
mod tests;

pub use backend::{BackendAdapter, ChromaBackend, CollectionState, IngestPolicy, MilvusBackend};
pub use base::{BaseSettings, DatabaseUpdate, KnowledgeBase};
pub use chunk::{Chunk, ChunkConfig, ChunkingEngine};
pub use convert::{BasicConverter, DocumentConverter, UrlPolicy};
pub use engine::{ChromaEngine, MemoryEngine, MilvusEngine, VectorEngine};
pub use manager::KnowledgeBaseManager;
pub use models::ModelCache;
pub use queue::ProcessingQueue;
pub use registry::BackendRegistry;
pub use retrieval::RetrievalPlan;
pub use types::{
    BackendType, ChunkRow, ContentKind, DatabaseInfo, EmbedInfo, FileInfo, FileRecord,
    FileStatus, InconsistencyReport, KnowledgeBaseRecord, ProcessingParams, QueryOptions,
    ScoredChunk, Statistics,
};
