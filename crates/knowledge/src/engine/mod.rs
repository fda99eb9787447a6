//! Vector engine abstraction.
//!
//! An engine stores chunk rows with their vectors in named collections and
//! answers nearest-neighbour searches. Engines report raw scores; turning
//! those into similarities is the backend adapter's job.

pub mod chroma;
pub mod memory;
pub mod milvus;

pub use chroma::ChromaEngine;
pub use memory::MemoryEngine;
pub use milvus::MilvusEngine;

use crate::types::ChunkRow;
use async_trait::async_trait;
use knowbase_core::AppResult;
use serde_json::{Map, Value};

/// Parameters for creating a collection.
#[derive(Debug, Clone)]
pub struct CollectionSpec {
    pub name: String,
    pub dimension: usize,
    /// Embedding model the vectors come from
    pub model_tag: String,
    pub description: String,
    /// Extra collection metadata, for engines that keep any
    pub metadata: Map<String, Value>,
}

/// What an engine can tell about an existing collection.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CollectionInfo {
    pub name: String,
    pub model_tag: Option<String>,
    pub description: Option<String>,
    pub metric: Option<String>,
    pub dimension: Option<usize>,
}

/// A chunk row and its vector.
#[derive(Debug, Clone)]
pub struct VectorRow {
    pub row: ChunkRow,
    pub vector: Vec<f32>,
}

/// One nearest-neighbour hit with the engine's raw score.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub row: ChunkRow,
    pub raw_score: f32,
}

/// Row selection for query, delete and filtered search.
#[derive(Debug, Clone, PartialEq)]
pub enum RowFilter {
    FileId(String),
    SourceContains(String),
}

impl RowFilter {
    pub fn matches(&self, row: &ChunkRow) -> bool {
        match self {
            RowFilter::FileId(id) => &row.file_id == id,
            RowFilter::SourceContains(text) => row.source.contains(text.as_str()),
        }
    }
}

/// Storage engine holding vector collections.
#[async_trait]
pub trait VectorEngine: Send + Sync {
    fn engine_name(&self) -> &str;

    async fn has_collection(&self, name: &str) -> AppResult<bool>;

    async fn create_collection(&self, spec: &CollectionSpec) -> AppResult<()>;

    /// `None` when the collection does not exist.
    async fn describe_collection(&self, name: &str) -> AppResult<Option<CollectionInfo>>;

    async fn drop_collection(&self, name: &str) -> AppResult<()>;

    async fn list_collections(&self) -> AppResult<Vec<String>>;

    async fn insert(&self, name: &str, rows: Vec<VectorRow>) -> AppResult<()>;

    /// Nearest rows to `vector`, best first.
    async fn search(
        &self,
        name: &str,
        vector: &[f32],
        limit: usize,
        filter: Option<&RowFilter>,
    ) -> AppResult<Vec<SearchHit>>;

    async fn query(&self, name: &str, filter: &RowFilter) -> AppResult<Vec<ChunkRow>>;

    /// Returns the number of rows removed.
    async fn delete(&self, name: &str, filter: &RowFilter) -> AppResult<usize>;

    async fn count(&self, name: &str) -> AppResult<usize>;
}

/// Read a string field out of a JSON object.
pub(crate) fn str_field(value: &Value, key: &str) -> String {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// Read an integer field that may arrive as a number or a string.
pub(crate) fn usize_field(value: &Value, key: &str) -> usize {
    match value.get(key) {
        Some(Value::Number(n)) => n.as_u64().unwrap_or_default() as usize,
        Some(Value::String(s)) => s.parse().unwrap_or_default(),
        _ => 0,
    }
}
