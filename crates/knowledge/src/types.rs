//! Knowledge base type definitions.

use chrono::{DateTime, Utc};
use knowbase_core::config::EmbeddingSettings;
use knowbase_core::{AppError, AppResult};
use knowbase_models::{EmbeddingConfig, RerankConfig};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// Vector engine family backing a knowledge base.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
    Chroma,
    Milvus,
}

impl BackendType {
    pub const ALL: [BackendType; 2] = [BackendType::Chroma, BackendType::Milvus];

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendType::Chroma => "chroma",
            BackendType::Milvus => "milvus",
        }
    }
}

impl fmt::Display for BackendType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendType {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "chroma" => Ok(BackendType::Chroma),
            "milvus" => Ok(BackendType::Milvus),
            other => Err(AppError::Config(format!(
                "Unknown backend type: '{}'. Supported: chroma, milvus",
                other
            ))),
        }
    }
}

/// Embedding model a knowledge base was created with.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EmbedInfo {
    /// Model identifier; also the tag recorded on the vector collection
    pub name: String,

    #[serde(default = "default_embed_provider")]
    pub provider: String,

    #[serde(default)]
    pub base_url: Option<String>,

    /// Environment variable name holding the key, or the key itself
    #[serde(default)]
    pub api_key: Option<String>,

    pub dimension: usize,

    #[serde(default)]
    pub batch_size: Option<usize>,
}

fn default_embed_provider() -> String {
    "openai".to_string()
}

impl EmbedInfo {
    /// Tag written onto collections so a model change can be detected.
    pub fn model_tag(&self) -> &str {
        if self.name.is_empty() {
            "default"
        } else {
            &self.name
        }
    }

    /// Build the provider configuration, resolving the API key.
    pub fn to_embedding_config(&self, timeout_secs: u64) -> EmbeddingConfig {
        let api_key = self
            .api_key
            .as_ref()
            .map(|key| std::env::var(key).unwrap_or_else(|_| key.clone()));

        EmbeddingConfig {
            provider: self.provider.clone(),
            model: self.name.clone(),
            dimensions: self.dimension,
            base_url: self.base_url.clone(),
            api_key,
            batch_size: self.batch_size.unwrap_or(64),
            timeout_secs,
        }
    }
}

impl From<&EmbeddingSettings> for EmbedInfo {
    fn from(settings: &EmbeddingSettings) -> Self {
        Self {
            name: settings.model.clone(),
            provider: settings.provider.clone(),
            base_url: settings.base_url.clone(),
            api_key: settings.api_key_env.clone(),
            dimension: settings.dimension,
            batch_size: Some(settings.batch_size),
        }
    }
}

/// Persisted description of one knowledge base.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeBaseRecord {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub backend_type: BackendType,
    pub embed_info: EmbedInfo,
    #[serde(default)]
    pub llm_info: Option<Value>,
    /// Free-form parameters (reranker_config, query_params, is_private, ...)
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl KnowledgeBaseRecord {
    /// Reranker settings stored under `metadata.reranker_config`.
    pub fn reranker_settings(&self) -> RerankerSettings {
        self.metadata
            .get("reranker_config")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default()
    }

    /// Retrieval defaults stored under `metadata.query_params.options`.
    pub fn stored_query_options(&self) -> QueryOptions {
        self.metadata
            .get("query_params")
            .and_then(|p| p.get("options"))
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default()
    }
}

/// Ingestion status of a file record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    Processing,
    Done,
    Failed,
}

impl FileStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileStatus::Processing => "processing",
            FileStatus::Done => "done",
            FileStatus::Failed => "failed",
        }
    }
}

/// What an ingested item refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    #[default]
    File,
    Url,
}

/// Per-item processing options, stored verbatim on the file record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessingParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<ContentKind>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_size: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_overlap: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub use_qa_split: Option<bool>,

    /// Escaped literal such as `\n\n\n`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qa_separator: Option<String>,

    /// Unrecognised keys, kept so re-indexing sees exactly what was sent
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ProcessingParams {
    pub fn content_kind(&self) -> ContentKind {
        self.content_type.unwrap_or_default()
    }

    /// Layer `self` (the request) over `stored`; request values win.
    pub fn merged_over(&self, stored: &ProcessingParams) -> ProcessingParams {
        let mut extra = stored.extra.clone();
        extra.extend(self.extra.clone());

        ProcessingParams {
            content_type: self.content_type.or(stored.content_type),
            chunk_size: self.chunk_size.or(stored.chunk_size),
            chunk_overlap: self.chunk_overlap.or(stored.chunk_overlap),
            use_qa_split: self.use_qa_split.or(stored.use_qa_split),
            qa_separator: self
                .qa_separator
                .clone()
                .or_else(|| stored.qa_separator.clone()),
            extra,
        }
    }
}

/// Metadata about one ingested file, URL or folder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub file_id: String,
    pub database_id: String,
    pub filename: String,
    /// Local path or URL
    pub path: String,
    #[serde(default)]
    pub file_type: String,
    pub status: FileStatus,
    /// SHA-256 of the file bytes; absent for URLs and unreadable files
    #[serde(default)]
    pub content_hash: Option<String>,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub is_folder: bool,
    #[serde(default)]
    pub processing_params: ProcessingParams,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<String>,
}

impl FileRecord {
    pub(crate) fn mark(&mut self, status: FileStatus, error: Option<String>) {
        self.status = status;
        self.error = error;
        self.updated_at = Some(Utc::now());
    }
}

/// A chunk row as stored in a vector engine (without its vector).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkRow {
    pub id: String,
    pub content: String,
    pub source: String,
    pub file_id: String,
    pub chunk_index: usize,
    #[serde(default)]
    pub chunk_type: String,
}

/// One retrieval result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredChunk {
    pub chunk_id: String,
    pub content: String,
    pub file_id: String,
    pub filename: String,
    pub chunk_index: usize,
    /// Vector similarity in [0, 1]
    pub similarity: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rerank_score: Option<f32>,
    /// Raw engine distance, only when requested
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distance: Option<f32>,
}

/// Query-time overrides. Unset fields fall back to per-kb settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryOptions {
    #[serde(default)]
    pub top_k: Option<usize>,
    #[serde(default)]
    pub similarity_threshold: Option<f32>,
    #[serde(default)]
    pub use_reranker: Option<bool>,
    #[serde(default)]
    pub recall_top_k: Option<usize>,
    /// Only return chunks whose source filename contains this text
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub include_distances: Option<bool>,
}

impl QueryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = Some(top_k);
        self
    }

    pub fn with_similarity_threshold(mut self, threshold: f32) -> Self {
        self.similarity_threshold = Some(threshold);
        self
    }

    pub fn with_reranker(mut self, enabled: bool) -> Self {
        self.use_reranker = Some(enabled);
        self
    }

    pub fn with_recall_top_k(mut self, recall_top_k: usize) -> Self {
        self.recall_top_k = Some(recall_top_k);
        self
    }

    pub fn with_file_name(mut self, file_name: impl Into<String>) -> Self {
        self.file_name = Some(file_name.into());
        self
    }

    pub fn with_distances(mut self) -> Self {
        self.include_distances = Some(true);
        self
    }

    /// Fill unset fields from `fallback`.
    pub fn or(self, fallback: &QueryOptions) -> QueryOptions {
        QueryOptions {
            top_k: self.top_k.or(fallback.top_k),
            similarity_threshold: self.similarity_threshold.or(fallback.similarity_threshold),
            use_reranker: self.use_reranker.or(fallback.use_reranker),
            recall_top_k: self.recall_top_k.or(fallback.recall_top_k),
            file_name: self.file_name.or_else(|| fallback.file_name.clone()),
            include_distances: self.include_distances.or(fallback.include_distances),
        }
    }
}

/// Per-kb reranking configuration (`metadata.reranker_config`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RerankerSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub reranker: Option<RerankConfig>,
    #[serde(default)]
    pub recall_top_k: Option<usize>,
    #[serde(default)]
    pub final_top_k: Option<usize>,
}

/// Knowledge base record plus its files, as shown to callers.
#[derive(Debug, Clone, Serialize)]
pub struct DatabaseInfo {
    #[serde(flatten)]
    pub record: KnowledgeBaseRecord,
    /// Newest first
    pub files: Vec<FileRecord>,
    /// Vector rows in the collection, when the engine could be asked
    pub row_count: Option<usize>,
}

/// A file record with its stored chunks.
#[derive(Debug, Clone, Serialize)]
pub struct FileInfo {
    pub meta: FileRecord,
    /// Ordered by chunk index
    pub chunks: Vec<ChunkRow>,
}

/// Counts across every backend.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Statistics {
    pub total_databases: usize,
    pub databases_by_backend: std::collections::BTreeMap<String, usize>,
    pub total_files: usize,
    pub files_by_status: std::collections::BTreeMap<String, usize>,
}

/// Disagreements between metadata and vector storage.
#[derive(Debug, Clone, Default, Serialize)]
pub struct InconsistencyReport {
    /// Collections in an engine with no knowledge base record
    pub orphan_collections: Vec<(BackendType, String)>,
    /// Knowledge bases with finished files but no collection
    pub missing_collections: Vec<(BackendType, String)>,
    /// Knowledge bases known globally but absent from their backend metadata
    pub missing_records: Vec<String>,
}

/// Parse a JSON object into the `extra` map used for free-form kb metadata.
pub fn metadata_map(value: Value) -> AppResult<Map<String, Value>> {
    match value {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Map::new()),
        other => Err(AppError::Knowledge(format!(
            "Knowledge base metadata must be a JSON object, got {}",
            other
        ))),
    }
}
