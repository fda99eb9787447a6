//! Chroma backend policy.
//!
//! The embedding model is stored in collection metadata under
//! `embedding_model`; cosine distances become similarities as `1 - d`.

use super::BackendAdapter;
use crate::engine::{CollectionInfo, CollectionSpec, VectorEngine};
use crate::types::{BackendType, KnowledgeBaseRecord};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Map};
use std::sync::Arc;

pub const CHROMA_INSERT_BATCH: usize = 64;
pub const CHROMA_DEFAULT_THRESHOLD: f32 = 0.0;

/// Model tag assumed for collections created without one.
const UNTAGGED_MODEL: &str = "default";

pub struct ChromaBackend {
    engine: Arc<dyn VectorEngine>,
}

impl ChromaBackend {
    pub fn new(engine: Arc<dyn VectorEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl BackendAdapter for ChromaBackend {
    fn backend_type(&self) -> BackendType {
        BackendType::Chroma
    }

    fn engine(&self) -> &Arc<dyn VectorEngine> {
        &self.engine
    }

    fn default_similarity_threshold(&self) -> f32 {
        CHROMA_DEFAULT_THRESHOLD
    }

    fn insert_batch_size(&self) -> usize {
        CHROMA_INSERT_BATCH
    }

    fn collection_spec(&self, kb: &KnowledgeBaseRecord) -> CollectionSpec {
        let mut metadata = Map::new();
        metadata.insert("db_id".into(), json!(kb.id));
        metadata.insert("created_at".into(), json!(Utc::now().to_rfc3339()));

        CollectionSpec {
            name: self.collection_name(&kb.id),
            dimension: kb.embed_info.dimension,
            model_tag: kb.embed_info.model_tag().to_string(),
            description: String::new(),
            metadata,
        }
    }

    fn recorded_model(&self, info: &CollectionInfo, _expected: &str) -> Option<String> {
        Some(
            info.model_tag
                .clone()
                .unwrap_or_else(|| UNTAGGED_MODEL.to_string()),
        )
    }

    fn to_similarity(&self, raw_score: f32) -> f32 {
        (1.0 - raw_score).clamp(0.0, 1.0)
    }
}
