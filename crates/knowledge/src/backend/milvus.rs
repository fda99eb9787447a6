//! Milvus backend policy.
//!
//! Milvus collections carry no free-form metadata, so the embedding model is
//! written into the collection description and matched by containment.

use super::BackendAdapter;
use crate::engine::{CollectionInfo, CollectionSpec, VectorEngine};
use crate::types::{BackendType, KnowledgeBaseRecord};
use async_trait::async_trait;
use serde_json::Map;
use std::sync::Arc;

pub const MILVUS_INSERT_BATCH: usize = 40;
pub const MILVUS_DEFAULT_THRESHOLD: f32 = 0.2;

const DESCRIPTION_MODEL_MARKER: &str = " using ";

pub struct MilvusBackend {
    engine: Arc<dyn VectorEngine>,
    metric_type: String,
}

impl MilvusBackend {
    pub fn new(engine: Arc<dyn VectorEngine>) -> Self {
        Self {
            engine,
            metric_type: "COSINE".to_string(),
        }
    }

    /// Metric of the collections this backend searches; decides score mapping.
    pub fn with_metric_type(mut self, metric_type: impl Into<String>) -> Self {
        self.metric_type = metric_type.into();
        self
    }

    fn description_for(kb_id: &str, model: &str) -> String {
        format!(
            "Knowledge base collection for {}{}{}",
            kb_id, DESCRIPTION_MODEL_MARKER, model
        )
    }
}

#[async_trait]
impl BackendAdapter for MilvusBackend {
    fn backend_type(&self) -> BackendType {
        BackendType::Milvus
    }

    fn engine(&self) -> &Arc<dyn VectorEngine> {
        &self.engine
    }

    fn default_similarity_threshold(&self) -> f32 {
        MILVUS_DEFAULT_THRESHOLD
    }

    fn insert_batch_size(&self) -> usize {
        MILVUS_INSERT_BATCH
    }

    fn collection_spec(&self, kb: &KnowledgeBaseRecord) -> CollectionSpec {
        let model = kb.embed_info.model_tag();
        CollectionSpec {
            name: self.collection_name(&kb.id),
            dimension: kb.embed_info.dimension,
            model_tag: model.to_string(),
            description: Self::description_for(&kb.id, model),
            metadata: Map::new(),
        }
    }

    fn recorded_model(&self, info: &CollectionInfo, expected: &str) -> Option<String> {
        let description = info.description.as_deref()?;
        if description.contains(expected) {
            return Some(expected.to_string());
        }
        description
            .rsplit_once(DESCRIPTION_MODEL_MARKER)
            .map(|(_, model)| model.trim().to_string())
    }

    fn to_similarity(&self, raw_score: f32) -> f32 {
        if self.metric_type.eq_ignore_ascii_case("COSINE") {
            raw_score.clamp(0.0, 1.0)
        } else {
            1.0 / (1.0 + raw_score.max(0.0))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::CollectionState;
    use crate::engine::MemoryEngine;
    use crate::tests::kb_record;

    #[test]
    fn test_description_carries_model() {
        let backend = MilvusBackend::new(Arc::new(MemoryEngine::with_similarities()));
        let kb = kb_record("kb_m", BackendType::Milvus, "bge-m3");
        let spec = backend.collection_spec(&kb);
        assert_eq!(
            spec.description,
            "Knowledge base collection for kb_m using bge-m3"
        );
    }

    #[test]
    fn test_recorded_model_from_description() {
        let backend = MilvusBackend::new(Arc::new(MemoryEngine::with_similarities()));
        let info = CollectionInfo {
            name: "kb_m".into(),
            description: Some("Knowledge base collection for kb_m using old-model".into()),
            ..Default::default()
        };
        assert_eq!(
            backend.recorded_model(&info, "bge-m3").as_deref(),
            Some("old-model")
        );
        assert_eq!(
            backend.recorded_model(&info, "old-model").as_deref(),
            Some("old-model")
        );

        let bare = CollectionInfo {
            name: "kb_m".into(),
            ..Default::default()
        };
        assert_eq!(backend.recorded_model(&bare, "bge-m3"), None);
    }

    #[test]
    fn test_score_mapping_by_metric() {
        let cosine = MilvusBackend::new(Arc::new(MemoryEngine::with_similarities()));
        assert!((cosine.to_similarity(0.83) - 0.83).abs() < 1e-6);

        let l2 = MilvusBackend::new(Arc::new(MemoryEngine::with_similarities()))
            .with_metric_type("L2");
        assert!((l2.to_similarity(1.0) - 0.5).abs() < 1e-6);
        assert_eq!(l2.to_similarity(0.0), 1.0);
    }

    #[tokio::test]
    async fn test_rebuild_on_model_change() {
        let engine = Arc::new(MemoryEngine::with_similarities());
        let backend = MilvusBackend::new(engine.clone());
        let mut kb = kb_record("kb_m", BackendType::Milvus, "model-a");

        backend.create_or_open_collection(&kb).await.unwrap();
        kb.embed_info.name = "model-b".into();

        assert!(matches!(
            backend.create_or_open_collection(&kb).await.unwrap(),
            CollectionState::Rebuilt { .. }
        ));
        let info = engine.describe_collection("kb_m").await.unwrap().unwrap();
        assert!(info.description.unwrap().ends_with("model-b"));
    }
}
