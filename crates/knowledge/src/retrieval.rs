//! Recall, threshold, rerank, truncate.
//!
//! Settings resolve call-site options first, then the kb's stored
//! `query_params`, then its `reranker_config`, then built-in defaults.

use crate::backend::BackendAdapter;
use crate::engine::RowFilter;
use crate::types::{KnowledgeBaseRecord, QueryOptions, ScoredChunk};
use knowbase_core::AppResult;
use knowbase_models::{EmbeddingProvider, Reranker};
use tracing::{debug, warn};

pub const DEFAULT_TOP_K: usize = 10;
pub const DEFAULT_RECALL_TOP_K: usize = 50;

/// Fully resolved retrieval settings for one query.
#[derive(Debug, Clone, PartialEq)]
pub struct RetrievalPlan {
    pub top_k: usize,
    pub recall_top_k: usize,
    pub similarity_threshold: f32,
    pub use_reranker: bool,
    pub file_name: Option<String>,
    pub include_distances: bool,
}

impl RetrievalPlan {
    /// Resolve call-site options against a kb's stored settings.
    ///
    /// Reranking is only planned when a reranker is actually available.
    pub fn resolve(
        call: &QueryOptions,
        kb: &KnowledgeBaseRecord,
        default_threshold: f32,
        reranker_available: bool,
    ) -> Self {
        let options = call.clone().or(&kb.stored_query_options());
        let rerank_settings = kb.reranker_settings();

        let use_reranker =
            options.use_reranker.unwrap_or(rerank_settings.enabled) && reranker_available;

        let top_k = options
            .top_k
            .or(if use_reranker {
                rerank_settings.final_top_k
            } else {
                None
            })
            .unwrap_or(DEFAULT_TOP_K)
            .max(1);

        let recall_top_k = if use_reranker {
            options
                .recall_top_k
                .or(rerank_settings.recall_top_k)
                .unwrap_or(DEFAULT_RECALL_TOP_K)
                .max(top_k)
        } else {
            top_k
        };

        Self {
            top_k,
            recall_top_k,
            similarity_threshold: options.similarity_threshold.unwrap_or(default_threshold),
            use_reranker,
            file_name: options.file_name.filter(|n| !n.is_empty()),
            include_distances: options.include_distances.unwrap_or(false),
        }
    }
}

/// Keep candidates whose similarity reaches `threshold`.
pub fn apply_threshold(candidates: Vec<ScoredChunk>, threshold: f32) -> Vec<ScoredChunk> {
    candidates
        .into_iter()
        .filter(|c| c.similarity >= threshold)
        .collect()
}

/// Attach rerank scores and order by them, best first.
pub fn apply_rerank(mut candidates: Vec<ScoredChunk>, scores: &[f32]) -> Vec<ScoredChunk> {
    for (candidate, score) in candidates.iter_mut().zip(scores) {
        candidate.rerank_score = Some(*score);
    }
    candidates.sort_by(|a, b| {
        b.rerank_score
            .unwrap_or_default()
            .partial_cmp(&a.rerank_score.unwrap_or_default())
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    candidates
}

/// Run a query against one knowledge base.
///
/// Backend failures are logged and yield an empty result so a query that
/// fans out over several knowledge bases keeps going. Embedding failures
/// are returned.
pub async fn retrieve(
    adapter: &dyn BackendAdapter,
    kb: &KnowledgeBaseRecord,
    embedder: &dyn EmbeddingProvider,
    reranker: Option<&dyn Reranker>,
    query: &str,
    plan: &RetrievalPlan,
) -> AppResult<Vec<ScoredChunk>> {
    match adapter.collection_ready(kb).await {
        Ok(true) => {}
        Ok(false) => {
            debug!("No usable collection for '{}', returning no results", kb.id);
            return Ok(Vec::new());
        }
        Err(e) => {
            warn!("Backend unavailable while querying '{}': {}", kb.id, e);
            return Ok(Vec::new());
        }
    }

    let vector = embedder.embed(query).await?;
    let filter = plan
        .file_name
        .as_ref()
        .map(|name| RowFilter::SourceContains(name.clone()));

    let recalled = match adapter
        .search(kb, &vector, plan.recall_top_k, filter.as_ref())
        .await
    {
        Ok(hits) => hits,
        Err(e) => {
            warn!("Search failed for '{}': {}", kb.id, e);
            return Ok(Vec::new());
        }
    };
    let recalled_count = recalled.len();

    let mut candidates = apply_threshold(recalled, plan.similarity_threshold);
    debug!(
        "Recalled {} chunks from '{}', {} above threshold {:.2}",
        recalled_count,
        kb.id,
        candidates.len(),
        plan.similarity_threshold
    );

    if let (true, Some(reranker)) = (plan.use_reranker, reranker) {
        if !candidates.is_empty() {
            let texts: Vec<String> = candidates.iter().map(|c| c.content.clone()).collect();
            match reranker.score(query, &texts).await {
                Ok(scores) if scores.len() == texts.len() => {
                    candidates = apply_rerank(candidates, &scores);
                }
                Ok(scores) => warn!(
                    "Reranker returned {} scores for {} candidates; keeping vector order",
                    scores.len(),
                    texts.len()
                ),
                Err(e) => warn!("Reranking failed, keeping vector order: {}", e),
            }
        }
    }

    candidates.truncate(plan.top_k);
    if !plan.include_distances {
        for candidate in &mut candidates {
            candidate.distance = None;
        }
    }

    Ok(candidates)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{ChromaBackend, IngestPolicy};
    use crate::chunk::{ChunkConfig, ChunkingEngine};
    use crate::engine::MemoryEngine;
    use crate::tests::kb_record;
    use crate::types::{metadata_map, BackendType};
    use async_trait::async_trait;
    use knowbase_core::AppError;
    use knowbase_models::embeddings::providers::MockProvider;
    use knowbase_models::rerank::MockReranker;
    use serde_json::json;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    #[derive(Debug)]
    struct DownReranker;

    #[async_trait]
    impl Reranker for DownReranker {
        fn model_name(&self) -> &str {
            "down"
        }
        async fn score(&self, _query: &str, _documents: &[String]) -> AppResult<Vec<f32>> {
            Err(AppError::Model("connection refused".into()))
        }
    }

    const FACTS: [&str; 8] = [
        "The capital of France is Paris.",
        "Berlin is the capital of Germany.",
        "Madrid is the capital city of Spain.",
        "Rome has been the capital of Italy since 1871.",
        "Bananas are rich in potassium.",
        "The Pacific is the largest ocean.",
        "Paris hosts the Louvre museum in France.",
        "Lisbon is the capital of Portugal.",
    ];

    async fn indexed_kb() -> (ChromaBackend, KnowledgeBaseRecord, MockProvider) {
        let backend = ChromaBackend::new(Arc::new(MemoryEngine::with_distances()));
        let kb = kb_record("kb_r", BackendType::Chroma, "trigram-v1");
        let embedder = MockProvider::new("trigram-v1", 8);
        backend.create_or_open_collection(&kb).await.unwrap();

        let chunker = ChunkingEngine::new(ChunkConfig::default());
        for (i, fact) in FACTS.iter().enumerate() {
            let chunks = chunker
                .process(&format!("file_{}", i), &format!("fact{}.md", i), fact)
                .unwrap();
            backend
                .insert_chunks(
                    &kb,
                    &chunks,
                    &embedder,
                    &IngestPolicy::default(),
                    &CancellationToken::new(),
                )
                .await
                .unwrap();
        }
        (backend, kb, embedder)
    }

    #[test]
    fn test_plan_precedence() {
        let mut kb = kb_record("kb_p", BackendType::Chroma, "m");
        kb.metadata = metadata_map(json!({
            "reranker_config": {"enabled": true, "recall_top_k": 20, "final_top_k": 4},
            "query_params": {"options": {"similarity_threshold": 0.3}}
        }))
        .unwrap();

        let plan = RetrievalPlan::resolve(&QueryOptions::new(), &kb, 0.0, true);
        assert!(plan.use_reranker);
        assert_eq!(plan.top_k, 4);
        assert_eq!(plan.recall_top_k, 20);
        assert!((plan.similarity_threshold - 0.3).abs() < 1e-6);

        let call = QueryOptions::new()
            .with_top_k(30)
            .with_similarity_threshold(0.1);
        let plan = RetrievalPlan::resolve(&call, &kb, 0.0, true);
        assert_eq!(plan.top_k, 30);
        // Recall never smaller than the final size
        assert_eq!(plan.recall_top_k, 30);
        assert!((plan.similarity_threshold - 0.1).abs() < 1e-6);

        let plan = RetrievalPlan::resolve(&QueryOptions::new(), &kb, 0.0, false);
        assert!(!plan.use_reranker);
        assert_eq!(plan.top_k, DEFAULT_TOP_K);
        assert_eq!(plan.recall_top_k, plan.top_k);
    }

    #[test]
    fn test_plan_defaults() {
        let kb = kb_record("kb_p", BackendType::Milvus, "m");
        let plan = RetrievalPlan::resolve(&QueryOptions::new().with_reranker(true), &kb, 0.2, true);
        assert_eq!(plan.top_k, DEFAULT_TOP_K);
        assert_eq!(plan.recall_top_k, DEFAULT_RECALL_TOP_K);
        assert!((plan.similarity_threshold - 0.2).abs() < 1e-6);
        assert!(!plan.include_distances);
    }

    #[tokio::test]
    async fn test_threshold_monotonic() {
        let (backend, kb, embedder) = indexed_kb().await;

        let mut previous = usize::MAX;
        for threshold in [0.0, 0.1, 0.2, 0.3, 0.5, 0.7, 0.9, 1.0] {
            let plan = RetrievalPlan::resolve(
                &QueryOptions::new()
                    .with_top_k(FACTS.len())
                    .with_similarity_threshold(threshold),
                &kb,
                0.0,
                false,
            );
            let results = retrieve(&backend, &kb, &embedder, None, "capital of France", &plan)
                .await
                .unwrap();
            assert!(results.len() <= previous);
            assert!(results.iter().all(|r| r.similarity >= threshold));
            previous = results.len();
        }
    }

    #[tokio::test]
    async fn test_rerank_returns_ordered_subset_of_recall() {
        let (backend, kb, embedder) = indexed_kb().await;
        let query = "capital of France Paris";

        let recall_plan = RetrievalPlan::resolve(
            &QueryOptions::new().with_top_k(6),
            &kb,
            0.0,
            false,
        );
        let recalled = retrieve(&backend, &kb, &embedder, None, query, &recall_plan)
            .await
            .unwrap();
        let recalled_ids: Vec<&str> = recalled.iter().map(|r| r.chunk_id.as_str()).collect();

        let reranker = MockReranker::new("overlap");
        let plan = RetrievalPlan::resolve(
            &QueryOptions::new()
                .with_top_k(5)
                .with_reranker(true)
                .with_recall_top_k(6),
            &kb,
            0.0,
            true,
        );
        let results = retrieve(&backend, &kb, &embedder, Some(&reranker), query, &plan)
            .await
            .unwrap();

        assert_eq!(results.len(), 5);
        assert!(results
            .iter()
            .all(|r| recalled_ids.contains(&r.chunk_id.as_str())));
        let scores: Vec<f32> = results.iter().map(|r| r.rerank_score.unwrap()).collect();
        assert!(scores.windows(2).all(|w| w[0] >= w[1]));
    }

    #[tokio::test]
    async fn test_rerank_failure_falls_back_to_vector_order() {
        let (backend, kb, embedder) = indexed_kb().await;
        let plan = RetrievalPlan::resolve(
            &QueryOptions::new().with_top_k(3).with_reranker(true),
            &kb,
            0.0,
            true,
        );

        let results = retrieve(
            &backend,
            &kb,
            &embedder,
            Some(&DownReranker),
            "capital of France",
            &plan,
        )
        .await
        .unwrap();

        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|r| r.rerank_score.is_none()));
        assert!(results
            .windows(2)
            .all(|w| w[0].similarity >= w[1].similarity));
    }

    #[tokio::test]
    async fn test_file_name_filter_and_distances() {
        let (backend, kb, embedder) = indexed_kb().await;
        let plan = RetrievalPlan::resolve(
            &QueryOptions::new()
                .with_file_name("fact0")
                .with_distances(),
            &kb,
            0.0,
            false,
        );

        let results = retrieve(&backend, &kb, &embedder, None, "capital", &plan)
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].file_id, "file_0");
        assert!(results[0].distance.is_some());
    }

    #[tokio::test]
    async fn test_missing_collection_is_empty() {
        let backend = ChromaBackend::new(Arc::new(MemoryEngine::with_distances()));
        let kb = kb_record("kb_none", BackendType::Chroma, "trigram-v1");
        let embedder = MockProvider::new("trigram-v1", 8);
        let plan = RetrievalPlan::resolve(&QueryOptions::new(), &kb, 0.0, false);

        let results = retrieve(&backend, &kb, &embedder, None, "anything", &plan)
            .await
            .unwrap();
        assert!(results.is_empty());
    }
}
