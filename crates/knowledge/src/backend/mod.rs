//! Backend adapters.
//!
//! An adapter binds one `VectorEngine` to the policy of a backend family:
//! how a collection records its embedding model, how raw engine scores map
//! to similarities, and the batch sizes and thresholds that family uses.
//! Collection lifecycle and chunk I/O are shared and live on the trait.

pub mod chroma;
pub mod ingest;
pub mod milvus;

pub use chroma::ChromaBackend;
pub use ingest::IngestPolicy;
pub use milvus::MilvusBackend;

use crate::chunk::Chunk;
use crate::engine::{CollectionInfo, CollectionSpec, RowFilter, VectorEngine};
use crate::types::{BackendType, ChunkRow, KnowledgeBaseRecord, ScoredChunk};
use async_trait::async_trait;
use knowbase_core::AppResult;
use knowbase_models::EmbeddingProvider;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Outcome of opening a collection for writing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollectionState {
    Created,
    Opened,
    /// Dropped and recreated because the embedding model changed
    Rebuilt { previous_model: Option<String> },
}

/// One backend family over one vector engine.
#[async_trait]
pub trait BackendAdapter: Send + Sync {
    fn backend_type(&self) -> BackendType;

    fn engine(&self) -> &Arc<dyn VectorEngine>;

    /// Threshold used when neither the caller nor the kb sets one.
    fn default_similarity_threshold(&self) -> f32;

    /// Rows per engine insert call.
    fn insert_batch_size(&self) -> usize;

    /// Collection parameters for a knowledge base.
    fn collection_spec(&self, kb: &KnowledgeBaseRecord) -> CollectionSpec;

    /// Model recorded on an existing collection, as far as it can be told.
    fn recorded_model(&self, info: &CollectionInfo, expected: &str) -> Option<String>;

    /// Map an engine score to a similarity in [0, 1].
    fn to_similarity(&self, raw_score: f32) -> f32;

    fn collection_name(&self, kb_id: &str) -> String {
        kb_id.to_string()
    }

    /// Open the kb's collection, creating it when absent and rebuilding it
    /// when it was built with another embedding model.
    async fn create_or_open_collection(
        &self,
        kb: &KnowledgeBaseRecord,
    ) -> AppResult<CollectionState> {
        let name = self.collection_name(&kb.id);
        let expected = kb.embed_info.model_tag();
        let engine = self.engine();

        let Some(info) = engine.describe_collection(&name).await? else {
            engine.create_collection(&self.collection_spec(kb)).await?;
            info!("Created {} collection '{}' for model '{}'", self.backend_type(), name, expected);
            return Ok(CollectionState::Created);
        };

        let recorded = self.recorded_model(&info, expected);
        if recorded.as_deref() == Some(expected) {
            return Ok(CollectionState::Opened);
        }

        warn!(
            "Collection '{}' was built with model {:?}, kb now uses '{}'; dropping and rebuilding. \
             Previously indexed files must be re-ingested",
            name, recorded, expected
        );
        engine.drop_collection(&name).await?;
        engine.create_collection(&self.collection_spec(kb)).await?;
        Ok(CollectionState::Rebuilt {
            previous_model: recorded,
        })
    }

    /// Whether the collection exists and matches the kb's model. Never
    /// creates or drops anything.
    async fn collection_ready(&self, kb: &KnowledgeBaseRecord) -> AppResult<bool> {
        let name = self.collection_name(&kb.id);
        let expected = kb.embed_info.model_tag();

        match self.engine().describe_collection(&name).await? {
            None => Ok(false),
            Some(info) => {
                let recorded = self.recorded_model(&info, expected);
                if recorded.as_deref() != Some(expected) {
                    warn!(
                        "Collection '{}' holds vectors from model {:?}, not '{}'; skipping search",
                        name, recorded, expected
                    );
                    return Ok(false);
                }
                Ok(true)
            }
        }
    }

    /// Embed and store a file's chunks. The collection must be open.
    async fn insert_chunks(
        &self,
        kb: &KnowledgeBaseRecord,
        chunks: &[Chunk],
        embedder: &dyn EmbeddingProvider,
        policy: &IngestPolicy,
        cancel: &CancellationToken,
    ) -> AppResult<usize> {
        ingest::insert_chunks(
            self.engine().as_ref(),
            &self.collection_name(&kb.id),
            chunks,
            embedder,
            self.insert_batch_size(),
            policy,
            cancel,
        )
        .await
    }

    /// Nearest chunks with similarities, best first.
    async fn search(
        &self,
        kb: &KnowledgeBaseRecord,
        vector: &[f32],
        limit: usize,
        filter: Option<&RowFilter>,
    ) -> AppResult<Vec<ScoredChunk>> {
        let hits = self
            .engine()
            .search(&self.collection_name(&kb.id), vector, limit, filter)
            .await?;

        let mut results: Vec<ScoredChunk> = hits
            .into_iter()
            .map(|hit| ScoredChunk {
                chunk_id: hit.row.id,
                content: hit.row.content,
                file_id: hit.row.file_id,
                filename: hit.row.source,
                chunk_index: hit.row.chunk_index,
                similarity: self.to_similarity(hit.raw_score),
                rerank_score: None,
                distance: Some(hit.raw_score),
            })
            .collect();
        results.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(results)
    }

    async fn delete_file_chunks(&self, kb_id: &str, file_id: &str) -> AppResult<usize> {
        let name = self.collection_name(kb_id);
        if !self.engine().has_collection(&name).await? {
            return Ok(0);
        }
        self.engine()
            .delete(&name, &RowFilter::FileId(file_id.to_string()))
            .await
    }

    /// A file's stored chunks ordered by chunk index.
    async fn file_chunks(&self, kb_id: &str, file_id: &str) -> AppResult<Vec<ChunkRow>> {
        let name = self.collection_name(kb_id);
        if !self.engine().has_collection(&name).await? {
            return Ok(Vec::new());
        }
        let mut rows = self
            .engine()
            .query(&name, &RowFilter::FileId(file_id.to_string()))
            .await?;
        rows.sort_by_key(|r| r.chunk_index);
        Ok(rows)
    }

    /// Destroy every vector of the kb. Succeeds when already gone.
    async fn delete_collection(&self, kb_id: &str) -> AppResult<()> {
        let name = self.collection_name(kb_id);
        if self.engine().has_collection(&name).await? {
            self.engine().drop_collection(&name).await?;
            info!("Dropped {} collection '{}'", self.backend_type(), name);
        }
        Ok(())
    }

    async fn row_count(&self, kb_id: &str) -> AppResult<Option<usize>> {
        let name = self.collection_name(kb_id);
        if !self.engine().has_collection(&name).await? {
            return Ok(None);
        }
        Ok(Some(self.engine().count(&name).await?))
    }

    async fn list_collections(&self) -> AppResult<Vec<String>> {
        self.engine().list_collections().await
    }
}
