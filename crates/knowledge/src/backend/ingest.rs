//! Embedding and insertion of a file's chunks.

use crate::chunk::Chunk;
use crate::engine::{VectorEngine, VectorRow};
use crate::types::ChunkRow;
use futures::stream::{self, StreamExt, TryStreamExt};
use knowbase_core::{AppError, AppResult};
use knowbase_models::EmbeddingProvider;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Limits applied while embedding one file.
#[derive(Debug, Clone, Copy)]
pub struct IngestPolicy {
    /// Embedding batches in flight at once
    pub concurrency: usize,
    /// Deadline for a single embedding batch
    pub batch_timeout: Duration,
}

impl Default for IngestPolicy {
    fn default() -> Self {
        Self {
            concurrency: 4,
            batch_timeout: Duration::from_secs(60),
        }
    }
}

/// Embed `texts` in provider-sized batches, several at a time, and return
/// the vectors in input order.
pub async fn embed_in_batches(
    embedder: &dyn EmbeddingProvider,
    texts: &[String],
    policy: &IngestPolicy,
    cancel: &CancellationToken,
) -> AppResult<Vec<Vec<f32>>> {
    let batch_size = embedder.max_batch_size().max(1);
    let calls: Vec<_> = texts
        .chunks(batch_size)
        .map(|batch| embed_one(embedder, batch.to_vec(), policy.batch_timeout, cancel))
        .collect();

    let batches: Vec<Vec<Vec<f32>>> = stream::iter(calls)
        .buffered(policy.concurrency.max(1))
        .try_collect()
        .await?;

    let vectors: Vec<Vec<f32>> = batches.into_iter().flatten().collect();
    if vectors.len() != texts.len() {
        return Err(AppError::Model(format!(
            "Embedding provider returned {} vectors for {} texts",
            vectors.len(),
            texts.len()
        )));
    }
    Ok(vectors)
}

async fn embed_one(
    embedder: &dyn EmbeddingProvider,
    batch: Vec<String>,
    timeout: Duration,
    cancel: &CancellationToken,
) -> AppResult<Vec<Vec<f32>>> {
    if cancel.is_cancelled() {
        return Err(AppError::Cancelled("Embedding cancelled".to_string()));
    }
    tokio::time::timeout(timeout, embedder.embed_batch(&batch))
        .await
        .map_err(|_| {
            AppError::Model(format!(
                "Embedding batch of {} texts timed out after {}s",
                batch.len(),
                timeout.as_secs()
            ))
        })?
}

/// Embed chunks and insert them into `collection`, `insert_batch` rows at a time.
pub async fn insert_chunks(
    engine: &dyn VectorEngine,
    collection: &str,
    chunks: &[Chunk],
    embedder: &dyn EmbeddingProvider,
    insert_batch: usize,
    policy: &IngestPolicy,
    cancel: &CancellationToken,
) -> AppResult<usize> {
    if chunks.is_empty() {
        return Ok(0);
    }

    let texts: Vec<String> = chunks.iter().map(|c| c.content.clone()).collect();
    let vectors = embed_in_batches(embedder, &texts, policy, cancel).await?;

    let rows: Vec<VectorRow> = chunks
        .iter()
        .zip(vectors)
        .map(|(chunk, vector)| VectorRow {
            row: ChunkRow {
                id: chunk.chunk_id.clone(),
                content: chunk.content.clone(),
                source: chunk.source.clone(),
                file_id: chunk.file_id.clone(),
                chunk_index: chunk.chunk_index,
                chunk_type: chunk.chunk_type.as_str().to_string(),
            },
            vector,
        })
        .collect();

    let mut inserted = 0;
    let mut rows = rows.into_iter().peekable();
    while rows.peek().is_some() {
        if cancel.is_cancelled() {
            return Err(AppError::Cancelled(format!(
                "Insertion into '{}' cancelled after {} rows",
                collection, inserted
            )));
        }
        let batch: Vec<VectorRow> = rows.by_ref().take(insert_batch.max(1)).collect();
        let len = batch.len();
        engine.insert(collection, batch).await?;
        inserted += len;
        debug!("Inserted {}/{} chunks into '{}'", inserted, chunks.len(), collection);
    }

    Ok(inserted)
}
