//! In-process vector engine.
//!
//! Brute-force cosine search over `HashMap`-backed collections. Used for
//! tests and for running without a vector server.

use super::{CollectionInfo, CollectionSpec, RowFilter, SearchHit, VectorEngine, VectorRow};
use crate::types::ChunkRow;
use async_trait::async_trait;
use knowbase_core::{AppError, AppResult};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// How the engine reports scores.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScoreConvention {
    /// Cosine distance, `1 - cos`, lower is better
    Distance,
    /// Cosine similarity, higher is better
    Similarity,
}

struct MemoryCollection {
    info: CollectionInfo,
    rows: Vec<VectorRow>,
}

/// In-memory engine.
#[derive(Clone)]
pub struct MemoryEngine {
    convention: ScoreConvention,
    collections: Arc<RwLock<HashMap<String, MemoryCollection>>>,
}

impl MemoryEngine {
    pub fn new(convention: ScoreConvention) -> Self {
        Self {
            convention,
            collections: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Scores like a Chroma cosine collection.
    pub fn with_distances() -> Self {
        Self::new(ScoreConvention::Distance)
    }

    /// Scores like a Milvus COSINE collection.
    pub fn with_similarities() -> Self {
        Self::new(ScoreConvention::Similarity)
    }

    fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
        if a.len() != b.len() {
            return 0.0;
        }

        let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
        let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

        if norm_a == 0.0 || norm_b == 0.0 {
            return 0.0;
        }

        dot / (norm_a * norm_b)
    }

    fn missing(name: &str) -> AppError {
        AppError::BackendUnavailable(format!("Collection '{}' does not exist", name))
    }
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::with_distances()
    }
}

#[async_trait]
impl VectorEngine for MemoryEngine {
    fn engine_name(&self) -> &str {
        "memory"
    }

    async fn has_collection(&self, name: &str) -> AppResult<bool> {
        Ok(self.collections.read().await.contains_key(name))
    }

    async fn create_collection(&self, spec: &CollectionSpec) -> AppResult<()> {
        let mut collections = self.collections.write().await;
        if collections.contains_key(&spec.name) {
            return Err(AppError::Knowledge(format!(
                "Collection '{}' already exists",
                spec.name
            )));
        }

        let metric = match self.convention {
            ScoreConvention::Distance => "cosine_distance",
            ScoreConvention::Similarity => "COSINE",
        };
        collections.insert(
            spec.name.clone(),
            MemoryCollection {
                info: CollectionInfo {
                    name: spec.name.clone(),
                    model_tag: Some(spec.model_tag.clone()),
                    description: Some(spec.description.clone()),
                    metric: Some(metric.to_string()),
                    dimension: Some(spec.dimension),
                },
                rows: Vec::new(),
            },
        );
        debug!("Created memory collection '{}'", spec.name);
        Ok(())
    }

    async fn describe_collection(&self, name: &str) -> AppResult<Option<CollectionInfo>> {
        Ok(self
            .collections
            .read()
            .await
            .get(name)
            .map(|c| c.info.clone()))
    }

    async fn drop_collection(&self, name: &str) -> AppResult<()> {
        self.collections.write().await.remove(name);
        debug!("Dropped memory collection '{}'", name);
        Ok(())
    }

    async fn list_collections(&self) -> AppResult<Vec<String>> {
        let mut names: Vec<String> = self.collections.read().await.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn insert(&self, name: &str, rows: Vec<VectorRow>) -> AppResult<()> {
        let mut collections = self.collections.write().await;
        let collection = collections.get_mut(name).ok_or_else(|| Self::missing(name))?;

        if let Some(dim) = collection.info.dimension {
            if let Some(bad) = rows.iter().find(|r| r.vector.len() != dim) {
                return Err(AppError::Knowledge(format!(
                    "Vector for '{}' has dimension {}, collection expects {}",
                    bad.row.id,
                    bad.vector.len(),
                    dim
                )));
            }
        }

        let count = rows.len();
        for row in rows {
            collection.rows.retain(|r| r.row.id != row.row.id);
            collection.rows.push(row);
        }
        debug!("Inserted {} rows into '{}'", count, name);
        Ok(())
    }

    async fn search(
        &self,
        name: &str,
        vector: &[f32],
        limit: usize,
        filter: Option<&RowFilter>,
    ) -> AppResult<Vec<SearchHit>> {
        let collections = self.collections.read().await;
        let collection = collections.get(name).ok_or_else(|| Self::missing(name))?;

        let mut scored: Vec<(f32, &VectorRow)> = collection
            .rows
            .iter()
            .filter(|r| filter.map_or(true, |f| f.matches(&r.row)))
            .map(|r| (Self::cosine_similarity(vector, &r.vector), r))
            .collect();

        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

        Ok(scored
            .into_iter()
            .take(limit)
            .map(|(similarity, r)| SearchHit {
                row: r.row.clone(),
                raw_score: match self.convention {
                    ScoreConvention::Distance => 1.0 - similarity,
                    ScoreConvention::Similarity => similarity,
                },
            })
            .collect())
    }

    async fn query(&self, name: &str, filter: &RowFilter) -> AppResult<Vec<ChunkRow>> {
        let collections = self.collections.read().await;
        let collection = collections.get(name).ok_or_else(|| Self::missing(name))?;

        Ok(collection
            .rows
            .iter()
            .filter(|r| filter.matches(&r.row))
            .map(|r| r.row.clone())
            .collect())
    }

    async fn delete(&self, name: &str, filter: &RowFilter) -> AppResult<usize> {
        let mut collections = self.collections.write().await;
        let Some(collection) = collections.get_mut(name) else {
            return Ok(0);
        };

        let before = collection.rows.len();
        collection.rows.retain(|r| !filter.matches(&r.row));
        let deleted = before - collection.rows.len();
        debug!("Deleted {} rows from '{}'", deleted, name);
        Ok(deleted)
    }

    async fn count(&self, name: &str) -> AppResult<usize> {
        let collections = self.collections.read().await;
        let collection = collections.get(name).ok_or_else(|| Self::missing(name))?;
        Ok(collection.rows.len())
    }
}
