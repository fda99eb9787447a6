//! Shared cache of embedding and rerank clients.
//!
//! Knowledge bases using the same model share one client.

use crate::types::EmbedInfo;
use knowbase_core::AppResult;
use knowbase_models::{create_provider, create_reranker, EmbeddingProvider, RerankConfig, Reranker};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

pub struct ModelCache {
    embed_timeout_secs: u64,
    embedders: RwLock<HashMap<String, Arc<dyn EmbeddingProvider>>>,
    rerankers: RwLock<HashMap<String, Arc<dyn Reranker>>>,
}

impl ModelCache {
    pub fn new(embed_timeout_secs: u64) -> Self {
        Self {
            embed_timeout_secs,
            embedders: RwLock::new(HashMap::new()),
            rerankers: RwLock::new(HashMap::new()),
        }
    }

    /// Embedding client for a knowledge base's model.
    pub fn embedder(&self, info: &EmbedInfo) -> AppResult<Arc<dyn EmbeddingProvider>> {
        let key = format!(
            "{}:{}:{}:{}",
            info.provider,
            info.model_tag(),
            info.base_url.as_deref().unwrap_or_default(),
            info.dimension
        );

        if let Some(provider) = self
            .embedders
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&key)
        {
            return Ok(Arc::clone(provider));
        }

        let config = info.to_embedding_config(self.embed_timeout_secs);
        config.validate()?;
        tracing::debug!(
            "Creating embedding provider: provider={}, model={}, dimensions={}",
            config.provider,
            config.model,
            config.dimensions
        );
        let provider = create_provider(&config)?;

        self.embedders
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key, Arc::clone(&provider));
        Ok(provider)
    }

    /// Rerank client for a configuration.
    pub fn reranker(&self, config: &RerankConfig) -> AppResult<Arc<dyn Reranker>> {
        let key = format!(
            "{}:{}:{}",
            config.provider,
            config.model,
            config.base_url.as_deref().unwrap_or_default()
        );

        if let Some(reranker) = self
            .rerankers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&key)
        {
            return Ok(Arc::clone(reranker));
        }

        let reranker = create_reranker(config)?;
        self.rerankers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key, Arc::clone(&reranker));
        Ok(reranker)
    }
}

impl Default for ModelCache {
    fn default() -> Self {
        Self::new(60)
    }
}
