//! Embedding providers.
//!
//! Every knowledge base names its embedding model in its `embed_info`; the
//! factory here turns that description into a live provider.

pub mod config;
pub mod providers;

pub use config::EmbeddingConfig;

use knowbase_core::{AppError, AppResult};
use std::sync::Arc;

/// Trait for embedding providers.
#[async_trait::async_trait]
pub trait EmbeddingProvider: Send + Sync + std::fmt::Debug {
    /// Get provider name (e.g., "mock", "openai", "ollama")
    fn provider_name(&self) -> &str;

    /// Get model identifier
    fn model_name(&self) -> &str;

    /// Get embedding dimensions
    fn dimensions(&self) -> usize;

    /// Largest number of texts accepted by one `embed_batch` call.
    fn max_batch_size(&self) -> usize;

    /// Generate embeddings for multiple texts in a batch.
    ///
    /// Output order matches input order.
    async fn embed_batch(&self, texts: &[String]) -> AppResult<Vec<Vec<f32>>>;

    /// Generate embedding for a single text (convenience method).
    async fn embed(&self, text: &str) -> AppResult<Vec<f32>> {
        let mut results = self.embed_batch(&[text.to_string()]).await?;
        results
            .pop()
            .ok_or_else(|| AppError::Model("No embedding returned".to_string()))
    }
}

/// Create an embedding provider based on configuration.
pub fn create_provider(config: &EmbeddingConfig) -> AppResult<Arc<dyn EmbeddingProvider>> {
    config.validate()?;

    match config.provider.as_str() {
        "mock" => Ok(Arc::new(providers::MockProvider::new(
            config.model.clone(),
            config.dimensions,
        ))),
        "ollama" => Ok(Arc::new(providers::OllamaProvider::new(config)?)),
        "openai" => Ok(Arc::new(providers::OpenAiProvider::new(config)?)),
        _ => Err(AppError::Model(format!(
            "Unknown embedding provider: '{}'. Supported providers: mock, ollama, openai",
            config.provider
        ))),
    }
}

/// Reject vectors whose length differs from the configured dimension.
pub(crate) fn validate_dimensions(
    model: &str,
    expected: usize,
    embeddings: &[Vec<f32>],
) -> AppResult<()> {
    if let Some(mismatch) = embeddings.iter().find(|v| v.len() != expected) {
        return Err(AppError::Model(format!(
            "Embedding dimension mismatch for model '{}': expected {}, got {}",
            model,
            expected,
            mismatch.len()
        )));
    }
    Ok(())
}
