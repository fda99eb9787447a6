//! Embedding configuration types.

use knowbase_core::{AppError, AppResult};
use serde::{Deserialize, Serialize};

/// Embedding model description resolved for one knowledge base.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EmbeddingConfig {
    /// Provider name: "mock", "ollama", "openai"
    pub provider: String,

    /// Model identifier (provider-specific)
    pub model: String,

    /// Embedding vector dimensions
    pub dimensions: usize,

    /// Endpoint; providers fall back to their own default when unset
    #[serde(default)]
    pub base_url: Option<String>,

    /// Resolved API key
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,

    /// Maximum batch size for embedding requests
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Per-request timeout
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_batch_size() -> usize {
    64
}

fn default_timeout_secs() -> u64 {
    60
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "mock".to_string(),
            model: "trigram-v1".to_string(),
            dimensions: 384,
            base_url: None,
            api_key: None,
            batch_size: default_batch_size(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl EmbeddingConfig {
    /// Check the fields every provider relies on.
    pub fn validate(&self) -> AppResult<()> {
        if self.model.trim().is_empty() {
            return Err(AppError::Model("Embedding model name is empty".to_string()));
        }
        if self.dimensions == 0 {
            return Err(AppError::Model(format!(
                "Embedding model '{}' has zero dimensions",
                self.model
            )));
        }
        if self.batch_size == 0 {
            return Err(AppError::Model("Embedding batch_size must be > 0".to_string()));
        }
        Ok(())
    }
}
