//! Rerank clients.
//!
//! A reranker scores `(query, document)` pairs more accurately than vector
//! similarity. Scores are returned in document order and always lie in
//! `[0, 1]`; providers that answer with raw logits are squashed through a
//! sigmoid.

pub mod http;
pub mod mock;

pub use http::{HttpReranker, RerankApiStyle};
pub use mock::MockReranker;

use async_trait::async_trait;
use knowbase_core::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Trait for rerank providers.
#[async_trait]
pub trait Reranker: Send + Sync + std::fmt::Debug {
    /// Model identifier
    fn model_name(&self) -> &str;

    /// Score every document against the query.
    ///
    /// The result has one entry per document, in input order.
    async fn score(&self, query: &str, documents: &[String]) -> AppResult<Vec<f32>>;
}

/// Reranker description.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RerankConfig {
    /// "openai", "siliconflow", "vllm", "dashscope" or "mock"
    pub provider: String,

    pub model: String,

    /// Full rerank endpoint URL
    #[serde(default)]
    pub base_url: Option<String>,

    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Documents per request
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Optional task instruction (dashscope only)
    #[serde(default)]
    pub instruct: Option<String>,
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_batch_size() -> usize {
    32
}

impl RerankConfig {
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
            base_url: None,
            api_key: None,
            timeout_secs: default_timeout_secs(),
            batch_size: default_batch_size(),
            instruct: None,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }
}

/// Create a reranker from configuration.
pub fn create_reranker(config: &RerankConfig) -> AppResult<Arc<dyn Reranker>> {
    match config.provider.as_str() {
        "mock" => Ok(Arc::new(MockReranker::new(config.model.clone()))),
        "openai" | "siliconflow" | "vllm" => Ok(Arc::new(HttpReranker::new(
            config,
            RerankApiStyle::OpenAi,
        )?)),
        "dashscope" => Ok(Arc::new(HttpReranker::new(
            config,
            RerankApiStyle::DashScope,
        )?)),
        other => Err(AppError::Model(format!(
            "Unknown rerank provider: '{}'. Supported providers: mock, openai, siliconflow, vllm, dashscope",
            other
        ))),
    }
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Map scores into `[0, 1]`.
///
/// Scores already inside the unit interval are kept; if any score falls
/// outside it the whole set is treated as logits and passed through a
/// sigmoid, which preserves order.
pub fn normalize_scores(scores: Vec<f32>) -> Vec<f32> {
    if scores.iter().all(|s| (0.0..=1.0).contains(s)) {
        scores
    } else {
        scores.into_iter().map(sigmoid).collect()
    }
}
