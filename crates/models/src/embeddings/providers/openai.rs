//! OpenAI-compatible embedding provider.
//!
//! Works with any service exposing `POST .../embeddings` with
//! `{model, input}` requests and `{data: [{index, embedding}]}` replies
//! (OpenAI, SiliconFlow, vLLM, LM Studio and similar gateways).

use crate::embeddings::{validate_dimensions, EmbeddingConfig, EmbeddingProvider};
use async_trait::async_trait;
use knowbase_core::{AppError, AppResult};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, instrument};
use url::Url;

#[derive(Debug, Clone)]
pub struct OpenAiProvider {
    client: Client,
    endpoint: Url,
    api_key: Option<String>,
    model: String,
    dimensions: usize,
    batch_size: usize,
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingItem>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingItem {
    #[serde(default)]
    index: usize,
    embedding: Vec<f32>,
}

impl OpenAiProvider {
    pub fn new(config: &EmbeddingConfig) -> AppResult<Self> {
        let base_url = config.base_url.as_deref().ok_or_else(|| {
            AppError::Model(format!(
                "Embedding model '{}' needs a base_url for the openai provider",
                config.model
            ))
        })?;

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| AppError::Model(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: embeddings_endpoint(base_url)?,
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            dimensions: config.dimensions,
            batch_size: config.batch_size,
        })
    }

    #[instrument(skip(self, texts), fields(batch = texts.len(), model = %self.model))]
    async fn embed_once(&self, texts: &[String]) -> AppResult<Vec<Vec<f32>>> {
        let mut request = self.client.post(self.endpoint.clone()).json(&EmbeddingRequest {
            model: &self.model,
            input: texts,
        });
        if let Some(ref key) = self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| AppError::Model(format!("Embedding request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::Model(format!(
                "Embedding API error ({}): {}",
                status, body
            )));
        }

        let mut parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| AppError::Model(format!("Failed to parse embedding response: {}", e)))?;

        if parsed.data.len() != texts.len() {
            return Err(AppError::Model(format!(
                "Embedding API returned {} vectors for {} inputs",
                parsed.data.len(),
                texts.len()
            )));
        }

        parsed.data.sort_by_key(|item| item.index);
        let embeddings: Vec<Vec<f32>> = parsed.data.into_iter().map(|i| i.embedding).collect();
        validate_dimensions(&self.model, self.dimensions, &embeddings)?;

        Ok(embeddings)
    }
}

/// Accept both `https://host/v1` and `https://host/v1/embeddings`.
fn embeddings_endpoint(base_url: &str) -> AppResult<Url> {
    let trimmed = base_url.trim_end_matches('/');
    let full = if trimmed.ends_with("/embeddings") {
        trimmed.to_string()
    } else {
        format!("{}/embeddings", trimmed)
    };
    Url::parse(&full)
        .map_err(|e| AppError::Model(format!("Invalid embedding base_url '{}': {}", base_url, e)))
}

#[async_trait]
impl EmbeddingProvider for OpenAiProvider {
    fn provider_name(&self) -> &str {
        "openai"
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn max_batch_size(&self) -> usize {
        self.batch_size
    }

    async fn embed_batch(&self, texts: &[String]) -> AppResult<Vec<Vec<f32>>> {
        let mut embeddings = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            embeddings.extend(self.embed_once(batch).await?);
        }
        debug!("Generated {} embeddings via {}", embeddings.len(), self.endpoint);
        Ok(embeddings)
    }
}
