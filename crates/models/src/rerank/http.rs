//! HTTP rerank client for hosted rerank services.

use super::{normalize_scores, RerankConfig, Reranker};
use async_trait::async_trait;
use knowbase_core::{AppError, AppResult};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, instrument};
use url::Url;

/// Request/response dialect spoken by the rerank endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RerankApiStyle {
    /// `{model, query, documents}` → `{results: [{index, relevance_score}]}`
    OpenAi,
    /// `{model, input: {query, documents}, parameters}` → `{output: {results: [...]}}`
    DashScope,
}

#[derive(Debug, Deserialize)]
struct RerankItem {
    index: usize,
    #[serde(alias = "score")]
    relevance_score: f32,
}

#[derive(Debug)]
pub struct HttpReranker {
    client: Client,
    endpoint: Url,
    api_key: Option<String>,
    model: String,
    style: RerankApiStyle,
    batch_size: usize,
    instruct: Option<String>,
}

impl HttpReranker {
    pub fn new(config: &RerankConfig, style: RerankApiStyle) -> AppResult<Self> {
        let base_url = config.base_url.as_deref().ok_or_else(|| {
            AppError::Model(format!(
                "Reranker '{}' ({}) needs a base_url",
                config.model, config.provider
            ))
        })?;
        let endpoint = Url::parse(base_url)
            .map_err(|e| AppError::Model(format!("Invalid reranker URL '{}': {}", base_url, e)))?;

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| AppError::Model(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint,
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            style,
            batch_size: config.batch_size.max(1),
            instruct: config.instruct.clone(),
        })
    }

    fn payload(&self, query: &str, documents: &[String]) -> Value {
        match self.style {
            RerankApiStyle::OpenAi => json!({
                "model": self.model,
                "query": query,
                "documents": documents,
            }),
            RerankApiStyle::DashScope => {
                let mut parameters = json!({
                    "top_n": documents.len(),
                    "return_documents": false,
                });
                if let Some(ref instruct) = self.instruct {
                    parameters["instruct"] = json!(instruct);
                }
                json!({
                    "model": self.model,
                    "input": {"query": query, "documents": documents},
                    "parameters": parameters,
                })
            }
        }
    }

    fn extract_results(&self, body: Value) -> AppResult<Vec<RerankItem>> {
        let results = match self.style {
            RerankApiStyle::OpenAi => body.get("results").cloned(),
            RerankApiStyle::DashScope => body
                .get("output")
                .and_then(|output| output.get("results"))
                .cloned(),
        }
        .ok_or_else(|| AppError::Model("Rerank response has no results".to_string()))?;

        serde_json::from_value(results)
            .map_err(|e| AppError::Model(format!("Failed to parse rerank results: {}", e)))
    }

    #[instrument(skip(self, query, documents), fields(model = %self.model, docs = documents.len()))]
    async fn score_batch(&self, query: &str, documents: &[String]) -> AppResult<Vec<f32>> {
        let mut request = self
            .client
            .post(self.endpoint.clone())
            .json(&self.payload(query, documents));
        if let Some(ref key) = self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| AppError::Model(format!("Rerank request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::Model(format!(
                "Rerank API error ({}): {}",
                status, body
            )));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| AppError::Model(format!("Failed to parse rerank response: {}", e)))?;

        let mut scores: Vec<Option<f32>> = vec![None; documents.len()];
        for item in self.extract_results(body)? {
            if let Some(slot) = scores.get_mut(item.index) {
                *slot = Some(item.relevance_score);
            }
        }

        scores
            .into_iter()
            .enumerate()
            .map(|(i, s)| {
                s.ok_or_else(|| AppError::Model(format!("Rerank response missing document {}", i)))
            })
            .collect()
    }
}

#[async_trait]
impl Reranker for HttpReranker {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn score(&self, query: &str, documents: &[String]) -> AppResult<Vec<f32>> {
        if documents.is_empty() {
            return Ok(Vec::new());
        }

        let mut scores = Vec::with_capacity(documents.len());
        let total = documents.len().div_ceil(self.batch_size);
        for (batch_no, batch) in documents.chunks(self.batch_size).enumerate() {
            scores.extend(self.score_batch(query, batch).await?);
            debug!("Reranking batch {}/{} completed", batch_no + 1, total);
        }

        Ok(normalize_scores(scores))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn docs() -> Vec<String> {
        vec!["alpha".to_string(), "beta".to_string(), "gamma".to_string()]
    }

    #[tokio::test]
    async fn test_openai_style_scores_follow_input_order() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/v1/rerank"))
            .and(body_partial_json(json!({"model": "bge-reranker", "query": "q"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "results": [
                    {"index": 2, "relevance_score": 0.9},
                    {"index": 0, "relevance_score": 0.2},
                    {"index": 1, "relevance_score": 0.5}
                ]
            })))
            .mount(&server)
            .await;

        let config = RerankConfig::new("vllm", "bge-reranker")
            .with_base_url(format!("{}/v1/rerank", server.uri()));
        let reranker = HttpReranker::new(&config, RerankApiStyle::OpenAi).unwrap();
        let scores = reranker.score("q", &docs()).await.unwrap();

        assert_eq!(scores, vec![0.2, 0.5, 0.9]);
    }

    #[tokio::test]
    async fn test_dashscope_style_logits_are_normalized() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/rerank"))
            .and(body_partial_json(json!({"input": {"query": "q"}})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "output": {"results": [
                    {"index": 0, "relevance_score": 3.0},
                    {"index": 1, "relevance_score": -2.0},
                    {"index": 2, "relevance_score": 0.0}
                ]}
            })))
            .mount(&server)
            .await;

        let config = RerankConfig::new("dashscope", "gte-rerank")
            .with_base_url(format!("{}/rerank", server.uri()));
        let reranker = HttpReranker::new(&config, RerankApiStyle::DashScope).unwrap();
        let scores = reranker.score("q", &docs()).await.unwrap();

        assert!(scores.iter().all(|s| (0.0..=1.0).contains(s)));
        assert!(scores[0] > scores[2] && scores[2] > scores[1]);
    }

    #[tokio::test]
    async fn test_missing_document_is_error() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "results": [{"index": 0, "relevance_score": 0.4}]
            })))
            .mount(&server)
            .await;

        let config = RerankConfig::new("openai", "m").with_base_url(server.uri());
        let reranker = HttpReranker::new(&config, RerankApiStyle::OpenAi).unwrap();
        assert!(reranker.score("q", &docs()).await.is_err());
    }

    #[tokio::test]
    async fn test_service_error_propagates() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let config = RerankConfig::new("openai", "m").with_base_url(server.uri());
        let reranker = HttpReranker::new(&config, RerankApiStyle::OpenAi).unwrap();
        let err = reranker.score("q", &docs()).await.unwrap_err();
        assert!(err.to_string().contains("503"));
    }
}
