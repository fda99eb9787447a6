//! Token-overlap reranker for tests and offline use.

use super::Reranker;
use async_trait::async_trait;
use knowbase_core::AppResult;
use std::collections::HashSet;

/// Scores a document by the share of query words it contains.
#[derive(Debug)]
pub struct MockReranker {
    model: String,
}

impl MockReranker {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
        }
    }
}

fn words(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_string)
        .collect()
}

#[async_trait]
impl Reranker for MockReranker {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn score(&self, query: &str, documents: &[String]) -> AppResult<Vec<f32>> {
        let query_words = words(query);
        if query_words.is_empty() {
            return Ok(vec![0.0; documents.len()]);
        }

        Ok(documents
            .iter()
            .map(|doc| {
                let doc_words = words(doc);
                let hits = query_words.intersection(&doc_words).count();
                hits as f32 / query_words.len() as f32
            })
            .collect())
    }
}
