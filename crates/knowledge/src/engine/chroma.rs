//! Chroma engine over the REST v1 API.

use super::{
    str_field, usize_field, CollectionInfo, CollectionSpec, RowFilter, SearchHit, VectorEngine,
    VectorRow,
};
use crate::types::ChunkRow;
use async_trait::async_trait;
use knowbase_core::{AppError, AppResult};
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, instrument};

/// Over-fetch factor for searches filtered on source text, which Chroma
/// cannot express in a `where` clause.
const SOURCE_FILTER_OVERFETCH: usize = 4;

#[derive(Debug, Deserialize)]
struct CollectionReply {
    id: String,
    name: String,
    #[serde(default)]
    metadata: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
struct QueryReply {
    #[serde(default)]
    ids: Vec<Vec<String>>,
    #[serde(default)]
    documents: Option<Vec<Vec<Option<String>>>>,
    #[serde(default)]
    metadatas: Option<Vec<Vec<Option<Value>>>>,
    #[serde(default)]
    distances: Option<Vec<Vec<f32>>>,
}

#[derive(Debug, Default, Deserialize)]
struct GetReply {
    #[serde(default)]
    ids: Vec<String>,
    #[serde(default)]
    documents: Option<Vec<Option<String>>>,
    #[serde(default)]
    metadatas: Option<Vec<Option<Value>>>,
}

/// Chroma server client.
pub struct ChromaEngine {
    client: Client,
    base_url: String,
    ids: RwLock<HashMap<String, String>>,
}

impl ChromaEngine {
    pub fn new(base_url: &str, timeout_secs: u64) -> AppResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| {
                AppError::BackendUnavailable(format!("Failed to create HTTP client: {}", e))
            })?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            ids: RwLock::new(HashMap::new()),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v1/{}", self.base_url, path)
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> AppResult<reqwest::Response> {
        let mut request = self.client.request(method, self.url(path));
        if let Some(body) = body {
            request = request.json(&body);
        }
        request
            .send()
            .await
            .map_err(|e| AppError::BackendUnavailable(format!("Chroma request failed: {}", e)))
    }

    async fn expect_success(response: reqwest::Response) -> AppResult<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(AppError::BackendUnavailable(format!(
            "Chroma API error ({}): {}",
            status, body
        )))
    }

    async fn json<T: DeserializeOwned>(response: reqwest::Response) -> AppResult<T> {
        Self::expect_success(response)
            .await?
            .json()
            .await
            .map_err(|e| {
                AppError::BackendUnavailable(format!("Failed to parse Chroma reply: {}", e))
            })
    }

    /// Fetch a collection by name, `None` when Chroma says it does not exist.
    async fn fetch(&self, name: &str) -> AppResult<Option<CollectionReply>> {
        let response = self
            .send(Method::GET, &format!("collections/{}", name), None)
            .await?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            // Older servers answer a missing collection with a 500 ValueError
            if body.contains("does not exist") {
                return Ok(None);
            }
            return Err(AppError::BackendUnavailable(format!(
                "Chroma API error ({}): {}",
                status, body
            )));
        }

        let reply: CollectionReply = response.json().await.map_err(|e| {
            AppError::BackendUnavailable(format!("Failed to parse Chroma reply: {}", e))
        })?;
        self.ids
            .write()
            .await
            .insert(reply.name.clone(), reply.id.clone());
        Ok(Some(reply))
    }

    async fn collection_id(&self, name: &str) -> AppResult<String> {
        if let Some(id) = self.ids.read().await.get(name) {
            return Ok(id.clone());
        }
        self.fetch(name)
            .await?
            .map(|c| c.id)
            .ok_or_else(|| {
                AppError::BackendUnavailable(format!("Collection '{}' does not exist", name))
            })
    }

    fn where_clause(filter: Option<&RowFilter>) -> Option<Value> {
        match filter {
            Some(RowFilter::FileId(id)) => Some(json!({ "file_id": id })),
            _ => None,
        }
    }

    async fn get_rows(
        &self,
        name: &str,
        filter: &RowFilter,
    ) -> AppResult<(Vec<String>, Vec<ChunkRow>)> {
        let id = self.collection_id(name).await?;
        let mut body = json!({ "include": ["documents", "metadatas"] });
        if let Some(clause) = Self::where_clause(Some(filter)) {
            body["where"] = clause;
        }

        let response = self
            .send(Method::POST, &format!("collections/{}/get", id), Some(body))
            .await?;
        let reply: GetReply = Self::json(response).await?;

        let documents = reply.documents.unwrap_or_default();
        let metadatas = reply.metadatas.unwrap_or_default();
        let mut ids = Vec::new();
        let mut rows = Vec::new();
        for (i, row_id) in reply.ids.into_iter().enumerate() {
            let row = row_from_parts(
                row_id.clone(),
                documents.get(i).cloned().flatten(),
                metadatas.get(i).cloned().flatten(),
            );
            if filter.matches(&row) {
                ids.push(row_id);
                rows.push(row);
            }
        }
        Ok((ids, rows))
    }
}

fn row_from_parts(id: String, document: Option<String>, metadata: Option<Value>) -> ChunkRow {
    let metadata = metadata.unwrap_or(Value::Null);
    ChunkRow {
        id,
        content: document.unwrap_or_default(),
        source: str_field(&metadata, "source"),
        file_id: str_field(&metadata, "file_id"),
        chunk_index: usize_field(&metadata, "chunk_index"),
        chunk_type: str_field(&metadata, "chunk_type"),
    }
}

#[async_trait]
impl VectorEngine for ChromaEngine {
    fn engine_name(&self) -> &str {
        "chroma"
    }

    async fn has_collection(&self, name: &str) -> AppResult<bool> {
        Ok(self.fetch(name).await?.is_some())
    }

    #[instrument(skip(self, spec), fields(collection = %spec.name))]
    async fn create_collection(&self, spec: &CollectionSpec) -> AppResult<()> {
        let mut metadata = spec.metadata.clone();
        metadata.insert("embedding_model".into(), json!(spec.model_tag));
        metadata.insert("dimension".into(), json!(spec.dimension));
        metadata.insert("hnsw:space".into(), json!("cosine"));
        if !spec.description.is_empty() {
            metadata.insert("description".into(), json!(spec.description));
        }

        let response = self
            .send(
                Method::POST,
                "collections",
                Some(json!({
                    "name": spec.name,
                    "metadata": metadata,
                    "get_or_create": false,
                })),
            )
            .await?;
        let reply: CollectionReply = Self::json(response).await?;

        self.ids.write().await.insert(reply.name, reply.id);
        debug!("Created Chroma collection '{}'", spec.name);
        Ok(())
    }

    async fn describe_collection(&self, name: &str) -> AppResult<Option<CollectionInfo>> {
        Ok(self.fetch(name).await?.map(|reply| {
            let metadata = reply.metadata.unwrap_or(Value::Null);
            let opt = |key: &str| metadata.get(key).and_then(Value::as_str).map(str::to_string);
            CollectionInfo {
                name: reply.name,
                model_tag: opt("embedding_model"),
                description: opt("description"),
                metric: opt("hnsw:space"),
                dimension: metadata
                    .get("dimension")
                    .and_then(Value::as_u64)
                    .map(|d| d as usize),
            }
        }))
    }

    #[instrument(skip(self))]
    async fn drop_collection(&self, name: &str) -> AppResult<()> {
        let response = self
            .send(Method::DELETE, &format!("collections/{}", name), None)
            .await?;
        self.ids.write().await.remove(name);

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        Self::expect_success(response).await?;
        debug!("Dropped Chroma collection '{}'", name);
        Ok(())
    }

    async fn list_collections(&self) -> AppResult<Vec<String>> {
        let response = self.send(Method::GET, "collections", None).await?;
        let replies: Vec<CollectionReply> = Self::json(response).await?;
        Ok(replies.into_iter().map(|c| c.name).collect())
    }

    #[instrument(skip(self, rows), fields(rows = rows.len()))]
    async fn insert(&self, name: &str, rows: Vec<VectorRow>) -> AppResult<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let id = self.collection_id(name).await?;

        let mut ids = Vec::with_capacity(rows.len());
        let mut embeddings = Vec::with_capacity(rows.len());
        let mut documents = Vec::with_capacity(rows.len());
        let mut metadatas = Vec::with_capacity(rows.len());
        for VectorRow { row, vector } in rows {
            metadatas.push(json!({
                "source": row.source,
                "file_id": row.file_id,
                "chunk_index": row.chunk_index,
                "chunk_type": row.chunk_type,
            }));
            ids.push(row.id);
            documents.push(row.content);
            embeddings.push(vector);
        }

        let response = self
            .send(
                Method::POST,
                &format!("collections/{}/add", id),
                Some(json!({
                    "ids": ids,
                    "embeddings": embeddings,
                    "documents": documents,
                    "metadatas": metadatas,
                })),
            )
            .await?;
        Self::expect_success(response).await?;
        Ok(())
    }

    #[instrument(skip(self, vector, filter))]
    async fn search(
        &self,
        name: &str,
        vector: &[f32],
        limit: usize,
        filter: Option<&RowFilter>,
    ) -> AppResult<Vec<SearchHit>> {
        let id = self.collection_id(name).await?;
        let n_results = match filter {
            Some(RowFilter::SourceContains(_)) => limit * SOURCE_FILTER_OVERFETCH,
            _ => limit,
        };

        let mut body = json!({
            "query_embeddings": [vector],
            "n_results": n_results,
            "include": ["documents", "metadatas", "distances"],
        });
        if let Some(clause) = Self::where_clause(filter) {
            body["where"] = clause;
        }

        let response = self
            .send(Method::POST, &format!("collections/{}/query", id), Some(body))
            .await?;
        let reply: QueryReply = Self::json(response).await?;

        let ids = reply.ids.into_iter().next().unwrap_or_default();
        let documents = reply
            .documents
            .and_then(|d| d.into_iter().next())
            .unwrap_or_default();
        let metadatas = reply
            .metadatas
            .and_then(|m| m.into_iter().next())
            .unwrap_or_default();
        let distances = reply
            .distances
            .and_then(|d| d.into_iter().next())
            .unwrap_or_default();

        Ok(ids
            .into_iter()
            .enumerate()
            .map(|(i, row_id)| SearchHit {
                row: row_from_parts(
                    row_id,
                    documents.get(i).cloned().flatten(),
                    metadatas.get(i).cloned().flatten(),
                ),
                raw_score: distances.get(i).copied().unwrap_or(1.0),
            })
            .filter(|hit| filter.map_or(true, |f| f.matches(&hit.row)))
            .take(limit)
            .collect())
    }

    async fn query(&self, name: &str, filter: &RowFilter) -> AppResult<Vec<ChunkRow>> {
        Ok(self.get_rows(name, filter).await?.1)
    }

    #[instrument(skip(self))]
    async fn delete(&self, name: &str, filter: &RowFilter) -> AppResult<usize> {
        let (ids, _) = self.get_rows(name, filter).await?;
        if ids.is_empty() {
            return Ok(0);
        }
        let collection = self.collection_id(name).await?;

        let response = self
            .send(
                Method::POST,
                &format!("collections/{}/delete", collection),
                Some(json!({ "ids": ids })),
            )
            .await?;
        Self::expect_success(response).await?;
        Ok(ids.len())
    }

    async fn count(&self, name: &str) -> AppResult<usize> {
        let id = self.collection_id(name).await?;
        let response = self
            .send(Method::GET, &format!("collections/{}/count", id), None)
            .await?;
        Self::json(response).await
    }
}
