//! Milvus engine over the RESTful v2 API.
//!
//! Every call is a `POST` returning `{code, message, data}`; a non-zero code
//! is a failure even under HTTP 200.

use super::{
    str_field, usize_field, CollectionInfo, CollectionSpec, RowFilter, SearchHit, VectorEngine,
    VectorRow,
};
use crate::types::ChunkRow;
use async_trait::async_trait;
use knowbase_core::{AppError, AppResult};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, instrument};

const OUTPUT_FIELDS: [&str; 5] = ["content", "source", "chunk_id", "file_id", "chunk_index"];

/// Upper bound on rows returned by a filtered query.
const QUERY_LIMIT: usize = 10_000;

const SOURCE_MAX_LEN: usize = 500;

pub const DEFAULT_METRIC: &str = "COSINE";

#[derive(Debug, Deserialize)]
struct MilvusReply {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    data: Value,
}

/// Milvus server client.
pub struct MilvusEngine {
    client: Client,
    base_url: String,
    token: Option<String>,
    database: String,
    metric_type: String,
}

impl MilvusEngine {
    pub fn new(
        uri: &str,
        token: Option<String>,
        database: &str,
        timeout_secs: u64,
    ) -> AppResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| {
                AppError::BackendUnavailable(format!("Failed to create HTTP client: {}", e))
            })?;

        Ok(Self {
            client,
            base_url: uri.trim_end_matches('/').to_string(),
            token: token.filter(|t| !t.is_empty()),
            database: database.to_string(),
            metric_type: DEFAULT_METRIC.to_string(),
        })
    }

    /// Metric for new collection indexes and for searches.
    pub fn with_metric_type(mut self, metric_type: impl Into<String>) -> Self {
        self.metric_type = metric_type.into();
        self
    }

    async fn call(&self, path: &str, mut body: Value) -> AppResult<Value> {
        body["dbName"] = json!(self.database);

        let mut request = self
            .client
            .post(format!("{}/v2/vectordb/{}", self.base_url, path))
            .json(&body);
        if let Some(ref token) = self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| AppError::BackendUnavailable(format!("Milvus request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(AppError::BackendUnavailable(format!(
                "Milvus API error ({}): {}",
                status, text
            )));
        }

        let reply: MilvusReply = response.json().await.map_err(|e| {
            AppError::BackendUnavailable(format!("Failed to parse Milvus reply: {}", e))
        })?;

        if reply.code != 0 && reply.code != 200 {
            return Err(AppError::BackendUnavailable(format!(
                "Milvus {} failed (code {}): {}",
                path,
                reply.code,
                reply.message.unwrap_or_default()
            )));
        }

        Ok(reply.data)
    }

    fn filter_expr(filter: &RowFilter) -> String {
        match filter {
            RowFilter::FileId(id) => format!("file_id == \"{}\"", escape(id)),
            RowFilter::SourceContains(text) => {
                format!("source like \"%{}%\"", escape(&escape_like(text)))
            }
        }
    }

    fn schema(spec: &CollectionSpec) -> Value {
        json!({
            "autoId": false,
            "enableDynamicField": false,
            "fields": [
                {"fieldName": "id", "dataType": "VarChar", "isPrimary": true,
                 "elementTypeParams": {"max_length": 100}},
                {"fieldName": "content", "dataType": "VarChar",
                 "elementTypeParams": {"max_length": 65535}},
                {"fieldName": "source", "dataType": "VarChar",
                 "elementTypeParams": {"max_length": SOURCE_MAX_LEN}},
                {"fieldName": "chunk_id", "dataType": "VarChar",
                 "elementTypeParams": {"max_length": 100}},
                {"fieldName": "file_id", "dataType": "VarChar",
                 "elementTypeParams": {"max_length": 100}},
                {"fieldName": "chunk_index", "dataType": "Int64"},
                {"fieldName": "embedding", "dataType": "FloatVector",
                 "elementTypeParams": {"dim": spec.dimension}}
            ]
        })
    }
}

fn escape(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Make `%` and `_` match literally inside a `like` pattern.
fn escape_like(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

fn truncate_chars(value: &str, max: usize) -> String {
    value.chars().take(max).collect()
}

fn row_from_entity(entity: &Value) -> ChunkRow {
    let chunk_id = str_field(entity, "chunk_id");
    let id = match entity.get("id").and_then(Value::as_str) {
        Some(id) => id.to_string(),
        None => chunk_id,
    };
    ChunkRow {
        id,
        content: str_field(entity, "content"),
        source: str_field(entity, "source"),
        file_id: str_field(entity, "file_id"),
        chunk_index: usize_field(entity, "chunk_index"),
        chunk_type: String::new(),
    }
}

#[async_trait]
impl VectorEngine for MilvusEngine {
    fn engine_name(&self) -> &str {
        "milvus"
    }

    async fn has_collection(&self, name: &str) -> AppResult<bool> {
        let data = self
            .call("collections/has", json!({ "collectionName": name }))
            .await?;
        Ok(data.get("has").and_then(Value::as_bool).unwrap_or(false))
    }

    #[instrument(skip(self, spec), fields(collection = %spec.name))]
    async fn create_collection(&self, spec: &CollectionSpec) -> AppResult<()> {
        self.call(
            "collections/create",
            json!({
                "collectionName": spec.name,
                "description": spec.description,
                "schema": Self::schema(spec),
                "indexParams": [{
                    "fieldName": "embedding",
                    "indexName": "embedding_index",
                    "metricType": self.metric_type,
                    "params": {"index_type": "IVF_FLAT", "nlist": 1024}
                }]
            }),
        )
        .await?;
        debug!("Created Milvus collection '{}'", spec.name);
        Ok(())
    }

    async fn describe_collection(&self, name: &str) -> AppResult<Option<CollectionInfo>> {
        if !self.has_collection(name).await? {
            return Ok(None);
        }

        let data = self
            .call("collections/describe", json!({ "collectionName": name }))
            .await?;

        let description = data
            .get("description")
            .and_then(Value::as_str)
            .map(str::to_string);
        let metric = data
            .get("indexes")
            .and_then(Value::as_array)
            .and_then(|indexes| {
                indexes
                    .iter()
                    .find(|i| i.get("fieldName").and_then(Value::as_str) == Some("embedding"))
            })
            .and_then(|i| i.get("metricType"))
            .and_then(Value::as_str)
            .map(str::to_string);
        let dimension = data
            .get("fields")
            .and_then(Value::as_array)
            .and_then(|fields| {
                fields
                    .iter()
                    .find(|f| f.get("name").and_then(Value::as_str) == Some("embedding"))
            })
            .and_then(|f| f.get("params"))
            .and_then(Value::as_array)
            .and_then(|params| {
                params
                    .iter()
                    .find(|p| p.get("key").and_then(Value::as_str) == Some("dim"))
            })
            .map(|p| usize_field(p, "value"));

        Ok(Some(CollectionInfo {
            name: name.to_string(),
            // Milvus keeps no free-form metadata; the model lives in the description
            model_tag: None,
            description,
            metric,
            dimension,
        }))
    }

    #[instrument(skip(self))]
    async fn drop_collection(&self, name: &str) -> AppResult<()> {
        self.call("collections/drop", json!({ "collectionName": name }))
            .await?;
        debug!("Dropped Milvus collection '{}'", name);
        Ok(())
    }

    async fn list_collections(&self) -> AppResult<Vec<String>> {
        let data = self.call("collections/list", json!({})).await?;
        Ok(data
            .as_array()
            .map(|names| {
                names
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default())
    }

    #[instrument(skip(self, rows), fields(rows = rows.len()))]
    async fn insert(&self, name: &str, rows: Vec<VectorRow>) -> AppResult<()> {
        if rows.is_empty() {
            return Ok(());
        }

        let data: Vec<Value> = rows
            .into_iter()
            .map(|VectorRow { row, vector }| {
                json!({
                    "id": row.id,
                    "content": row.content,
                    "source": truncate_chars(&row.source, SOURCE_MAX_LEN),
                    "chunk_id": row.id,
                    "file_id": row.file_id,
                    "chunk_index": row.chunk_index,
                    "embedding": vector,
                })
            })
            .collect();

        self.call(
            "entities/insert",
            json!({ "collectionName": name, "data": data }),
        )
        .await?;
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
        let mut body = json!({
            "collectionName": name,
            "data": [vector],
            "annsField": "embedding",
            "limit": limit,
            "outputFields": OUTPUT_FIELDS,
            "searchParams": {"metricType": self.metric_type, "params": {"nprobe": 10}},
        });
        if let Some(filter) = filter {
            body["filter"] = json!(Self::filter_expr(filter));
        }

        let data = self.call("entities/search", body).await?;
        Ok(data
            .as_array()
            .map(|hits| {
                hits.iter()
                    .map(|hit| SearchHit {
                        row: row_from_entity(hit),
                        raw_score: hit
                            .get("distance")
                            .and_then(Value::as_f64)
                            .unwrap_or_default() as f32,
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn query(&self, name: &str, filter: &RowFilter) -> AppResult<Vec<ChunkRow>> {
        let data = self
            .call(
                "entities/query",
                json!({
                    "collectionName": name,
                    "filter": Self::filter_expr(filter),
                    "outputFields": OUTPUT_FIELDS,
                    "limit": QUERY_LIMIT,
                }),
            )
            .await?;

        Ok(data
            .as_array()
            .map(|rows| rows.iter().map(row_from_entity).collect())
            .unwrap_or_default())
    }

    #[instrument(skip(self))]
    async fn delete(&self, name: &str, filter: &RowFilter) -> AppResult<usize> {
        let matching = self.query(name, filter).await?.len();
        if matching == 0 {
            return Ok(0);
        }

        self.call(
            "entities/delete",
            json!({ "collectionName": name, "filter": Self::filter_expr(filter) }),
        )
        .await?;
        Ok(matching)
    }

    async fn count(&self, name: &str) -> AppResult<usize> {
        let data = self
            .call("collections/get_stats", json!({ "collectionName": name }))
            .await?;
        Ok(usize_field(&data, "rowCount"))
    }
}
