//! Shared fixtures and end-to-end knowledge base scenarios.

use crate::types::{
    BackendType, EmbedInfo, FileRecord, FileStatus, KnowledgeBaseRecord, ProcessingParams,
};
use chrono::Utc;
use serde_json::Map;

mod lifecycle;

/// Mock-provider embedding settings.
pub(crate) fn mock_embed(model: &str, dimension: usize) -> EmbedInfo {
    EmbedInfo {
        name: model.to_string(),
        provider: "mock".to_string(),
        base_url: None,
        api_key: None,
        dimension,
        batch_size: Some(16),
    }
}

/// A knowledge base record using an 8-dimensional mock model.
pub(crate) fn kb_record(id: &str, backend: BackendType, model: &str) -> KnowledgeBaseRecord {
    KnowledgeBaseRecord {
        id: id.to_string(),
        name: format!("{} docs", id),
        description: String::new(),
        backend_type: backend,
        embed_info: mock_embed(model, 8),
        llm_info: None,
        metadata: Map::new(),
        created_at: Utc::now(),
        updated_at: None,
    }
}

/// A finished file record.
pub(crate) fn file_record(file_id: &str, db_id: &str) -> FileRecord {
    FileRecord {
        file_id: file_id.to_string(),
        database_id: db_id.to_string(),
        filename: format!("{}.md", file_id),
        path: format!("/tmp/{}.md", file_id),
        file_type: "md".to_string(),
        status: FileStatus::Done,
        content_hash: None,
        parent_id: None,
        is_folder: false,
        processing_params: ProcessingParams::default(),
        created_at: Utc::now(),
        updated_at: None,
        error: None,
    }
}
