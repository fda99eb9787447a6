//! Knowledge base lifecycle for one backend type.
//!
//! A [`KnowledgeBase`] owns the metadata document of its backend and drives
//! ingestion, re-indexing, deletion and retrieval through a
//! [`BackendAdapter`]. Every knowledge base it manages lives in the same
//! vector engine, one collection each.

use crate::backend::{BackendAdapter, IngestPolicy};
use crate::chunk::{ChunkConfig, ChunkingEngine};
use crate::convert::DocumentConverter;
use crate::metadata::MetadataStore;
use crate::models::ModelCache;
use crate::prepare::{hashstr, prepare_item_metadata};
use crate::queue::{InFlightGuard, ProcessingQueue};
use crate::retrieval::{retrieve, RetrievalPlan};
use crate::types::{
    BackendType, ChunkRow, DatabaseInfo, EmbedInfo, FileInfo, FileRecord, FileStatus,
    KnowledgeBaseRecord, ProcessingParams, QueryOptions, ScoredChunk,
};
use chrono::Utc;
use knowbase_core::{AppError, AppResult};
use knowbase_models::{RerankConfig, Reranker};
use serde_json::{json, Map, Value};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Error written onto records whose run is gone.
pub const INTERRUPTED_MESSAGE: &str = "Processing interrupted - process not found in queue";

/// Tunables shared by every knowledge base of a backend.
#[derive(Debug, Clone, Default)]
pub struct BaseSettings {
    pub ingest: IngestPolicy,
    /// Reranker used when a kb enables reranking without naming one
    pub default_reranker: Option<RerankConfig>,
}

/// Fields accepted by [`KnowledgeBase::update_database`].
#[derive(Debug, Clone, Default)]
pub struct DatabaseUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub llm_info: Option<Value>,
    pub embed_info: Option<EmbedInfo>,
}

pub struct KnowledgeBase {
    backend: Arc<dyn BackendAdapter>,
    store: MetadataStore,
    work_dir: PathBuf,
    queue: Arc<ProcessingQueue>,
    converter: Arc<dyn DocumentConverter>,
    models: Arc<ModelCache>,
    settings: BaseSettings,
    kb_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl KnowledgeBase {
    /// Open the metadata under `work_dir` (normally `<root>/<backend>_data`).
    pub fn new(
        backend: Arc<dyn BackendAdapter>,
        work_dir: impl Into<PathBuf>,
        queue: Arc<ProcessingQueue>,
        converter: Arc<dyn DocumentConverter>,
        models: Arc<ModelCache>,
    ) -> AppResult<Self> {
        let work_dir = work_dir.into();
        let store = MetadataStore::open(&work_dir, backend.backend_type())?;

        Ok(Self {
            backend,
            store,
            work_dir,
            queue,
            converter,
            models,
            settings: BaseSettings::default(),
            kb_locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn with_settings(mut self, settings: BaseSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn backend_type(&self) -> BackendType {
        self.backend.backend_type()
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn has_database(&self, db_id: &str) -> bool {
        self.store.database(db_id).is_some()
    }

    pub fn database_ids(&self) -> Vec<String> {
        self.store.read(|doc| doc.databases.keys().cloned().collect())
    }

    /// Raw record without the stale-status check.
    pub fn record(&self, db_id: &str) -> AppResult<KnowledgeBaseRecord> {
        self.store
            .database(db_id)
            .ok_or_else(|| AppError::NotFound(format!("Knowledge base not found: {}", db_id)))
    }

    /// All file records across every knowledge base of this backend.
    pub fn all_files(&self) -> Vec<FileRecord> {
        self.store.read(|doc| doc.files.values().cloned().collect())
    }

    pub(crate) fn kb_lock(&self, db_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.kb_locks.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(locks.entry(db_id.to_string()).or_default())
    }

    fn kb_dir(&self, db_id: &str) -> PathBuf {
        self.work_dir.join(db_id)
    }

    // ---- databases ----

    /// Create a knowledge base and its (empty) collection.
    ///
    /// A `true` `is_private` entry in `metadata` yields a `kb_private_` id.
    #[instrument(skip(self, embed_info, llm_info, metadata), fields(backend = %self.backend_type()))]
    pub async fn create_database(
        &self,
        name: &str,
        description: &str,
        embed_info: EmbedInfo,
        llm_info: Option<Value>,
        metadata: Map<String, Value>,
    ) -> AppResult<KnowledgeBaseRecord> {
        if name.trim().is_empty() {
            return Err(AppError::Knowledge(
                "Knowledge base name must not be empty".to_string(),
            ));
        }

        let private = metadata
            .get("is_private")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let prefix = if private { "kb_private_" } else { "kb_" };
        let db_id = format!("{}{}", prefix, hashstr(name, Some(32), true));

        if self.has_database(&db_id) {
            return Err(AppError::Knowledge(format!(
                "Knowledge base id collision: {}",
                db_id
            )));
        }

        let record = KnowledgeBaseRecord {
            id: db_id.clone(),
            name: name.to_string(),
            description: description.to_string(),
            backend_type: self.backend_type(),
            embed_info,
            llm_info,
            metadata,
            created_at: Utc::now(),
            updated_at: None,
        };

        self.backend.create_or_open_collection(&record).await?;

        let dir = self.kb_dir(&db_id);
        std::fs::create_dir_all(&dir).map_err(|e| {
            AppError::Knowledge(format!("Failed to create directory {:?}: {}", dir, e))
        })?;

        let stored = record.clone();
        self.store.update(|doc| {
            doc.databases.insert(stored.id.clone(), stored);
        })?;

        info!(
            "Created knowledge base '{}' ({}) with model '{}'",
            name,
            db_id,
            record.embed_info.model_tag()
        );
        Ok(record)
    }

    /// Remove a knowledge base: file records, record, collection, directory.
    /// Pieces already gone are skipped.
    #[instrument(skip(self), fields(backend = %self.backend_type()))]
    pub async fn delete_database(&self, db_id: &str) -> AppResult<()> {
        let lock = self.kb_lock(db_id);
        let _held = lock.lock().await;

        let removed_files = self.store.update(|doc| {
            let before = doc.files.len();
            doc.files.retain(|_, f| f.database_id != db_id);
            let removed = before - doc.files.len();
            doc.databases.remove(db_id);
            removed
        })?;

        if let Err(e) = self.backend.delete_collection(db_id).await {
            warn!("Failed to drop collection for '{}': {}", db_id, e);
        }

        let dir = self.kb_dir(db_id);
        if dir.exists() {
            if let Err(e) = std::fs::remove_dir_all(&dir) {
                warn!("Failed to remove {:?}: {}", dir, e);
            }
        }

        info!("Deleted knowledge base {} ({} files)", db_id, removed_files);
        Ok(())
    }

    /// Record plus files, with stale `processing` entries corrected first.
    pub async fn get_database_info(&self, db_id: &str) -> AppResult<DatabaseInfo> {
        self.record(db_id)?;
        self.fail_stale_files(Some(db_id))?;

        let record = self.record(db_id)?;
        let files = self.store.read(|doc| doc.files_of(db_id));
        let row_count = match self.backend.row_count(db_id).await {
            Ok(count) => count,
            Err(e) => {
                debug!("Row count unavailable for {}: {}", db_id, e);
                None
            }
        };

        Ok(DatabaseInfo {
            record,
            files,
            row_count,
        })
    }

    /// Every knowledge base of this backend, oldest first.
    pub fn list_databases(&self) -> AppResult<Vec<DatabaseInfo>> {
        self.fail_stale_files(None)?;

        let mut infos: Vec<DatabaseInfo> = self.store.read(|doc| {
            doc.databases
                .values()
                .map(|record| DatabaseInfo {
                    record: record.clone(),
                    files: doc.files_of(&record.id),
                    row_count: None,
                })
                .collect()
        });
        infos.sort_by(|a, b| a.record.created_at.cmp(&b.record.created_at));
        Ok(infos)
    }

    pub async fn update_database(
        &self,
        db_id: &str,
        update: DatabaseUpdate,
    ) -> AppResult<KnowledgeBaseRecord> {
        let lock = self.kb_lock(db_id);
        let _held = lock.lock().await;

        let mut record = self.record(db_id)?;
        if let Some(name) = update.name {
            record.name = name;
        }
        if let Some(description) = update.description {
            record.description = description;
        }
        if let Some(llm_info) = update.llm_info {
            record.llm_info = Some(llm_info);
        }
        if let Some(embed_info) = update.embed_info {
            if embed_info.model_tag() != record.embed_info.model_tag() {
                info!(
                    "Embedding model of {} changes from '{}' to '{}'; the collection is rebuilt on the next write",
                    db_id,
                    record.embed_info.model_tag(),
                    embed_info.model_tag()
                );
            }
            record.embed_info = embed_info;
        }
        record.updated_at = Some(Utc::now());

        let stored = record.clone();
        self.store.update(|doc| {
            doc.databases.insert(stored.id.clone(), stored);
        })?;
        Ok(record)
    }

    /// Persist default retrieval options under `metadata.query_params`.
    pub async fn update_query_params(&self, db_id: &str, options: &QueryOptions) -> AppResult<()> {
        let lock = self.kb_lock(db_id);
        let _held = lock.lock().await;

        self.record(db_id)?;
        let options = serde_json::to_value(options)?;
        self.store.update(|doc| {
            if let Some(record) = doc.databases.get_mut(db_id) {
                record
                    .metadata
                    .insert("query_params".to_string(), json!({ "options": options }));
                record.updated_at = Some(Utc::now());
            }
        })
    }

    /// Flip `processing` records that no live run owns to `failed`.
    ///
    /// Returns how many records changed. A flipped record is no longer
    /// `processing`, so each is corrected exactly once.
    pub fn fail_stale_files(&self, db_id: Option<&str>) -> AppResult<usize> {
        let stale: Vec<String> = self.store.read(|doc| {
            doc.files
                .values()
                .filter(|f| db_id.map_or(true, |id| f.database_id == id))
                .filter(|f| f.status == FileStatus::Processing)
                .filter(|f| !self.queue.is_in_flight(&f.file_id))
                .map(|f| f.file_id.clone())
                .collect()
        });

        if stale.is_empty() {
            return Ok(0);
        }

        self.store.update(|doc| {
            let mut flipped = 0;
            for file_id in &stale {
                if let Some(file) = doc.files.get_mut(file_id) {
                    // Re-check under the write lock; a run may have finished meanwhile
                    if file.status == FileStatus::Processing && !self.queue.is_in_flight(file_id) {
                        warn!("File {} ({}) was left processing; marking failed", file.filename, file_id);
                        file.mark(FileStatus::Failed, Some(INTERRUPTED_MESSAGE.to_string()));
                        flipped += 1;
                    }
                }
            }
            flipped
        })
    }

    // ---- content ----

    /// Ingest files or URLs one after another.
    ///
    /// Each item gets a record that ends `done` or `failed`; one bad item
    /// never stops the rest. Items not yet started when `cancel` fires are
    /// skipped and get no record.
    #[instrument(skip(self, items, params, cancel), fields(backend = %self.backend_type(), items = items.len()))]
    pub async fn add_content(
        &self,
        db_id: &str,
        items: &[String],
        params: &ProcessingParams,
        cancel: &CancellationToken,
    ) -> AppResult<Vec<FileRecord>> {
        let kb = self.record(db_id)?;
        let kind = params.content_kind();
        let mut processed = Vec::with_capacity(items.len());

        for item in items {
            if cancel.is_cancelled() {
                warn!(
                    "Ingestion cancelled; {} of {} items not started",
                    items.len() - processed.len(),
                    items.len()
                );
                break;
            }

            let mut record = prepare_item_metadata(item, kind, db_id, params).await?;
            // Queued before the first `processing` write so the stale pass never sees it unowned
            let _in_flight = InFlightGuard::new(&self.queue, &record.file_id);
            self.store.put_file(record.clone())?;

            match self.index_item(&kb, &record, params, false, cancel).await {
                Ok(count) => {
                    info!("Indexed {} ({} chunks)", record.filename, count);
                    record.mark(FileStatus::Done, None);
                }
                Err(e) => {
                    warn!("Failed to index {}: {}", record.filename, e);
                    record.mark(FileStatus::Failed, Some(failure_message(&e)));
                }
            }
            self.store.put_file(record.clone())?;
            processed.push(record);
        }

        Ok(processed)
    }

    /// Re-index existing files with `params` layered over the stored ones.
    ///
    /// Old chunks are deleted only once the file converted successfully, so
    /// the file has no chunks for the span of its own re-insert.
    #[instrument(skip(self, file_ids, params, cancel), fields(backend = %self.backend_type()))]
    pub async fn update_content(
        &self,
        db_id: &str,
        file_ids: &[String],
        params: &ProcessingParams,
        cancel: &CancellationToken,
    ) -> AppResult<Vec<FileRecord>> {
        let kb = self.record(db_id)?;
        let mut processed = Vec::with_capacity(file_ids.len());

        for file_id in file_ids {
            if cancel.is_cancelled() {
                warn!("Re-indexing cancelled before {}", file_id);
                break;
            }

            let Some(mut record) = self
                .store
                .file(file_id)
                .filter(|f| f.database_id == db_id)
            else {
                warn!("File {} not found in {}, skipping", file_id, db_id);
                continue;
            };
            if record.is_folder {
                debug!("Skipping folder {}", file_id);
                continue;
            }

            let _in_flight = InFlightGuard::new(&self.queue, file_id);
            record.processing_params = params.merged_over(&record.processing_params);
            record.mark(FileStatus::Processing, None);
            self.store.put_file(record.clone())?;

            let merged = record.processing_params.clone();
            match self.index_item(&kb, &record, &merged, true, cancel).await {
                Ok(count) => {
                    info!("Re-indexed {} ({} chunks)", record.filename, count);
                    record.mark(FileStatus::Done, None);
                }
                Err(e) => {
                    warn!("Failed to re-index {}: {}", record.filename, e);
                    record.mark(FileStatus::Failed, Some(failure_message(&e)));
                }
            }
            self.store.put_file(record.clone())?;
            processed.push(record);
        }

        Ok(processed)
    }

    /// Convert, chunk, embed and insert one item. With `replace`, the file's
    /// existing chunks are removed after conversion succeeds.
    async fn index_item(
        &self,
        kb: &KnowledgeBaseRecord,
        record: &FileRecord,
        params: &ProcessingParams,
        replace: bool,
        cancel: &CancellationToken,
    ) -> AppResult<usize> {
        let embedder = self.models.embedder(&kb.embed_info)?;

        {
            let lock = self.kb_lock(&kb.id);
            let _held = lock.lock().await;
            self.backend.create_or_open_collection(kb).await?;
        }

        let text = tokio::select! {
            _ = cancel.cancelled() => return Err(AppError::Cancelled("Cancelled".to_string())),
            text = self.converter.convert(&record.path, params.content_kind(), params) => text?,
        };

        let chunks = ChunkingEngine::new(ChunkConfig::from_params(params)).process(
            &record.file_id,
            &record.filename,
            &text,
        )?;
        debug!("{} split into {} chunks", record.filename, chunks.len());

        if replace {
            let removed = self
                .backend
                .delete_file_chunks(&kb.id, &record.file_id)
                .await?;
            debug!("Removed {} old chunks of {}", removed, record.file_id);
        }

        self.backend
            .insert_chunks(
                kb,
                &chunks,
                embedder.as_ref(),
                &self.settings.ingest,
                cancel,
            )
            .await
    }

    /// Remove a file's chunks, then its record. Folders are removed with
    /// their contents.
    pub async fn delete_file(&self, db_id: &str, file_id: &str) -> AppResult<()> {
        let record = self.file_in(db_id, file_id)?;
        if record.is_folder {
            return self.delete_folder(db_id, file_id).await;
        }

        let removed = self.backend.delete_file_chunks(db_id, file_id).await?;
        self.store.update(|doc| {
            doc.files.remove(file_id);
        })?;
        info!("Deleted file {} ({} chunks)", record.filename, removed);
        Ok(())
    }

    /// Stored chunks of a file, by chunk index. Unknown files have none.
    pub async fn get_file_chunks(&self, db_id: &str, file_id: &str) -> AppResult<Vec<ChunkRow>> {
        self.record(db_id)?;
        self.backend.file_chunks(db_id, file_id).await
    }

    pub async fn get_file_info(&self, db_id: &str, file_id: &str) -> AppResult<FileInfo> {
        let meta = self.file_in(db_id, file_id)?;
        let chunks = if meta.is_folder {
            Vec::new()
        } else {
            self.backend.file_chunks(db_id, file_id).await?
        };
        Ok(FileInfo { meta, chunks })
    }

    fn file_in(&self, db_id: &str, file_id: &str) -> AppResult<FileRecord> {
        self.record(db_id)?;
        self.store
            .file(file_id)
            .filter(|f| f.database_id == db_id)
            .ok_or_else(|| {
                AppError::NotFound(format!("File {} not found in knowledge base {}", file_id, db_id))
            })
    }

    // ---- folders ----

    pub async fn create_folder(
        &self,
        db_id: &str,
        name: &str,
        parent_id: Option<&str>,
    ) -> AppResult<FileRecord> {
        let lock = self.kb_lock(db_id);
        let _held = lock.lock().await;

        self.record(db_id)?;
        if let Some(parent) = parent_id {
            self.folder_in(db_id, parent)?;
        }

        let now = Utc::now();
        let folder = FileRecord {
            file_id: format!("folder-{}", uuid::Uuid::new_v4()),
            database_id: db_id.to_string(),
            filename: name.to_string(),
            path: name.to_string(),
            file_type: "folder".to_string(),
            status: FileStatus::Done,
            content_hash: None,
            parent_id: parent_id.map(str::to_string),
            is_folder: true,
            processing_params: ProcessingParams::default(),
            created_at: now,
            updated_at: Some(now),
            error: None,
        };
        self.store.put_file(folder.clone())?;
        Ok(folder)
    }

    /// Delete a folder, everything beneath it, and their chunks.
    pub async fn delete_folder(&self, db_id: &str, folder_id: &str) -> AppResult<()> {
        self.folder_in(db_id, folder_id)?;

        let subtree = self.store.read(|doc| {
            let mut found = vec![folder_id.to_string()];
            let mut cursor = 0;
            while cursor < found.len() {
                let parent = found[cursor].clone();
                found.extend(
                    doc.files
                        .values()
                        .filter(|f| f.database_id == db_id)
                        .filter(|f| f.parent_id.as_deref() == Some(parent.as_str()))
                        .map(|f| f.file_id.clone()),
                );
                cursor += 1;
            }
            found
        });

        for file_id in &subtree {
            let is_folder = self
                .store
                .file(file_id)
                .map(|f| f.is_folder)
                .unwrap_or(true);
            if !is_folder {
                self.backend.delete_file_chunks(db_id, file_id).await?;
            }
        }

        self.store.update(|doc| {
            for file_id in &subtree {
                doc.files.remove(file_id);
            }
        })?;
        info!("Deleted folder {} ({} entries)", folder_id, subtree.len());
        Ok(())
    }

    /// Re-parent a file or folder. `None` moves it to the root.
    pub async fn move_file(
        &self,
        db_id: &str,
        file_id: &str,
        new_parent_id: Option<&str>,
    ) -> AppResult<FileRecord> {
        let lock = self.kb_lock(db_id);
        let _held = lock.lock().await;

        let mut record = self.file_in(db_id, file_id)?;

        if let Some(parent) = new_parent_id {
            if parent == file_id {
                return Err(AppError::Knowledge("Cannot move a folder into itself".to_string()));
            }
            self.folder_in(db_id, parent)?;

            if record.is_folder {
                // Walk up from the target; meeting the moved folder means a cycle
                let mut seen = HashSet::new();
                let mut cursor = Some(parent.to_string());
                while let Some(current) = cursor {
                    if current == file_id {
                        return Err(AppError::Knowledge(
                            "Cannot move a folder into one of its subfolders".to_string(),
                        ));
                    }
                    if !seen.insert(current.clone()) {
                        break;
                    }
                    cursor = self.store.file(&current).and_then(|f| f.parent_id);
                }
            }
        }

        record.parent_id = new_parent_id.map(str::to_string);
        record.updated_at = Some(Utc::now());
        self.store.put_file(record.clone())?;
        Ok(record)
    }

    fn folder_in(&self, db_id: &str, folder_id: &str) -> AppResult<FileRecord> {
        let folder = self.file_in(db_id, folder_id)?;
        if !folder.is_folder {
            return Err(AppError::Knowledge(format!("{} is not a folder", folder_id)));
        }
        Ok(folder)
    }

    // ---- lookups ----

    /// Whether a file with this content hash was already ingested (failed
    /// attempts don't count).
    pub fn file_existed_in_db(&self, db_id: &str, content_hash: &str) -> bool {
        self.store.read(|doc| {
            doc.files.values().any(|f| {
                f.database_id == db_id
                    && f.status != FileStatus::Failed
                    && f.content_hash.as_deref() == Some(content_hash)
            })
        })
    }

    pub fn get_same_name_files(&self, db_id: &str, filename: &str) -> Vec<FileRecord> {
        self.store.read(|doc| {
            doc.files_of(db_id)
                .into_iter()
                .filter(|f| !f.is_folder && f.filename == filename)
                .collect()
        })
    }

    /// Upload directory of a kb (or the shared one), created on demand.
    pub fn get_db_upload_path(&self, db_id: Option<&str>) -> AppResult<PathBuf> {
        let dir = match db_id {
            Some(id) => self.kb_dir(id).join("uploads"),
            None => self.work_dir.join("uploads"),
        };
        std::fs::create_dir_all(&dir).map_err(|e| {
            AppError::Knowledge(format!("Failed to create upload directory {:?}: {}", dir, e))
        })?;
        Ok(dir)
    }

    // ---- retrieval ----

    /// Retrieve chunks for `query`, best first.
    #[instrument(skip(self, query, options), fields(backend = %self.backend_type()))]
    pub async fn query(
        &self,
        db_id: &str,
        query: &str,
        options: &QueryOptions,
    ) -> AppResult<Vec<ScoredChunk>> {
        let kb = self.record(db_id)?;
        let embedder = self.models.embedder(&kb.embed_info)?;
        let reranker = self.resolve_reranker(&kb, options);

        let plan = RetrievalPlan::resolve(
            options,
            &kb,
            self.backend.default_similarity_threshold(),
            reranker.is_some(),
        );
        debug!(
            "Query plan: top_k={}, recall_top_k={}, threshold={}, rerank={}",
            plan.top_k, plan.recall_top_k, plan.similarity_threshold, plan.use_reranker
        );

        retrieve(
            self.backend.as_ref(),
            &kb,
            embedder.as_ref(),
            reranker.as_deref(),
            query,
            &plan,
        )
        .await
    }

    fn resolve_reranker(
        &self,
        kb: &KnowledgeBaseRecord,
        options: &QueryOptions,
    ) -> Option<Arc<dyn Reranker>> {
        let settings = kb.reranker_settings();
        let wanted = options
            .use_reranker
            .or(kb.stored_query_options().use_reranker)
            .unwrap_or(settings.enabled);
        if !wanted {
            return None;
        }

        let Some(config) = settings
            .reranker
            .or_else(|| self.settings.default_reranker.clone())
        else {
            debug!("Reranking requested for {} but no reranker is configured", kb.id);
            return None;
        };

        match self.models.reranker(&config) {
            Ok(reranker) => Some(reranker),
            Err(e) => {
                warn!("Reranker '{}' unavailable: {}", config.model, e);
                None
            }
        }
    }

    pub async fn row_count(&self, db_id: &str) -> AppResult<Option<usize>> {
        self.backend.row_count(db_id).await
    }

    pub async fn list_collections(&self) -> AppResult<Vec<String>> {
        self.backend.list_collections().await
    }
}

/// Error text stored on a failed file record.
fn failure_message(err: &AppError) -> String {
    match err {
        AppError::Cancelled(_) => "Cancelled".to_string(),
        other => other.to_string(),
    }
}
