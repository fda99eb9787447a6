//! Entry point for callers.
//!
//! [`KnowledgeBaseManager`] holds one [`KnowledgeBase`] per backend type and
//! routes every call by knowledge base id. A global metadata file records
//! which backend owns which id, so routing survives restarts without asking
//! the engines.

use crate::backend::IngestPolicy;
use crate::base::{BaseSettings, DatabaseUpdate, KnowledgeBase};
use crate::convert::{BasicConverter, DocumentConverter, UrlPolicy};
use crate::models::ModelCache;
use crate::queue::ProcessingQueue;
use crate::registry::BackendRegistry;
use crate::types::{
    BackendType, ChunkRow, DatabaseInfo, EmbedInfo, FileInfo, FileRecord, FileStatus,
    InconsistencyReport, KnowledgeBaseRecord, ProcessingParams, QueryOptions, ScoredChunk,
    Statistics,
};
use chrono::{DateTime, Utc};
use knowbase_core::{AppConfig, AppError, AppResult};
use knowbase_models::RerankConfig;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const GLOBAL_METADATA_FILE: &str = "global_metadata.json";

/// Routing entry for one knowledge base.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalEntry {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub backend_type: BackendType,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub additional_params: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct GlobalMetadata {
    #[serde(default)]
    databases: BTreeMap<String, GlobalEntry>,
}

impl GlobalEntry {
    fn from_record(record: &KnowledgeBaseRecord) -> Self {
        Self {
            name: record.name.clone(),
            description: record.description.clone(),
            backend_type: record.backend_type,
            created_at: record.created_at,
            additional_params: record.metadata.clone(),
        }
    }
}

pub struct KnowledgeBaseManager {
    work_dir: PathBuf,
    bases: BTreeMap<BackendType, KnowledgeBase>,
    global: Mutex<GlobalMetadata>,
    queue: Arc<ProcessingQueue>,
    default_embed: Option<EmbedInfo>,
}

impl KnowledgeBaseManager {
    /// Open every registered backend under `work_dir`.
    pub fn new(
        work_dir: impl Into<PathBuf>,
        registry: &BackendRegistry,
        converter: Arc<dyn DocumentConverter>,
        models: Arc<ModelCache>,
        settings: BaseSettings,
    ) -> AppResult<Self> {
        let work_dir = work_dir.into();
        std::fs::create_dir_all(&work_dir).map_err(|e| {
            AppError::Knowledge(format!("Failed to create work directory {:?}: {}", work_dir, e))
        })?;

        let queue = Arc::new(ProcessingQueue::new());
        let mut bases = BTreeMap::new();
        for backend_type in registry.supported() {
            let base = KnowledgeBase::new(
                registry.create(backend_type)?,
                work_dir.join(format!("{}_data", backend_type)),
                Arc::clone(&queue),
                Arc::clone(&converter),
                Arc::clone(&models),
            )?
            .with_settings(settings.clone());
            bases.insert(backend_type, base);
        }

        let global = load_global(&work_dir.join(GLOBAL_METADATA_FILE))?;
        let manager = Self {
            work_dir,
            bases,
            global: Mutex::new(global),
            queue,
            default_embed: None,
        };
        manager.sync_global()?;

        info!(
            "Knowledge base manager ready: {} backends, {} knowledge bases",
            manager.bases.len(),
            manager.global().databases.len()
        );
        Ok(manager)
    }

    /// Manager over the REST engines and models named in `config`.
    pub fn from_config(config: &AppConfig) -> AppResult<Self> {
        config.ensure_work_dir()?;

        let settings = BaseSettings {
            ingest: IngestPolicy {
                concurrency: config.embedding.concurrency.max(1),
                batch_timeout: Duration::from_secs(config.embedding.timeout_secs),
            },
            default_reranker: config.reranker.as_ref().map(|r| {
                let mut rerank = RerankConfig::new(&r.provider, &r.model);
                rerank.timeout_secs = r.timeout_secs;
                if let Some(ref url) = r.base_url {
                    rerank = rerank.with_base_url(url);
                }
                if let Some(key) = r.api_key_env.as_ref().and_then(|v| std::env::var(v).ok()) {
                    rerank = rerank.with_api_key(key);
                }
                rerank
            }),
        };

        let manager = Self::new(
            config.data_dir(),
            &BackendRegistry::from_config(config),
            Arc::new(
                BasicConverter::new(config.url_fetch.timeout_secs)?
                    .with_url_policy(UrlPolicy::from_settings(&config.url_fetch)),
            ),
            Arc::new(ModelCache::new(config.embedding.timeout_secs)),
            settings,
        )?;
        Ok(manager.with_default_embedding(EmbedInfo::from(&config.embedding)))
    }

    /// Embedding model for knowledge bases created without one.
    pub fn with_default_embedding(mut self, embed_info: EmbedInfo) -> Self {
        self.default_embed = Some(embed_info);
        self
    }

    pub fn default_embedding(&self) -> Option<&EmbedInfo> {
        self.default_embed.as_ref()
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn queue(&self) -> &Arc<ProcessingQueue> {
        &self.queue
    }

    pub fn supported_backends(&self) -> Vec<BackendType> {
        self.bases.keys().copied().collect()
    }

    fn global(&self) -> std::sync::MutexGuard<'_, GlobalMetadata> {
        self.global.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn update_global<R>(&self, f: impl FnOnce(&mut GlobalMetadata) -> R) -> AppResult<R> {
        let mut global = self.global();
        let result = f(&mut global);
        save_global(&self.work_dir.join(GLOBAL_METADATA_FILE), &global)?;
        Ok(result)
    }

    /// Add routing entries for bases the backends know but the global file
    /// lost.
    fn sync_global(&self) -> AppResult<()> {
        let missing: Vec<KnowledgeBaseRecord> = {
            let global = self.global();
            self.bases
                .values()
                .flat_map(|base| {
                    base.database_ids()
                        .into_iter()
                        .filter(|id| !global.databases.contains_key(id))
                        .filter_map(|id| base.record(&id).ok())
                        .collect::<Vec<_>>()
                })
                .collect()
        };

        if missing.is_empty() {
            return Ok(());
        }
        warn!("Restoring {} knowledge bases missing from global metadata", missing.len());
        self.update_global(|global| {
            for record in &missing {
                global
                    .databases
                    .insert(record.id.clone(), GlobalEntry::from_record(record));
            }
        })
    }

    fn base(&self, backend_type: BackendType) -> AppResult<&KnowledgeBase> {
        self.bases.get(&backend_type).ok_or_else(|| {
            AppError::Config(format!("Backend '{}' is not enabled", backend_type))
        })
    }

    /// Backend owning `db_id`.
    fn route(&self, db_id: &str) -> AppResult<&KnowledgeBase> {
        let known = self.global().databases.get(db_id).map(|e| e.backend_type);
        if let Some(backend_type) = known {
            return self.base(backend_type);
        }

        self.bases
            .values()
            .find(|base| base.has_database(db_id))
            .ok_or_else(|| AppError::NotFound(format!("Knowledge base not found: {}", db_id)))
    }

    // ---- databases ----

    pub async fn create_database(
        &self,
        name: &str,
        description: &str,
        backend_type: BackendType,
        embed_info: Option<EmbedInfo>,
        llm_info: Option<Value>,
        extra: Map<String, Value>,
    ) -> AppResult<KnowledgeBaseRecord> {
        let embed_info = embed_info
            .or_else(|| self.default_embed.clone())
            .ok_or_else(|| {
                AppError::Config("No embedding model given and no default configured".to_string())
            })?;

        let record = self
            .base(backend_type)?
            .create_database(name, description, embed_info, llm_info, extra)
            .await?;

        self.update_global(|global| {
            global
                .databases
                .insert(record.id.clone(), GlobalEntry::from_record(&record));
        })?;
        Ok(record)
    }

    pub async fn delete_database(&self, db_id: &str) -> AppResult<()> {
        let base = self.route(db_id)?;
        base.delete_database(db_id).await?;
        self.update_global(|global| {
            global.databases.remove(db_id);
        })
    }

    pub async fn get_database_info(&self, db_id: &str) -> AppResult<DatabaseInfo> {
        self.route(db_id)?.get_database_info(db_id).await
    }

    /// Every knowledge base across backends, oldest first.
    pub fn list_databases(&self) -> AppResult<Vec<DatabaseInfo>> {
        let mut all = Vec::new();
        for base in self.bases.values() {
            all.extend(base.list_databases()?);
        }
        all.sort_by(|a, b| a.record.created_at.cmp(&b.record.created_at));
        Ok(all)
    }

    pub async fn update_database(
        &self,
        db_id: &str,
        update: DatabaseUpdate,
    ) -> AppResult<KnowledgeBaseRecord> {
        let record = self.route(db_id)?.update_database(db_id, update).await?;
        self.update_global(|global| {
            global
                .databases
                .insert(record.id.clone(), GlobalEntry::from_record(&record));
        })?;
        Ok(record)
    }

    pub async fn update_query_params(&self, db_id: &str, options: &QueryOptions) -> AppResult<()> {
        self.route(db_id)?.update_query_params(db_id, options).await
    }

    // ---- content ----

    pub async fn add_content(
        &self,
        db_id: &str,
        items: &[String],
        params: &ProcessingParams,
        cancel: &CancellationToken,
    ) -> AppResult<Vec<FileRecord>> {
        self.route(db_id)?.add_content(db_id, items, params, cancel).await
    }

    pub async fn update_content(
        &self,
        db_id: &str,
        file_ids: &[String],
        params: &ProcessingParams,
        cancel: &CancellationToken,
    ) -> AppResult<Vec<FileRecord>> {
        self.route(db_id)?
            .update_content(db_id, file_ids, params, cancel)
            .await
    }

    pub async fn query(
        &self,
        db_id: &str,
        text: &str,
        options: &QueryOptions,
    ) -> AppResult<Vec<ScoredChunk>> {
        self.route(db_id)?.query(db_id, text, options).await
    }

    pub async fn delete_file(&self, db_id: &str, file_id: &str) -> AppResult<()> {
        self.route(db_id)?.delete_file(db_id, file_id).await
    }

    pub async fn get_file_chunks(&self, db_id: &str, file_id: &str) -> AppResult<Vec<ChunkRow>> {
        self.route(db_id)?.get_file_chunks(db_id, file_id).await
    }

    pub async fn get_file_info(&self, db_id: &str, file_id: &str) -> AppResult<FileInfo> {
        self.route(db_id)?.get_file_info(db_id, file_id).await
    }

    pub async fn create_folder(
        &self,
        db_id: &str,
        name: &str,
        parent_id: Option<&str>,
    ) -> AppResult<FileRecord> {
        self.route(db_id)?.create_folder(db_id, name, parent_id).await
    }

    pub async fn delete_folder(&self, db_id: &str, folder_id: &str) -> AppResult<()> {
        self.route(db_id)?.delete_folder(db_id, folder_id).await
    }

    pub async fn move_file(
        &self,
        db_id: &str,
        file_id: &str,
        new_parent_id: Option<&str>,
    ) -> AppResult<FileRecord> {
        self.route(db_id)?
            .move_file(db_id, file_id, new_parent_id)
            .await
    }

    pub fn file_existed_in_db(&self, db_id: &str, content_hash: &str) -> AppResult<bool> {
        Ok(self.route(db_id)?.file_existed_in_db(db_id, content_hash))
    }

    pub fn get_same_name_files(&self, db_id: &str, filename: &str) -> AppResult<Vec<FileRecord>> {
        Ok(self.route(db_id)?.get_same_name_files(db_id, filename))
    }

    pub fn get_db_upload_path(&self, db_id: &str) -> AppResult<PathBuf> {
        self.route(db_id)?.get_db_upload_path(Some(db_id))
    }

    // ---- maintenance ----

    pub fn get_statistics(&self) -> AppResult<Statistics> {
        let mut stats = Statistics::default();

        for (backend_type, base) in &self.bases {
            base.fail_stale_files(None)?;
            let count = base.database_ids().len();
            stats.total_databases += count;
            stats
                .databases_by_backend
                .insert(backend_type.to_string(), count);

            for file in base.all_files().into_iter().filter(|f| !f.is_folder) {
                stats.total_files += 1;
                *stats
                    .files_by_status
                    .entry(file.status.as_str().to_string())
                    .or_default() += 1;
            }
        }

        Ok(stats)
    }

    /// Compare metadata with what the engines actually hold.
    ///
    /// Only reports; nothing is repaired. Engines that cannot be reached are
    /// skipped with a warning.
    pub async fn detect_inconsistencies(&self) -> AppResult<InconsistencyReport> {
        let mut report = InconsistencyReport::default();

        for (backend_type, base) in &self.bases {
            let known: HashSet<String> = base.database_ids().into_iter().collect();

            let collections = match base.list_collections().await {
                Ok(collections) => collections,
                Err(e) => {
                    warn!("Skipping {} consistency check: {}", backend_type, e);
                    continue;
                }
            };
            let present: HashSet<&str> = collections.iter().map(String::as_str).collect();

            for name in &collections {
                if name.starts_with("kb_") && !known.contains(name) {
                    report.orphan_collections.push((*backend_type, name.clone()));
                }
            }

            let mut indexed: Vec<String> = base
                .all_files()
                .into_iter()
                .filter(|f| f.status == FileStatus::Done && !f.is_folder)
                .map(|f| f.database_id)
                .filter(|id| known.contains(id) && !present.contains(id.as_str()))
                .collect();
            indexed.sort();
            indexed.dedup();
            report
                .missing_collections
                .extend(indexed.into_iter().map(|id| (*backend_type, id)));
        }

        let global: Vec<(String, BackendType)> = self
            .global()
            .databases
            .iter()
            .map(|(id, entry)| (id.clone(), entry.backend_type))
            .collect();
        for (id, backend_type) in global {
            let present = self
                .bases
                .get(&backend_type)
                .is_some_and(|base| base.has_database(&id));
            if !present {
                report.missing_records.push(id);
            }
        }

        debug!(
            "Consistency check: {} orphan, {} missing collections, {} missing records",
            report.orphan_collections.len(),
            report.missing_collections.len(),
            report.missing_records.len()
        );
        Ok(report)
    }
}

fn load_global(path: &Path) -> AppResult<GlobalMetadata> {
    if !path.exists() {
        return Ok(GlobalMetadata::default());
    }
    let raw = std::fs::read_to_string(path)
        .map_err(|e| AppError::Knowledge(format!("Failed to read {:?}: {}", path, e)))?;
    match serde_json::from_str(&raw) {
        Ok(global) => Ok(global),
        Err(e) => {
            // Rebuilt from the backend documents by sync_global
            warn!("Global metadata {:?} is unreadable ({}); rebuilding", path, e);
            Ok(GlobalMetadata::default())
        }
    }
}

fn save_global(path: &Path, global: &GlobalMetadata) -> AppResult<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let json = serde_json::to_string_pretty(global)?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| {
        AppError::Knowledge(format!("Failed to create temp file in {:?}: {}", dir, e))
    })?;
    tmp.write_all(json.as_bytes())?;
    tmp.persist(path).map_err(|e| {
        AppError::Knowledge(format!("Failed to write global metadata to {:?}: {}", path, e))
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendAdapter, ChromaBackend, MilvusBackend};
    use crate::engine::{CollectionSpec, MemoryEngine, VectorEngine};
    use crate::tests::mock_embed;
    use tempfile::TempDir;

    struct Engines {
        chroma: Arc<MemoryEngine>,
        milvus: Arc<MemoryEngine>,
    }

    fn memory_registry() -> (BackendRegistry, Engines) {
        let engines = Engines {
            chroma: Arc::new(MemoryEngine::with_distances()),
            milvus: Arc::new(MemoryEngine::with_similarities()),
        };
        let chroma = Arc::clone(&engines.chroma);
        let milvus = Arc::clone(&engines.milvus);

        let registry = BackendRegistry::new()
            .register(BackendType::Chroma, move || {
                Ok(Arc::new(ChromaBackend::new(chroma.clone())) as Arc<dyn BackendAdapter>)
            })
            .register(BackendType::Milvus, move || {
                Ok(Arc::new(MilvusBackend::new(milvus.clone())) as Arc<dyn BackendAdapter>)
            });
        (registry, engines)
    }

    fn open(dir: &Path, registry: &BackendRegistry) -> KnowledgeBaseManager {
        KnowledgeBaseManager::new(
            dir,
            registry,
            Arc::new(BasicConverter::new(5).unwrap()),
            Arc::new(ModelCache::default()),
            BaseSettings::default(),
        )
        .unwrap()
        .with_default_embedding(mock_embed("trigram-v1", 64))
    }

    fn doc(dir: &Path, name: &str, content: &str) -> String {
        let path = dir.join(name);
        std::fs::write(&path, content).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[tokio::test]
    async fn test_routes_by_id_across_backends() {
        let temp = TempDir::new().unwrap();
        let (registry, engines) = memory_registry();
        let manager = open(temp.path(), &registry);

        let chroma = manager
            .create_database("notes", "", BackendType::Chroma, None, None, Map::new())
            .await
            .unwrap();
        let milvus = manager
            .create_database("papers", "", BackendType::Milvus, None, None, Map::new())
            .await
            .unwrap();

        let item = doc(temp.path(), "paris.md", "The capital of France is Paris.");
        let records = manager
            .add_content(
                &milvus.id,
                &[item],
                &ProcessingParams::default(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(records[0].status, FileStatus::Done);

        assert!(engines.milvus.has_collection(&milvus.id).await.unwrap());
        assert!(!engines.milvus.has_collection(&chroma.id).await.unwrap());
        assert_eq!(engines.milvus.count(&milvus.id).await.unwrap(), 1);

        let hits = manager
            .query(
                &milvus.id,
                "capital of France",
                &QueryOptions::new().with_top_k(1),
            )
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].content.contains("Paris"));
        assert!(hits[0].similarity >= 0.2);

        let listed = manager.list_databases().unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].record.id, chroma.id);
        assert_eq!(
            manager.get_db_upload_path(&chroma.id).unwrap(),
            temp.path().join("chroma_data").join(&chroma.id).join("uploads")
        );
    }

    #[tokio::test]
    async fn test_unknown_ids_are_not_found() {
        let temp = TempDir::new().unwrap();
        let (registry, _engines) = memory_registry();
        let manager = open(temp.path(), &registry);

        let err = manager
            .query("kb_missing", "anything", &QueryOptions::new())
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(err.status_code(), 404);
        assert!(manager.delete_database("kb_missing").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_global_metadata_survives_restart() {
        let temp = TempDir::new().unwrap();
        let (registry, _engines) = memory_registry();
        let created = {
            let manager = open(temp.path(), &registry);
            manager
                .create_database("kept", "desc", BackendType::Milvus, None, None, Map::new())
                .await
                .unwrap()
        };

        let raw = std::fs::read_to_string(temp.path().join(GLOBAL_METADATA_FILE)).unwrap();
        assert!(raw.contains(&created.id));

        // Losing the global file is healed from the backend documents
        std::fs::remove_file(temp.path().join(GLOBAL_METADATA_FILE)).unwrap();
        let manager = open(temp.path(), &registry);
        let info = manager.get_database_info(&created.id).await.unwrap();
        assert_eq!(info.record.backend_type, BackendType::Milvus);
        assert!(manager.global().databases.contains_key(&created.id));
    }

    #[tokio::test]
    async fn test_update_and_delete_keep_global_in_step() {
        let temp = TempDir::new().unwrap();
        let (registry, engines) = memory_registry();
        let manager = open(temp.path(), &registry);
        let kb = manager
            .create_database("old", "", BackendType::Chroma, None, None, Map::new())
            .await
            .unwrap();

        manager
            .update_database(
                &kb.id,
                DatabaseUpdate {
                    name: Some("new".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(manager.global().databases[&kb.id].name, "new");

        manager.delete_database(&kb.id).await.unwrap();
        assert!(manager.global().databases.is_empty());
        assert!(!engines.chroma.has_collection(&kb.id).await.unwrap());
        assert!(manager.get_database_info(&kb.id).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_statistics() {
        let temp = TempDir::new().unwrap();
        let (registry, _engines) = memory_registry();
        let manager = open(temp.path(), &registry);
        let kb = manager
            .create_database("stats", "", BackendType::Chroma, None, None, Map::new())
            .await
            .unwrap();
        manager
            .create_database("empty", "", BackendType::Milvus, None, None, Map::new())
            .await
            .unwrap();

        let items = vec![
            doc(temp.path(), "ok.md", "Rivers flow to the sea."),
            doc(temp.path(), "bad.docx", "binary"),
        ];
        manager
            .add_content(&kb.id, &items, &ProcessingParams::default(), &CancellationToken::new())
            .await
            .unwrap();
        manager.create_folder(&kb.id, "folder", None).await.unwrap();

        let stats = manager.get_statistics().unwrap();
        assert_eq!(stats.total_databases, 2);
        assert_eq!(stats.databases_by_backend["chroma"], 1);
        assert_eq!(stats.databases_by_backend["milvus"], 1);
        assert_eq!(stats.total_files, 2);
        assert_eq!(stats.files_by_status["done"], 1);
        assert_eq!(stats.files_by_status["failed"], 1);
    }

    #[tokio::test]
    async fn test_detect_inconsistencies() {
        let temp = TempDir::new().unwrap();
        let (registry, engines) = memory_registry();
        let manager = open(temp.path(), &registry);
        let kb = manager
            .create_database("check", "", BackendType::Chroma, None, None, Map::new())
            .await
            .unwrap();
        let item = doc(temp.path(), "a.md", "Mountains are tall.");
        manager
            .add_content(&kb.id, &[item], &ProcessingParams::default(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            manager.detect_inconsistencies().await.unwrap().orphan_collections,
            vec![]
        );

        engines.chroma.drop_collection(&kb.id).await.unwrap();
        engines
            .milvus
            .create_collection(&CollectionSpec {
                name: "kb_stray".into(),
                dimension: 8,
                model_tag: "m".into(),
                description: String::new(),
                metadata: Map::new(),
            })
            .await
            .unwrap();

        let report = manager.detect_inconsistencies().await.unwrap();
        assert_eq!(
            report.orphan_collections,
            vec![(BackendType::Milvus, "kb_stray".to_string())]
        );
        assert_eq!(report.missing_collections, vec![(BackendType::Chroma, kb.id)]);
        assert!(report.missing_records.is_empty());
    }
}
