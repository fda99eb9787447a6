//! Knowledge base lifecycle against the in-memory engine.

use super::mock_embed;
use crate::backend::{ChromaBackend, MilvusBackend};
use crate::base::{DatabaseUpdate, KnowledgeBase, INTERRUPTED_MESSAGE};
use crate::convert::{BasicConverter, DocumentConverter};
use crate::engine::{MemoryEngine, VectorEngine};
use crate::metadata::MetadataStore;
use crate::models::ModelCache;
use crate::queue::ProcessingQueue;
use crate::types::{
    BackendType, ContentKind, FileStatus, ProcessingParams, QueryOptions,
};
use async_trait::async_trait;
use knowbase_core::AppResult;
use serde_json::{json, Map};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const FRANCE: &str = "# France\n\nParis is the capital of France. The Louvre museum is in Paris.";
const FRUIT: &str = "# Fruit\n\nBananas are rich in potassium and grow in tropical climates.";

struct Fixture {
    temp: TempDir,
    engine: Arc<MemoryEngine>,
    queue: Arc<ProcessingQueue>,
    base: KnowledgeBase,
}

fn chroma_fixture() -> Fixture {
    let temp = TempDir::new().unwrap();
    let engine = Arc::new(MemoryEngine::with_distances());
    let queue = Arc::new(ProcessingQueue::new());
    let base = KnowledgeBase::new(
        Arc::new(ChromaBackend::new(engine.clone())),
        temp.path().join("chroma_data"),
        queue.clone(),
        Arc::new(BasicConverter::new(5).unwrap()),
        Arc::new(ModelCache::default()),
    )
    .unwrap();

    Fixture {
        temp,
        engine,
        queue,
        base,
    }
}

fn write_doc(dir: &Path, name: &str, content: &str) -> String {
    let path = dir.join(name);
    std::fs::write(&path, content).unwrap();
    path.to_string_lossy().into_owned()
}

async fn create_kb(base: &KnowledgeBase, name: &str, model: &str) -> String {
    base.create_database(name, "test kb", mock_embed(model, 64), None, Map::new())
        .await
        .unwrap()
        .id
}

#[tokio::test]
async fn test_ingest_and_query() {
    let fx = chroma_fixture();
    let db_id = create_kb(&fx.base, "geo", "trigram-v1").await;
    let france = write_doc(fx.temp.path(), "france.md", FRANCE);
    let fruit = write_doc(fx.temp.path(), "fruit.md", FRUIT);

    let records = fx
        .base
        .add_content(
            &db_id,
            &[france, fruit],
            &ProcessingParams::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(records.len(), 2);
    assert!(records.iter().all(|r| r.status == FileStatus::Done));
    assert!(records.iter().all(|r| r.content_hash.is_some()));
    assert!(fx.queue.is_empty());

    let results = fx
        .base
        .query(
            &db_id,
            "Which city is the capital of France?",
            &QueryOptions::new().with_top_k(1),
        )
        .await
        .unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].file_id, records[0].file_id);
    assert_eq!(results[0].filename, "france.md");
    assert!(results[0].distance.is_none());

    let info = fx.base.get_database_info(&db_id).await.unwrap();
    assert_eq!(info.files.len(), 2);
    assert_eq!(info.row_count, Some(2));
}

#[tokio::test]
async fn test_one_bad_item_does_not_stop_the_batch() {
    let fx = chroma_fixture();
    let db_id = create_kb(&fx.base, "mixed", "trigram-v1").await;
    let good = write_doc(fx.temp.path(), "good.md", FRANCE);
    let binary = write_doc(fx.temp.path(), "scan.pdf", "%PDF-1.7");
    let missing = fx.temp.path().join("gone.txt").to_string_lossy().into_owned();

    let records = fx
        .base
        .add_content(
            &db_id,
            &[good, binary, missing],
            &ProcessingParams::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    let statuses: Vec<FileStatus> = records.iter().map(|r| r.status).collect();
    assert_eq!(
        statuses,
        vec![FileStatus::Done, FileStatus::Failed, FileStatus::Failed]
    );
    assert!(records[1].error.as_deref().unwrap().contains("Unsupported"));
    assert!(records[2].error.is_some());
    assert!(records[2].content_hash.is_none());

    let info = fx.base.get_database_info(&db_id).await.unwrap();
    assert_eq!(info.files.len(), 3);
    assert!(fx.queue.is_empty());

    let results = fx
        .base
        .query(&db_id, "capital of France", &QueryOptions::new().with_top_k(10))
        .await
        .unwrap();
    assert!(!results.is_empty());
    assert!(results.iter().all(|c| c.file_id == records[0].file_id));
}

#[tokio::test]
async fn test_delete_file_removes_chunks_then_record() {
    let fx = chroma_fixture();
    let db_id = create_kb(&fx.base, "del", "trigram-v1").await;
    let doc = write_doc(fx.temp.path(), "france.md", FRANCE);
    let file_id = fx
        .base
        .add_content(&db_id, &[doc], &ProcessingParams::default(), &CancellationToken::new())
        .await
        .unwrap()[0]
        .file_id
        .clone();

    assert!(!fx.base.get_file_chunks(&db_id, &file_id).await.unwrap().is_empty());

    fx.base.delete_file(&db_id, &file_id).await.unwrap();

    assert!(fx.base.get_file_chunks(&db_id, &file_id).await.unwrap().is_empty());
    assert!(fx
        .base
        .get_file_info(&db_id, &file_id)
        .await
        .unwrap_err()
        .is_not_found());
    assert_eq!(fx.engine.count(&db_id).await.unwrap(), 0);
}

#[tokio::test]
async fn test_delete_database_cascades() {
    let fx = chroma_fixture();
    let db_id = create_kb(&fx.base, "gone", "trigram-v1").await;
    let doc = write_doc(fx.temp.path(), "fruit.md", FRUIT);
    fx.base
        .add_content(&db_id, &[doc], &ProcessingParams::default(), &CancellationToken::new())
        .await
        .unwrap();
    let upload_dir = fx.base.get_db_upload_path(Some(&db_id)).unwrap();
    assert!(upload_dir.exists());

    fx.base.delete_database(&db_id).await.unwrap();

    assert!(!fx.base.has_database(&db_id));
    assert!(fx.base.all_files().is_empty());
    assert!(!fx.engine.has_collection(&db_id).await.unwrap());
    assert!(!fx.base.work_dir().join(&db_id).exists());
    assert!(fx.base.query(&db_id, "fruit", &QueryOptions::new()).await.unwrap_err().is_not_found());

    // Nothing left to remove
    fx.base.delete_database(&db_id).await.unwrap();
}

#[tokio::test]
async fn test_model_change_rebuilds_only_on_write() {
    let fx = chroma_fixture();
    let db_id = create_kb(&fx.base, "switch", "model-a").await;
    let first = write_doc(fx.temp.path(), "france.md", FRANCE);
    let first_id = fx
        .base
        .add_content(&db_id, &[first], &ProcessingParams::default(), &CancellationToken::new())
        .await
        .unwrap()[0]
        .file_id
        .clone();

    fx.base
        .update_database(
            &db_id,
            DatabaseUpdate {
                embed_info: Some(mock_embed("model-b", 64)),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    // Query sees the mismatch and returns nothing, leaving the collection alone
    let results = fx
        .base
        .query(&db_id, "capital of France", &QueryOptions::new())
        .await
        .unwrap();
    assert!(results.is_empty());
    let info = fx.engine.describe_collection(&db_id).await.unwrap().unwrap();
    assert_eq!(info.model_tag.as_deref(), Some("model-a"));
    assert_eq!(fx.engine.count(&db_id).await.unwrap(), 1);

    // The next ingestion rebuilds; vectors of the old model are gone
    let second = write_doc(fx.temp.path(), "fruit.md", FRUIT);
    fx.base
        .add_content(&db_id, &[second], &ProcessingParams::default(), &CancellationToken::new())
        .await
        .unwrap();

    let info = fx.engine.describe_collection(&db_id).await.unwrap().unwrap();
    assert_eq!(info.model_tag.as_deref(), Some("model-b"));
    assert!(fx.base.get_file_chunks(&db_id, &first_id).await.unwrap().is_empty());
    assert_eq!(fx.engine.count(&db_id).await.unwrap(), 1);
}

#[tokio::test]
async fn test_interrupted_records_fail_once() {
    let temp = TempDir::new().unwrap();
    let work_dir = temp.path().join("chroma_data");

    // A previous run died mid-ingest
    {
        let store = MetadataStore::open(&work_dir, BackendType::Chroma).unwrap();
        store
            .update(|doc| {
                doc.databases.insert(
                    "kb_crash".into(),
                    super::kb_record("kb_crash", BackendType::Chroma, "m"),
                );
            })
            .unwrap();
        let mut record = super::file_record("file_crash", "kb_crash");
        record.status = FileStatus::Processing;
        store.put_file(record).unwrap();
    }

    let base = KnowledgeBase::new(
        Arc::new(ChromaBackend::new(Arc::new(MemoryEngine::with_distances()))),
        &work_dir,
        Arc::new(ProcessingQueue::new()),
        Arc::new(BasicConverter::new(5).unwrap()),
        Arc::new(ModelCache::default()),
    )
    .unwrap();

    let info = base.get_database_info("kb_crash").await.unwrap();
    assert_eq!(info.files[0].status, FileStatus::Failed);
    assert_eq!(info.files[0].error.as_deref(), Some(INTERRUPTED_MESSAGE));
    let flipped_at = info.files[0].updated_at;

    assert_eq!(base.fail_stale_files(None).unwrap(), 0);
    let listed = base.list_databases().unwrap();
    assert_eq!(listed[0].files[0].updated_at, flipped_at);
}

#[tokio::test]
async fn test_in_flight_records_are_not_stale() {
    let fx = chroma_fixture();
    let db_id = create_kb(&fx.base, "busy", "m").await;
    let mut record = super::file_record("file_busy", &db_id);
    record.status = FileStatus::Processing;

    // Reach the store through a second handle, as a concurrent run would
    let store = MetadataStore::open(fx.base.work_dir(), BackendType::Chroma).unwrap();
    store.put_file(record).unwrap();
    fx.queue.mark_started("file_busy");

    let base = KnowledgeBase::new(
        Arc::new(ChromaBackend::new(fx.engine.clone())),
        fx.base.work_dir(),
        fx.queue.clone(),
        Arc::new(BasicConverter::new(5).unwrap()),
        Arc::new(ModelCache::default()),
    )
    .unwrap();
    assert_eq!(base.fail_stale_files(Some(&db_id)).unwrap(), 0);
    assert_eq!(
        base.get_database_info(&db_id).await.unwrap().files[0].status,
        FileStatus::Processing
    );
}

#[tokio::test]
async fn test_database_ids_are_prefixed_and_unique() {
    let fx = chroma_fixture();
    let a = create_kb(&fx.base, "same", "m").await;
    let b = create_kb(&fx.base, "same", "m").await;
    assert!(a.starts_with("kb_"));
    assert_eq!(a.len(), "kb_".len() + 32);
    assert_ne!(a, b);

    let mut metadata = Map::new();
    metadata.insert("is_private".into(), json!(true));
    let private = fx
        .base
        .create_database("secret", "", mock_embed("m", 64), None, metadata)
        .await
        .unwrap();
    assert!(private.id.starts_with("kb_private_"));
    assert!(fx.engine.has_collection(&private.id).await.unwrap());

    assert!(fx
        .base
        .create_database("  ", "", mock_embed("m", 64), None, Map::new())
        .await
        .is_err());
}

#[tokio::test]
async fn test_reindex_merges_params_and_replaces_chunks() {
    let fx = chroma_fixture();
    let db_id = create_kb(&fx.base, "reindex", "trigram-v1").await;
    let long = (0..12)
        .map(|i| format!("Sentence number {} talks about rivers and mountains.", i))
        .collect::<Vec<_>>()
        .join(" ");
    let doc = write_doc(fx.temp.path(), "long.txt", &long);

    let initial: ProcessingParams =
        serde_json::from_value(json!({"chunk_overlap": 0, "enable_ocr": "disable"})).unwrap();
    let file_id = fx
        .base
        .add_content(&db_id, &[doc], &initial, &CancellationToken::new())
        .await
        .unwrap()[0]
        .file_id
        .clone();
    assert_eq!(fx.base.get_file_chunks(&db_id, &file_id).await.unwrap().len(), 1);

    let request: ProcessingParams = serde_json::from_value(json!({"chunk_size": 120})).unwrap();
    let updated = fx
        .base
        .update_content(&db_id, &[file_id.clone()], &request, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(updated[0].status, FileStatus::Done);
    assert_eq!(updated[0].processing_params.chunk_size, Some(120));
    assert_eq!(updated[0].processing_params.chunk_overlap, Some(0));
    assert_eq!(
        updated[0].processing_params.extra.get("enable_ocr"),
        Some(&json!("disable"))
    );

    let chunks = fx.base.get_file_chunks(&db_id, &file_id).await.unwrap();
    assert!(chunks.len() > 1);
    assert!(chunks.windows(2).all(|w| w[0].chunk_index < w[1].chunk_index));
    assert_eq!(fx.engine.count(&db_id).await.unwrap(), chunks.len());
}

#[tokio::test]
async fn test_folders_and_moves() {
    let fx = chroma_fixture();
    let db_id = create_kb(&fx.base, "tree", "trigram-v1").await;

    let outer = fx.base.create_folder(&db_id, "outer", None).await.unwrap();
    let inner = fx
        .base
        .create_folder(&db_id, "inner", Some(&outer.file_id))
        .await
        .unwrap();
    assert!(outer.file_id.starts_with("folder-"));
    assert_eq!(inner.status, FileStatus::Done);

    assert!(fx
        .base
        .move_file(&db_id, &outer.file_id, Some(&outer.file_id))
        .await
        .is_err());
    assert!(fx
        .base
        .move_file(&db_id, &outer.file_id, Some(&inner.file_id))
        .await
        .is_err());

    let doc = write_doc(fx.temp.path(), "france.md", FRANCE);
    let file_id = fx
        .base
        .add_content(&db_id, &[doc], &ProcessingParams::default(), &CancellationToken::new())
        .await
        .unwrap()[0]
        .file_id
        .clone();
    let moved = fx
        .base
        .move_file(&db_id, &file_id, Some(&inner.file_id))
        .await
        .unwrap();
    assert_eq!(moved.parent_id.as_deref(), Some(inner.file_id.as_str()));

    fx.base.delete_file(&db_id, &outer.file_id).await.unwrap();

    let info = fx.base.get_database_info(&db_id).await.unwrap();
    assert!(info.files.is_empty());
    assert_eq!(fx.engine.count(&db_id).await.unwrap(), 0);
}

#[tokio::test]
async fn test_lookups() {
    let fx = chroma_fixture();
    let db_id = create_kb(&fx.base, "lookups", "trigram-v1").await;
    let good = write_doc(fx.temp.path(), "notes.md", FRANCE);
    let bad = write_doc(fx.temp.path(), "notes.pdf", FRUIT);

    let records = fx
        .base
        .add_content(&db_id, &[good, bad], &ProcessingParams::default(), &CancellationToken::new())
        .await
        .unwrap();

    let done_hash = records[0].content_hash.clone().unwrap();
    let failed_hash = records[1].content_hash.clone().unwrap();
    assert!(fx.base.file_existed_in_db(&db_id, &done_hash));
    assert!(!fx.base.file_existed_in_db(&db_id, &failed_hash));
    assert_eq!(fx.base.get_same_name_files(&db_id, "notes.md").len(), 1);
    assert!(fx.base.get_same_name_files(&db_id, "other.md").is_empty());
    assert!(fx
        .base
        .get_db_upload_path(None)
        .unwrap()
        .ends_with("chroma_data/uploads"));
}

#[tokio::test]
async fn test_stored_query_params_apply() {
    let fx = chroma_fixture();
    let db_id = create_kb(&fx.base, "params", "trigram-v1").await;
    let docs = [
        write_doc(fx.temp.path(), "a.md", FRANCE),
        write_doc(fx.temp.path(), "b.md", FRUIT),
    ];
    fx.base
        .add_content(&db_id, &docs, &ProcessingParams::default(), &CancellationToken::new())
        .await
        .unwrap();

    fx.base
        .update_query_params(&db_id, &QueryOptions::new().with_top_k(1))
        .await
        .unwrap();
    let stored = fx.base.query(&db_id, "Paris", &QueryOptions::new()).await.unwrap();
    assert_eq!(stored.len(), 1);

    let overridden = fx
        .base
        .query(&db_id, "Paris", &QueryOptions::new().with_top_k(2).with_distances())
        .await
        .unwrap();
    assert_eq!(overridden.len(), 2);
    assert!(overridden.iter().all(|c| c.distance.is_some()));
}

/// Never finishes; only cancellation gets a file past it.
struct StalledConverter;

#[async_trait]
impl DocumentConverter for StalledConverter {
    async fn convert(
        &self,
        _item: &str,
        _kind: ContentKind,
        _params: &ProcessingParams,
    ) -> AppResult<String> {
        std::future::pending().await
    }
}

#[tokio::test]
async fn test_cancellation_marks_file_failed() {
    let temp = TempDir::new().unwrap();
    let queue = Arc::new(ProcessingQueue::new());
    let base = KnowledgeBase::new(
        Arc::new(MilvusBackend::new(Arc::new(MemoryEngine::with_similarities()))),
        temp.path().join("milvus_data"),
        queue.clone(),
        Arc::new(StalledConverter),
        Arc::new(ModelCache::default()),
    )
    .unwrap();
    let db_id = create_kb(&base, "stuck", "m").await;

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let items = vec!["/nowhere/one.md".to_string(), "/nowhere/two.md".to_string()];
    let records = base
        .add_content(&db_id, &items, &ProcessingParams::default(), &cancel)
        .await
        .unwrap();

    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, FileStatus::Failed);
    assert_eq!(records[0].error.as_deref(), Some("Cancelled"));
    assert!(queue.is_empty());
    assert_eq!(base.get_database_info(&db_id).await.unwrap().files.len(), 1);
}

fn numbered_docs(dir: &Path, prefix: &str, count: usize) -> Vec<String> {
    (0..count)
        .map(|i| {
            write_doc(
                dir,
                &format!("{}-{}.md", prefix, i),
                &format!("# Note {}\n\n{} entry number {} about Paris.", i, prefix, i),
            )
        })
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stale_pass_leaves_live_ingestion_alone() {
    let Fixture { temp, base, .. } = chroma_fixture();
    let base = Arc::new(base);
    let db_id = create_kb(&base, "live", "m").await;
    let items = numbered_docs(temp.path(), "live", 150);

    let stop = Arc::new(AtomicBool::new(false));
    let sweeper = {
        let base = base.clone();
        let stop = stop.clone();
        tokio::task::spawn_blocking(move || {
            let mut flipped = 0;
            while !stop.load(Ordering::SeqCst) {
                flipped += base.fail_stale_files(None).unwrap();
            }
            flipped
        })
    };

    let records = base
        .add_content(&db_id, &items, &ProcessingParams::default(), &CancellationToken::new())
        .await
        .unwrap();
    stop.store(true, Ordering::SeqCst);

    assert_eq!(sweeper.await.unwrap(), 0);
    assert_eq!(records.len(), 150);
    let info = base.get_database_info(&db_id).await.unwrap();
    assert!(info.files.iter().all(|f| f.status == FileStatus::Done));
    assert!(info.files.iter().all(|f| f.error.is_none()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_ingestion_into_one_kb_keeps_every_record() {
    let fx = chroma_fixture();
    let db_id = create_kb(&fx.base, "shared", "m").await;
    let left = numbered_docs(fx.temp.path(), "left", 12);
    let right = numbered_docs(fx.temp.path(), "right", 12);
    let params = ProcessingParams::default();
    let cancel = CancellationToken::new();

    let (a, b) = tokio::join!(
        fx.base.add_content(&db_id, &left, &params, &cancel),
        fx.base.add_content(&db_id, &right, &params, &cancel),
    );
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_eq!(a.len() + b.len(), 24);

    let info = fx.base.get_database_info(&db_id).await.unwrap();
    assert_eq!(info.files.len(), 24);
    assert!(info.files.iter().all(|f| f.status == FileStatus::Done));
    assert_eq!(info.row_count, Some(24));

    // The metadata file on disk holds the same records
    let reopened = MetadataStore::open(fx.base.work_dir(), BackendType::Chroma).unwrap();
    assert_eq!(reopened.read(|doc| doc.files_of(&db_id).len()), 24);
    assert!(fx.queue.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_kb_lock_does_not_block_other_kbs() {
    let fx = chroma_fixture();
    let busy = create_kb(&fx.base, "busy", "m").await;
    let free = create_kb(&fx.base, "free", "m").await;
    let doc = write_doc(fx.temp.path(), "france.md", FRANCE);
    let params = ProcessingParams::default();
    let cancel = CancellationToken::new();

    let lock = fx.base.kb_lock(&busy);
    let held = lock.lock().await;

    let done = tokio::time::timeout(
        Duration::from_secs(5),
        fx.base.add_content(&free, std::slice::from_ref(&doc), &params, &cancel),
    )
    .await
    .expect("other kb blocked by a held lock")
    .unwrap();
    assert_eq!(done[0].status, FileStatus::Done);

    let blocked = tokio::time::timeout(
        Duration::from_millis(200),
        fx.base.add_content(&busy, std::slice::from_ref(&doc), &params, &cancel),
    )
    .await;
    assert!(blocked.is_err());

    drop(held);
    let records = fx
        .base
        .add_content(&busy, std::slice::from_ref(&doc), &params, &cancel)
        .await
        .unwrap();
    assert_eq!(records[0].status, FileStatus::Done);
}
