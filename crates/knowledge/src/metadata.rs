//! Per-backend metadata document.
//!
//! Holds every knowledge base and file record of one backend type in a
//! single JSON file, rewritten wholesale after each mutation. Writes go to a
//! temporary file in the same directory and are renamed into place; the
//! previous version is kept as `<file>.backup` and used when the main file
//! cannot be parsed.

use crate::types::{BackendType, FileRecord, KnowledgeBaseRecord};
use chrono::{DateTime, Utc};
use knowbase_core::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// On-disk layout of a metadata file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetadataDoc {
    #[serde(default)]
    pub databases: BTreeMap<String, KnowledgeBaseRecord>,
    #[serde(default)]
    pub files: BTreeMap<String, FileRecord>,
    #[serde(default)]
    pub backend_type: Option<BackendType>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl MetadataDoc {
    /// Files of one knowledge base, newest first.
    pub fn files_of(&self, db_id: &str) -> Vec<FileRecord> {
        let mut files: Vec<FileRecord> = self
            .files
            .values()
            .filter(|f| f.database_id == db_id)
            .cloned()
            .collect();
        files.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        files
    }
}

/// Metadata file plus its in-memory copy.
pub struct MetadataStore {
    path: PathBuf,
    backend: BackendType,
    doc: Mutex<MetadataDoc>,
}

impl MetadataStore {
    /// Load `metadata_<backend>.json` from `dir`, creating the directory.
    pub fn open(dir: &Path, backend: BackendType) -> AppResult<Self> {
        fs::create_dir_all(dir).map_err(|e| {
            AppError::Knowledge(format!("Failed to create metadata directory {:?}: {}", dir, e))
        })?;

        let path = dir.join(format!("metadata_{}.json", backend));
        let mut doc = load_with_backup(&path)?;
        doc.backend_type = Some(backend);

        tracing::debug!(
            "Loaded {} metadata: {} databases, {} files",
            backend,
            doc.databases.len(),
            doc.files.len()
        );

        Ok(Self {
            path,
            backend,
            doc: Mutex::new(doc),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run `f` against the current document.
    pub fn read<R>(&self, f: impl FnOnce(&MetadataDoc) -> R) -> R {
        let doc = self.doc.lock().unwrap_or_else(|e| e.into_inner());
        f(&doc)
    }

    /// Mutate the document and persist it before releasing the lock.
    pub fn update<R>(&self, f: impl FnOnce(&mut MetadataDoc) -> R) -> AppResult<R> {
        let mut doc = self.doc.lock().unwrap_or_else(|e| e.into_inner());
        let result = f(&mut doc);
        doc.updated_at = Some(Utc::now());
        doc.backend_type = Some(self.backend);
        write_atomic(&self.path, &doc)?;
        Ok(result)
    }

    pub fn database(&self, db_id: &str) -> Option<KnowledgeBaseRecord> {
        self.read(|doc| doc.databases.get(db_id).cloned())
    }

    pub fn file(&self, file_id: &str) -> Option<FileRecord> {
        self.read(|doc| doc.files.get(file_id).cloned())
    }

    /// Insert or replace one file record.
    pub fn put_file(&self, record: FileRecord) -> AppResult<()> {
        self.update(|doc| {
            doc.files.insert(record.file_id.clone(), record);
        })
    }
}

fn backup_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".backup");
    PathBuf::from(name)
}

fn parse(path: &Path) -> AppResult<MetadataDoc> {
    let raw = fs::read_to_string(path)
        .map_err(|e| AppError::Knowledge(format!("Failed to read {:?}: {}", path, e)))?;
    serde_json::from_str(&raw)
        .map_err(|e| AppError::Serialization(format!("Failed to parse {:?}: {}", path, e)))
}

fn load_with_backup(path: &Path) -> AppResult<MetadataDoc> {
    let backup = backup_path(path);

    if !path.exists() {
        if backup.exists() {
            tracing::warn!("Metadata file {:?} missing, restoring from backup", path);
            return parse(&backup);
        }
        return Ok(MetadataDoc::default());
    }

    match parse(path) {
        Ok(doc) => Ok(doc),
        Err(e) if backup.exists() => {
            tracing::warn!("{}; loading backup {:?}", e, backup);
            parse(&backup)
        }
        Err(e) => Err(e),
    }
}

fn write_atomic(path: &Path, doc: &MetadataDoc) -> AppResult<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let json = serde_json::to_string_pretty(doc)?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| {
        AppError::Knowledge(format!("Failed to create temp file in {:?}: {}", dir, e))
    })?;
    tmp.write_all(json.as_bytes())?;
    tmp.as_file().sync_all()?;

    if path.exists() {
        if let Err(e) = fs::copy(path, backup_path(path)) {
            tracing::warn!("Failed to back up {:?}: {}", path, e);
        }
    }

    tmp.persist(path).map_err(|e| {
        AppError::Knowledge(format!("Failed to write metadata to {:?}: {}", path, e))
    })?;
    Ok(())
}
