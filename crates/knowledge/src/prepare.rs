//! File and URL record preparation.
//!
//! Every ingested item gets a `FileRecord` in `processing` state before any
//! conversion or embedding starts, so a crash mid-ingestion leaves a trace
//! the stale-state pass can later correct.

use crate::types::{ContentKind, FileRecord, FileStatus, ProcessingParams};
use chrono::Utc;
use knowbase_core::AppResult;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::LazyLock;
use tokio::io::AsyncReadExt;
use url::Url;

/// Read size for incremental hashing.
const HASH_READ_SIZE: usize = 8 * 1024;

/// Hex SHA-256 of `input`, optionally salted with a random UUID and truncated.
pub fn hashstr(input: &str, length: Option<usize>, with_salt: bool) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    if with_salt {
        hasher.update(uuid::Uuid::new_v4().as_bytes());
    }
    let digest = format!("{:x}", hasher.finalize());
    match length {
        Some(len) if len < digest.len() => digest[..len].to_string(),
        _ => digest,
    }
}

/// SHA-256 of a file's bytes, read in fixed 8 KiB blocks.
pub async fn calculate_content_hash(path: &Path) -> AppResult<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_READ_SIZE];

    loop {
        let read = file.read(&mut buf).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

static UPLOAD_SUFFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<stem>.+)_\d{13}(?P<ext>\.[^.]+)?$").expect("upload suffix pattern")
});

/// Strip a `<name>_<13-digit-timestamp><ext>` uniqueness suffix.
pub fn strip_upload_suffix(name: &str) -> String {
    match UPLOAD_SUFFIX.captures(name) {
        Some(caps) => format!(
            "{}{}",
            &caps["stem"],
            caps.name("ext").map(|m| m.as_str()).unwrap_or("")
        ),
        None => name.to_string(),
    }
}

/// Display filename for a URL: its last path segment, falling back to the host.
pub fn filename_from_url(raw: &str) -> String {
    let Ok(url) = Url::parse(raw) else {
        return strip_upload_suffix(raw.rsplit('/').next().unwrap_or(raw));
    };

    let segment = url
        .path_segments()
        .and_then(|mut segments| segments.rfind(|s| !s.is_empty()))
        .map(str::to_string);

    match segment {
        Some(segment) => strip_upload_suffix(&segment),
        None => url.host_str().unwrap_or(raw).to_string(),
    }
}

fn extension_of(name: &str) -> String {
    Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .unwrap_or_default()
}

/// Mint a file id from the item path and the current time.
pub fn mint_file_id(item: &str) -> String {
    let now = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    format!("file_{}", hashstr(&format!("{}{}", item, now), Some(12), false))
}

/// Build the `processing` record for an item about to be ingested.
///
/// Hash failures are logged and leave `content_hash` empty; they never stop
/// ingestion.
pub async fn prepare_item_metadata(
    item: &str,
    kind: ContentKind,
    db_id: &str,
    params: &ProcessingParams,
) -> AppResult<FileRecord> {
    let (filename, path, file_type, content_hash) = match kind {
        ContentKind::File => {
            let file_path = Path::new(item);
            let filename = file_path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or(item)
                .to_string();
            let path = match tokio::fs::canonicalize(file_path).await {
                Ok(abs) => abs.to_string_lossy().into_owned(),
                Err(_) => item.to_string(),
            };
            let content_hash = match calculate_content_hash(file_path).await {
                Ok(hash) => Some(hash),
                Err(e) => {
                    tracing::warn!("Failed to calculate content hash for {}: {}", item, e);
                    None
                }
            };
            let file_type = extension_of(&filename);
            (filename, path, file_type, content_hash)
        }
        ContentKind::Url => {
            let filename = filename_from_url(item);
            let file_type = match extension_of(&filename) {
                ext if ext.is_empty() => "url".to_string(),
                ext => ext,
            };
            (filename, item.to_string(), file_type, None)
        }
    };

    Ok(FileRecord {
        file_id: mint_file_id(&path),
        database_id: db_id.to_string(),
        filename,
        path,
        file_type,
        status: FileStatus::Processing,
        content_hash,
        parent_id: params
            .extra
            .get("parent_id")
            .and_then(|v| v.as_str())
            .map(str::to_string),
        is_folder: false,
        processing_params: params.clone(),
        created_at: Utc::now(),
        updated_at: None,
        error: None,
    })
}
