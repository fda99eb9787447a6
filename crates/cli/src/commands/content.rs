//! Ingestion and file commands.

use super::{interrupt_token, print_json};
use clap::Args;
use knowbase_core::{AppError, AppResult};
use knowbase_knowledge::convert::SourceFormat;
use knowbase_knowledge::prepare::calculate_content_hash;
use knowbase_knowledge::{ContentKind, FileRecord, FileStatus, KnowledgeBaseManager, ProcessingParams};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Chunking flags shared by `add` and `reindex`.
#[derive(Args, Debug, Clone, Default)]
pub struct ChunkingArgs {
    /// Target chunk size in characters
    #[arg(long)]
    pub chunk_size: Option<usize>,

    /// Characters shared between neighbouring chunks
    #[arg(long)]
    pub chunk_overlap: Option<usize>,

    /// Split on a separator before chunking (question/answer documents)
    #[arg(long)]
    pub qa_split: bool,

    /// Separator for --qa-split, escaped (default "\n\n\n")
    #[arg(long, requires = "qa_split")]
    pub qa_separator: Option<String>,
}

impl ChunkingArgs {
    fn params(&self, kind: Option<ContentKind>) -> ProcessingParams {
        ProcessingParams {
            content_type: kind,
            chunk_size: self.chunk_size,
            chunk_overlap: self.chunk_overlap,
            use_qa_split: self.qa_split.then_some(true),
            qa_separator: self.qa_separator.clone(),
            ..Default::default()
        }
    }
}

/// Ingest files, directories or URLs
#[derive(Args, Debug)]
pub struct AddCommand {
    /// Knowledge base id
    pub id: String,

    /// Files or directories to ingest
    pub paths: Vec<PathBuf>,

    /// URLs to fetch and ingest; hosts must be in the url_fetch whitelist
    #[arg(long)]
    pub url: Vec<String>,

    /// Skip files whose content is already in the knowledge base
    #[arg(long)]
    pub skip_existing: bool,

    #[command(flatten)]
    pub chunking: ChunkingArgs,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

impl AddCommand {
    pub async fn execute(&self, manager: &KnowledgeBaseManager) -> AppResult<()> {
        if self.paths.is_empty() && self.url.is_empty() {
            return Err(AppError::Config(
                "Nothing to add: pass paths or --url".to_string(),
            ));
        }

        let mut files = Vec::new();
        for path in &self.paths {
            files.extend(collect_files(path)?);
        }

        if self.skip_existing {
            let mut fresh = Vec::with_capacity(files.len());
            for file in files {
                let seen = match calculate_content_hash(Path::new(&file)).await {
                    Ok(hash) => manager.file_existed_in_db(&self.id, &hash)?,
                    Err(_) => false,
                };
                if seen {
                    tracing::info!("Skipping {} (already ingested)", file);
                } else {
                    fresh.push(file);
                }
            }
            files = fresh;
        }

        tracing::info!(
            "Adding {} files and {} URLs to {}",
            files.len(),
            self.url.len(),
            self.id
        );

        let cancel = interrupt_token();
        let mut records = Vec::new();
        if !files.is_empty() {
            let params = self.chunking.params(None);
            records.extend(manager.add_content(&self.id, &files, &params, &cancel).await?);
        }
        if !self.url.is_empty() && !cancel.is_cancelled() {
            let params = self.chunking.params(Some(ContentKind::Url));
            records.extend(manager.add_content(&self.id, &self.url, &params, &cancel).await?);
        }

        report(&records, self.json)
    }
}

/// Files under `path`; directories are walked and filtered to supported
/// formats.
fn collect_files(path: &Path) -> AppResult<Vec<String>> {
    if !path.exists() {
        return Err(AppError::NotFound(format!("Path not found: {:?}", path)));
    }
    if path.is_file() {
        return Ok(vec![path.to_string_lossy().into_owned()]);
    }

    let mut files = Vec::new();
    for entry in WalkDir::new(path)
        .follow_links(true)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        let entry_path = entry.path();
        if !entry.file_type().is_file() {
            continue;
        }
        if SourceFormat::from_path(entry_path).is_none() {
            tracing::debug!("Skipping unsupported file: {:?}", entry_path);
            continue;
        }
        files.push(entry_path.to_string_lossy().into_owned());
    }
    files.sort();
    Ok(files)
}

fn report(records: &[FileRecord], json: bool) -> AppResult<()> {
    if json {
        return print_json(&records);
    }

    let done = records.iter().filter(|r| r.status == FileStatus::Done).count();
    for record in records {
        match record.error {
            Some(ref error) => println!("  FAILED {} ({}): {}", record.filename, record.file_id, error),
            None => println!("  ok     {} ({})", record.filename, record.file_id),
        }
    }
    println!("{} of {} items indexed", done, records.len());
    Ok(())
}

/// Re-index files already in a knowledge base
#[derive(Args, Debug)]
pub struct ReindexCommand {
    /// Knowledge base id
    pub id: String,

    /// File ids to re-index (default: every file)
    pub file_ids: Vec<String>,

    /// Only re-index files that failed
    #[arg(long)]
    pub failed: bool,

    #[command(flatten)]
    pub chunking: ChunkingArgs,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

impl ReindexCommand {
    pub async fn execute(&self, manager: &KnowledgeBaseManager) -> AppResult<()> {
        let file_ids = if self.file_ids.is_empty() {
            manager
                .get_database_info(&self.id)
                .await?
                .files
                .into_iter()
                .filter(|f| !f.is_folder)
                .filter(|f| !self.failed || f.status == FileStatus::Failed)
                .map(|f| f.file_id)
                .collect()
        } else {
            self.file_ids.clone()
        };

        tracing::info!("Re-indexing {} files in {}", file_ids.len(), self.id);
        let records = manager
            .update_content(
                &self.id,
                &file_ids,
                &self.chunking.params(None),
                &interrupt_token(),
            )
            .await?;

        report(&records, self.json)
    }
}

/// Delete a file and its chunks
#[derive(Args, Debug)]
pub struct DeleteFileCommand {
    /// Knowledge base id
    pub id: String,

    /// File or folder id
    pub file_id: String,
}

impl DeleteFileCommand {
    pub async fn execute(&self, manager: &KnowledgeBaseManager) -> AppResult<()> {
        manager.delete_file(&self.id, &self.file_id).await?;
        println!("Deleted {} from {}", self.file_id, self.id);
        Ok(())
    }
}

/// Show the stored chunks of a file
#[derive(Args, Debug)]
pub struct ChunksCommand {
    /// Knowledge base id
    pub id: String,

    /// File id
    pub file_id: String,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

impl ChunksCommand {
    pub async fn execute(&self, manager: &KnowledgeBaseManager) -> AppResult<()> {
        let info = manager.get_file_info(&self.id, &self.file_id).await?;

        if self.json {
            return print_json(&info);
        }

        println!(
            "{} [{}] - {} chunks",
            info.meta.filename,
            info.meta.status.as_str(),
            info.chunks.len()
        );
        for chunk in &info.chunks {
            println!("--- #{} ({})", chunk.chunk_index, chunk.id);
            println!("{}", chunk.content);
        }
        Ok(())
    }
}
