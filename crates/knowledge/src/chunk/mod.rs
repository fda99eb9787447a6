//! Markdown-aware chunking.
//!
//! Text is split by `text-splitter`'s markdown splitter, which prefers
//! heading, paragraph and sentence boundaries and only falls back to
//! character windows when a section exceeds the target size. Consecutive
//! chunks share up to `chunk_overlap` characters.
//!
//! An optional separator (for example `\n\n\n` between question/answer
//! pairs) partitions the document first; each segment is then split on its
//! own so author-placed markers always end a chunk.

mod separator;

pub use separator::unescape_separator;

use crate::types::ProcessingParams;
use knowbase_core::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use text_splitter::{ChunkConfig as SplitterConfig, MarkdownSplitter};

pub const DEFAULT_CHUNK_SIZE: usize = 1000;
pub const DEFAULT_CHUNK_OVERLAP: usize = 200;
pub const DEFAULT_QA_SEPARATOR: &str = "\\n\\n\\n";

/// Whether a chunk came from plain splitting or a separator pre-split.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkType {
    Normal,
    Qa,
}

impl ChunkType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkType::Normal => "normal",
            ChunkType::Qa => "qa",
        }
    }
}

/// An indexable span of a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    /// `{file_id}_chunk_{index}`
    pub chunk_id: String,
    pub file_id: String,
    pub content: String,
    /// Source filename
    pub source: String,
    /// 0-based position in document order
    pub chunk_index: usize,
    pub chunk_type: ChunkType,
    /// Byte range of `content` in the original text
    pub byte_range: (usize, usize),
}

/// Chunking parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkConfig {
    /// Target chunk size in characters
    pub chunk_size: usize,

    /// Characters carried over between neighbouring chunks
    pub chunk_overlap: usize,

    /// Unescaped separator for the optional pre-split
    pub separator: Option<String>,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_overlap: DEFAULT_CHUNK_OVERLAP,
            separator: None,
        }
    }
}

impl ChunkConfig {
    /// Derive chunking settings from per-item processing params.
    pub fn from_params(params: &ProcessingParams) -> Self {
        let separator = if params.use_qa_split.unwrap_or(false) {
            let raw = params
                .qa_separator
                .as_deref()
                .unwrap_or(DEFAULT_QA_SEPARATOR);
            Some(unescape_separator(raw))
        } else {
            None
        };

        Self {
            chunk_size: params.chunk_size.unwrap_or(DEFAULT_CHUNK_SIZE),
            chunk_overlap: params.chunk_overlap.unwrap_or(DEFAULT_CHUNK_OVERLAP),
            separator: separator.filter(|s| !s.is_empty()),
        }
    }

    /// Overlap must stay below the chunk size; anything larger is halved down.
    fn effective_overlap(&self) -> usize {
        if self.chunk_overlap < self.chunk_size {
            self.chunk_overlap
        } else {
            self.chunk_size / 2
        }
    }
}

/// Splits documents into ordered, overlapping chunks.
pub struct ChunkingEngine {
    config: ChunkConfig,
}

impl ChunkingEngine {
    pub fn new(config: ChunkConfig) -> Self {
        Self { config }
    }

    /// Split `text` into `(byte_offset, content)` spans in document order.
    ///
    /// Empty segments and whitespace-only spans are dropped.
    pub fn split<'t>(&self, text: &'t str) -> AppResult<Vec<(usize, &'t str)>> {
        if self.config.chunk_size == 0 {
            return Err(AppError::Knowledge("chunk_size must be > 0".to_string()));
        }

        let splitter_config = SplitterConfig::new(self.config.chunk_size)
            .with_overlap(self.config.effective_overlap())
            .map_err(|e| AppError::Knowledge(format!("Invalid chunk settings: {}", e)))?;
        let splitter = MarkdownSplitter::new(splitter_config);

        let segments: Vec<(usize, &str)> = match self.config.separator {
            Some(ref separator) => separator::segments(text, separator),
            None => vec![(0, text)],
        };

        let mut spans = Vec::new();
        for (segment_offset, segment) in segments {
            if segment.trim().is_empty() {
                continue;
            }
            for (offset, piece) in splitter.chunk_indices(segment) {
                if piece.trim().is_empty() {
                    continue;
                }
                spans.push((segment_offset + offset, piece));
            }
        }

        Ok(spans)
    }

    /// Chunk a converted document belonging to `file_id`.
    pub fn process(&self, file_id: &str, filename: &str, text: &str) -> AppResult<Vec<Chunk>> {
        let chunk_type = if self.config.separator.is_some() {
            ChunkType::Qa
        } else {
            ChunkType::Normal
        };

        let chunks: Vec<Chunk> = self
            .split(text)?
            .into_iter()
            .enumerate()
            .map(|(index, (offset, piece))| Chunk {
                chunk_id: format!("{}_chunk_{}", file_id, index),
                file_id: file_id.to_string(),
                content: piece.trim().to_string(),
                source: filename.to_string(),
                chunk_index: index,
                chunk_type,
                byte_range: (offset, offset + piece.len()),
            })
            .collect();

        tracing::debug!(
            "Split {} into {} chunks ({} bytes, size={}, overlap={})",
            filename,
            chunks.len(),
            text.len(),
            self.config.chunk_size,
            self.config.effective_overlap()
        );

        Ok(chunks)
    }
}
