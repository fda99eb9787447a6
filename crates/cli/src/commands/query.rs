//! Retrieval command.

use super::print_json;
use clap::Args;
use knowbase_core::AppResult;
use knowbase_knowledge::{KnowledgeBaseManager, QueryOptions, ScoredChunk};

/// Retrieve chunks relevant to a question
#[derive(Args, Debug)]
pub struct QueryCommand {
    /// Knowledge base id
    pub id: String,

    /// Query text
    pub query: String,

    /// Number of chunks to return
    #[arg(short = 'k', long)]
    pub top_k: Option<usize>,

    /// Minimum similarity in [0, 1]
    #[arg(short = 't', long)]
    pub threshold: Option<f32>,

    /// Rerank candidates with the configured reranker
    #[arg(long, conflicts_with = "no_rerank")]
    pub rerank: bool,

    /// Skip reranking even when the knowledge base enables it
    #[arg(long)]
    pub no_rerank: bool,

    /// Candidates recalled before reranking
    #[arg(long)]
    pub recall_top_k: Option<usize>,

    /// Only search chunks from files whose name contains this text
    #[arg(long)]
    pub file_name: Option<String>,

    /// Include raw engine distances
    #[arg(long)]
    pub distances: bool,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

impl QueryCommand {
    fn options(&self) -> QueryOptions {
        let mut options = QueryOptions::new();
        options.top_k = self.top_k;
        options.similarity_threshold = self.threshold;
        options.recall_top_k = self.recall_top_k;
        options.file_name = self.file_name.clone();
        if self.rerank {
            options = options.with_reranker(true);
        } else if self.no_rerank {
            options = options.with_reranker(false);
        }
        if self.distances {
            options = options.with_distances();
        }
        options
    }

    pub async fn execute(&self, manager: &KnowledgeBaseManager) -> AppResult<()> {
        tracing::info!("Querying {}", self.id);

        let results = manager.query(&self.id, &self.query, &self.options()).await?;
        tracing::debug!("Query returned {} chunks", results.len());

        if self.json {
            return print_json(&results);
        }

        if results.is_empty() {
            println!("No matching chunks");
            return Ok(());
        }
        for (rank, chunk) in results.iter().enumerate() {
            println!("{}. {}", rank + 1, score_line(chunk));
            println!("{}", chunk.content);
            println!();
        }
        Ok(())
    }
}

fn score_line(chunk: &ScoredChunk) -> String {
    let mut line = format!(
        "{} #{} similarity={:.3}",
        chunk.filename, chunk.chunk_index, chunk.similarity
    );
    if let Some(score) = chunk.rerank_score {
        line.push_str(&format!(" rerank={:.3}", score));
    }
    if let Some(distance) = chunk.distance {
        line.push_str(&format!(" distance={:.4}", distance));
    }
    line
}
