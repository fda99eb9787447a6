//! Knowledge base lifecycle commands.

use super::print_json;
use clap::Args;
use knowbase_core::AppResult;
use knowbase_knowledge::{
    BackendType, DatabaseInfo, DatabaseUpdate, EmbedInfo, FileStatus, KnowledgeBaseManager,
};
use serde_json::{json, Map, Value};

/// Create a knowledge base
#[derive(Args, Debug)]
pub struct CreateCommand {
    /// Knowledge base name
    pub name: String,

    /// Vector engine (chroma, milvus)
    #[arg(short, long, default_value = "chroma")]
    pub backend: BackendType,

    #[arg(short, long, default_value = "")]
    pub description: String,

    /// Embedding provider (default: from config)
    #[arg(long)]
    pub embed_provider: Option<String>,

    /// Embedding model (default: from config)
    #[arg(long)]
    pub embed_model: Option<String>,

    /// Embedding dimension (default: from config)
    #[arg(long)]
    pub dimension: Option<usize>,

    /// Create a private knowledge base
    #[arg(long)]
    pub private: bool,

    /// Rerank query results with the configured reranker
    #[arg(long)]
    pub rerank: bool,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

impl CreateCommand {
    pub async fn execute(&self, manager: &KnowledgeBaseManager) -> AppResult<()> {
        tracing::info!("Creating {} knowledge base '{}'", self.backend, self.name);

        let mut extra = Map::new();
        if self.private {
            extra.insert("is_private".to_string(), Value::Bool(true));
        }
        if self.rerank {
            extra.insert("reranker_config".to_string(), json!({ "enabled": true }));
        }

        // Flags override individual fields of the configured model
        let embed_info = manager.default_embedding().cloned().map(|mut info| {
            if let Some(ref model) = self.embed_model {
                info.name = model.clone();
            }
            if let Some(ref provider) = self.embed_provider {
                info.provider = provider.clone();
            }
            if let Some(dimension) = self.dimension {
                info.dimension = dimension;
            }
            info
        });

        let record = manager
            .create_database(
                &self.name,
                &self.description,
                self.backend,
                embed_info,
                None,
                extra,
            )
            .await?;

        if self.json {
            print_json(&record)?;
        } else {
            println!(
                "Created knowledge base '{}' ({}) on {} with model '{}'",
                record.name,
                record.id,
                record.backend_type,
                record.embed_info.model_tag()
            );
        }
        Ok(())
    }
}

/// List knowledge bases
#[derive(Args, Debug)]
pub struct ListCommand {
    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

impl ListCommand {
    pub fn execute(&self, manager: &KnowledgeBaseManager) -> AppResult<()> {
        let databases = manager.list_databases()?;

        if self.json {
            return print_json(&databases);
        }

        if databases.is_empty() {
            println!("No knowledge bases");
            return Ok(());
        }
        for info in &databases {
            println!(
                "{}  {:<7} {}  ({})",
                info.record.id,
                info.record.backend_type.as_str(),
                info.record.name,
                file_summary(info)
            );
        }
        Ok(())
    }
}

fn file_summary(info: &DatabaseInfo) -> String {
    let files: Vec<_> = info.files.iter().filter(|f| !f.is_folder).collect();
    let failed = files
        .iter()
        .filter(|f| f.status == FileStatus::Failed)
        .count();
    if failed > 0 {
        format!("{} files, {} failed", files.len(), failed)
    } else {
        format!("{} files", files.len())
    }
}

/// Show a knowledge base and its files
#[derive(Args, Debug)]
pub struct InfoCommand {
    /// Knowledge base id
    pub id: String,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

impl InfoCommand {
    pub async fn execute(&self, manager: &KnowledgeBaseManager) -> AppResult<()> {
        let info = manager.get_database_info(&self.id).await?;

        if self.json {
            return print_json(&info);
        }

        println!("Knowledge base: {} ({})", info.record.name, info.record.id);
        println!("  Backend: {}", info.record.backend_type);
        println!(
            "  Embedding: {} / {} ({} dims)",
            info.record.embed_info.provider,
            info.record.embed_info.model_tag(),
            info.record.embed_info.dimension
        );
        if !info.record.description.is_empty() {
            println!("  Description: {}", info.record.description);
        }
        match info.row_count {
            Some(rows) => println!("  Vectors: {}", rows),
            None => println!("  Vectors: (no collection)"),
        }
        println!("  Files: {}", file_summary(&info));

        for file in &info.files {
            let marker = if file.is_folder { "/" } else { "" };
            print!("    {} {}{} [{}]", file.file_id, file.filename, marker, file.status.as_str());
            match file.error {
                Some(ref error) => println!(" {}", error),
                None => println!(),
            }
        }
        Ok(())
    }
}

/// Change a knowledge base's settings
#[derive(Args, Debug)]
pub struct UpdateCommand {
    /// Knowledge base id
    pub id: String,

    #[arg(long)]
    pub name: Option<String>,

    #[arg(long)]
    pub description: Option<String>,

    /// New embedding model; existing vectors are dropped on the next ingest
    #[arg(long)]
    pub embed_model: Option<String>,

    /// Dimension of the new embedding model
    #[arg(long, requires = "embed_model")]
    pub dimension: Option<usize>,

    /// Default number of results for queries
    #[arg(long)]
    pub top_k: Option<usize>,

    /// Default minimum similarity for queries
    #[arg(long)]
    pub similarity_threshold: Option<f32>,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

impl UpdateCommand {
    pub async fn execute(&self, manager: &KnowledgeBaseManager) -> AppResult<()> {
        let embed_info = match self.embed_model {
            Some(ref model) => {
                let current = manager.get_database_info(&self.id).await?.record.embed_info;
                Some(EmbedInfo {
                    name: model.clone(),
                    dimension: self.dimension.unwrap_or(current.dimension),
                    ..current
                })
            }
            None => None,
        };

        let record = manager
            .update_database(
                &self.id,
                DatabaseUpdate {
                    name: self.name.clone(),
                    description: self.description.clone(),
                    llm_info: None,
                    embed_info,
                },
            )
            .await?;

        if self.top_k.is_some() || self.similarity_threshold.is_some() {
            let mut options = record.stored_query_options();
            if let Some(top_k) = self.top_k {
                options = options.with_top_k(top_k);
            }
            if let Some(threshold) = self.similarity_threshold {
                options = options.with_similarity_threshold(threshold);
            }
            manager.update_query_params(&self.id, &options).await?;
        }

        if self.json {
            let info = manager.get_database_info(&self.id).await?;
            print_json(&info.record)?;
        } else {
            println!("Updated knowledge base '{}' ({})", record.name, record.id);
        }
        Ok(())
    }
}

/// Delete a knowledge base
#[derive(Args, Debug)]
pub struct DeleteCommand {
    /// Knowledge base id
    pub id: String,
}

impl DeleteCommand {
    pub async fn execute(&self, manager: &KnowledgeBaseManager) -> AppResult<()> {
        tracing::info!("Deleting knowledge base {}", self.id);
        manager.delete_database(&self.id).await?;
        println!("Knowledge base {} deleted", self.id);
        Ok(())
    }
}
