//! Knowbase CLI
//!
//! Create knowledge bases on Chroma or Milvus, ingest documents into them
//! and run retrieval queries from the command line.

mod commands;

use clap::{Parser, Subcommand};
use commands::{
    AddCommand, CheckCommand, ChunksCommand, CreateCommand, DeleteCommand, DeleteFileCommand,
    InfoCommand, ListCommand, QueryCommand, ReindexCommand, StatsCommand, UpdateCommand,
};
use knowbase_core::{config::AppConfig, logging, AppResult};
use knowbase_knowledge::KnowledgeBaseManager;
use std::path::PathBuf;

/// Knowbase - knowledge base indexing and retrieval over vector engines
#[derive(Parser, Debug)]
#[command(name = "knowbase")]
#[command(about = "Knowledge base indexing and retrieval over Chroma and Milvus", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to workspace directory (default: current directory)
    #[arg(short, long, global = true, env = "KNOWBASE_WORKSPACE")]
    workspace: Option<PathBuf>,

    /// Path to config file
    #[arg(short, long, global = true, env = "KNOWBASE_CONFIG")]
    config: Option<PathBuf>,

    /// Directory for metadata and per-backend data
    #[arg(long, global = true, env = "KNOWBASE_WORK_DIR")]
    work_dir: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, global = true, env = "RUST_LOG")]
    log_level: Option<String>,

    /// Enable verbose output (sets log level to debug)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Disable colored output
    #[arg(long, global = true, env = "NO_COLOR")]
    no_color: bool,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a knowledge base
    Create(CreateCommand),

    /// List knowledge bases
    List(ListCommand),

    /// Show a knowledge base and its files
    Info(InfoCommand),

    /// Change name, description, embedding model or query defaults
    Update(UpdateCommand),

    /// Delete a knowledge base with all its vectors
    Delete(DeleteCommand),

    /// Ingest files, directories or URLs
    Add(AddCommand),

    /// Re-index files already in a knowledge base
    Reindex(ReindexCommand),

    /// Retrieve chunks relevant to a question
    Query(QueryCommand),

    /// Delete a file (or folder) and its chunks
    DeleteFile(DeleteFileCommand),

    /// Show the stored chunks of a file
    Chunks(ChunksCommand),

    /// Show counts across all knowledge bases
    Stats(StatsCommand),

    /// Compare metadata against the vector engines
    Check(CheckCommand),
}

impl Commands {
    fn name(&self) -> &'static str {
        match self {
            Commands::Create(_) => "create",
            Commands::List(_) => "list",
            Commands::Info(_) => "info",
            Commands::Update(_) => "update",
            Commands::Delete(_) => "delete",
            Commands::Add(_) => "add",
            Commands::Reindex(_) => "reindex",
            Commands::Query(_) => "query",
            Commands::DeleteFile(_) => "delete-file",
            Commands::Chunks(_) => "chunks",
            Commands::Stats(_) => "stats",
            Commands::Check(_) => "check",
        }
    }
}

#[tokio::main]
async fn main() -> AppResult<()> {
    // Parse command-line arguments first (needed for logging config)
    let cli = Cli::parse();

    let config = AppConfig::load_from(cli.workspace.clone(), cli.config.clone())?.with_overrides(
        cli.workspace,
        cli.config,
        cli.work_dir,
        cli.log_level,
        cli.verbose,
        cli.no_color,
        cli.json_logs,
    );

    logging::init_logging(config.log_level.as_deref(), config.no_color, config.json_logs)?;

    tracing::info!("Knowbase CLI starting");
    tracing::debug!("Workspace: {:?}", config.workspace);
    tracing::debug!("Data directory: {:?}", config.data_dir());

    config.validate()?;

    let _span = tracing::info_span!("command", name = cli.command.name()).entered();

    let manager = KnowledgeBaseManager::from_config(&config)?;

    let result = match cli.command {
        Commands::Create(cmd) => cmd.execute(&manager).await,
        Commands::List(cmd) => cmd.execute(&manager),
        Commands::Info(cmd) => cmd.execute(&manager).await,
        Commands::Update(cmd) => cmd.execute(&manager).await,
        Commands::Delete(cmd) => cmd.execute(&manager).await,
        Commands::Add(cmd) => cmd.execute(&manager).await,
        Commands::Reindex(cmd) => cmd.execute(&manager).await,
        Commands::Query(cmd) => cmd.execute(&manager).await,
        Commands::DeleteFile(cmd) => cmd.execute(&manager).await,
        Commands::Chunks(cmd) => cmd.execute(&manager).await,
        Commands::Stats(cmd) => cmd.execute(&manager),
        Commands::Check(cmd) => cmd.execute(&manager).await,
    };

    match &result {
        Ok(_) => tracing::info!("Command completed successfully"),
        Err(e) => tracing::error!("Command failed: {}", e),
    }

    result
}
