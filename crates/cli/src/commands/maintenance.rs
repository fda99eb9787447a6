//! Statistics and consistency commands.

use super::print_json;
use clap::Args;
use knowbase_core::AppResult;
use knowbase_knowledge::KnowledgeBaseManager;

/// Show counts across all knowledge bases
#[derive(Args, Debug)]
pub struct StatsCommand {
    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

impl StatsCommand {
    pub fn execute(&self, manager: &KnowledgeBaseManager) -> AppResult<()> {
        let stats = manager.get_statistics()?;

        if self.json {
            return print_json(&stats);
        }

        println!("Knowledge bases: {}", stats.total_databases);
        for (backend, count) in &stats.databases_by_backend {
            println!("  {}: {}", backend, count);
        }
        println!("Files: {}", stats.total_files);
        for (status, count) in &stats.files_by_status {
            println!("  {}: {}", status, count);
        }
        Ok(())
    }
}

/// Compare metadata against the vector engines
#[derive(Args, Debug)]
pub struct CheckCommand {
    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

impl CheckCommand {
    pub async fn execute(&self, manager: &KnowledgeBaseManager) -> AppResult<()> {
        tracing::info!(
            "Checking {} backends for inconsistencies",
            manager.supported_backends().len()
        );
        let report = manager.detect_inconsistencies().await?;

        if self.json {
            return print_json(&report);
        }

        let clean = report.orphan_collections.is_empty()
            && report.missing_collections.is_empty()
            && report.missing_records.is_empty();
        if clean {
            println!("No inconsistencies found");
            return Ok(());
        }

        for (backend, name) in &report.orphan_collections {
            println!("orphan collection   {} {}", backend, name);
        }
        for (backend, id) in &report.missing_collections {
            println!("missing collection  {} {} (re-index its files)", backend, id);
        }
        for id in &report.missing_records {
            println!("missing record      {}", id);
        }
        Ok(())
    }
}
