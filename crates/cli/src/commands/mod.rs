//! Command handlers for the knowbase CLI.

pub mod content;
pub mod database;
pub mod maintenance;
pub mod query;

pub use content::{AddCommand, ChunksCommand, DeleteFileCommand, ReindexCommand};
pub use database::{CreateCommand, DeleteCommand, InfoCommand, ListCommand, UpdateCommand};
pub use maintenance::{CheckCommand, StatsCommand};
pub use query::QueryCommand;

use knowbase_core::AppResult;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

/// Print a value as pretty JSON on stdout.
pub(crate) fn print_json<T: Serialize>(value: &T) -> AppResult<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Token cancelled on Ctrl-C, so an interrupted ingest still records the
/// file it was working on.
pub(crate) fn interrupt_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted; finishing the current file as cancelled");
            trigger.cancel();
        }
    });
    token
}
