use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use price_list_import_lib::{
    list_import_history, service_health, undo_import, upload_price_list, AppConfig, AppState,
    UploadRequest,
};
use serde::Serialize;

#[derive(Parser, Debug)]
#[command(name = "price-list-import", version, about = "Regional price-list importer")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Import a price-list workbook
    Import {
        /// Path to the .xlsx/.xls/.ods workbook
        path: PathBuf,
        /// Date the prices take effect (YYYY-MM-DD or RFC 3339); defaults to now
        #[arg(long)]
        effective_date: Option<String>,
        /// Identity recorded on the import batch
        #[arg(long)]
        imported_by: Option<String>,
    },
    /// Revert an import batch and the listings it created
    Undo {
        /// Import batch id
        id: i64,
    },
    /// List import batches, newest first
    History {
        #[arg(long)]
        page: Option<usize>,
        #[arg(long)]
        page_size: Option<usize>,
    },
    /// Print database location and effective configuration
    Health,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let state = AppState::initialize(AppConfig::from_env())
        .context("failed to initialise price database")?;

    match cli.command {
        Command::Import {
            path,
            effective_date,
            imported_by,
        } => {
            let bytes = std::fs::read(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let file_name = path
                .file_name()
                .map(|name| name.to_string_lossy().to_string())
                .unwrap_or_else(|| path.display().to_string());
            let response = upload_price_list(
                &state,
                UploadRequest {
                    file_name,
                    bytes,
                    imported_by,
                    effective_date,
                },
            )
            .await
            .map_err(|err| anyhow!(err))?;
            print_json(&response)
        }
        Command::Undo { id } => print_json(&undo_import(&state, id).map_err(|err| anyhow!(err))?),
        Command::History { page, page_size } => print_json(
            &list_import_history(&state, page, page_size).map_err(|err| anyhow!(err))?,
        ),
        Command::Health => print_json(&service_health(&state).map_err(|err| anyhow!(err))?),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
