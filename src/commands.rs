use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use tracing::warn;

use crate::config::PublicAppConfig;
use crate::db::parse_timestamp;
use crate::errors::{AppError, AppResult};
use crate::history::{self, HistoryPage, HistoryPagination};
use crate::importer::{ImportOutcome, ImportRequest};
use crate::pricing::SkippedRow;
use crate::AppState;

#[derive(Debug, Clone, Default)]
pub struct UploadRequest {
    pub file_name: String,
    pub bytes: Vec<u8>,
    pub imported_by: Option<String>,
    /// RFC 3339 timestamp or a bare `YYYY-MM-DD` date; defaults to now.
    pub effective_date: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnresolvedStoreEntry {
    pub store: String,
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkippedSheetEntry {
    pub sheet: String,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkippedRowEntry {
    pub sheet: String,
    #[serde(flatten)]
    pub row: SkippedRow,
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadResponse {
    pub message: String,
    pub unresolved_stores: Vec<UnresolvedStoreEntry>,
    pub skipped_sheets: Vec<SkippedSheetEntry>,
    pub skipped_rows: Vec<SkippedRowEntry>,
    pub batch_id: i64,
    pub sheets_processed: usize,
    pub listings_created: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UndoResponse {
    pub message: String,
    pub deleted_prices: usize,
    pub deleted_import_id: i64,
}

#[derive(Debug, Serialize)]
pub struct ServiceHealth {
    pub db_path: Option<String>,
    pub config: PublicAppConfig,
    pub import_batches: i64,
}

pub async fn upload_price_list(
    state: &AppState,
    request: UploadRequest,
) -> Result<UploadResponse, String> {
    let effective_date = request
        .effective_date
        .as_deref()
        .map(parse_effective_date)
        .transpose()
        .map_err(|err| err.to_string())?;
    let import_request = ImportRequest {
        file_name: request.file_name,
        imported_by: request.imported_by,
        effective_date,
    };

    let outcome = state
        .importer()
        .import_bytes(&request.bytes, import_request)
        .await
        .map_err(|err| err.to_string())?;

    match outcome {
        ImportOutcome::Succeeded(report) => Ok(UploadResponse {
            message: "Price list processed successfully.".to_string(),
            unresolved_stores: report
                .unresolved_stores()
                .map(|(store, address)| UnresolvedStoreEntry {
                    store: store.to_string(),
                    address: address.to_string(),
                })
                .collect(),
            skipped_sheets: report
                .skipped_sheets()
                .map(|(sheet, error)| SkippedSheetEntry {
                    sheet: sheet.to_string(),
                    error: error.to_string(),
                })
                .collect(),
            skipped_rows: report
                .skipped_rows()
                .map(|(sheet, row)| SkippedRowEntry {
                    sheet: sheet.to_string(),
                    row: row.clone(),
                })
                .collect(),
            batch_id: report.batch_id,
            sheets_processed: report.sheets_processed(),
            listings_created: report.listings_created(),
        }),
        ImportOutcome::Failed { batch_id, error } => {
            warn!(target: "import", batch_id, error = %error, "upload rejected");
            Err(error.to_string())
        }
    }
}

pub fn undo_import(state: &AppState, batch_id: i64) -> Result<UndoResponse, String> {
    let report = {
        let connection = state.connection();
        let mut conn = connection.lock();
        history::undo_import(&mut conn, batch_id).map_err(|err| err.to_string())?
    };
    Ok(UndoResponse {
        message: format!(
            "Import {} reverted. {} price listings deleted.",
            report.deleted_import_id, report.deleted_prices
        ),
        deleted_prices: report.deleted_prices,
        deleted_import_id: report.deleted_import_id,
    })
}

pub fn list_import_history(
    state: &AppState,
    page: Option<usize>,
    page_size: Option<usize>,
) -> Result<HistoryPage, String> {
    let connection = state.connection();
    let conn = connection.lock();
    history::list_history(&conn, HistoryPagination::new(page, page_size))
        .map_err(|err| err.to_string())
}

pub fn service_health(state: &AppState) -> Result<ServiceHealth, String> {
    state.service_health().map_err(|err| err.to_string())
}

fn parse_effective_date(value: &str) -> AppResult<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        return date
            .and_hms_opt(0, 0, 0)
            .map(|naive| naive.and_utc())
            .ok_or_else(|| AppError::Parse(format!("invalid effective date '{value}'")));
    }
    parse_timestamp(value)
}
