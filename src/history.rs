use std::cmp;

use rusqlite::{Connection, OptionalExtension, Row};
use serde::Serialize;
use tracing::info;

use crate::errors::{AppError, AppResult};

const DEFAULT_PAGE_SIZE: usize = 20;
const MAX_PAGE_SIZE: usize = 100;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImportBatch {
    pub id: i64,
    pub file_name: String,
    pub imported_by: Option<String>,
    pub effective_date: String,
    pub success: bool,
    pub message: String,
    pub batch_key: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct NewImportBatch<'a> {
    pub file_name: &'a str,
    pub imported_by: Option<&'a str>,
    pub effective_date: &'a str,
    pub success: bool,
    pub message: &'a str,
    pub batch_key: &'a str,
}

#[derive(Debug, Clone, Copy)]
pub struct HistoryPagination {
    pub page: usize,
    pub page_size: usize,
}

impl HistoryPagination {
    pub fn new(page: Option<usize>, page_size: Option<usize>) -> Self {
        Self {
            page: page.unwrap_or(1).max(1),
            page_size: page_size.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE),
        }
    }

    fn with_total(self, total: usize) -> Self {
        if total == 0 {
            return Self {
                page: 1,
                page_size: self.page_size,
            };
        }
        let pages = total.div_ceil(self.page_size);
        Self {
            page: cmp::min(self.page, pages).max(1),
            page_size: self.page_size,
        }
    }

    fn offset(&self) -> i64 {
        self.page.saturating_sub(1).saturating_mul(self.page_size) as i64
    }
}

impl Default for HistoryPagination {
    fn default() -> Self {
        Self::new(None, None)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HistoryPage {
    pub rows: Vec<ImportBatch>,
    pub total: usize,
    pub page: usize,
    pub page_size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UndoReport {
    pub deleted_prices: usize,
    pub deleted_import_id: i64,
}

pub fn log_import(connection: &Connection, batch: &NewImportBatch<'_>) -> AppResult<i64> {
    connection.execute(
        "INSERT INTO import_batches
            (file_name, imported_by, effective_date, success, message, batch_key)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        (
            batch.file_name,
            batch.imported_by,
            batch.effective_date,
            batch.success,
            batch.message,
            batch.batch_key,
        ),
    )?;
    Ok(connection.last_insert_rowid())
}

pub fn get_batch(connection: &Connection, batch_id: i64) -> AppResult<ImportBatch> {
    connection
        .query_row(
            "SELECT id, file_name, imported_by, effective_date, success, message, batch_key, created_at
            FROM import_batches
            WHERE id = ?1",
            [batch_id],
            batch_from_row,
        )
        .optional()?
        .ok_or_else(|| AppError::NotFound(format!("import batch {batch_id}")))
}

/// Newest effective date first.
pub fn list_history(
    connection: &Connection,
    pagination: HistoryPagination,
) -> AppResult<HistoryPage> {
    let total: i64 =
        connection.query_row("SELECT COUNT(*) FROM import_batches", [], |row| row.get(0))?;
    let total = total as usize;
    let pagination = pagination.with_total(total);

    let mut stmt = connection.prepare(
        "SELECT id, file_name, imported_by, effective_date, success, message, batch_key, created_at
        FROM import_batches
        ORDER BY effective_date DESC, id DESC
        LIMIT ?1 OFFSET ?2",
    )?;
    let rows = stmt
        .query_map(
            (pagination.page_size as i64, pagination.offset()),
            batch_from_row,
        )?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(HistoryPage {
        rows,
        total,
        page: pagination.page,
        page_size: pagination.page_size,
    })
}

/// Deletes the listings a batch created and then the batch record, in one transaction.
pub fn undo_import(connection: &mut Connection, batch_id: i64) -> AppResult<UndoReport> {
    undo_with_checkpoint(connection, batch_id, || Ok(()))
}

fn undo_with_checkpoint(
    connection: &mut Connection,
    batch_id: i64,
    between_deletes: impl FnOnce() -> AppResult<()>,
) -> AppResult<UndoReport> {
    let tx = connection.transaction()?;
    let batch = get_batch(&tx, batch_id)?;

    let deleted_prices = match batch.batch_key.as_deref() {
        Some(key) => tx.execute("DELETE FROM price_listings WHERE batch_key = ?1", [key])?,
        // Batches recorded before listings carried a key are matched by effective date.
        None => tx.execute(
            "DELETE FROM price_listings WHERE batch_key IS NULL AND effective_date = ?1",
            [batch.effective_date.as_str()],
        )?,
    };
    between_deletes()?;
    tx.execute("DELETE FROM import_batches WHERE id = ?1", [batch_id])?;
    tx.commit()?;

    info!(
        target: "undo",
        batch_id,
        deleted_prices,
        effective_date = batch.effective_date.as_str(),
        "import batch reverted"
    );
    Ok(UndoReport {
        deleted_prices,
        deleted_import_id: batch_id,
    })
}

fn batch_from_row(row: &Row<'_>) -> rusqlite::Result<ImportBatch> {
    Ok(ImportBatch {
        id: row.get(0)?,
        file_name: row.get(1)?,
        imported_by: row.get(2)?,
        effective_date: row.get(3)?,
        success: row.get(4)?,
        message: row.get(5)?,
        batch_key: row.get(6)?,
        created_at: row.get(7)?,
    })
}
