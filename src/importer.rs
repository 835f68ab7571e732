use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::rngs::OsRng;
use rand::RngCore;
use rusqlite::Connection;
use serde::Serialize;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::db::format_timestamp;
use crate::errors::{AppError, AppResult};
use crate::geocoder::Geocoder;
use crate::history::{log_import, NewImportBatch};
use crate::pricing::{reconcile_prices, ListingScope, SkippedRow};
use crate::resolver::{ensure_region, find_store, source_id, upsert_product, upsert_store};
use crate::workbook::{extract_products, normalize_sheet, region_name, Workbook, Worksheet};

const BATCH_KEY_BYTES: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ImportStage {
    Started,
    ParsingWorkbook,
    PerSheetProcessing,
    Logged,
    Succeeded,
    Failed,
}

impl ImportStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImportStage::Started => "started",
            ImportStage::ParsingWorkbook => "parsing_workbook",
            ImportStage::PerSheetProcessing => "per_sheet_processing",
            ImportStage::Logged => "logged",
            ImportStage::Succeeded => "succeeded",
            ImportStage::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Diagnostic {
    SkippedSheet {
        sheet: String,
        error: String,
    },
    SkippedRow {
        sheet: String,
        row: SkippedRow,
    },
    UnresolvedStore {
        sheet: String,
        store: String,
        address: String,
    },
}

#[derive(Debug, Clone, Default)]
pub struct ImportRequest {
    pub file_name: String,
    pub imported_by: Option<String>,
    pub effective_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SheetReport {
    pub sheet: String,
    pub region: String,
    pub stores: usize,
    pub listings_created: usize,
    pub listings_unchanged: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImportReport {
    pub batch_id: i64,
    pub batch_key: String,
    pub effective_date: String,
    pub products_resolved: usize,
    pub sheets: Vec<SheetReport>,
    pub diagnostics: Vec<Diagnostic>,
}

impl ImportReport {
    pub fn sheets_processed(&self) -> usize {
        self.sheets.len()
    }

    pub fn listings_created(&self) -> usize {
        self.sheets.iter().map(|sheet| sheet.listings_created).sum()
    }

    pub fn skipped_sheets(&self) -> impl Iterator<Item = (&str, &str)> {
        self.diagnostics.iter().filter_map(|diagnostic| match diagnostic {
            Diagnostic::SkippedSheet { sheet, error } => Some((sheet.as_str(), error.as_str())),
            _ => None,
        })
    }

    pub fn unresolved_stores(&self) -> impl Iterator<Item = (&str, &str)> {
        self.diagnostics.iter().filter_map(|diagnostic| match diagnostic {
            Diagnostic::UnresolvedStore { store, address, .. } => {
                Some((store.as_str(), address.as_str()))
            }
            _ => None,
        })
    }

    pub fn skipped_rows(&self) -> impl Iterator<Item = (&str, &SkippedRow)> {
        self.diagnostics.iter().filter_map(|diagnostic| match diagnostic {
            Diagnostic::SkippedRow { sheet, row } => Some((sheet.as_str(), row)),
            _ => None,
        })
    }
}

#[derive(Debug)]
pub enum ImportOutcome {
    Succeeded(ImportReport),
    Failed { batch_id: i64, error: AppError },
}

#[derive(Debug, Clone)]
struct ImportSettings {
    source_name: String,
    excluded_sheets: Vec<String>,
    refresh_resolved: bool,
}

struct RunContext {
    request: ImportRequest,
    batch_key: String,
    effective_date: String,
}

impl RunContext {
    fn new(request: ImportRequest) -> Self {
        let effective_date = format_timestamp(&request.effective_date.unwrap_or_else(Utc::now));
        Self {
            request,
            batch_key: generate_batch_key(),
            effective_date,
        }
    }

    fn enter(&self, stage: ImportStage) {
        info!(
            target: "import",
            file = self.request.file_name.as_str(),
            batch_key = self.batch_key.as_str(),
            stage = stage.as_str(),
            "import stage"
        );
    }

    fn batch<'a>(&'a self, success: bool, message: &'a str) -> NewImportBatch<'a> {
        NewImportBatch {
            file_name: &self.request.file_name,
            imported_by: self.request.imported_by.as_deref(),
            effective_date: &self.effective_date,
            success,
            message,
            batch_key: &self.batch_key,
        }
    }
}

#[derive(Clone)]
pub struct PriceListImporter {
    db: Arc<Mutex<Connection>>,
    geocoder: Geocoder,
    settings: ImportSettings,
    guard: Arc<AsyncMutex<()>>,
}

impl PriceListImporter {
    pub fn new(db: Arc<Mutex<Connection>>, geocoder: Geocoder, config: &AppConfig) -> Self {
        Self {
            db,
            geocoder,
            settings: ImportSettings {
                source_name: config.import_source_name.clone(),
                excluded_sheets: config.excluded_sheets.clone(),
                refresh_resolved: config.geocoder_refresh_resolved,
            },
            guard: Arc::new(AsyncMutex::new(())),
        }
    }

    /// Imports an uploaded workbook. An unreadable file is recorded as a failed batch.
    pub async fn import_bytes(
        &self,
        bytes: &[u8],
        request: ImportRequest,
    ) -> AppResult<ImportOutcome> {
        match Workbook::from_bytes(bytes) {
            Ok(workbook) => self.import_workbook(&workbook, request).await,
            Err(err) => {
                let _lock = self.guard.lock().await;
                let run = RunContext::new(request);
                run.enter(ImportStage::Started);
                self.record_failure(&run, err)
            }
        }
    }

    pub async fn import_workbook(
        &self,
        workbook: &Workbook,
        request: ImportRequest,
    ) -> AppResult<ImportOutcome> {
        let _lock = self.guard.lock().await;
        let run = RunContext::new(request);
        run.enter(ImportStage::Started);

        run.enter(ImportStage::ParsingWorkbook);
        let sheets = workbook.eligible_sheets(&self.settings.excluded_sheets);
        let (source_id, products_resolved) = match self.prepare_catalog(&sheets) {
            Ok(prepared) => prepared,
            Err(err) => return self.record_failure(&run, err),
        };

        run.enter(ImportStage::PerSheetProcessing);
        let mut reports = Vec::new();
        let mut diagnostics = Vec::new();
        for sheet in &sheets {
            match self.process_sheet(sheet, source_id, &run).await {
                Ok((report, sheet_diagnostics)) => {
                    reports.push(report);
                    diagnostics.extend(sheet_diagnostics);
                }
                Err(err) => {
                    warn!(
                        target: "import",
                        sheet = sheet.name.as_str(),
                        error = %err,
                        "sheet skipped"
                    );
                    diagnostics.push(Diagnostic::SkippedSheet {
                        sheet: sheet.name.clone(),
                        error: err.to_string(),
                    });
                }
            }
        }

        let mut report = ImportReport {
            batch_id: 0,
            batch_key: run.batch_key.clone(),
            effective_date: run.effective_date.clone(),
            products_resolved,
            sheets: reports,
            diagnostics,
        };
        let message = format!(
            "Processed {} sheets. {} unresolved stores, {} skipped sheets.",
            report.sheets_processed(),
            report.unresolved_stores().count(),
            report.skipped_sheets().count(),
        );
        report.batch_id = {
            let conn = self.db.lock();
            log_import(&conn, &run.batch(true, &message))?
        };
        run.enter(ImportStage::Logged);
        run.enter(ImportStage::Succeeded);
        Ok(ImportOutcome::Succeeded(report))
    }

    /// Resolves the workbook-wide catalog from the first eligible sheet.
    fn prepare_catalog(&self, sheets: &[&Worksheet]) -> AppResult<(i64, usize)> {
        let first = sheets.first().ok_or(AppError::NoEligibleSheets)?;
        let products = extract_products(&first.name, &first.grid)?;

        let mut conn = self.db.lock();
        let source_id = source_id(&conn, &self.settings.source_name)?;
        let tx = conn.transaction()?;
        for product in &products {
            upsert_product(&tx, product, source_id)?;
        }
        tx.commit()?;
        debug!(
            target: "import",
            sheet = first.name.as_str(),
            products = products.len(),
            "catalog resolved"
        );
        Ok((source_id, products.len()))
    }

    async fn process_sheet(
        &self,
        sheet: &Worksheet,
        source_id: i64,
        run: &RunContext,
    ) -> AppResult<(SheetReport, Vec<Diagnostic>)> {
        let region = {
            let conn = self.db.lock();
            ensure_region(&conn, &region_name(&sheet.name))?
        };
        let normalized = normalize_sheet(&sheet.name, &region.name, &sheet.grid)?;
        let stores = normalized.distinct_stores();

        let pending = {
            let conn = self.db.lock();
            let mut pending = Vec::new();
            for (name, address) in &stores {
                let known = find_store(&conn, name, address, region.id, source_id)?;
                let needs_lookup = match known {
                    Some(store) => {
                        self.settings.refresh_resolved || !store.coordinates.is_resolved()
                    }
                    None => true,
                };
                if needs_lookup {
                    pending.push((name.clone(), address.clone()));
                }
            }
            pending
        };
        debug!(
            target: "import",
            sheet = sheet.name.as_str(),
            stores = stores.len(),
            lookups = pending.len(),
            "geocoding stores"
        );
        let located = self.geocoder.locate_many(pending).await;

        let mut diagnostics = Vec::new();
        let mut conn = self.db.lock();
        let tx = conn.transaction()?;
        for (name, address) in &stores {
            let found = located
                .get(&(name.clone(), address.clone()))
                .copied()
                .flatten();
            let store = upsert_store(&tx, name, address, region.id, source_id, found)?;
            if !store.coordinates.is_resolved() {
                diagnostics.push(Diagnostic::UnresolvedStore {
                    sheet: sheet.name.clone(),
                    store: name.clone(),
                    address: address.clone(),
                });
            }
        }
        let summary = reconcile_prices(
            &tx,
            &normalized.prices,
            ListingScope {
                region_id: region.id,
                source_id,
                effective_date: &run.effective_date,
                batch_key: &run.batch_key,
            },
        )?;
        tx.commit()?;

        diagnostics.extend(summary.skipped.into_iter().map(|row| Diagnostic::SkippedRow {
            sheet: sheet.name.clone(),
            row,
        }));
        Ok((
            SheetReport {
                sheet: sheet.name.clone(),
                region: region.name,
                stores: stores.len(),
                listings_created: summary.created,
                listings_unchanged: summary.unchanged,
            },
            diagnostics,
        ))
    }

    fn record_failure(&self, run: &RunContext, error: AppError) -> AppResult<ImportOutcome> {
        warn!(
            target: "import",
            file = run.request.file_name.as_str(),
            structural = error.is_structural(),
            error = %error,
            "import aborted"
        );
        let message = error.to_string();
        let batch_id = {
            let conn = self.db.lock();
            log_import(&conn, &run.batch(false, &message))?
        };
        run.enter(ImportStage::Logged);
        run.enter(ImportStage::Failed);
        Ok(ImportOutcome::Failed { batch_id, error })
    }
}

fn generate_batch_key() -> String {
    let mut bytes = vec![0_u8; BATCH_KEY_BYTES];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}
