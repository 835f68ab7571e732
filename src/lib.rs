pub mod commands;
pub mod config;
pub mod db;
pub mod errors;
pub mod geocoder;
pub mod history;
pub mod importer;
pub mod pricing;
pub mod resolver;
pub mod workbook;

use std::path::PathBuf;
use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use rusqlite::Connection as SqlConnection;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::commands::ServiceHealth;
use crate::db::DatabaseContext;

pub use crate::commands::{
    list_import_history, service_health, undo_import, upload_price_list, UndoResponse,
    UploadRequest, UploadResponse,
};
pub use crate::config::AppConfig;
pub use crate::db::{bootstrap, bootstrap_in_memory};
pub use crate::errors::{AppError, AppResult};
pub use crate::geocoder::{Coordinates, GeocodeLookup, Geocoder};
pub use crate::history::{HistoryPage, HistoryPagination, ImportBatch, UndoReport};
pub use crate::importer::{Diagnostic, ImportOutcome, ImportReport, ImportRequest, PriceListImporter};
pub use crate::workbook::{SheetGrid, Workbook, Worksheet};

pub struct AppState {
    db: Arc<Mutex<SqlConnection>>,
    db_path: Option<PathBuf>,
    config: AppConfig,
    importer: PriceListImporter,
}

impl AppState {
    /// Opens the configured database and builds the HTTP-backed geocoder.
    pub fn initialize(config: AppConfig) -> AppResult<Self> {
        init_tracing();
        let context = bootstrap(&config.database_path, &config.import_source_name)?;
        let geocoder = Geocoder::new(&config)?;
        info!(
            target: "database",
            geocoder = config.geocoder_base_url.as_str(),
            "service state initialised"
        );
        Ok(Self::from_parts(context, config, geocoder))
    }

    pub fn from_parts(context: DatabaseContext, config: AppConfig, geocoder: Geocoder) -> Self {
        let DatabaseContext { connection, path } = context;
        let db = Arc::new(Mutex::new(connection));
        let importer = PriceListImporter::new(Arc::clone(&db), geocoder, &config);
        Self {
            db,
            db_path: path,
            config,
            importer,
        }
    }

    pub fn importer(&self) -> &PriceListImporter {
        &self.importer
    }

    pub fn connection(&self) -> Arc<Mutex<SqlConnection>> {
        Arc::clone(&self.db)
    }

    pub fn service_health(&self) -> AppResult<ServiceHealth> {
        let import_batches =
            self.db
                .lock()
                .query_row("SELECT COUNT(*) FROM import_batches", [], |row| row.get(0))?;
        Ok(ServiceHealth {
            db_path: self
                .db_path
                .as_ref()
                .map(|path| path.to_string_lossy().to_string()),
            config: self.config.public_profile(),
            import_batches,
        })
    }
}

pub fn init_tracing() {
    static INIT: OnceCell<()> = OnceCell::new();
    let _ = INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,import=debug,geocoder=debug,undo=debug"));
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init();
    });
}
