use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OpenFlags};
use tracing::info;

use crate::errors::{AppError, AppResult};

pub const IMPORT_SOURCE_DESCRIPTION: &str = "Ministry of Trade Import";

pub struct DatabaseContext {
    pub connection: Connection,
    pub path: Option<PathBuf>,
}

pub fn bootstrap<P: AsRef<Path>>(db_path: P, import_source: &str) -> AppResult<DatabaseContext> {
    let db_path = db_path.as_ref();
    if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE;
    let connection = Connection::open_with_flags(db_path, flags)?;
    configure(&connection, true)?;
    run_migrations(&connection)?;
    seed_import_source(&connection, import_source)?;
    info!(
        target: "database",
        path = %db_path.display(),
        source = import_source,
        "price database ready"
    );

    Ok(DatabaseContext {
        connection,
        path: Some(db_path.to_path_buf()),
    })
}

pub fn bootstrap_in_memory(import_source: &str) -> AppResult<DatabaseContext> {
    let connection = Connection::open_in_memory()?;
    configure(&connection, false)?;
    run_migrations(&connection)?;
    seed_import_source(&connection, import_source)?;
    Ok(DatabaseContext {
        connection,
        path: None,
    })
}

fn configure(connection: &Connection, wal: bool) -> AppResult<()> {
    if wal {
        connection.pragma_update(None, "journal_mode", "WAL")?;
    }
    connection.execute_batch("PRAGMA foreign_keys = ON;")?;
    Ok(())
}

fn run_migrations(connection: &Connection) -> AppResult<()> {
    connection.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS regions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            created_at TEXT NOT NULL DEFAULT (DATETIME('now'))
        );

        CREATE TABLE IF NOT EXISTS data_sources (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            description TEXT
        );

        CREATE TABLE IF NOT EXISTS products (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            brand TEXT NOT NULL DEFAULT '',
            amount TEXT NOT NULL DEFAULT '',
            barcode TEXT UNIQUE,
            category TEXT,
            description TEXT,
            image_url TEXT,
            source_id INTEGER REFERENCES data_sources(id) ON DELETE SET NULL,
            date_added TEXT NOT NULL DEFAULT (DATETIME('now'))
        );

        CREATE TABLE IF NOT EXISTS stores (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            address TEXT NOT NULL DEFAULT '',
            lat REAL NOT NULL DEFAULT 0,
            lon REAL NOT NULL DEFAULT 0,
            region_id INTEGER REFERENCES regions(id) ON DELETE CASCADE,
            source_id INTEGER REFERENCES data_sources(id) ON DELETE SET NULL,
            date_added TEXT NOT NULL DEFAULT (DATETIME('now'))
        );

        CREATE TABLE IF NOT EXISTS price_listings (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            product_id INTEGER NOT NULL REFERENCES products(id) ON DELETE CASCADE,
            store_id INTEGER NOT NULL REFERENCES stores(id) ON DELETE CASCADE,
            price TEXT NOT NULL,
            price_is_verified TEXT NOT NULL DEFAULT 'pending'
                CHECK (price_is_verified IN ('pending', 'verified', 'rejected')),
            source_id INTEGER REFERENCES data_sources(id) ON DELETE SET NULL,
            effective_date TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS import_batches (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            file_name TEXT NOT NULL,
            imported_by TEXT,
            effective_date TEXT NOT NULL,
            success INTEGER NOT NULL CHECK (success IN (0, 1)),
            message TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (DATETIME('now'))
        );

        CREATE UNIQUE INDEX IF NOT EXISTS idx_products_identity
            ON products(name, brand, amount, source_id);
        CREATE UNIQUE INDEX IF NOT EXISTS idx_stores_identity
            ON stores(name, address, region_id, source_id);
        CREATE INDEX IF NOT EXISTS idx_price_listings_lookup
            ON price_listings(product_id, store_id, effective_date);
        "#,
    )?;

    ensure_column(connection, "price_listings", "batch_key TEXT")?;
    ensure_column(connection, "import_batches", "batch_key TEXT")?;
    connection.execute(
        "CREATE INDEX IF NOT EXISTS idx_price_listings_batch ON price_listings(batch_key)",
        [],
    )?;
    connection.execute(
        "CREATE INDEX IF NOT EXISTS idx_import_batches_effective ON import_batches(effective_date)",
        [],
    )?;
    Ok(())
}

fn ensure_column(connection: &Connection, table: &str, definition: &str) -> AppResult<()> {
    let column_name = definition
        .split_whitespace()
        .next()
        .ok_or_else(|| AppError::Config(format!("invalid column definition: {definition}")))?;
    if column_exists(connection, table, column_name)? {
        return Ok(());
    }
    let sql = format!("ALTER TABLE {table} ADD COLUMN {definition}");
    connection.execute(&sql, [])?;
    Ok(())
}

fn column_exists(connection: &Connection, table: &str, column: &str) -> AppResult<bool> {
    let pragma = format!("PRAGMA table_info({table})");
    let mut stmt = connection.prepare(&pragma)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

fn seed_import_source(connection: &Connection, name: &str) -> AppResult<()> {
    connection.execute(
        "INSERT INTO data_sources (name, description) VALUES (?1, ?2)
        ON CONFLICT(name) DO NOTHING",
        (name, IMPORT_SOURCE_DESCRIPTION),
    )?;
    Ok(())
}

/// Fixed-precision UTC text so that lexical order matches chronological order.
pub fn format_timestamp(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_timestamp(value: &str) -> AppResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|parsed| parsed.with_timezone(&Utc))
        .map_err(|err| AppError::Parse(format!("invalid timestamp '{value}': {err}")))
}
