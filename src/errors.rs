use std::io;

use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Database(#[from] rusqlite::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Workbook(#[from] calamine::Error),
    #[error("Header row not found in '{sheet}'.")]
    HeaderNotFound { sheet: String },
    #[error("'{column}' not found in sheet '{sheet}'.")]
    MissingColumn { sheet: String, column: String },
    #[error("workbook has no importable sheets")]
    NoEligibleSheets,
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0}")]
    Parse(String),
    #[error("{0}")]
    Config(String),
}

impl AppError {
    /// Structural errors abort a whole import instead of a single sheet.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            AppError::HeaderNotFound { .. }
                | AppError::MissingColumn { .. }
                | AppError::Workbook(_)
                | AppError::NoEligibleSheets
        )
    }
}
