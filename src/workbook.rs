use std::io::Cursor;
use std::path::Path;

use calamine::{open_workbook_auto, open_workbook_auto_from_rs, Data, Range, Reader};
use serde::Serialize;
use tracing::debug;

use crate::errors::{AppError, AppResult};

pub const HEADER_SENTINEL: &str = "No.";
pub const HEADER_SCAN_ROWS: usize = 10;
pub const IDENTITY_COLUMNS: [&str; 4] = ["ProductId", "Item", "Brand", "Size"];

/// Metadata rows sit directly above the header: store names one row up, addresses two.
const STORE_NAME_OFFSET: usize = 1;
const ADDRESS_OFFSET: usize = 2;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SheetGrid {
    rows: Vec<Vec<String>>,
}

impl SheetGrid {
    pub fn new(rows: Vec<Vec<String>>) -> Self {
        Self { rows }
    }

    pub fn from_rows<R, S>(rows: impl IntoIterator<Item = R>) -> Self
    where
        R: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            rows: rows
                .into_iter()
                .map(|row| row.into_iter().map(|cell| cell.into().trim().to_string()).collect())
                .collect(),
        }
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn width(&self) -> usize {
        self.rows.iter().map(Vec::len).max().unwrap_or(0)
    }

    pub fn row(&self, index: usize) -> &[String] {
        self.rows.get(index).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn cell(&self, row: usize, column: usize) -> &str {
        self.row(row).get(column).map(String::as_str).unwrap_or("")
    }

    fn from_range(range: &Range<Data>) -> Self {
        let (start_row, start_col) = range.start().unwrap_or((0, 0));
        let mut rows = vec![Vec::new(); start_row as usize];
        for source in range.rows() {
            let mut cells = vec![String::new(); start_col as usize];
            cells.extend(source.iter().map(cell_text));
            rows.push(cells);
        }
        Self { rows }
    }
}

#[derive(Debug, Clone)]
pub struct Worksheet {
    pub name: String,
    pub grid: SheetGrid,
}

#[derive(Debug, Clone, Default)]
pub struct Workbook {
    sheets: Vec<Worksheet>,
}

impl Workbook {
    pub fn from_sheets(sheets: Vec<Worksheet>) -> Self {
        Self { sheets }
    }

    pub fn from_bytes(bytes: &[u8]) -> AppResult<Self> {
        let mut source = open_workbook_auto_from_rs(Cursor::new(bytes.to_vec()))?;
        let mut sheets = Vec::new();
        for name in source.sheet_names() {
            let range = source.worksheet_range(&name)?;
            sheets.push(Worksheet {
                grid: SheetGrid::from_range(&range),
                name,
            });
        }
        Ok(Self { sheets })
    }

    pub fn open<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let mut source = open_workbook_auto(path.as_ref())?;
        let mut sheets = Vec::new();
        for name in source.sheet_names() {
            let range = source.worksheet_range(&name)?;
            sheets.push(Worksheet {
                grid: SheetGrid::from_range(&range),
                name,
            });
        }
        Ok(Self { sheets })
    }

    pub fn sheet_names(&self) -> Vec<&str> {
        self.sheets.iter().map(|sheet| sheet.name.as_str()).collect()
    }

    /// Sheets whose trimmed, lowercased name is not on the exclusion list.
    pub fn eligible_sheets(&self, excluded: &[String]) -> Vec<&Worksheet> {
        self.sheets
            .iter()
            .filter(|sheet| {
                let key = sheet.name.trim().to_lowercase();
                !excluded.iter().any(|name| name.trim().to_lowercase() == key)
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProductRecord {
    pub product_id: String,
    pub item: String,
    pub brand: String,
    pub size: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoreColumn {
    pub column: usize,
    pub store: String,
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PriceRecord {
    pub item: String,
    pub brand: String,
    pub size: String,
    pub store: String,
    pub address: String,
    pub price: String,
}

#[derive(Debug, Clone)]
pub struct NormalizedSheet {
    pub sheet: String,
    pub region: String,
    pub header_row: usize,
    pub stores: Vec<StoreColumn>,
    pub prices: Vec<PriceRecord>,
}

impl NormalizedSheet {
    /// Distinct (store, address) pairs in column order.
    pub fn distinct_stores(&self) -> Vec<(String, String)> {
        let mut seen: Vec<(String, String)> = Vec::new();
        for column in &self.stores {
            let key = (column.store.clone(), column.address.clone());
            if !seen.contains(&key) {
                seen.push(key);
            }
        }
        seen
    }
}

pub fn detect_header_row(grid: &SheetGrid) -> Option<usize> {
    (0..grid.row_count().min(HEADER_SCAN_ROWS))
        .find(|&index| grid.row(index).iter().any(|cell| cell == HEADER_SENTINEL))
}

/// Product identity block of every data row below the header.
pub fn extract_products(sheet: &str, grid: &SheetGrid) -> AppResult<Vec<ProductRecord>> {
    let header_row = locate_header(sheet, grid)?;
    Ok(product_rows(grid, header_row)
        .map(|(_, product)| product)
        .collect())
}

pub fn normalize_sheet(sheet: &str, region: &str, grid: &SheetGrid) -> AppResult<NormalizedSheet> {
    let header_row = locate_header(sheet, grid)?;
    let stores = store_columns(sheet, grid, header_row)?;

    let mut prices = Vec::new();
    for (row_index, product) in product_rows(grid, header_row) {
        for column in &stores {
            let price = grid.cell(row_index, column.column);
            if price.is_empty() {
                continue;
            }
            prices.push(PriceRecord {
                item: product.item.clone(),
                brand: product.brand.clone(),
                size: product.size.clone(),
                store: column.store.clone(),
                address: column.address.clone(),
                price: price.to_string(),
            });
        }
    }

    debug!(
        target: "import",
        sheet,
        header_row,
        stores = stores.len(),
        prices = prices.len(),
        "sheet reshaped to long form"
    );

    Ok(NormalizedSheet {
        sheet: sheet.to_string(),
        region: region.to_string(),
        header_row,
        stores,
        prices,
    })
}

/// Title-cases a sheet name the way regions are keyed (`" port of spain "` -> `"Port Of Spain"`).
pub fn region_name(sheet: &str) -> String {
    let mut out = String::with_capacity(sheet.len());
    let mut previous_alpha = false;
    for ch in sheet.trim().chars() {
        if ch.is_alphabetic() {
            if previous_alpha {
                out.extend(ch.to_lowercase());
            } else {
                out.extend(ch.to_uppercase());
            }
            previous_alpha = true;
        } else {
            out.push(ch);
            previous_alpha = false;
        }
    }
    out
}

fn locate_header(sheet: &str, grid: &SheetGrid) -> AppResult<usize> {
    let header_row = detect_header_row(grid).ok_or_else(|| AppError::HeaderNotFound {
        sheet: sheet.to_string(),
    })?;
    let width = grid.row(header_row).len();
    if width < IDENTITY_COLUMNS.len() {
        return Err(AppError::MissingColumn {
            sheet: sheet.to_string(),
            column: IDENTITY_COLUMNS[width].to_string(),
        });
    }
    Ok(header_row)
}

fn product_rows(
    grid: &SheetGrid,
    header_row: usize,
) -> impl Iterator<Item = (usize, ProductRecord)> + '_ {
    (header_row + 1..grid.row_count()).filter_map(move |index| {
        let item = grid.cell(index, 1);
        if item.is_empty() {
            return None;
        }
        Some((
            index,
            ProductRecord {
                product_id: grid.cell(index, 0).to_string(),
                item: item.to_string(),
                brand: grid.cell(index, 2).to_string(),
                size: grid.cell(index, 3).to_string(),
            },
        ))
    })
}

fn store_columns(sheet: &str, grid: &SheetGrid, header_row: usize) -> AppResult<Vec<StoreColumn>> {
    let first = IDENTITY_COLUMNS.len();
    let width = grid.width();
    if width <= first {
        return Ok(Vec::new());
    }
    let (Some(name_row), Some(address_row)) = (
        header_row.checked_sub(STORE_NAME_OFFSET),
        header_row.checked_sub(ADDRESS_OFFSET),
    ) else {
        return Err(AppError::Parse(format!(
            "store name and address rows missing above the header in '{sheet}'"
        )));
    };

    let mut columns = Vec::new();
    let mut current_address = String::new();
    for column in first..width {
        let address = grid.cell(address_row, column);
        if !address.is_empty() {
            current_address = address.to_string();
        }
        let store = grid.cell(name_row, column);
        if store.is_empty() {
            continue;
        }
        columns.push(StoreColumn {
            column,
            store: store.to_string(),
            address: current_address.clone(),
        });
    }
    Ok(columns)
}

fn cell_text(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        Data::String(s) => s.trim().to_string(),
        Data::Int(i) => i.to_string(),
        Data::Float(f) => {
            if f.fract() == 0.0 && f.abs() < 1e15 {
                (*f as i64).to_string()
            } else {
                f.to_string()
            }
        }
        Data::Bool(b) => b.to_string(),
        other => other.to_string().trim().to_string(),
    }
}
