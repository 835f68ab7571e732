use std::collections::HashMap;
use std::str::FromStr;

use rust_decimal::Decimal;
use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::errors::{AppError, AppResult};
use crate::resolver::{find_product, find_store};
use crate::workbook::PriceRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriceVerification {
    #[default]
    Pending,
    Verified,
    Rejected,
}

impl PriceVerification {
    pub fn as_str(&self) -> &'static str {
        match self {
            PriceVerification::Pending => "pending",
            PriceVerification::Verified => "verified",
            PriceVerification::Rejected => "rejected",
        }
    }

    pub fn parse(value: &str) -> AppResult<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(PriceVerification::Pending),
            "verified" => Ok(PriceVerification::Verified),
            "rejected" => Ok(PriceVerification::Rejected),
            _ => Err(AppError::Parse(format!("invalid verification state: {value}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    UnparsablePrice,
    UnknownProduct,
    UnknownStore,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedRow {
    pub reason: SkipReason,
    pub item: String,
    pub brand: String,
    pub size: String,
    pub store: String,
    pub address: String,
    pub raw_price: String,
}

impl SkippedRow {
    fn new(reason: SkipReason, record: &PriceRecord) -> Self {
        Self {
            reason,
            item: record.item.clone(),
            brand: record.brand.clone(),
            size: record.size.clone(),
            store: record.store.clone(),
            address: record.address.clone(),
            raw_price: record.price.clone(),
        }
    }
}

/// Where new listings of one sheet are attributed.
#[derive(Debug, Clone, Copy)]
pub struct ListingScope<'a> {
    pub region_id: i64,
    pub source_id: i64,
    pub effective_date: &'a str,
    pub batch_key: &'a str,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileSummary {
    pub created: usize,
    pub unchanged: usize,
    pub skipped: Vec<SkippedRow>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LatestListing {
    pub id: i64,
    pub price: Decimal,
    pub effective_date: String,
}

/// Keeps digits and decimal points only: `"$ 12,345.00 TTD"` parses as `12345.00`.
pub fn parse_price(raw: &str) -> Option<Decimal> {
    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    Decimal::from_str(&cleaned).ok().map(|value| value.round_dp(2))
}

pub fn reconcile_prices(
    connection: &Connection,
    rows: &[PriceRecord],
    scope: ListingScope<'_>,
) -> AppResult<ReconcileSummary> {
    let mut summary = ReconcileSummary::default();
    let mut products: HashMap<(String, String, String), Option<i64>> = HashMap::new();
    let mut stores: HashMap<(String, String), Option<i64>> = HashMap::new();

    for record in rows {
        let product_key = (record.item.clone(), record.brand.clone(), record.size.clone());
        let product_id = match products.get(&product_key) {
            Some(cached) => *cached,
            None => {
                let found = find_product(
                    connection,
                    &record.item,
                    &record.brand,
                    &record.size,
                    scope.source_id,
                )?
                .map(|product| product.id);
                products.insert(product_key, found);
                found
            }
        };
        let Some(product_id) = product_id else {
            summary
                .skipped
                .push(SkippedRow::new(SkipReason::UnknownProduct, record));
            continue;
        };

        let store_key = (record.store.clone(), record.address.clone());
        let store_id = match stores.get(&store_key) {
            Some(cached) => *cached,
            None => {
                let found = find_store(
                    connection,
                    &record.store,
                    &record.address,
                    scope.region_id,
                    scope.source_id,
                )?
                .map(|store| store.id);
                stores.insert(store_key, found);
                found
            }
        };
        let Some(store_id) = store_id else {
            summary
                .skipped
                .push(SkippedRow::new(SkipReason::UnknownStore, record));
            continue;
        };

        let Some(price) = parse_price(&record.price) else {
            summary
                .skipped
                .push(SkippedRow::new(SkipReason::UnparsablePrice, record));
            continue;
        };

        let latest = latest_listing(connection, product_id, store_id, scope.source_id)?;
        if latest.as_ref().is_some_and(|listing| listing.price == price) {
            summary.unchanged += 1;
            continue;
        }

        insert_listing(
            connection,
            product_id,
            store_id,
            price,
            PriceVerification::Verified,
            scope,
        )?;
        trace!(
            target: "import",
            product_id,
            store_id,
            price = %price,
            "price listing recorded"
        );
        summary.created += 1;
    }

    Ok(summary)
}

pub fn latest_listing(
    connection: &Connection,
    product_id: i64,
    store_id: i64,
    source_id: i64,
) -> AppResult<Option<LatestListing>> {
    let row: Option<(i64, String, String)> = connection
        .query_row(
            "SELECT id, price, effective_date
            FROM price_listings
            WHERE product_id = ?1 AND store_id = ?2 AND source_id = ?3
            ORDER BY effective_date DESC, id DESC
            LIMIT 1",
            (product_id, store_id, source_id),
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?;

    row.map(|(id, price, effective_date)| {
        let price = Decimal::from_str(&price)
            .map_err(|err| AppError::Parse(format!("stored price '{price}' is invalid: {err}")))?;
        Ok(LatestListing {
            id,
            price,
            effective_date,
        })
    })
    .transpose()
}

fn insert_listing(
    connection: &Connection,
    product_id: i64,
    store_id: i64,
    price: Decimal,
    verification: PriceVerification,
    scope: ListingScope<'_>,
) -> AppResult<i64> {
    connection.execute(
        "INSERT INTO price_listings
            (product_id, store_id, price, price_is_verified, source_id, effective_date, batch_key)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        (
            product_id,
            store_id,
            format!("{:.2}", price),
            verification.as_str(),
            scope.source_id,
            scope.effective_date,
            scope.batch_key,
        ),
    )?;
    Ok(connection.last_insert_rowid())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::bootstrap_in_memory;
    use crate::resolver::{ensure_region, source_id, upsert_product, upsert_store};
    use crate::workbook::ProductRecord;

    struct Fixture {
        conn: Connection,
        source: i64,
        region: i64,
        product: i64,
        store: i64,
    }

    fn fixture() -> Fixture {
        let conn = bootstrap_in_memory("mti").unwrap().connection;
        let source = source_id(&conn, "mti").unwrap();
        let region = ensure_region(&conn, "North").unwrap().id;
        let product = upsert_product(
            &conn,
            &ProductRecord {
                product_id: "1".into(),
                item: "Rice".into(),
                brand: "Acme".into(),
                size: "1kg".into(),
            },
            source,
        )
        .unwrap();
        let store = upsert_store(&conn, "Hi-Lo", "Mall Road", region, source, None)
            .unwrap()
            .id;
        Fixture {
            conn,
            source,
            region,
            product,
            store,
        }
    }

    fn record(price: &str) -> PriceRecord {
        PriceRecord {
            item: "Rice".into(),
            brand: "Acme".into(),
            size: "1kg".into(),
            store: "Hi-Lo".into(),
            address: "Mall Road".into(),
            price: price.into(),
        }
    }

    fn scope<'a>(fixture: &Fixture, date: &'a str, batch: &'a str) -> ListingScope<'a> {
        ListingScope {
            region_id: fixture.region,
            source_id: fixture.source,
            effective_date: date,
            batch_key: batch,
        }
    }

    fn listing_count(conn: &Connection) -> i64 {
        conn.query_row("SELECT COUNT(*) FROM price_listings", [], |row| row.get(0))
            .unwrap()
    }

    #[test]
    fn parses_decorated_prices() {
        assert_eq!(
            parse_price("$ 12,345.00 TTD"),
            Some(Decimal::from_str("12345.00").unwrap())
        );
        assert_eq!(parse_price("9"), Some(Decimal::from(9)));
        assert_eq!(parse_price("N/A"), None);
        assert_eq!(parse_price(""), None);
        assert_eq!(parse_price("1.2.3"), None);
        assert_eq!(
            parse_price("4.999"),
            Some(Decimal::from_str("5.00").unwrap())
        );
    }

    #[test]
    fn creates_listing_only_when_price_changes() {
        let f = fixture();
        let first = reconcile_prices(
            &f.conn,
            &[record("$12.00")],
            scope(&f, "2024-01-01T00:00:00.000000Z", "batch-a"),
        )
        .unwrap();
        assert_eq!(first.created, 1);

        let same = reconcile_prices(
            &f.conn,
            &[record("12")],
            scope(&f, "2024-02-01T00:00:00.000000Z", "batch-b"),
        )
        .unwrap();
        assert_eq!(same.created, 0);
        assert_eq!(same.unchanged, 1);
        assert_eq!(listing_count(&f.conn), 1);

        let changed = reconcile_prices(
            &f.conn,
            &[record("13.50")],
            scope(&f, "2024-03-01T00:00:00.000000Z", "batch-c"),
        )
        .unwrap();
        assert_eq!(changed.created, 1);

        let latest = latest_listing(&f.conn, f.product, f.store, f.source)
            .unwrap()
            .unwrap();
        assert_eq!(latest.price, Decimal::from_str("13.50").unwrap());
        assert_eq!(latest.effective_date, "2024-03-01T00:00:00.000000Z");
    }

    #[test]
    fn unparsable_price_is_skipped_not_zeroed() {
        let f = fixture();
        let summary = reconcile_prices(
            &f.conn,
            &[record("N/A")],
            scope(&f, "2024-01-01T00:00:00.000000Z", "batch-a"),
        )
        .unwrap();
        assert_eq!(summary.created, 0);
        assert_eq!(summary.skipped.len(), 1);
        assert_eq!(summary.skipped[0].reason, SkipReason::UnparsablePrice);
        assert_eq!(summary.skipped[0].raw_price, "N/A");
        assert_eq!(summary.skipped[0].store, "Hi-Lo");
        assert_eq!(listing_count(&f.conn), 0);
    }

    #[test]
    fn rows_without_catalog_entries_are_reported() {
        let f = fixture();
        let mut unknown_product = record("5");
        unknown_product.item = "Sugar".into();
        let mut unknown_store = record("5");
        unknown_store.store = "Massy".into();

        let summary = reconcile_prices(
            &f.conn,
            &[unknown_product, unknown_store],
            scope(&f, "2024-01-01T00:00:00.000000Z", "batch-a"),
        )
        .unwrap();
        let reasons: Vec<_> = summary.skipped.iter().map(|row| row.reason).collect();
        assert_eq!(
            reasons,
            vec![SkipReason::UnknownProduct, SkipReason::UnknownStore]
        );
    }

    #[test]
    fn imported_listings_are_verified_and_tagged_with_batch() {
        let f = fixture();
        reconcile_prices(
            &f.conn,
            &[record("7.25")],
            scope(&f, "2024-01-01T00:00:00.000000Z", "batch-a"),
        )
        .unwrap();
        let (price, state, batch): (String, String, String) = f
            .conn
            .query_row(
                "SELECT price, price_is_verified, batch_key FROM price_listings",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .unwrap();
        assert_eq!(price, "7.25");
        assert_eq!(
            PriceVerification::parse(&state).unwrap(),
            PriceVerification::Verified
        );
        assert_eq!(batch, "batch-a");
    }

    #[test]
    fn user_submissions_default_to_pending() {
        let f = fixture();
        f.conn
            .execute(
                "INSERT INTO price_listings (product_id, store_id, price, effective_date)
                VALUES (?1, ?2, '3.00', '2024-01-01T00:00:00.000000Z')",
                (f.product, f.store),
            )
            .unwrap();
        let state: String = f
            .conn
            .query_row("SELECT price_is_verified FROM price_listings", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(state, PriceVerification::default().as_str());
    }
}
