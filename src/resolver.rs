use rusqlite::{Connection, OptionalExtension, Row};
use serde::Serialize;

use crate::errors::{AppError, AppResult};
use crate::geocoder::Coordinates;
use crate::workbook::ProductRecord;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Region {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Product {
    pub id: i64,
    pub name: String,
    pub brand: String,
    pub amount: String,
    pub category: Option<String>,
    pub barcode: Option<String>,
    pub source_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Store {
    pub id: i64,
    pub name: String,
    pub address: String,
    pub coordinates: Coordinates,
    pub region_id: Option<i64>,
    pub source_id: Option<i64>,
}

/// Trims and collapses internal whitespace runs so cosmetic spacing never splits an identity.
pub fn normalize_key(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub fn source_id(connection: &Connection, name: &str) -> AppResult<i64> {
    connection
        .query_row(
            "SELECT id FROM data_sources WHERE name = ?1",
            [name],
            |row| row.get(0),
        )
        .optional()?
        .ok_or_else(|| AppError::NotFound(format!("data source '{name}'")))
}

pub fn ensure_region(connection: &Connection, name: &str) -> AppResult<Region> {
    let name = normalize_key(name);
    let id = connection.query_row(
        "INSERT INTO regions (name) VALUES (?1)
        ON CONFLICT(name) DO UPDATE SET name = excluded.name
        RETURNING id",
        [name.as_str()],
        |row| row.get(0),
    )?;
    Ok(Region { id, name })
}

/// Find-or-create on (name, brand, amount, source). Blank incoming values never erase data.
pub fn upsert_product(
    connection: &Connection,
    record: &ProductRecord,
    source_id: i64,
) -> AppResult<i64> {
    let id = connection.query_row(
        "INSERT INTO products (name, brand, amount, source_id) VALUES (?1, ?2, ?3, ?4)
        ON CONFLICT(name, brand, amount, source_id) DO UPDATE SET
            name = COALESCE(NULLIF(excluded.name, ''), products.name),
            brand = COALESCE(NULLIF(excluded.brand, ''), products.brand),
            amount = COALESCE(NULLIF(excluded.amount, ''), products.amount)
        RETURNING id",
        (
            normalize_key(&record.item),
            normalize_key(&record.brand),
            normalize_key(&record.size),
            source_id,
        ),
        |row| row.get(0),
    )?;
    Ok(id)
}

pub fn find_product(
    connection: &Connection,
    name: &str,
    brand: &str,
    amount: &str,
    source_id: i64,
) -> AppResult<Option<Product>> {
    connection
        .query_row(
            "SELECT id, name, brand, amount, category, barcode, source_id
            FROM products
            WHERE name = ?1 AND brand = ?2 AND amount = ?3 AND source_id = ?4",
            (
                normalize_key(name),
                normalize_key(brand),
                normalize_key(amount),
                source_id,
            ),
            parse_product,
        )
        .optional()
        .map_err(AppError::from)
}

pub fn find_store(
    connection: &Connection,
    name: &str,
    address: &str,
    region_id: i64,
    source_id: i64,
) -> AppResult<Option<Store>> {
    connection
        .query_row(
            "SELECT id, name, address, lat, lon, region_id, source_id
            FROM stores
            WHERE name = ?1 AND address = ?2 AND region_id = ?3 AND source_id = ?4",
            (normalize_key(name), normalize_key(address), region_id, source_id),
            parse_store,
        )
        .optional()
        .map_err(AppError::from)
}

/// Find-or-create on (name, address, region, source). An existing store only takes new
/// coordinates when a resolved pair is supplied; new stores fall back to the sentinel.
pub fn upsert_store(
    connection: &Connection,
    name: &str,
    address: &str,
    region_id: i64,
    source_id: i64,
    located: Option<Coordinates>,
) -> AppResult<Store> {
    let coordinates = located
        .filter(Coordinates::is_resolved)
        .unwrap_or(Coordinates::UNRESOLVED);
    connection
        .query_row(
            "INSERT INTO stores (name, address, lat, lon, region_id, source_id)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(name, address, region_id, source_id) DO UPDATE SET
                lat = CASE WHEN excluded.lat = 0 AND excluded.lon = 0 THEN stores.lat ELSE excluded.lat END,
                lon = CASE WHEN excluded.lat = 0 AND excluded.lon = 0 THEN stores.lon ELSE excluded.lon END
            RETURNING id, name, address, lat, lon, region_id, source_id",
            (
                normalize_key(name),
                normalize_key(address),
                coordinates.lat,
                coordinates.lon,
                region_id,
                source_id,
            ),
            parse_store,
        )
        .map_err(AppError::from)
}

fn parse_product(row: &Row<'_>) -> rusqlite::Result<Product> {
    Ok(Product {
        id: row.get(0)?,
        name: row.get(1)?,
        brand: row.get(2)?,
        amount: row.get(3)?,
        category: row.get(4)?,
        barcode: row.get(5)?,
        source_id: row.get(6)?,
    })
}

fn parse_store(row: &Row<'_>) -> rusqlite::Result<Store> {
    Ok(Store {
        id: row.get(0)?,
        name: row.get(1)?,
        address: row.get(2)?,
        coordinates: Coordinates::new(row.get(3)?, row.get(4)?),
        region_id: row.get(5)?,
        source_id: row.get(6)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::bootstrap_in_memory;

    fn product(item: &str, brand: &str, size: &str) -> ProductRecord {
        ProductRecord {
            product_id: String::new(),
            item: item.into(),
            brand: brand.into(),
            size: size.into(),
        }
    }

    fn setup() -> (Connection, i64, i64) {
        let conn = bootstrap_in_memory("mti").unwrap().connection;
        let source = source_id(&conn, "mti").unwrap();
        let region = ensure_region(&conn, "North").unwrap();
        (conn, source, region.id)
    }

    #[test]
    fn collapses_whitespace_in_keys() {
        assert_eq!(normalize_key("  Main   Street\tGrocers "), "Main Street Grocers");
        assert_eq!(normalize_key("   "), "");
    }

    #[test]
    fn regions_are_created_once() {
        let (conn, _, region_id) = setup();
        let again = ensure_region(&conn, " North ").unwrap();
        assert_eq!(again.id, region_id);
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM regions", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn product_upsert_does_not_duplicate() {
        let (conn, source, _) = setup();
        let first = upsert_product(&conn, &product("Rice", "Acme", "1kg"), source).unwrap();
        let second = upsert_product(&conn, &product(" Rice ", "Acme", "1kg"), source).unwrap();
        assert_eq!(first, second);
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM products", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn blank_brand_never_erases_existing_brand() {
        let (conn, source, _) = setup();
        let acme = upsert_product(&conn, &product("Rice", "Acme", "1kg"), source).unwrap();
        upsert_product(&conn, &product("Rice", "", "1kg"), source).unwrap();

        let existing = find_product(&conn, "Rice", "Acme", "1kg", source)
            .unwrap()
            .unwrap();
        assert_eq!(existing.id, acme);
        assert_eq!(existing.brand, "Acme");
    }

    #[test]
    fn curated_fields_survive_reimport() {
        let (conn, source, _) = setup();
        let id = upsert_product(&conn, &product("Rice", "Acme", "1kg"), source).unwrap();
        conn.execute(
            "UPDATE products SET category = 'Grains', barcode = '123' WHERE id = ?1",
            [id],
        )
        .unwrap();
        upsert_product(&conn, &product("Rice", "Acme", "1kg"), source).unwrap();
        let stored = find_product(&conn, "Rice", "Acme", "1kg", source)
            .unwrap()
            .unwrap();
        assert_eq!(stored.category.as_deref(), Some("Grains"));
        assert_eq!(stored.barcode.as_deref(), Some("123"));
    }

    #[test]
    fn matching_is_scoped_to_source() {
        let (conn, source, _) = setup();
        conn.execute(
            "INSERT INTO products (name, brand, amount, source_id) VALUES ('Rice', 'Acme', '1kg', NULL)",
            [],
        )
        .unwrap();
        let imported = upsert_product(&conn, &product("Rice", "Acme", "1kg"), source).unwrap();
        let manual: i64 = conn
            .query_row(
                "SELECT id FROM products WHERE source_id IS NULL",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_ne!(imported, manual);
    }

    #[test]
    fn new_store_without_coordinates_gets_sentinel() {
        let (conn, source, region) = setup();
        let store = upsert_store(&conn, "Hi-Lo", "Mall Road", region, source, None).unwrap();
        assert_eq!(store.coordinates, Coordinates::UNRESOLVED);
        assert!(find_store(&conn, "Hi-Lo", "Mall Road", region, source)
            .unwrap()
            .is_some());
    }

    #[test]
    fn existing_store_keeps_coordinates_unless_new_pair_resolved() {
        let (conn, source, region) = setup();
        let located = Coordinates::new(10.5, -61.3);
        let created =
            upsert_store(&conn, "Hi-Lo", "Mall Road", region, source, Some(located)).unwrap();
        assert_eq!(created.coordinates, located);

        let unchanged = upsert_store(&conn, "Hi-Lo", "Mall Road", region, source, None).unwrap();
        assert_eq!(unchanged.id, created.id);
        assert_eq!(unchanged.coordinates, located);

        let sentinel = upsert_store(
            &conn,
            "Hi-Lo",
            "Mall Road",
            region,
            source,
            Some(Coordinates::UNRESOLVED),
        )
        .unwrap();
        assert_eq!(sentinel.coordinates, located);

        let moved = Coordinates::new(10.6, -61.4);
        let updated =
            upsert_store(&conn, "Hi-Lo", "Mall Road", region, source, Some(moved)).unwrap();
        assert_eq!(updated.id, created.id);
        assert_eq!(updated.coordinates, moved);
    }

    #[test]
    fn same_store_name_at_other_address_is_distinct() {
        let (conn, source, region) = setup();
        let a = upsert_store(&conn, "Hi-Lo", "Mall Road", region, source, None).unwrap();
        let b = upsert_store(&conn, "Hi-Lo", "Main Road", region, source, None).unwrap();
        assert_ne!(a.id, b.id);
    }
}
