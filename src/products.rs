//! Product catalogue, stock levels and the stock movement ledger.

use chrono::{DateTime, NaiveDate};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::db::{self, DbState};
use crate::error::{AppError, AppResult};
use crate::models::{Product, StockMovement};
use crate::sync::{self, SyncOperation};
use crate::validation::{
    existing_id, optional_string, require_fields, required_string, resolve_id, round_money,
    sanitize_float, sanitize_int,
};

const SYNC_ENTITY: &str = "product";

/// Days ahead of expiry at which a product is flagged.
pub const EXPIRY_WARNING_DAYS: i64 = 30;

const PRODUCT_COLUMNS: &str =
    "id, name, sku, category, price, cost, stock, min_stock, expiry_date";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StockFilter {
    /// Nothing left.
    Out,
    /// Above zero but at or below the minimum.
    Low,
    /// Above the minimum.
    In,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductFilter {
    pub search: Option<String>,
    pub category: Option<String>,
    pub stock: Option<StockFilter>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExpiryStatus {
    Expired,
    Expiring,
    Ok,
}

/// Why a product's stock changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MovementReason {
    Opening,
    Sale,
    Purchase,
    Adjustment,
}

impl MovementReason {
    pub fn as_str(self) -> &'static str {
        match self {
            MovementReason::Opening => "opening",
            MovementReason::Sale => "sale",
            MovementReason::Purchase => "purchase",
            MovementReason::Adjustment => "adjustment",
        }
    }
}

fn map_product(row: &Row<'_>) -> rusqlite::Result<Product> {
    Ok(Product {
        id: row.get(0)?,
        name: row.get(1)?,
        sku: row.get(2)?,
        category: row.get(3)?,
        price: row.get(4)?,
        cost: row.get(5)?,
        stock: row.get(6)?,
        min_stock: row.get(7)?,
        expiry_date: row.get(8)?,
    })
}

pub fn list(db: &DbState, filter: &ProductFilter) -> AppResult<Vec<Product>> {
    let mut clauses: Vec<&str> = Vec::new();
    let mut args: Vec<String> = Vec::new();

    if let Some(search) = filter.search.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        clauses.push("(lower(name) LIKE ? OR lower(sku) LIKE ?)");
        let pattern = format!("%{}%", search.to_lowercase());
        args.push(pattern.clone());
        args.push(pattern);
    }
    if let Some(category) = filter
        .category
        .as_deref()
        .map(str::trim)
        .filter(|c| !c.is_empty() && *c != "all")
    {
        clauses.push("category = ?");
        args.push(category.to_string());
    }
    match filter.stock {
        Some(StockFilter::Out) => clauses.push("stock = 0"),
        Some(StockFilter::Low) => clauses.push("stock > 0 AND stock <= min_stock"),
        Some(StockFilter::In) => clauses.push("stock > min_stock"),
        None => {}
    }

    let mut sql = format!("SELECT {PRODUCT_COLUMNS} FROM products");
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
    sql.push_str(" ORDER BY name ASC");

    let conn = db.lock()?;
    let mut stmt = conn.prepare(&sql)?;
    let products = stmt
        .query_map(params_from_iter(args.iter()), map_product)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(products)
}

pub(crate) fn find(conn: &Connection, id: &str) -> AppResult<Option<Product>> {
    Ok(conn
        .query_row(
            &format!("SELECT {PRODUCT_COLUMNS} FROM products WHERE id = ?1"),
            params![id],
            map_product,
        )
        .optional()?)
}

pub fn get(db: &DbState, id: &str) -> AppResult<Product> {
    let id = existing_id(Some(id))?;
    let conn = db.lock()?;
    find(&conn, &id)?.ok_or_else(|| AppError::NotFound("Product not found".into()))
}

/// Exact SKU match, ignoring case.
pub fn find_by_sku(db: &DbState, sku: &str) -> AppResult<Option<Product>> {
    let sku = sku.trim();
    if sku.is_empty() {
        return Ok(None);
    }
    let conn = db.lock()?;
    Ok(conn
        .query_row(
            &format!("SELECT {PRODUCT_COLUMNS} FROM products WHERE sku = ?1 COLLATE NOCASE LIMIT 1"),
            params![sku],
            map_product,
        )
        .optional()?)
}

/// Accepts `YYYY-MM-DD` or an RFC 3339 timestamp and keeps the date part.
fn parse_expiry(raw: Option<String>) -> AppResult<Option<String>> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    if let Ok(date) = NaiveDate::parse_from_str(&raw, "%Y-%m-%d") {
        return Ok(Some(date.format("%Y-%m-%d").to_string()));
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(&raw) {
        return Ok(Some(ts.date_naive().format("%Y-%m-%d").to_string()));
    }
    Err(AppError::Validation(format!("Invalid expiry date: {raw}")))
}

fn product_from_payload(payload: &Value, id: String) -> AppResult<Product> {
    require_fields(payload, &["name", "sku", "category", "price", "cost"])?;
    let price = sanitize_float(payload.get("price"));
    let cost = sanitize_float(payload.get("cost"));
    if price < 0.0 || cost < 0.0 {
        return Err(AppError::Validation("Price and cost cannot be negative".into()));
    }
    let min_stock = sanitize_int(payload.get("minStock"));
    if min_stock < 0 {
        return Err(AppError::Validation("Minimum stock cannot be negative".into()));
    }
    Ok(Product {
        id,
        name: required_string(payload, "name")?,
        sku: required_string(payload, "sku")?,
        category: required_string(payload, "category")?,
        price: round_money(price),
        cost: round_money(cost),
        stock: sanitize_int(payload.get("stock")),
        min_stock,
        expiry_date: parse_expiry(optional_string(payload, "expiryDate"))?,
    })
}

fn sku_taken(conn: &Connection, sku: &str, except_id: &str) -> AppResult<bool> {
    let hit: Option<String> = conn
        .query_row(
            "SELECT id FROM products WHERE sku = ?1 COLLATE NOCASE AND id != ?2 LIMIT 1",
            params![sku, except_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(hit.is_some())
}

pub fn create(db: &DbState, payload: &Value) -> AppResult<Product> {
    let product = product_from_payload(payload, resolve_id(payload)?)?;

    let conn = db.lock()?;
    db::with_transaction(&conn, |tx| {
        if sku_taken(tx, &product.sku, &product.id)? {
            return Err(AppError::Conflict(format!("SKU {} already exists", product.sku)));
        }
        tx.execute(
            "INSERT INTO products (id, name, sku, category, price, cost, stock, min_stock, expiry_date)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7, ?8)",
            params![
                product.id,
                product.name,
                product.sku,
                product.category,
                product.price,
                product.cost,
                product.min_stock,
                product.expiry_date,
            ],
        )?;
        if product.stock != 0 {
            apply_stock_delta(tx, &product.id, product.stock, MovementReason::Opening, None)?;
        }
        sync::enqueue(tx, SYNC_ENTITY, &product.id, SyncOperation::Insert, &json!(product))
    })?;

    info!(product_id = %product.id, sku = %product.sku, "Product created");
    Ok(product)
}

/// Full replacement of a product. A changed stock level is booked as an
/// adjustment so the ledger always explains the current figure.
pub fn update(db: &DbState, payload: &Value) -> AppResult<Product> {
    let id = existing_id(payload.get("id").and_then(Value::as_str))?;
    let product = product_from_payload(payload, id)?;

    let conn = db.lock()?;
    db::with_transaction(&conn, |tx| {
        let current =
            find(tx, &product.id)?.ok_or_else(|| AppError::NotFound("Product not found".into()))?;
        if sku_taken(tx, &product.sku, &product.id)? {
            return Err(AppError::Conflict(format!("SKU {} already exists", product.sku)));
        }
        tx.execute(
            "UPDATE products
             SET name = ?1, sku = ?2, category = ?3, price = ?4, cost = ?5,
                 min_stock = ?6, expiry_date = ?7
             WHERE id = ?8",
            params![
                product.name,
                product.sku,
                product.category,
                product.price,
                product.cost,
                product.min_stock,
                product.expiry_date,
                product.id,
            ],
        )?;
        let delta = product.stock - current.stock;
        if delta != 0 {
            apply_stock_delta(tx, &product.id, delta, MovementReason::Adjustment, None)?;
        }
        sync::enqueue(tx, SYNC_ENTITY, &product.id, SyncOperation::Update, &json!(product))
    })?;

    Ok(product)
}

/// Delete a product unless an invoice line still points at it.
pub fn delete(db: &DbState, id: Option<&str>) -> AppResult<String> {
    let id = existing_id(id)?;
    let conn = db.lock()?;
    db::with_transaction(&conn, |tx| {
        if find(tx, &id)?.is_none() {
            return Err(AppError::NotFound("Product not found".into()));
        }
        let used: i64 = tx.query_row(
            "SELECT COUNT(*) FROM invoice_items WHERE product_id = ?1",
            params![id],
            |row| row.get(0),
        )?;
        if used > 0 {
            return Err(AppError::Conflict("Cannot delete product in use.".into()));
        }
        tx.execute("DELETE FROM products WHERE id = ?1", params![id])?;
        sync::enqueue(tx, SYNC_ENTITY, &id, SyncOperation::Delete, &json!({ "id": id }))
    })?;

    info!(product_id = %id, "Product deleted");
    Ok(id)
}

/// Move a product's stock by `delta` and record it in the ledger.
/// Returns the new stock level. Stock may go below zero.
pub(crate) fn apply_stock_delta(
    conn: &Connection,
    product_id: &str,
    delta: i64,
    reason: MovementReason,
    invoice_id: Option<&str>,
) -> AppResult<i64> {
    let changed = conn.execute(
        "UPDATE products SET stock = stock + ?1 WHERE id = ?2",
        params![delta, product_id],
    )?;
    if changed == 0 {
        return Err(AppError::NotFound(format!("Product {product_id} not found")));
    }
    let stock_after: i64 = conn.query_row(
        "SELECT stock FROM products WHERE id = ?1",
        params![product_id],
        |row| row.get(0),
    )?;
    conn.execute(
        "INSERT INTO stock_movements (product_id, invoice_id, delta, stock_after, reason)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![product_id, invoice_id, delta, stock_after, reason.as_str()],
    )?;
    if stock_after < 0 {
        warn!(
            product_id = %product_id,
            stock_after,
            reason = reason.as_str(),
            "Stock went negative"
        );
    }
    Ok(stock_after)
}

/// Classify a product's expiry date relative to `today`.
/// `None` when the product has no usable expiry date.
pub fn expiry_status(product: &Product, today: NaiveDate) -> Option<ExpiryStatus> {
    let expiry = NaiveDate::parse_from_str(product.expiry_date.as_deref()?, "%Y-%m-%d").ok()?;
    let days = (expiry - today).num_days();
    Some(if days <= 0 {
        ExpiryStatus::Expired
    } else if days <= EXPIRY_WARNING_DAYS {
        ExpiryStatus::Expiring
    } else {
        ExpiryStatus::Ok
    })
}

/// Products at or below their minimum stock.
pub fn low_stock(db: &DbState) -> AppResult<Vec<Product>> {
    let conn = db.lock()?;
    let mut stmt = conn.prepare(&format!(
        "SELECT {PRODUCT_COLUMNS} FROM products WHERE stock <= min_stock ORDER BY stock ASC, name ASC"
    ))?;
    let products = stmt
        .query_map([], map_product)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(products)
}

/// Ledger for one product, newest first.
pub fn stock_movements(db: &DbState, product_id: &str) -> AppResult<Vec<StockMovement>> {
    let product_id = existing_id(Some(product_id))?;
    let conn = db.lock()?;
    if find(&conn, &product_id)?.is_none() {
        return Err(AppError::NotFound("Product not found".into()));
    }
    let mut stmt = conn.prepare(
        "SELECT id, product_id, invoice_id, delta, stock_after, reason, created_at
         FROM stock_movements
         WHERE product_id = ?1
         ORDER BY id DESC",
    )?;
    let movements = stmt
        .query_map(params![product_id], |row| {
            Ok(StockMovement {
                id: row.get(0)?,
                product_id: row.get(1)?,
                invoice_id: row.get(2)?,
                delta: row.get(3)?,
                stock_after: row.get(4)?,
                reason: row.get(5)?,
                created_at: row.get(6)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(movements)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn product_payload(name: &str, sku: &str, stock: i64, min_stock: i64) -> Value {
        json!({
            "name": name,
            "sku": sku,
            "category": "Consumables",
            "price": 12.5,
            "cost": "7.25",
            "stock": stock,
            "minStock": min_stock,
        })
    }

    #[test]
    fn create_records_opening_stock() {
        let db = db::open_in_memory().unwrap();
        let product = create(&db, &product_payload("Gloves", "GLV-01", 40, 10)).unwrap();

        let fetched = get(&db, &product.id).unwrap();
        assert_eq!(fetched, product);
        assert_eq!(fetched.cost, 7.25);

        let ledger = stock_movements(&db, &product.id).unwrap();
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger[0].reason, "opening");
        assert_eq!(ledger[0].delta, 40);
        assert_eq!(ledger[0].stock_after, 40);
    }

    #[test]
    fn missing_fields_are_listed() {
        let db = db::open_in_memory().unwrap();
        let err = create(&db, &json!({ "name": "Gloves", "price": 1 })).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Missing required fields: sku, category, cost"
        );
    }

    #[test]
    fn duplicate_sku_is_a_conflict_regardless_of_case() {
        let db = db::open_in_memory().unwrap();
        create(&db, &product_payload("Gloves", "GLV-01", 0, 0)).unwrap();
        let err = create(&db, &product_payload("Gloves L", "glv-01", 0, 0)).unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)), "got {err:?}");
    }

    #[test]
    fn update_books_stock_change_as_adjustment() {
        let db = db::open_in_memory().unwrap();
        let product = create(&db, &product_payload("Masks", "MSK-01", 10, 5)).unwrap();

        let mut payload = product_payload("Masks FFP2", "MSK-01", 4, 5);
        payload["id"] = json!(product.id);
        let updated = update(&db, &payload).unwrap();
        assert_eq!(updated.name, "Masks FFP2");
        assert_eq!(get(&db, &product.id).unwrap().stock, 4);

        let ledger = stock_movements(&db, &product.id).unwrap();
        assert_eq!(ledger[0].reason, "adjustment");
        assert_eq!(ledger[0].delta, -6);
    }

    #[test]
    fn list_filters_by_search_category_and_stock() {
        let db = db::open_in_memory().unwrap();
        create(&db, &product_payload("Gloves", "GLV-01", 0, 5)).unwrap();
        create(&db, &product_payload("Masks", "MSK-01", 3, 5)).unwrap();
        create(&db, &product_payload("Composite", "CMP-01", 50, 5)).unwrap();
        let mut other = product_payload("Lidocaine", "LID-01", 20, 5);
        other["category"] = json!("Anesthetics");
        create(&db, &other).unwrap();

        let names = |filter: ProductFilter| -> Vec<String> {
            list(&db, &filter).unwrap().into_iter().map(|p| p.name).collect()
        };

        assert_eq!(
            names(ProductFilter { stock: Some(StockFilter::Out), ..Default::default() }),
            vec!["Gloves"]
        );
        assert_eq!(
            names(ProductFilter { stock: Some(StockFilter::Low), ..Default::default() }),
            vec!["Masks"]
        );
        assert_eq!(
            names(ProductFilter { stock: Some(StockFilter::In), ..Default::default() }),
            vec!["Composite", "Lidocaine"]
        );
        assert_eq!(
            names(ProductFilter { search: Some("msk".into()), ..Default::default() }),
            vec!["Masks"]
        );
        assert_eq!(
            names(ProductFilter { category: Some("Anesthetics".into()), ..Default::default() }),
            vec!["Lidocaine"]
        );
        assert_eq!(names(ProductFilter::default()).len(), 4);
    }

    #[test]
    fn find_by_sku_ignores_case() {
        let db = db::open_in_memory().unwrap();
        let product = create(&db, &product_payload("Gloves", "GLV-01", 1, 0)).unwrap();
        let hit = find_by_sku(&db, " glv-01 ").unwrap().unwrap();
        assert_eq!(hit.id, product.id);
        assert!(find_by_sku(&db, "nope").unwrap().is_none());
    }

    #[test]
    fn delete_refuses_products_on_invoices() {
        let db = db::open_in_memory().unwrap();
        let used = create(&db, &product_payload("Gloves", "GLV-01", 1, 0)).unwrap();
        let unused = create(&db, &product_payload("Masks", "MSK-01", 1, 0)).unwrap();
        {
            let conn = db.lock().unwrap();
            conn.execute(
                "INSERT INTO invoices (id, number, type, entity_name, subtotal, total)
                 VALUES ('inv-1', 'INV-1', 'sale', 'Walk-in', 1.0, 1.0)",
                [],
            )
            .unwrap();
            conn.execute(
                "INSERT INTO invoice_items (id, invoice_id, product_id, product_name, quantity, unit_price, total)
                 VALUES ('it-1', 'inv-1', ?1, 'Gloves', 1, 1.0, 1.0)",
                params![used.id],
            )
            .unwrap();
        }

        let err = delete(&db, Some(used.id.as_str())).unwrap_err();
        assert_eq!(err.to_string(), "Cannot delete product in use.");
        delete(&db, Some(unused.id.as_str())).unwrap();
        assert_eq!(list(&db, &ProductFilter::default()).unwrap().len(), 1);
    }

    #[test]
    fn expiry_thresholds() {
        let today = NaiveDate::from_ymd_opt(2024, 6, 1).unwrap();
        let mut product = Product {
            id: "p".into(),
            name: "Lidocaine".into(),
            sku: "LID".into(),
            category: "Anesthetics".into(),
            price: 1.0,
            cost: 1.0,
            stock: 1,
            min_stock: 0,
            expiry_date: None,
        };
        assert_eq!(expiry_status(&product, today), None);

        product.expiry_date = Some("2024-06-01".into());
        assert_eq!(expiry_status(&product, today), Some(ExpiryStatus::Expired));
        product.expiry_date = Some("2024-07-01".into());
        assert_eq!(expiry_status(&product, today), Some(ExpiryStatus::Expiring));
        product.expiry_date = Some("2024-07-02".into());
        assert_eq!(expiry_status(&product, today), Some(ExpiryStatus::Ok));
    }

    #[test]
    fn expiry_date_accepts_rfc3339_and_rejects_garbage() {
        let db = db::open_in_memory().unwrap();
        let mut payload = product_payload("Lidocaine", "LID-01", 1, 0);
        payload["expiryDate"] = json!("2025-03-04T10:00:00Z");
        assert_eq!(
            create(&db, &payload).unwrap().expiry_date.as_deref(),
            Some("2025-03-04")
        );

        let mut payload = product_payload("Articaine", "ART-01", 1, 0);
        payload["expiryDate"] = json!("next spring");
        assert!(matches!(create(&db, &payload), Err(AppError::Validation(_))));
    }

    #[test]
    fn low_stock_includes_boundary() {
        let db = db::open_in_memory().unwrap();
        create(&db, &product_payload("Gloves", "GLV-01", 5, 5)).unwrap();
        create(&db, &product_payload("Masks", "MSK-01", 6, 5)).unwrap();
        let low: Vec<String> = low_stock(&db).unwrap().into_iter().map(|p| p.name).collect();
        assert_eq!(low, vec!["Gloves"]);
    }
}
