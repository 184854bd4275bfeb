//! Dashboard figures computed straight from the store.

use chrono::{Duration, NaiveDate};
use rusqlite::params;
use serde::Serialize;

use crate::db::DbState;
use crate::error::AppResult;
use crate::products::EXPIRY_WARNING_DAYS;
use crate::validation::round_money;

const RECENT_SALES: i64 = 7;
const STOCK_DISTRIBUTION: i64 = 5;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SalePoint {
    /// `YYYY-MM-DD`
    pub date: String,
    pub amount: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StockPoint {
    pub name: String,
    pub stock: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardMetrics {
    pub total_sales: f64,
    pub total_purchases: f64,
    pub low_stock_items: i64,
    pub total_products: i64,
    pub expiring_count: i64,
    /// Sales minus the cost of the goods sold on them.
    pub profit: f64,
    /// Oldest first.
    pub recent_sales: Vec<SalePoint>,
    pub stock_distribution: Vec<StockPoint>,
}

/// Drafts are left out: they have not been issued and moved no stock.
pub fn metrics(db: &DbState, today: NaiveDate) -> AppResult<DashboardMetrics> {
    let conn = db.lock()?;

    let (total_sales, total_purchases): (f64, f64) = conn.query_row(
        "SELECT
            COALESCE(SUM(CASE WHEN type = 'sale' THEN total END), 0),
            COALESCE(SUM(CASE WHEN type = 'purchase' THEN total END), 0)
         FROM invoices
         WHERE status != 'draft'",
        [],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;

    let cogs: f64 = conn.query_row(
        "SELECT COALESCE(SUM(ii.cost * ii.quantity), 0)
         FROM invoice_items ii
         JOIN invoices i ON i.id = ii.invoice_id
         WHERE i.type = 'sale' AND i.status != 'draft'",
        [],
        |row| row.get(0),
    )?;

    let (total_products, low_stock_items): (i64, i64) = conn.query_row(
        "SELECT COUNT(*), COALESCE(SUM(CASE WHEN stock <= min_stock THEN 1 ELSE 0 END), 0)
         FROM products",
        [],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;

    let horizon = (today + Duration::days(EXPIRY_WARNING_DAYS))
        .format("%Y-%m-%d")
        .to_string();
    let expiring_count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM products
         WHERE expiry_date IS NOT NULL AND expiry_date != '' AND expiry_date <= ?1",
        params![horizon],
        |row| row.get(0),
    )?;

    let mut stmt = conn.prepare(
        "SELECT substr(date, 1, 10), total FROM invoices
         WHERE type = 'sale' AND status != 'draft'
         ORDER BY date DESC, rowid DESC
         LIMIT ?1",
    )?;
    let mut recent_sales = stmt
        .query_map(params![RECENT_SALES], |row| {
            Ok(SalePoint {
                date: row.get(0)?,
                amount: row.get(1)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    recent_sales.reverse();

    let mut stmt = conn.prepare("SELECT name, stock FROM products ORDER BY name ASC LIMIT ?1")?;
    let stock_distribution = stmt
        .query_map(params![STOCK_DISTRIBUTION], |row| {
            Ok(StockPoint {
                name: row.get(0)?,
                stock: row.get(1)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(DashboardMetrics {
        total_sales: round_money(total_sales),
        total_purchases: round_money(total_purchases),
        low_stock_items,
        total_products,
        expiring_count,
        profit: round_money(total_sales - cogs),
        recent_sales,
        stock_distribution,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{db, entities, invoices, products};
    use serde_json::json;

    #[test]
    fn metrics_cover_sales_profit_and_stock() {
        let db = db::open_in_memory().unwrap();
        let today = NaiveDate::from_ymd_opt(2024, 6, 1).unwrap();

        let client = entities::create(&db, &json!({ "name": "Smile Clinic", "type": "client" }))
            .unwrap()
            .id;
        let supplier = entities::create(&db, &json!({ "name": "Dental Depot", "type": "supplier" }))
            .unwrap()
            .id;
        let gloves = products::create(
            &db,
            &json!({ "name": "Gloves", "sku": "GLV", "category": "PPE", "price": 10, "cost": 4,
                     "stock": 3, "minStock": 5, "expiryDate": "2024-06-20" }),
        )
        .unwrap();
        products::create(
            &db,
            &json!({ "name": "Articaine", "sku": "ART", "category": "Anesthetics", "price": 30, "cost": 20,
                     "stock": 50, "minStock": 5, "expiryDate": "2025-01-01" }),
        )
        .unwrap();

        for day in 1..=8 {
            invoices::create(
                &db,
                &json!({
                    "type": "sale",
                    "entityId": client,
                    "date": format!("2024-05-{day:02}"),
                    "items": [{ "productId": gloves.id, "quantity": 1 }]
                }),
            )
            .unwrap();
        }
        invoices::create(
            &db,
            &json!({
                "type": "sale",
                "entityId": client,
                "status": "draft",
                "items": [{ "productId": gloves.id, "quantity": 100 }]
            }),
        )
        .unwrap();
        invoices::create(
            &db,
            &json!({
                "type": "purchase",
                "entityId": supplier,
                "items": [{ "productId": gloves.id, "quantity": 10, "unitPrice": 4 }]
            }),
        )
        .unwrap();

        let m = metrics(&db, today).unwrap();
        assert_eq!(m.total_sales, 80.0);
        assert_eq!(m.total_purchases, 40.0);
        assert_eq!(m.profit, 80.0 - 8.0 * 4.0);
        assert_eq!(m.total_products, 2);
        // Gloves: 3 - 8 + 10 = 5, at the minimum.
        assert_eq!(m.low_stock_items, 1);
        assert_eq!(m.expiring_count, 1);

        assert_eq!(m.recent_sales.len(), 7);
        assert_eq!(m.recent_sales[0].date, "2024-05-02");
        assert_eq!(m.recent_sales[6].date, "2024-05-08");

        let names: Vec<&str> = m.stock_distribution.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["Articaine", "Gloves"]);
    }

    #[test]
    fn empty_store_gives_zeroes() {
        let db = db::open_in_memory().unwrap();
        let m = metrics(&db, NaiveDate::from_ymd_opt(2024, 6, 1).unwrap()).unwrap();
        assert_eq!(m.total_sales, 0.0);
        assert_eq!(m.profit, 0.0);
        assert!(m.recent_sales.is_empty());
        assert!(m.stock_distribution.is_empty());
    }
}
