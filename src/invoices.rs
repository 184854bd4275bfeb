//! Sale and purchase invoices.
//!
//! Creating an invoice is one write transaction: the header, its lines, the
//! stock movements for every line tied to a product, and the outbox row all
//! commit together or not at all. Drafts carry no stock effect until they
//! are promoted to `pending` or `paid`.

use std::collections::HashMap;

use chrono::{NaiveDate, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info};
use uuid::Uuid;

use crate::db::{self, DbState};
use crate::entities;
use crate::error::{AppError, AppResult};
use crate::models::{Invoice, InvoiceItem, InvoiceStatus, InvoiceType, Page, Pagination};
use crate::products::{self, MovementReason};
use crate::sync::{self, SyncOperation};
use crate::validation::{
    existing_id, normalize_timestamp, optional_string, resolve_id, round_money, sanitize_float,
    sanitize_int,
};

const SYNC_ENTITY: &str = "invoice";

pub const INVOICE_PREFIX: &str = "INV";

/// Money comparisons tolerate sub-cent float noise.
const MONEY_EPSILON: f64 = 0.005;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvoiceFilter {
    #[serde(rename = "type")]
    pub invoice_type: Option<InvoiceType>,
    pub entity_name: Option<String>,
    /// Matches the invoice number or the entity name.
    pub search: Option<String>,
    /// Inclusive `YYYY-MM-DD` lower bound.
    pub from: Option<String>,
    /// Inclusive `YYYY-MM-DD` upper bound.
    pub to: Option<String>,
}

struct InvoiceHeader {
    invoice: Invoice,
    stock_applied: bool,
}

const HEADER_COLUMNS: &str = "id, number, date, type, entity_id, entity_name, subtotal, total, \
                              paid_amount, status, stock_applied";

fn text_enum<T>(row: &Row<'_>, idx: usize, parse: fn(&str) -> Option<T>) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    parse(&raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            format!("unexpected value {raw}").into(),
        )
    })
}

fn map_header(row: &Row<'_>) -> rusqlite::Result<InvoiceHeader> {
    Ok(InvoiceHeader {
        invoice: Invoice {
            id: row.get(0)?,
            number: row.get(1)?,
            date: row.get(2)?,
            invoice_type: text_enum(row, 3, InvoiceType::parse)?,
            entity_id: row.get(4)?,
            entity_name: row.get(5)?,
            items: Vec::new(),
            subtotal: row.get(6)?,
            total: row.get(7)?,
            paid_amount: row.get(8)?,
            status: text_enum(row, 9, InvoiceStatus::parse)?,
        },
        stock_applied: row.get::<_, i64>(10)? != 0,
    })
}

fn map_item(row: &Row<'_>) -> rusqlite::Result<(String, InvoiceItem)> {
    Ok((
        row.get(0)?,
        InvoiceItem {
            id: row.get(1)?,
            product_id: row.get(2)?,
            product_name: row.get(3)?,
            quantity: row.get(4)?,
            unit_price: row.get(5)?,
            cost: row.get(6)?,
            total: row.get(7)?,
        },
    ))
}

fn load_items(conn: &Connection, invoice_ids: &[String]) -> AppResult<HashMap<String, Vec<InvoiceItem>>> {
    let mut grouped: HashMap<String, Vec<InvoiceItem>> = HashMap::new();
    if invoice_ids.is_empty() {
        return Ok(grouped);
    }
    let placeholders = vec!["?"; invoice_ids.len()].join(", ");
    let mut stmt = conn.prepare(&format!(
        "SELECT invoice_id, id, product_id, product_name, quantity, unit_price, cost, total
         FROM invoice_items
         WHERE invoice_id IN ({placeholders})
         ORDER BY rowid ASC"
    ))?;
    let rows = stmt
        .query_map(params_from_iter(invoice_ids.iter()), map_item)?
        .collect::<Result<Vec<_>, _>>()?;
    for (invoice_id, item) in rows {
        grouped.entry(invoice_id).or_default().push(item);
    }
    Ok(grouped)
}

fn find_header(conn: &Connection, id: &str) -> AppResult<Option<InvoiceHeader>> {
    Ok(conn
        .query_row(
            &format!("SELECT {HEADER_COLUMNS} FROM invoices WHERE id = ?1"),
            params![id],
            map_header,
        )
        .optional()?)
}

fn find(conn: &Connection, id: &str) -> AppResult<Option<InvoiceHeader>> {
    let Some(mut header) = find_header(conn, id)? else {
        return Ok(None);
    };
    let mut items = load_items(conn, std::slice::from_ref(&header.invoice.id))?;
    header.invoice.items = items.remove(&header.invoice.id).unwrap_or_default();
    Ok(Some(header))
}

pub fn get(db: &DbState, id: &str) -> AppResult<Invoice> {
    let id = existing_id(Some(id))?;
    let conn = db.lock()?;
    find(&conn, &id)?
        .map(|h| h.invoice)
        .ok_or_else(|| AppError::NotFound("Invoice not found".into()))
}

fn parse_day(raw: &str) -> AppResult<String> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map(|d| d.format("%Y-%m-%d").to_string())
        .map_err(|_| AppError::Validation(format!("Invalid date: {raw}")))
}

/// Paginated invoice list, newest first. Items are loaded for the returned
/// page only.
pub fn list(
    db: &DbState,
    page: Option<i64>,
    limit: Option<i64>,
    filter: &InvoiceFilter,
) -> AppResult<Page<Invoice>> {
    let mut clauses: Vec<&str> = Vec::new();
    let mut args: Vec<String> = Vec::new();

    if let Some(invoice_type) = filter.invoice_type {
        clauses.push("type = ?");
        args.push(invoice_type.as_str().to_string());
    }
    if let Some(name) = filter.entity_name.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        clauses.push("entity_name = ?");
        args.push(name.to_string());
    }
    if let Some(search) = filter.search.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        clauses.push("(lower(number) LIKE ? OR lower(entity_name) LIKE ?)");
        let pattern = format!("%{}%", search.to_lowercase());
        args.push(pattern.clone());
        args.push(pattern);
    }
    if let Some(from) = filter.from.as_deref().filter(|s| !s.trim().is_empty()) {
        clauses.push("substr(date, 1, 10) >= ?");
        args.push(parse_day(from)?);
    }
    if let Some(to) = filter.to.as_deref().filter(|s| !s.trim().is_empty()) {
        clauses.push("substr(date, 1, 10) <= ?");
        args.push(parse_day(to)?);
    }

    let where_sql = if clauses.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", clauses.join(" AND "))
    };

    let conn = db.lock()?;
    let total: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM invoices{where_sql}"),
        params_from_iter(args.iter()),
        |row| row.get(0),
    )?;
    let pagination = Pagination::new(total, page, limit);

    let mut sql = format!("SELECT {HEADER_COLUMNS} FROM invoices{where_sql} ORDER BY date DESC, rowid DESC");
    if let Some(limit) = pagination.limit {
        sql.push_str(&format!(" LIMIT {limit} OFFSET {}", pagination.offset()));
    }
    let mut stmt = conn.prepare(&sql)?;
    let headers = stmt
        .query_map(params_from_iter(args.iter()), map_header)?
        .collect::<Result<Vec<_>, _>>()?;

    let ids: Vec<String> = headers.iter().map(|h| h.invoice.id.clone()).collect();
    let mut items = load_items(&conn, &ids)?;
    let data = headers
        .into_iter()
        .map(|h| {
            let mut invoice = h.invoice;
            invoice.items = items.remove(&invoice.id).unwrap_or_default();
            invoice
        })
        .collect();

    Ok(Page { data, pagination })
}

/// Next sequential number for `prefix`, e.g. `INV-20240601-00042`.
/// The counter lives in `local_settings` and is shared across days.
pub fn next_invoice_number(conn: &Connection, prefix: &str) -> AppResult<String> {
    let key = format!("{}_counter", prefix.to_lowercase());
    let current: i64 = db::get_setting(conn, "invoices", &key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    let mut next = current + 1;
    let day = Utc::now().format("%Y%m%d");
    loop {
        let number = format!("{prefix}-{day}-{next:05}");
        let taken: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM invoices WHERE number = ?1",
                params![number],
                |row| row.get(0),
            )
            .optional()?;
        if taken.is_none() {
            db::set_setting(conn, "invoices", &key, &next.to_string())?;
            return Ok(number);
        }
        next += 1;
    }
}

fn parse_type(payload: &Value) -> AppResult<InvoiceType> {
    let raw = payload.get("type").and_then(Value::as_str).unwrap_or_default();
    if raw.trim().is_empty() {
        return Err(AppError::MissingFields(vec!["type".into()]));
    }
    InvoiceType::parse(raw).ok_or_else(|| AppError::Validation("Invalid invoice type".into()))
}

fn parse_status(payload: &Value) -> AppResult<Option<InvoiceStatus>> {
    match optional_string(payload, "status") {
        None => Ok(None),
        Some(raw) => InvoiceStatus::parse(&raw)
            .map(Some)
            .ok_or_else(|| AppError::Validation("Invalid invoice status".into())),
    }
}

fn derive_status(paid_amount: f64, total: f64) -> InvoiceStatus {
    if paid_amount + MONEY_EPSILON >= total {
        InvoiceStatus::Paid
    } else {
        InvoiceStatus::Pending
    }
}

/// Resolve the counterpart: a given `entityId` must exist and sit on the
/// right side of the directory; the name falls back to the entity's.
fn resolve_entity(
    conn: &Connection,
    invoice_type: InvoiceType,
    entity_id: Option<String>,
    entity_name: Option<String>,
) -> AppResult<(Option<String>, String)> {
    let Some(raw_id) = entity_id else {
        let name = entity_name.ok_or_else(|| AppError::MissingFields(vec!["entityName".into()]))?;
        return Ok((None, name));
    };
    let id = existing_id(Some(raw_id.as_str()))?;
    let entity = entities::find(conn, &id)?
        .ok_or_else(|| AppError::NotFound("Entity not found".into()))?;
    let expected = invoice_type.counterpart();
    if entity.entity_type != expected {
        return Err(AppError::Validation(format!(
            "A {invoice_type} invoice needs a {expected}, but {} is a {}",
            entity.name, entity.entity_type
        )));
    }
    Ok((Some(entity.id), entity_name.unwrap_or(entity.name)))
}

fn build_items(conn: &Connection, invoice_type: InvoiceType, payload: &Value) -> AppResult<Vec<InvoiceItem>> {
    let raw_items = match payload.get("items") {
        None | Some(Value::Null) => return Ok(Vec::new()),
        Some(Value::Array(items)) => items,
        Some(_) => return Err(AppError::Validation("items must be an array".into())),
    };

    let mut items = Vec::with_capacity(raw_items.len());
    for (idx, raw) in raw_items.iter().enumerate() {
        let line = idx + 1;
        let quantity = sanitize_int(raw.get("quantity"));
        if quantity <= 0 {
            return Err(AppError::Validation(format!(
                "Line {line}: quantity must be greater than zero"
            )));
        }

        let product = match optional_string(raw, "productId") {
            Some(pid) => {
                let pid = existing_id(Some(pid.as_str()))?;
                Some(
                    products::find(conn, &pid)?
                        .ok_or_else(|| AppError::NotFound(format!("Line {line}: product not found")))?,
                )
            }
            None => None,
        };

        let unit_price = match (raw.get("unitPrice"), &product) {
            (None | Some(Value::Null), Some(p)) => match invoice_type {
                InvoiceType::Sale => p.price,
                InvoiceType::Purchase => p.cost,
            },
            (value, _) => sanitize_float(value),
        };
        if unit_price < 0.0 {
            return Err(AppError::Validation(format!(
                "Line {line}: unit price cannot be negative"
            )));
        }

        let product_name = optional_string(raw, "productName")
            .or_else(|| product.as_ref().map(|p| p.name.clone()))
            .ok_or_else(|| AppError::MissingFields(vec![format!("items[{idx}].productName")]))?;
        let cost = match (raw.get("cost"), &product) {
            (None | Some(Value::Null), Some(p)) => p.cost,
            (value, _) => sanitize_float(value),
        };
        let unit_price = round_money(unit_price);

        items.push(InvoiceItem {
            id: Uuid::new_v4().to_string(),
            product_id: product.map(|p| p.id),
            product_name,
            quantity,
            unit_price,
            cost: round_money(cost),
            total: round_money(unit_price * quantity as f64),
        });
    }
    Ok(items)
}

fn post_stock(conn: &Connection, invoice: &Invoice) -> AppResult<()> {
    let reason = match invoice.invoice_type {
        InvoiceType::Sale => MovementReason::Sale,
        InvoiceType::Purchase => MovementReason::Purchase,
    };
    let sign = invoice.invoice_type.stock_sign();
    for item in &invoice.items {
        if let Some(product_id) = &item.product_id {
            products::apply_stock_delta(conn, product_id, sign * item.quantity, reason, Some(invoice.id.as_str()))?;
        }
    }
    conn.execute(
        "UPDATE invoices SET stock_applied = 1 WHERE id = ?1",
        params![invoice.id],
    )?;
    debug!(invoice_id = %invoice.id, lines = invoice.items.len(), "Invoice stock posted");
    Ok(())
}

/// Create an invoice on a connection that is already inside a transaction.
pub(crate) fn create_in(conn: &Connection, payload: &Value, number_prefix: &str) -> AppResult<Invoice> {
    let invoice_type = parse_type(payload)?;
    let id = resolve_id(payload)?;
    let number = match optional_string(payload, "number") {
        Some(number) => number,
        None => next_invoice_number(conn, number_prefix)?,
    };
    let date = normalize_timestamp(optional_string(payload, "date"))?;
    let (entity_id, entity_name) = resolve_entity(
        conn,
        invoice_type,
        optional_string(payload, "entityId"),
        optional_string(payload, "entityName"),
    )?;

    let items = build_items(conn, invoice_type, payload)?;
    let subtotal = round_money(items.iter().map(|i| i.total).sum());
    let total = subtotal;

    let paid_amount = round_money(sanitize_float(payload.get("paidAmount")));
    if paid_amount < 0.0 {
        return Err(AppError::Validation("Paid amount cannot be negative".into()));
    }
    let status = parse_status(payload)?.unwrap_or_else(|| derive_status(paid_amount, total));

    let invoice = Invoice {
        id,
        number,
        date,
        invoice_type,
        entity_id,
        entity_name,
        items,
        subtotal,
        total,
        paid_amount,
        status,
    };

    conn.execute(
        "INSERT INTO invoices (id, number, date, type, entity_id, entity_name, subtotal, total, status, paid_amount)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            invoice.id,
            invoice.number,
            invoice.date,
            invoice.invoice_type.as_str(),
            invoice.entity_id,
            invoice.entity_name,
            invoice.subtotal,
            invoice.total,
            invoice.status.as_str(),
            invoice.paid_amount,
        ],
    )?;
    for item in &invoice.items {
        conn.execute(
            "INSERT INTO invoice_items (id, invoice_id, product_id, product_name, quantity, unit_price, cost, total)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                item.id,
                invoice.id,
                item.product_id,
                item.product_name,
                item.quantity,
                item.unit_price,
                item.cost,
                item.total,
            ],
        )?;
    }

    if invoice.status != InvoiceStatus::Draft {
        post_stock(conn, &invoice)?;
    }

    sync::enqueue(conn, SYNC_ENTITY, &invoice.id, SyncOperation::Insert, &json!(invoice))?;
    Ok(invoice)
}

/// Create an invoice, post its stock and queue it for sync, atomically.
pub fn create(db: &DbState, payload: &Value) -> AppResult<Invoice> {
    let conn = db.lock()?;
    let invoice = db::with_transaction(&conn, |tx| create_in(tx, payload, INVOICE_PREFIX))?;
    info!(
        invoice_id = %invoice.id,
        number = %invoice.number,
        invoice_type = %invoice.invoice_type,
        total = invoice.total,
        status = %invoice.status,
        "Invoice created"
    );
    Ok(invoice)
}

fn write_header(conn: &Connection, invoice: &Invoice) -> AppResult<()> {
    conn.execute(
        "UPDATE invoices
         SET number = ?1, date = ?2, type = ?3, entity_id = ?4, entity_name = ?5,
             status = ?6, paid_amount = ?7
         WHERE id = ?8",
        params![
            invoice.number,
            invoice.date,
            invoice.invoice_type.as_str(),
            invoice.entity_id,
            invoice.entity_name,
            invoice.status.as_str(),
            invoice.paid_amount,
            invoice.id,
        ],
    )?;
    Ok(())
}

/// Header update. Lines and totals are fixed once created.
pub fn update(db: &DbState, payload: &Value) -> AppResult<Invoice> {
    let id = existing_id(payload.get("id").and_then(Value::as_str))?;

    let conn = db.lock()?;
    let invoice = db::with_transaction(&conn, |tx| {
        let InvoiceHeader {
            invoice: mut current,
            stock_applied,
        } = find(tx, &id)?.ok_or_else(|| AppError::NotFound("Invoice not found".into()))?;

        if payload.get("type").is_some() {
            let invoice_type = parse_type(payload)?;
            if invoice_type != current.invoice_type && stock_applied {
                return Err(AppError::Conflict(
                    "Cannot change the type of an invoice whose stock was already posted".into(),
                ));
            }
            current.invoice_type = invoice_type;
        }
        if let Some(number) = optional_string(payload, "number") {
            current.number = number;
        }
        if payload.get("date").is_some() {
            current.date = normalize_timestamp(optional_string(payload, "date"))?;
        }

        let entity_id = optional_string(payload, "entityId").or_else(|| current.entity_id.clone());
        let entity_name = optional_string(payload, "entityName");
        let name_fallback = if entity_id == current.entity_id {
            entity_name.or_else(|| Some(current.entity_name.clone()))
        } else {
            entity_name
        };
        let (entity_id, entity_name) =
            resolve_entity(tx, current.invoice_type, entity_id, name_fallback)?;
        current.entity_id = entity_id;
        current.entity_name = entity_name;

        if payload.get("paidAmount").is_some() {
            let paid_amount = round_money(sanitize_float(payload.get("paidAmount")));
            if paid_amount < 0.0 {
                return Err(AppError::Validation("Paid amount cannot be negative".into()));
            }
            current.paid_amount = paid_amount;
        }

        let previous_status = current.status;
        current.status = match parse_status(payload)? {
            Some(status) => status,
            None if previous_status == InvoiceStatus::Draft => InvoiceStatus::Draft,
            None => derive_status(current.paid_amount, current.total),
        };
        if current.status == InvoiceStatus::Draft && stock_applied {
            return Err(AppError::Conflict(
                "A posted invoice cannot go back to draft".into(),
            ));
        }

        write_header(tx, &current)?;
        if current.status != InvoiceStatus::Draft && !stock_applied {
            post_stock(tx, &current)?;
            info!(invoice_id = %current.id, "Draft invoice posted");
        }
        sync::enqueue(tx, SYNC_ENTITY, &current.id, SyncOperation::Update, &json!(current))?;
        Ok(current)
    })?;

    Ok(invoice)
}

/// Settle part or all of an invoice's outstanding balance.
pub fn record_payment(db: &DbState, id: &str, amount: f64) -> AppResult<Invoice> {
    let id = existing_id(Some(id))?;
    if !amount.is_finite() || amount <= 0.0 {
        return Err(AppError::Validation("Payment amount must be greater than zero".into()));
    }
    let amount = round_money(amount);

    let conn = db.lock()?;
    let invoice = db::with_transaction(&conn, |tx| {
        let mut invoice = find(tx, &id)?
            .map(|h| h.invoice)
            .ok_or_else(|| AppError::NotFound("Invoice not found".into()))?;
        if invoice.status == InvoiceStatus::Draft {
            return Err(AppError::Conflict("Draft invoices cannot take payments".into()));
        }
        let balance = round_money(invoice.balance_due());
        if amount > balance + MONEY_EPSILON {
            return Err(AppError::Validation(format!(
                "Payment of {amount:.2} exceeds the remaining balance of {balance:.2}"
            )));
        }

        invoice.paid_amount = round_money(invoice.paid_amount + amount);
        invoice.status = derive_status(invoice.paid_amount, invoice.total);
        write_header(tx, &invoice)?;
        sync::enqueue(tx, SYNC_ENTITY, &invoice.id, SyncOperation::Update, &json!(invoice))?;
        Ok(invoice)
    })?;

    info!(
        invoice_id = %invoice.id,
        amount,
        paid_amount = invoice.paid_amount,
        status = %invoice.status,
        "Invoice payment recorded"
    );
    Ok(invoice)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Product;

    struct Fixture {
        db: DbState,
        client: String,
        supplier: String,
        gloves: Product,
        masks: Product,
    }

    fn fixture() -> Fixture {
        let db = db::open_in_memory().unwrap();
        let client = entities::create(&db, &json!({ "name": "Smile Clinic", "type": "client" }))
            .unwrap()
            .id;
        let supplier = entities::create(&db, &json!({ "name": "Dental Depot", "type": "supplier" }))
            .unwrap()
            .id;
        let gloves = products::create(
            &db,
            &json!({ "name": "Gloves", "sku": "GLV", "category": "PPE", "price": 10, "cost": 6, "stock": 20 }),
        )
        .unwrap();
        let masks = products::create(
            &db,
            &json!({ "name": "Masks", "sku": "MSK", "category": "PPE", "price": 4, "cost": 1.5, "stock": 5 }),
        )
        .unwrap();
        Fixture {
            db,
            client,
            supplier,
            gloves,
            masks,
        }
    }

    fn stock_of(db: &DbState, id: &str) -> i64 {
        products::get(db, id).unwrap().stock
    }

    fn queued(db: &DbState, entity_type: &str) -> i64 {
        let conn = db.lock().unwrap();
        conn.query_row(
            "SELECT COUNT(*) FROM sync_queue WHERE entity_type = ?1",
            params![entity_type],
            |row| row.get(0),
        )
        .unwrap()
    }

    #[test]
    fn sale_decrements_stock_and_recomputes_totals() {
        let f = fixture();
        let invoice = create(
            &f.db,
            &json!({
                "type": "sale",
                "entityId": f.client,
                "subtotal": 1,
                "total": 1,
                "paidAmount": 38,
                "items": [
                    { "productId": f.gloves.id, "quantity": 3, "unitPrice": 10 },
                    { "productId": f.masks.id, "quantity": 2 }
                ]
            }),
        )
        .unwrap();

        assert_eq!(invoice.entity_name, "Smile Clinic");
        assert_eq!(invoice.subtotal, 38.0);
        assert_eq!(invoice.total, 38.0);
        assert_eq!(invoice.status, InvoiceStatus::Paid);
        assert_eq!(invoice.items[1].unit_price, 4.0);
        assert_eq!(invoice.items[1].cost, 1.5);
        assert!(invoice.number.starts_with("INV-"));

        assert_eq!(stock_of(&f.db, &f.gloves.id), 17);
        assert_eq!(stock_of(&f.db, &f.masks.id), 3);
        assert_eq!(queued(&f.db, "invoice"), 1);

        let fetched = get(&f.db, &invoice.id).unwrap();
        assert_eq!(fetched, invoice);
    }

    #[test]
    fn purchase_increments_stock_with_ledger_rows() {
        let f = fixture();
        let invoice = create(
            &f.db,
            &json!({
                "type": "purchase",
                "entityId": f.supplier,
                "items": [{ "productId": f.gloves.id, "quantity": 10 }]
            }),
        )
        .unwrap();
        assert_eq!(invoice.items[0].unit_price, 6.0);
        assert_eq!(invoice.status, InvoiceStatus::Pending);
        assert_eq!(stock_of(&f.db, &f.gloves.id), 30);

        let ledger = products::stock_movements(&f.db, &f.gloves.id).unwrap();
        assert_eq!(ledger[0].reason, "purchase");
        assert_eq!(ledger[0].invoice_id.as_deref(), Some(invoice.id.as_str()));
        assert_eq!(ledger[0].stock_after, 30);
    }

    #[test]
    fn failure_midway_leaves_no_trace() {
        let f = fixture();
        let err = create(
            &f.db,
            &json!({
                "type": "sale",
                "entityId": f.client,
                "items": [
                    { "productId": f.gloves.id, "quantity": 2 },
                    { "productId": f.masks.id, "quantity": 0 }
                ]
            }),
        )
        .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));

        // Duplicate numbers hit the unique index; nothing from that attempt survives.
        create(&f.db, &json!({ "type": "sale", "number": "X-1", "entityName": "Walk-in" })).unwrap();
        let err = create(
            &f.db,
            &json!({
                "type": "sale",
                "number": "X-1",
                "entityName": "Walk-in",
                "items": [{ "productId": f.gloves.id, "quantity": 2 }]
            }),
        )
        .unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)), "got {err:?}");

        assert_eq!(stock_of(&f.db, &f.gloves.id), 20);
        let page = list(&f.db, None, None, &InvoiceFilter::default()).unwrap();
        assert_eq!(page.data.len(), 1);
        assert_eq!(queued(&f.db, "invoice"), 1);
    }

    #[test]
    fn entity_must_match_invoice_type() {
        let f = fixture();
        let err = create(
            &f.db,
            &json!({ "type": "purchase", "entityId": f.client, "items": [] }),
        )
        .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));

        let err = create(&f.db, &json!({ "type": "sale" })).unwrap_err();
        assert_eq!(err.to_string(), "Missing required fields: entityName");

        let err = create(&f.db, &json!({ "type": "refund", "entityName": "x" })).unwrap_err();
        assert_eq!(err.to_string(), "Invalid invoice type");
    }

    #[test]
    fn sales_may_drive_stock_negative() {
        let f = fixture();
        create(
            &f.db,
            &json!({
                "type": "sale",
                "entityId": f.client,
                "items": [{ "productId": f.masks.id, "quantity": 8 }]
            }),
        )
        .unwrap();
        assert_eq!(stock_of(&f.db, &f.masks.id), -3);
    }

    #[test]
    fn draft_posts_stock_only_when_promoted() {
        let f = fixture();
        let draft = create(
            &f.db,
            &json!({
                "type": "sale",
                "entityId": f.client,
                "status": "draft",
                "items": [{ "productId": f.gloves.id, "quantity": 4 }]
            }),
        )
        .unwrap();
        assert_eq!(draft.status, InvoiceStatus::Draft);
        assert_eq!(stock_of(&f.db, &f.gloves.id), 20);

        let err = record_payment(&f.db, &draft.id, 5.0).unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));

        let posted = update(&f.db, &json!({ "id": draft.id, "status": "pending" })).unwrap();
        assert_eq!(posted.status, InvoiceStatus::Pending);
        assert_eq!(stock_of(&f.db, &f.gloves.id), 16);

        // Saving again does not post twice.
        update(&f.db, &json!({ "id": draft.id, "number": "INV-CUSTOM" })).unwrap();
        assert_eq!(stock_of(&f.db, &f.gloves.id), 16);

        let err = update(&f.db, &json!({ "id": draft.id, "type": "purchase" })).unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
        let err = update(&f.db, &json!({ "id": draft.id, "status": "draft" })).unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
    }

    #[test]
    fn payments_settle_the_balance() {
        let f = fixture();
        let invoice = create(
            &f.db,
            &json!({
                "type": "sale",
                "entityId": f.client,
                "paidAmount": 10,
                "items": [{ "productId": f.gloves.id, "quantity": 5 }]
            }),
        )
        .unwrap();
        assert_eq!(invoice.status, InvoiceStatus::Pending);
        assert_eq!(invoice.balance_due(), 40.0);

        let err = record_payment(&f.db, &invoice.id, 45.0).unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
        let err = record_payment(&f.db, &invoice.id, 0.0).unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));

        let partial = record_payment(&f.db, &invoice.id, 15.0).unwrap();
        assert_eq!(partial.paid_amount, 25.0);
        assert_eq!(partial.status, InvoiceStatus::Pending);

        let settled = record_payment(&f.db, &invoice.id, 25.0).unwrap();
        assert_eq!(settled.paid_amount, 50.0);
        assert_eq!(settled.status, InvoiceStatus::Paid);
        assert_eq!(get(&f.db, &invoice.id).unwrap().status, InvoiceStatus::Paid);
    }

    #[test]
    fn list_paginates_newest_first_with_items() {
        let f = fixture();
        for day in 1..=5 {
            create(
                &f.db,
                &json!({
                    "type": "sale",
                    "entityId": f.client,
                    "date": format!("2024-03-0{day}"),
                    "items": [{ "productId": f.gloves.id, "quantity": day }]
                }),
            )
            .unwrap();
        }
        create(
            &f.db,
            &json!({ "type": "purchase", "entityId": f.supplier, "date": "2024-03-09", "items": [] }),
        )
        .unwrap();

        let page = list(&f.db, Some(1), Some(2), &InvoiceFilter::default()).unwrap();
        assert_eq!(page.pagination.total, 6);
        assert_eq!(page.pagination.total_pages, 3);
        assert_eq!(page.data.len(), 2);
        assert_eq!(page.data[0].invoice_type, InvoiceType::Purchase);
        assert_eq!(page.data[1].items[0].quantity, 5);

        let sales = InvoiceFilter {
            invoice_type: Some(InvoiceType::Sale),
            from: Some("2024-03-02".into()),
            to: Some("2024-03-04".into()),
            ..Default::default()
        };
        let page = list(&f.db, Some(0), None, &sales).unwrap();
        assert_eq!(page.pagination.page, 1);
        assert_eq!(page.pagination.total_pages, 1);
        let quantities: Vec<i64> = page.data.iter().map(|i| i.items[0].quantity).collect();
        assert_eq!(quantities, vec![4, 3, 2]);

        let search = InvoiceFilter {
            search: Some("depot".into()),
            ..Default::default()
        };
        assert_eq!(list(&f.db, None, None, &search).unwrap().data.len(), 1);
    }

    #[test]
    fn huge_limit_and_page_do_not_overflow() {
        let f = fixture();
        for _ in 0..2 {
            create(&f.db, &json!({ "type": "sale", "entityId": f.client, "items": [] })).unwrap();
        }
        let page = list(&f.db, Some(1), Some(i64::MAX), &InvoiceFilter::default()).unwrap();
        assert_eq!(page.pagination.total_pages, 1);
        assert_eq!(page.data.len(), 2);

        let page = list(&f.db, Some(i64::MAX), Some(10), &InvoiceFilter::default()).unwrap();
        assert!(page.data.is_empty());
        assert_eq!(page.pagination.total, 2);
    }

    #[test]
    fn numbers_are_sequential_per_prefix() {
        let f = fixture();
        let conn = f.db.lock().unwrap();
        let a = next_invoice_number(&conn, "INV").unwrap();
        let b = next_invoice_number(&conn, "INV").unwrap();
        let p = next_invoice_number(&conn, "POS").unwrap();
        assert!(a.ends_with("-00001"), "{a}");
        assert!(b.ends_with("-00002"), "{b}");
        assert!(p.starts_with("POS-") && p.ends_with("-00001"), "{p}");
    }
}
