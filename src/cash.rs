//! Cash register: income and expense entries outside of invoices.

use rusqlite::{params, params_from_iter, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;

use crate::db::{self, DbState};
use crate::error::{AppError, AppResult};
use crate::models::{CashTransaction, CashType, Page, Pagination};
use crate::sync::{self, SyncOperation};
use crate::validation::{
    existing_id, normalize_timestamp, optional_string, require_fields, required_string,
    resolve_id, round_money, sanitize_float,
};

const SYNC_ENTITY: &str = "cash_transaction";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CashFilter {
    #[serde(rename = "type")]
    pub transaction_type: Option<CashType>,
    /// Case-insensitive match on the description.
    pub search: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CashSummary {
    pub income: f64,
    pub expenses: f64,
    pub balance: f64,
}

fn map_transaction(row: &Row<'_>) -> rusqlite::Result<CashTransaction> {
    let raw_type: String = row.get(4)?;
    let transaction_type = CashType::parse(&raw_type).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            4,
            rusqlite::types::Type::Text,
            format!("unknown cash type {raw_type}").into(),
        )
    })?;
    Ok(CashTransaction {
        id: row.get(0)?,
        date: row.get(1)?,
        description: row.get(2)?,
        amount: row.get(3)?,
        transaction_type,
        category: row.get(5)?,
    })
}

pub fn list(
    db: &DbState,
    page: Option<i64>,
    limit: Option<i64>,
    filter: &CashFilter,
) -> AppResult<Page<CashTransaction>> {
    let mut clauses: Vec<&str> = Vec::new();
    let mut args: Vec<String> = Vec::new();
    if let Some(kind) = filter.transaction_type {
        clauses.push("type = ?");
        args.push(kind.as_str().to_string());
    }
    if let Some(search) = filter.search.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        clauses.push("lower(description) LIKE ?");
        args.push(format!("%{}%", search.to_lowercase()));
    }
    let where_sql = if clauses.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", clauses.join(" AND "))
    };

    let conn = db.lock()?;
    let total: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM cash_transactions{where_sql}"),
        params_from_iter(args.iter()),
        |row| row.get(0),
    )?;
    let pagination = Pagination::new(total, page, limit);

    let mut sql = format!(
        "SELECT id, date, description, amount, type, category FROM cash_transactions{where_sql}
         ORDER BY date DESC, rowid DESC"
    );
    if let Some(limit) = pagination.limit {
        sql.push_str(&format!(" LIMIT {limit} OFFSET {}", pagination.offset()));
    }
    let mut stmt = conn.prepare(&sql)?;
    let data = stmt
        .query_map(params_from_iter(args.iter()), map_transaction)?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Page { data, pagination })
}

pub fn create(db: &DbState, payload: &Value) -> AppResult<CashTransaction> {
    require_fields(payload, &["description", "amount", "type", "category"])?;
    let raw_type = payload.get("type").and_then(Value::as_str).unwrap_or_default();
    let transaction_type = CashType::parse(raw_type)
        .ok_or_else(|| AppError::Validation("Invalid transaction type".into()))?;
    let amount = round_money(sanitize_float(payload.get("amount")));
    if amount <= 0.0 {
        return Err(AppError::Validation("Amount must be greater than zero".into()));
    }

    let transaction = CashTransaction {
        id: resolve_id(payload)?,
        date: normalize_timestamp(optional_string(payload, "date"))?,
        description: required_string(payload, "description")?,
        amount,
        transaction_type,
        category: required_string(payload, "category")?,
    };

    let conn = db.lock()?;
    db::with_transaction(&conn, |tx| {
        tx.execute(
            "INSERT INTO cash_transactions (id, date, description, amount, type, category)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                transaction.id,
                transaction.date,
                transaction.description,
                transaction.amount,
                transaction.transaction_type.as_str(),
                transaction.category,
            ],
        )?;
        sync::enqueue(tx, SYNC_ENTITY, &transaction.id, SyncOperation::Insert, &json!(transaction))
    })?;

    info!(
        transaction_id = %transaction.id,
        transaction_type = %transaction.transaction_type,
        amount = transaction.amount,
        "Cash transaction recorded"
    );
    Ok(transaction)
}

pub fn delete(db: &DbState, id: Option<&str>) -> AppResult<String> {
    let id = existing_id(id)?;
    let conn = db.lock()?;
    db::with_transaction(&conn, |tx| {
        let exists: Option<i64> = tx
            .query_row(
                "SELECT 1 FROM cash_transactions WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_none() {
            return Err(AppError::NotFound("Transaction not found".into()));
        }
        tx.execute("DELETE FROM cash_transactions WHERE id = ?1", params![id])?;
        sync::enqueue(tx, SYNC_ENTITY, &id, SyncOperation::Delete, &json!({ "id": id }))
    })?;

    info!(transaction_id = %id, "Cash transaction deleted");
    Ok(id)
}

/// Register totals over every recorded transaction.
pub fn summary(db: &DbState) -> AppResult<CashSummary> {
    let conn = db.lock()?;
    let (income, expenses): (f64, f64) = conn.query_row(
        "SELECT
            COALESCE(SUM(CASE WHEN type = 'income' THEN amount END), 0),
            COALESCE(SUM(CASE WHEN type = 'expense' THEN amount END), 0)
         FROM cash_transactions",
        [],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    Ok(CashSummary {
        income: round_money(income),
        expenses: round_money(expenses),
        balance: round_money(income - expenses),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(db: &DbState, description: &str, amount: f64, kind: &str, date: &str) -> CashTransaction {
        create(
            db,
            &json!({
                "description": description,
                "amount": amount,
                "type": kind,
                "category": "Office",
                "date": date,
            }),
        )
        .unwrap()
    }

    #[test]
    fn summary_balances_income_against_expenses() {
        let db = db::open_in_memory().unwrap();
        record(&db, "Cash sale", 120.0, "income", "2024-04-01");
        record(&db, "Rent", 80.5, "expense", "2024-04-02");
        record(&db, "Courier", 9.5, "expense", "2024-04-03");

        let summary = summary(&db).unwrap();
        assert_eq!(summary.income, 120.0);
        assert_eq!(summary.expenses, 90.0);
        assert_eq!(summary.balance, 30.0);
    }

    #[test]
    fn empty_register_sums_to_zero() {
        let db = db::open_in_memory().unwrap();
        let summary = summary(&db).unwrap();
        assert_eq!(summary.balance, 0.0);
    }

    #[test]
    fn create_validates_amount_and_type() {
        let db = db::open_in_memory().unwrap();
        let base = json!({ "description": "Rent", "category": "Office", "type": "expense" });

        let mut zero = base.clone();
        zero["amount"] = json!(0);
        assert_eq!(
            create(&db, &zero).unwrap_err().to_string(),
            "Amount must be greater than zero"
        );

        let mut bad_type = base.clone();
        bad_type["amount"] = json!(10);
        bad_type["type"] = json!("refund");
        assert_eq!(
            create(&db, &bad_type).unwrap_err().to_string(),
            "Invalid transaction type"
        );

        let err = create(&db, &json!({ "description": "Rent" })).unwrap_err();
        assert_eq!(err.to_string(), "Missing required fields: amount, type, category");
    }

    #[test]
    fn date_defaults_to_now() {
        let db = db::open_in_memory().unwrap();
        let created = create(
            &db,
            &json!({ "description": "Float", "amount": 50, "type": "income", "category": "Till" }),
        )
        .unwrap();
        assert!(created.date.ends_with('Z'));
        assert_eq!(created.date.len(), 20);
    }

    #[test]
    fn list_paginates_and_filters() {
        let db = db::open_in_memory().unwrap();
        record(&db, "Cash sale", 120.0, "income", "2024-04-01");
        record(&db, "Rent", 80.5, "expense", "2024-04-02");
        record(&db, "Courier", 9.5, "expense", "2024-04-03");

        let page = list(&db, Some(1), Some(2), &CashFilter::default()).unwrap();
        assert_eq!(page.pagination.total, 3);
        assert_eq!(page.pagination.total_pages, 2);
        assert_eq!(page.data[0].description, "Courier");

        let expenses = CashFilter {
            transaction_type: Some(CashType::Expense),
            ..Default::default()
        };
        assert_eq!(list(&db, None, None, &expenses).unwrap().data.len(), 2);

        let search = CashFilter {
            search: Some("RENT".into()),
            ..Default::default()
        };
        let found = list(&db, None, None, &search).unwrap();
        assert_eq!(found.data.len(), 1);
        assert_eq!(found.pagination.total, 1);
    }

    #[test]
    fn delete_removes_and_queues() {
        let db = db::open_in_memory().unwrap();
        let created = record(&db, "Rent", 80.0, "expense", "2024-04-02");
        delete(&db, Some(created.id.as_str())).unwrap();
        assert_eq!(summary(&db).unwrap().expenses, 0.0);

        let err = delete(&db, Some(created.id.as_str())).unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));

        let conn = db.lock().unwrap();
        let ops: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sync_queue WHERE entity_type = 'cash_transaction'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(ops, 2);
    }
}
