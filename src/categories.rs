//! Product categories.

use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{json, Value};
use tracing::info;

use crate::db::{self, DbState};
use crate::error::{AppError, AppResult};
use crate::models::Category;
use crate::sync::{self, SyncOperation};
use crate::validation::{existing_id, require_fields, required_string, resolve_id};

const SYNC_ENTITY: &str = "category";

pub fn list(db: &DbState) -> AppResult<Vec<Category>> {
    let conn = db.lock()?;
    let mut stmt = conn.prepare("SELECT id, name FROM categories ORDER BY name ASC")?;
    let categories = stmt
        .query_map([], |row| {
            Ok(Category {
                id: row.get(0)?,
                name: row.get(1)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(categories)
}

fn find(conn: &Connection, id: &str) -> AppResult<Option<Category>> {
    Ok(conn
        .query_row(
            "SELECT id, name FROM categories WHERE id = ?1",
            params![id],
            |row| {
                Ok(Category {
                    id: row.get(0)?,
                    name: row.get(1)?,
                })
            },
        )
        .optional()?)
}

pub fn create(db: &DbState, payload: &Value) -> AppResult<Category> {
    require_fields(payload, &["name"])?;
    let category = Category {
        id: resolve_id(payload)?,
        name: required_string(payload, "name")?,
    };

    let conn = db.lock()?;
    db::with_transaction(&conn, |tx| {
        tx.execute(
            "INSERT INTO categories (id, name) VALUES (?1, ?2)",
            params![category.id, category.name],
        )?;
        sync::enqueue(tx, SYNC_ENTITY, &category.id, SyncOperation::Insert, &json!(category))
    })?;

    info!(category_id = %category.id, "Category created");
    Ok(category)
}

pub fn update(db: &DbState, payload: &Value) -> AppResult<Category> {
    require_fields(payload, &["id", "name"])?;
    let category = Category {
        id: existing_id(payload.get("id").and_then(Value::as_str))?,
        name: required_string(payload, "name")?,
    };

    let conn = db.lock()?;
    db::with_transaction(&conn, |tx| {
        let changed = tx.execute(
            "UPDATE categories SET name = ?1 WHERE id = ?2",
            params![category.name, category.id],
        )?;
        if changed == 0 {
            return Err(AppError::NotFound("Category not found".into()));
        }
        sync::enqueue(tx, SYNC_ENTITY, &category.id, SyncOperation::Update, &json!(category))
    })?;

    Ok(category)
}

pub fn delete(db: &DbState, id: Option<&str>) -> AppResult<String> {
    let id = existing_id(id)?;
    let conn = db.lock()?;
    db::with_transaction(&conn, |tx| {
        if find(tx, &id)?.is_none() {
            return Err(AppError::NotFound("Category not found".into()));
        }
        tx.execute("DELETE FROM categories WHERE id = ?1", params![id])?;
        sync::enqueue(tx, SYNC_ENTITY, &id, SyncOperation::Delete, &json!({ "id": id }))
    })?;

    info!(category_id = %id, "Category deleted");
    Ok(id)
}
