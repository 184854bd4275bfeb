//! Client and supplier directory.

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::{json, Value};
use tracing::info;

use crate::db::{self, DbState};
use crate::error::{AppError, AppResult};
use crate::models::{Entity, EntityType};
use crate::sync::{self, SyncOperation};
use crate::validation::{existing_id, optional_string, require_fields, required_string, resolve_id};

const SYNC_ENTITY: &str = "entity";

fn map_entity(row: &Row<'_>) -> rusqlite::Result<Entity> {
    let raw_type: String = row.get(2)?;
    let entity_type = EntityType::parse(&raw_type).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            2,
            rusqlite::types::Type::Text,
            format!("unknown entity type {raw_type}").into(),
        )
    })?;
    Ok(Entity {
        id: row.get(0)?,
        name: row.get(1)?,
        entity_type,
        email: row.get(3)?,
        phone: row.get(4)?,
        address: row.get(5)?,
    })
}

pub fn list(db: &DbState, entity_type: Option<EntityType>) -> AppResult<Vec<Entity>> {
    let conn = db.lock()?;
    let mut stmt = conn.prepare(
        "SELECT id, name, type, email, phone, address
         FROM entities
         WHERE ?1 IS NULL OR type = ?1
         ORDER BY name ASC",
    )?;
    let entities = stmt
        .query_map(params![entity_type.map(EntityType::as_str)], map_entity)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(entities)
}

pub(crate) fn find(conn: &Connection, id: &str) -> AppResult<Option<Entity>> {
    Ok(conn
        .query_row(
            "SELECT id, name, type, email, phone, address FROM entities WHERE id = ?1",
            params![id],
            map_entity,
        )
        .optional()?)
}

pub fn get(db: &DbState, id: &str) -> AppResult<Entity> {
    let id = existing_id(Some(id))?;
    let conn = db.lock()?;
    find(&conn, &id)?.ok_or_else(|| AppError::NotFound("Entity not found".into()))
}

fn entity_from_payload(payload: &Value, id: String) -> AppResult<Entity> {
    require_fields(payload, &["name", "type"])?;
    let raw_type = payload.get("type").and_then(Value::as_str).unwrap_or_default();
    let entity_type = EntityType::parse(raw_type)
        .ok_or_else(|| AppError::Validation("Invalid entity type".into()))?;
    Ok(Entity {
        id,
        name: required_string(payload, "name")?,
        entity_type,
        email: optional_string(payload, "email"),
        phone: optional_string(payload, "phone"),
        address: optional_string(payload, "address"),
    })
}

pub fn create(db: &DbState, payload: &Value) -> AppResult<Entity> {
    let entity = entity_from_payload(payload, resolve_id(payload)?)?;

    let conn = db.lock()?;
    db::with_transaction(&conn, |tx| {
        tx.execute(
            "INSERT INTO entities (id, name, type, email, phone, address)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                entity.id,
                entity.name,
                entity.entity_type.as_str(),
                entity.email,
                entity.phone,
                entity.address,
            ],
        )?;
        sync::enqueue(tx, SYNC_ENTITY, &entity.id, SyncOperation::Insert, &json!(entity))
    })?;

    info!(entity_id = %entity.id, entity_type = %entity.entity_type, "Entity created");
    Ok(entity)
}

pub fn update(db: &DbState, payload: &Value) -> AppResult<Entity> {
    let id = existing_id(payload.get("id").and_then(Value::as_str))?;
    let entity = entity_from_payload(payload, id)?;

    let conn = db.lock()?;
    db::with_transaction(&conn, |tx| {
        let current = find(tx, &entity.id)?
            .ok_or_else(|| AppError::NotFound("Entity not found".into()))?;
        // Invoices check their counterpart's type, so it is fixed once used.
        if current.entity_type != entity.entity_type && invoice_count(tx, &entity.id)? > 0 {
            return Err(AppError::Conflict(
                "Entity type cannot change while invoices reference it.".into(),
            ));
        }
        let changed = tx.execute(
            "UPDATE entities SET name = ?1, type = ?2, email = ?3, phone = ?4, address = ?5
             WHERE id = ?6",
            params![
                entity.name,
                entity.entity_type.as_str(),
                entity.email,
                entity.phone,
                entity.address,
                entity.id,
            ],
        )?;
        if changed == 0 {
            return Err(AppError::NotFound("Entity not found".into()));
        }
        sync::enqueue(tx, SYNC_ENTITY, &entity.id, SyncOperation::Update, &json!(entity))
    })?;

    Ok(entity)
}

fn invoice_count(conn: &Connection, id: &str) -> AppResult<i64> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM invoices WHERE entity_id = ?1",
        params![id],
        |row| row.get(0),
    )?)
}

/// Delete an entity unless an invoice references it.
pub fn delete(db: &DbState, id: Option<&str>) -> AppResult<String> {
    let id = existing_id(id)?;
    let conn = db.lock()?;
    db::with_transaction(&conn, |tx| {
        if find(tx, &id)?.is_none() {
            return Err(AppError::NotFound("Entity not found".into()));
        }
        if invoice_count(tx, &id)? > 0 {
            return Err(AppError::Conflict("Entity in use.".into()));
        }
        tx.execute("DELETE FROM entities WHERE id = ?1", params![id])?;
        sync::enqueue(tx, SYNC_ENTITY, &id, SyncOperation::Delete, &json!({ "id": id }))
    })?;

    info!(entity_id = %id, "Entity deleted");
    Ok(id)
}
