//! Offline sync queue.
//!
//! Every local mutation appends a row to `sync_queue` inside its own write
//! transaction. A background task replays pending rows against the remote
//! store in insertion order. Transient failures back off exponentially and
//! hold back every later row; permanent failures are parked as `failed` so
//! they cannot block the queue.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use reqwest::Method;
use rusqlite::{params, Connection};
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::api::{self, RemoteError};
use crate::db::DbState;
use crate::error::{AppError, AppResult};

const DEFAULT_RETRY_DELAY_MS: i64 = 5_000;
const MAX_RETRY_DELAY_MS: i64 = 300_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOperation {
    Insert,
    Update,
    Delete,
}

impl SyncOperation {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncOperation::Insert => "insert",
            SyncOperation::Update => "update",
            SyncOperation::Delete => "delete",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "insert" => Some(SyncOperation::Insert),
            "update" => Some(SyncOperation::Update),
            "delete" => Some(SyncOperation::Delete),
            _ => None,
        }
    }

    fn method(self) -> Method {
        match self {
            SyncOperation::Insert => Method::POST,
            SyncOperation::Update => Method::PUT,
            SyncOperation::Delete => Method::DELETE,
        }
    }
}

/// Append one outbox row. Must run on the caller's write transaction so the
/// row commits or rolls back with the mutation it describes.
pub fn enqueue(
    conn: &Connection,
    entity_type: &str,
    entity_id: &str,
    operation: SyncOperation,
    payload: &Value,
) -> AppResult<()> {
    let idempotency_key = format!(
        "{entity_type}:{entity_id}:{}:{}",
        operation.as_str(),
        Uuid::new_v4()
    );
    conn.execute(
        "INSERT INTO sync_queue (entity_type, entity_id, operation, payload, idempotency_key)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            entity_type,
            entity_id,
            operation.as_str(),
            payload.to_string(),
            idempotency_key
        ],
    )?;
    debug!(entity_type, entity_id, operation = operation.as_str(), "Sync operation queued");
    Ok(())
}

/// Resource path on the remote store for a queued entity type.
fn resource_path(entity_type: &str) -> Option<&'static str> {
    match entity_type {
        "product" => Some("/api/products"),
        "category" => Some("/api/categories"),
        "entity" => Some("/api/entities"),
        "invoice" => Some("/api/invoices"),
        "cash_transaction" => Some("/api/cash"),
        _ => None,
    }
}

fn percent_encode(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for b in input.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Engine state
// ---------------------------------------------------------------------------

/// Where queued operations are replayed.
#[derive(Clone)]
pub struct RemoteTarget {
    pub base_url: String,
    pub api_key: Zeroizing<String>,
}

impl RemoteTarget {
    pub fn new(base_url: &str, api_key: String) -> Self {
        Self {
            base_url: api::normalize_base_url(base_url),
            api_key: Zeroizing::new(api_key),
        }
    }
}

impl std::fmt::Debug for RemoteTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteTarget")
            .field("base_url", &self.base_url)
            .field("api_key", &"<redacted>")
            .finish()
    }
}

/// Shared state for the background sync engine.
pub struct SyncState {
    pub is_running: Arc<AtomicBool>,
    pub is_online: Arc<AtomicBool>,
    pub last_sync: Arc<Mutex<Option<String>>>,
    remote: Option<RemoteTarget>,
    batch_size: usize,
    /// Held for the length of a cycle so the loop and a forced sync never
    /// replay the same rows twice.
    cycle_lock: tokio::sync::Mutex<()>,
}

impl SyncState {
    pub fn new(remote: Option<RemoteTarget>, batch_size: usize) -> Self {
        Self {
            is_running: Arc::new(AtomicBool::new(false)),
            is_online: Arc::new(AtomicBool::new(false)),
            last_sync: Arc::new(Mutex::new(None)),
            remote,
            batch_size: batch_size.max(1),
            cycle_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn remote(&self) -> Option<&RemoteTarget> {
        self.remote.as_ref()
    }

    fn mark_synced_now(&self) {
        if let Ok(mut guard) = self.last_sync.lock() {
            *guard = Some(Utc::now().to_rfc3339());
        }
    }
}

/// Outcome of one replay pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub synced: usize,
    pub failed: usize,
    pub retried: usize,
    /// A row is waiting on its backoff, so later rows were held back.
    pub blocked: bool,
}

struct QueueRow {
    id: i64,
    entity_type: String,
    entity_id: String,
    operation: String,
    payload: String,
    idempotency_key: String,
    retry_count: i64,
    max_retries: i64,
    retry_delay_ms: i64,
    next_retry_at: Option<String>,
}

fn deterministic_jitter_ms(seed: i64) -> i64 {
    let positive = if seed < 0 { -seed } else { seed };
    (positive % 700) + 50
}

fn schedule_next_retry(delay_ms: i64, seed: i64) -> String {
    let bounded = delay_ms.clamp(1_000, MAX_RETRY_DELAY_MS);
    let jitter = deterministic_jitter_ms(seed);
    (Utc::now() + ChronoDuration::milliseconds(bounded + jitter)).to_rfc3339()
}

fn is_due(next_retry_at: Option<&str>, now: DateTime<Utc>) -> bool {
    match next_retry_at {
        None => true,
        Some(raw) => DateTime::parse_from_rfc3339(raw)
            .map(|at| at.with_timezone(&Utc) <= now)
            .unwrap_or(true),
    }
}

fn load_pending(db: &DbState, limit: usize) -> AppResult<Vec<QueueRow>> {
    let conn = db.lock()?;
    // A crash mid-request leaves rows in progress; they are retried.
    conn.execute(
        "UPDATE sync_queue SET status = 'pending', updated_at = datetime('now')
         WHERE status = 'in_progress'",
        [],
    )?;
    let mut stmt = conn.prepare(
        "SELECT id, entity_type, entity_id, operation, payload, idempotency_key,
                retry_count, max_retries, retry_delay_ms, next_retry_at
         FROM sync_queue
         WHERE status = 'pending'
         ORDER BY id ASC
         LIMIT ?1",
    )?;
    let rows = stmt
        .query_map(params![limit as i64], |row| {
            Ok(QueueRow {
                id: row.get(0)?,
                entity_type: row.get(1)?,
                entity_id: row.get(2)?,
                operation: row.get(3)?,
                payload: row.get(4)?,
                idempotency_key: row.get(5)?,
                retry_count: row.get(6)?,
                max_retries: row.get(7)?,
                retry_delay_ms: row.get(8)?,
                next_retry_at: row.get(9)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn set_in_progress(db: &DbState, id: i64) -> AppResult<()> {
    let conn = db.lock()?;
    conn.execute(
        "UPDATE sync_queue SET status = 'in_progress', updated_at = datetime('now') WHERE id = ?1",
        params![id],
    )?;
    Ok(())
}

fn mark_synced(db: &DbState, id: i64) -> AppResult<()> {
    let conn = db.lock()?;
    conn.execute(
        "UPDATE sync_queue
         SET status = 'synced', last_error = NULL, next_retry_at = NULL,
             synced_at = datetime('now'), updated_at = datetime('now')
         WHERE id = ?1",
        params![id],
    )?;
    Ok(())
}

fn mark_failed(db: &DbState, id: i64, error: &str) -> AppResult<()> {
    let conn = db.lock()?;
    conn.execute(
        "UPDATE sync_queue
         SET status = 'failed', last_error = ?1, next_retry_at = NULL,
             updated_at = datetime('now')
         WHERE id = ?2",
        params![error, id],
    )?;
    Ok(())
}

/// Record a transient failure. Returns true when the row ran out of retries.
fn mark_retry(db: &DbState, row: &QueueRow, error: &str) -> AppResult<bool> {
    let new_count = row.retry_count + 1;
    let exhausted = new_count >= row.max_retries;
    let delay = row.retry_delay_ms.max(DEFAULT_RETRY_DELAY_MS);
    let next_delay = (delay * 2).min(MAX_RETRY_DELAY_MS);
    let (status, next_retry_at) = if exhausted {
        ("failed", None)
    } else {
        ("pending", Some(schedule_next_retry(delay, row.id)))
    };

    let conn = db.lock()?;
    conn.execute(
        "UPDATE sync_queue
         SET status = ?1, retry_count = ?2, next_retry_at = ?3, retry_delay_ms = ?4,
             last_error = ?5, updated_at = datetime('now')
         WHERE id = ?6",
        params![status, new_count, next_retry_at, next_delay, error, row.id],
    )?;
    Ok(exhausted)
}

async fn push_row(remote: &RemoteTarget, row: &QueueRow) -> Result<(), RemoteError> {
    let permanent = |message: String| RemoteError {
        status: Some(400),
        message,
    };
    let operation = SyncOperation::parse(&row.operation)
        .ok_or_else(|| permanent(format!("Unknown sync operation {}", row.operation)))?;
    let base_path = resource_path(&row.entity_type)
        .ok_or_else(|| permanent(format!("Unsupported sync entity {}", row.entity_type)))?;
    let payload: Value = serde_json::from_str(&row.payload)
        .map_err(|e| permanent(format!("Corrupt sync payload: {e}")))?;

    let (path, body) = match operation {
        SyncOperation::Delete => (
            format!("{base_path}?id={}", percent_encode(&row.entity_id)),
            None,
        ),
        _ => (base_path.to_string(), Some(&payload)),
    };

    let result = api::request_remote(
        &remote.base_url,
        &remote.api_key,
        &path,
        operation.method(),
        body,
        Some(row.idempotency_key.as_str()),
    )
    .await;

    match result {
        Ok(_) => Ok(()),
        // The remote already holds the record, usually from an earlier
        // attempt whose response was lost.
        Err(err) if operation == SyncOperation::Insert && err.status == Some(409) => {
            debug!(queue_id = row.id, "Remote already has inserted record");
            Ok(())
        }
        Err(err) => Err(err),
    }
}

/// Replay due pending rows oldest first, at most `batch_size` of them.
pub async fn run_sync_cycle(
    db: &DbState,
    remote: &RemoteTarget,
    batch_size: usize,
) -> AppResult<SyncReport> {
    let mut report = SyncReport::default();
    let rows = load_pending(db, batch_size)?;
    let now = Utc::now();

    for row in rows {
        if !is_due(row.next_retry_at.as_deref(), now) {
            report.blocked = true;
            break;
        }

        set_in_progress(db, row.id)?;
        match push_row(remote, &row).await {
            Ok(()) => {
                mark_synced(db, row.id)?;
                report.synced += 1;
            }
            Err(err) if err.is_transient() => {
                let exhausted = mark_retry(db, &row, &err.message)?;
                if exhausted {
                    warn!(
                        queue_id = row.id,
                        entity_type = %row.entity_type,
                        entity_id = %row.entity_id,
                        error = %err,
                        "Sync retries exhausted"
                    );
                    report.failed += 1;
                } else {
                    debug!(queue_id = row.id, error = %err, "Sync deferred for retry");
                    report.retried += 1;
                }
                // Later rows must not overtake this one.
                report.blocked = true;
                break;
            }
            Err(err) => {
                warn!(
                    queue_id = row.id,
                    entity_type = %row.entity_type,
                    entity_id = %row.entity_id,
                    error = %err,
                    "Sync rejected by remote store"
                );
                mark_failed(db, row.id, &err.message)?;
                report.failed += 1;
            }
        }
    }

    Ok(report)
}

async fn run_guarded_cycle(db: &DbState, state: &SyncState) -> AppResult<SyncReport> {
    let remote = state
        .remote()
        .ok_or_else(|| AppError::Validation("Remote store not configured".into()))?;
    let _guard = state.cycle_lock.lock().await;
    let report = run_sync_cycle(db, remote, state.batch_size).await?;
    state.mark_synced_now();
    Ok(report)
}

// ---------------------------------------------------------------------------
// Background sync loop
// ---------------------------------------------------------------------------

/// Start the background sync loop. Every `interval` it checks connectivity
/// and, while the remote store is reachable, replays the queue. Without a
/// configured remote the loop idles and rows stay pending.
pub fn start_sync_loop(
    db: Arc<DbState>,
    state: Arc<SyncState>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    state.is_running.store(true, Ordering::SeqCst);

    tokio::spawn(async move {
        info!(interval_secs = interval.as_secs(), "Sync loop started");
        let mut previous_online: Option<bool> = None;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }

            let Some(remote) = state.remote() else {
                continue;
            };

            let connectivity = api::test_connectivity(&remote.base_url, &remote.api_key).await;
            let online = connectivity.success;
            state.is_online.store(online, Ordering::SeqCst);

            if !online {
                if previous_online != Some(false) {
                    info!(
                        error = connectivity.error.as_deref().unwrap_or("unknown"),
                        "Network offline; deferring remote sync and keeping queue pending"
                    );
                }
                previous_online = Some(false);
                continue;
            }

            if previous_online == Some(false) {
                info!("Network restored; resuming queued sync");
            }
            previous_online = Some(true);

            match run_guarded_cycle(&db, &state).await {
                Ok(report) => {
                    if report.synced > 0 || report.failed > 0 {
                        info!(
                            synced = report.synced,
                            failed = report.failed,
                            retried = report.retried,
                            "Sync cycle complete"
                        );
                    }
                }
                Err(e) => warn!(error = %e, "Sync cycle failed"),
            }
        }

        state.is_running.store(false, Ordering::SeqCst);
        info!("Sync loop stopped");
    })
}

/// Run one cycle now. Errors when no remote store is configured or when it
/// cannot be reached.
pub async fn force_sync(db: &DbState, state: &SyncState) -> AppResult<SyncReport> {
    let remote = state
        .remote()
        .ok_or_else(|| AppError::Validation("Remote store not configured".into()))?;
    let connectivity = api::test_connectivity(&remote.base_url, &remote.api_key).await;
    state.is_online.store(connectivity.success, Ordering::SeqCst);
    if !connectivity.success {
        let reason = connectivity.error.unwrap_or_else(|| "unknown error".into());
        return Err(AppError::Remote(format!("Remote store unavailable: {reason}")));
    }
    let report = run_guarded_cycle(db, state).await?;
    info!(synced = report.synced, failed = report.failed, "Force sync complete");
    Ok(report)
}

// ---------------------------------------------------------------------------
// Queue inspection and maintenance
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub pending: i64,
    pub in_progress: i64,
    pub failed: i64,
    pub synced: i64,
    pub oldest_next_retry_at: Option<String>,
    pub is_online: bool,
    pub is_running: bool,
    pub remote_configured: bool,
    pub last_sync: Option<String>,
}

pub fn get_sync_status(db: &DbState, state: &SyncState) -> AppResult<SyncStatus> {
    let conn = db.lock()?;
    let count = |status: &str| -> AppResult<i64> {
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM sync_queue WHERE status = ?1",
            params![status],
            |row| row.get(0),
        )?)
    };
    let pending = count("pending")?;
    let in_progress = count("in_progress")?;
    let failed = count("failed")?;
    let synced = count("synced")?;
    let oldest_next_retry_at: Option<String> = conn.query_row(
        "SELECT MIN(next_retry_at) FROM sync_queue
         WHERE status = 'pending' AND next_retry_at IS NOT NULL",
        [],
        |row| row.get(0),
    )?;

    Ok(SyncStatus {
        pending,
        in_progress,
        failed,
        synced,
        oldest_next_retry_at,
        is_online: state.is_online.load(Ordering::SeqCst),
        is_running: state.is_running.load(Ordering::SeqCst),
        remote_configured: state.remote().is_some(),
        last_sync: state.last_sync.lock().ok().and_then(|g| g.clone()),
    })
}

/// Put failed rows back in the queue with a fresh retry budget.
pub fn retry_failed(db: &DbState) -> AppResult<usize> {
    let conn = db.lock()?;
    let requeued = conn.execute(
        "UPDATE sync_queue
         SET status = 'pending', retry_count = 0, retry_delay_ms = ?1,
             next_retry_at = NULL, last_error = NULL, updated_at = datetime('now')
         WHERE status = 'failed'",
        params![DEFAULT_RETRY_DELAY_MS],
    )?;
    if requeued > 0 {
        info!(requeued, "Requeued failed sync rows");
    }
    Ok(requeued)
}

/// Delete synced rows older than `older_than_days`.
pub fn purge_synced(db: &DbState, older_than_days: u32) -> AppResult<usize> {
    let conn = db.lock()?;
    let purged = conn.execute(
        "DELETE FROM sync_queue
         WHERE status = 'synced'
           AND synced_at IS NOT NULL
           AND synced_at <= datetime('now', ?1)",
        params![format!("-{older_than_days} days")],
    )?;
    if purged > 0 {
        info!(purged, older_than_days, "Purged synced rows");
    }
    Ok(purged)
}
