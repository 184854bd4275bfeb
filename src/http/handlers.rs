//! Route handlers.

use axum::{
    extract::{Path, Query, Request, State},
    http::{header::AUTHORIZATION, HeaderMap},
    middleware::Next,
    response::{IntoResponse, Response},
    Extension, Json,
};
use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

use super::state::AppState;
use crate::auth;
use crate::cash::{self, CashFilter, CashSummary};
use crate::categories;
use crate::dashboard::{self, DashboardMetrics};
use crate::db::DbState;
use crate::entities;
use crate::error::{AppError, AppResult};
use crate::invoices::{self, InvoiceFilter};
use crate::models::{
    CashTransaction, CashType, Category, Entity, EntityType, Invoice, InvoiceType, Page, Product,
    StockMovement, User,
};
use crate::pos::{self, CheckoutLine};
use crate::products::{self, ExpiryStatus, ProductFilter};
use crate::sync::{self, SyncReport, SyncStatus};

pub type HandlerResult<T> = Result<Json<T>, AppError>;

/// Run a store call on the blocking pool; SQLite access is synchronous.
async fn with_db<T, F>(state: &AppState, f: F) -> AppResult<T>
where
    F: FnOnce(&DbState) -> AppResult<T> + Send + 'static,
    T: Send + 'static,
{
    let db = Arc::clone(&state.db);
    tokio::task::spawn_blocking(move || f(&db))
        .await
        .map_err(|e| AppError::Internal(format!("store task failed: {e}")))?
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationResponse {
    pub success: bool,
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub number: Option<String>,
}

fn mutated(id: String) -> Json<MutationResponse> {
    Json(MutationResponse {
        success: true,
        id,
        number: None,
    })
}

fn issued(invoice: Invoice) -> Json<MutationResponse> {
    Json(MutationResponse {
        success: true,
        id: invoice.id,
        number: Some(invoice.number),
    })
}

#[derive(Debug, Deserialize)]
pub struct IdQuery {
    pub id: Option<String>,
}

// =============================================================================
// Health and authentication
// =============================================================================

/// GET /health
pub async fn health_check(State(state): State<AppState>) -> Json<Value> {
    let database = match with_db(&state, |db| {
        let conn = db.lock()?;
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
        Ok(())
    })
    .await
    {
        Ok(()) => "connected".to_string(),
        Err(e) => format!("error: {e}"),
    };
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "database": database,
    }))
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Rejects requests without a live session or a known API key and exposes
/// the caller as a [`User`] extension to downstream handlers.
pub async fn require_auth(State(state): State<AppState>, mut req: Request, next: Next) -> Response {
    let user = match bearer_token(req.headers()) {
        Some(token) => auth::session(&state.auth, token),
        None => Ok(None),
    };
    match user {
        Ok(Some(user)) => {
            req.extensions_mut().insert(user);
            next.run(req).await
        }
        Ok(None) => AppError::Unauthorized("Unauthorized".into()).into_response(),
        Err(e) => e.into_response(),
    }
}

#[derive(Deserialize)]
pub struct LoginRequest {
    /// Accepted for clients that still send `{"action": "login"}`.
    pub action: Option<String>,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub password: String,
}

/// POST /api/auth
pub async fn login(
    State(state): State<AppState>,
    Json(request): Json<LoginRequest>,
) -> HandlerResult<auth::LoginResponse> {
    if request.action.as_deref().is_some_and(|a| a != "login") {
        return Err(AppError::Validation("Invalid request".into()));
    }
    let auth_state = Arc::clone(&state.auth);
    let response = with_db(&state, move |db| {
        auth::login(db, &auth_state, &request.email, &request.password)
    })
    .await?;
    Ok(Json(response))
}

/// GET /api/auth
pub async fn current_session(State(state): State<AppState>, headers: HeaderMap) -> HandlerResult<Value> {
    let user = match bearer_token(&headers) {
        Some(token) => auth::session(&state.auth, token)?,
        None => None,
    };
    Ok(Json(json!({ "user": user })))
}

/// DELETE /api/auth
pub async fn logout(State(state): State<AppState>, headers: HeaderMap) -> HandlerResult<Value> {
    if let Some(token) = bearer_token(&headers) {
        auth::logout(&state.auth, token)?;
    }
    Ok(Json(json!({ "success": true })))
}

/// POST /api/users (administrators only)
pub async fn create_user(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Json(payload): Json<Value>,
) -> HandlerResult<MutationResponse> {
    if user.role != "admin" {
        return Err(AppError::Forbidden("Administrator role required".into()));
    }
    let created = with_db(&state, move |db| auth::create_user(db, &payload)).await?;
    Ok(mutated(created.id))
}

// =============================================================================
// Products
// =============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductView {
    #[serde(flatten)]
    pub product: Product,
    pub low_stock: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expiry_status: Option<ExpiryStatus>,
}

impl ProductView {
    fn new(product: Product, today: NaiveDate) -> Self {
        Self {
            low_stock: product.is_low_stock(),
            expiry_status: products::expiry_status(&product, today),
            product,
        }
    }
}

fn with_views(list: Vec<Product>) -> Vec<ProductView> {
    let today = Utc::now().date_naive();
    list.into_iter().map(|p| ProductView::new(p, today)).collect()
}

/// GET /api/products
pub async fn list_products(
    State(state): State<AppState>,
    Query(filter): Query<ProductFilter>,
) -> HandlerResult<Vec<ProductView>> {
    let list = with_db(&state, move |db| products::list(db, &filter)).await?;
    Ok(Json(with_views(list)))
}

/// GET /api/products/low-stock
pub async fn low_stock_products(State(state): State<AppState>) -> HandlerResult<Vec<ProductView>> {
    let list = with_db(&state, products::low_stock).await?;
    Ok(Json(with_views(list)))
}

/// GET /api/products/{id}
pub async fn get_product(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> HandlerResult<ProductView> {
    let product = with_db(&state, move |db| products::get(db, &id)).await?;
    Ok(Json(ProductView::new(product, Utc::now().date_naive())))
}

/// GET /api/products/sku/{sku}
pub async fn product_by_sku(
    State(state): State<AppState>,
    Path(sku): Path<String>,
) -> HandlerResult<ProductView> {
    let product = with_db(&state, move |db| pos::scan(db, &sku)).await?;
    Ok(Json(ProductView::new(product, Utc::now().date_naive())))
}

/// GET /api/products/{id}/movements
pub async fn product_movements(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> HandlerResult<Vec<StockMovement>> {
    let movements = with_db(&state, move |db| products::stock_movements(db, &id)).await?;
    Ok(Json(movements))
}

/// POST /api/products
pub async fn create_product(
    State(state): State<AppState>,
    Json(payload): Json<Value>,
) -> HandlerResult<MutationResponse> {
    let product = with_db(&state, move |db| products::create(db, &payload)).await?;
    Ok(mutated(product.id))
}

/// PUT /api/products
pub async fn update_product(
    State(state): State<AppState>,
    Json(payload): Json<Value>,
) -> HandlerResult<MutationResponse> {
    let product = with_db(&state, move |db| products::update(db, &payload)).await?;
    Ok(mutated(product.id))
}

/// DELETE /api/products?id=
pub async fn delete_product(
    State(state): State<AppState>,
    Query(query): Query<IdQuery>,
) -> HandlerResult<MutationResponse> {
    let id = with_db(&state, move |db| products::delete(db, query.id.as_deref())).await?;
    Ok(mutated(id))
}

// =============================================================================
// Categories
// =============================================================================

/// GET /api/categories
pub async fn list_categories(State(state): State<AppState>) -> HandlerResult<Vec<Category>> {
    Ok(Json(with_db(&state, categories::list).await?))
}

/// POST /api/categories
pub async fn create_category(
    State(state): State<AppState>,
    Json(payload): Json<Value>,
) -> HandlerResult<MutationResponse> {
    let category = with_db(&state, move |db| categories::create(db, &payload)).await?;
    Ok(mutated(category.id))
}

/// PUT /api/categories
pub async fn update_category(
    State(state): State<AppState>,
    Json(payload): Json<Value>,
) -> HandlerResult<MutationResponse> {
    let category = with_db(&state, move |db| categories::update(db, &payload)).await?;
    Ok(mutated(category.id))
}

/// DELETE /api/categories?id=
pub async fn delete_category(
    State(state): State<AppState>,
    Query(query): Query<IdQuery>,
) -> HandlerResult<MutationResponse> {
    let id = with_db(&state, move |db| categories::delete(db, query.id.as_deref())).await?;
    Ok(mutated(id))
}

// =============================================================================
// Entities
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct EntityQuery {
    #[serde(rename = "type")]
    pub entity_type: Option<EntityType>,
}

/// GET /api/entities?type=
pub async fn list_entities(
    State(state): State<AppState>,
    Query(query): Query<EntityQuery>,
) -> HandlerResult<Vec<Entity>> {
    let list = with_db(&state, move |db| entities::list(db, query.entity_type)).await?;
    Ok(Json(list))
}

/// GET /api/entities/{id}
pub async fn get_entity(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> HandlerResult<Entity> {
    Ok(Json(with_db(&state, move |db| entities::get(db, &id)).await?))
}

/// POST /api/entities
pub async fn create_entity(
    State(state): State<AppState>,
    Json(payload): Json<Value>,
) -> HandlerResult<MutationResponse> {
    let entity = with_db(&state, move |db| entities::create(db, &payload)).await?;
    Ok(mutated(entity.id))
}

/// PUT /api/entities
pub async fn update_entity(
    State(state): State<AppState>,
    Json(payload): Json<Value>,
) -> HandlerResult<MutationResponse> {
    let entity = with_db(&state, move |db| entities::update(db, &payload)).await?;
    Ok(mutated(entity.id))
}

/// DELETE /api/entities?id=
pub async fn delete_entity(
    State(state): State<AppState>,
    Query(query): Query<IdQuery>,
) -> HandlerResult<MutationResponse> {
    let id = with_db(&state, move |db| entities::delete(db, query.id.as_deref())).await?;
    Ok(mutated(id))
}

// =============================================================================
// Invoices
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvoiceQuery {
    pub page: Option<i64>,
    pub limit: Option<i64>,
    #[serde(rename = "type")]
    pub invoice_type: Option<InvoiceType>,
    pub entity_name: Option<String>,
    pub search: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
}

/// GET /api/invoices
pub async fn list_invoices(
    State(state): State<AppState>,
    Query(query): Query<InvoiceQuery>,
) -> HandlerResult<Page<Invoice>> {
    let filter = InvoiceFilter {
        invoice_type: query.invoice_type,
        entity_name: query.entity_name,
        search: query.search,
        from: query.from,
        to: query.to,
    };
    let page = with_db(&state, move |db| {
        invoices::list(db, query.page, query.limit, &filter)
    })
    .await?;
    Ok(Json(page))
}

/// GET /api/invoices/{id}
pub async fn get_invoice(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> HandlerResult<Invoice> {
    Ok(Json(with_db(&state, move |db| invoices::get(db, &id)).await?))
}

/// POST /api/invoices
pub async fn create_invoice(
    State(state): State<AppState>,
    Json(payload): Json<Value>,
) -> HandlerResult<MutationResponse> {
    let invoice = with_db(&state, move |db| invoices::create(db, &payload)).await?;
    Ok(issued(invoice))
}

/// PUT /api/invoices
pub async fn update_invoice(
    State(state): State<AppState>,
    Json(payload): Json<Value>,
) -> HandlerResult<MutationResponse> {
    let invoice = with_db(&state, move |db| invoices::update(db, &payload)).await?;
    Ok(issued(invoice))
}

#[derive(Debug, Deserialize)]
pub struct PaymentRequest {
    pub amount: f64,
}

/// POST /api/invoices/{id}/payments
pub async fn record_payment(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<PaymentRequest>,
) -> HandlerResult<Invoice> {
    let invoice = with_db(&state, move |db| {
        invoices::record_payment(db, &id, request.amount)
    })
    .await?;
    Ok(Json(invoice))
}

// =============================================================================
// Cash register
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct CashQuery {
    pub page: Option<i64>,
    pub limit: Option<i64>,
    #[serde(rename = "type")]
    pub transaction_type: Option<CashType>,
    pub search: Option<String>,
}

/// GET /api/cash
pub async fn list_cash(
    State(state): State<AppState>,
    Query(query): Query<CashQuery>,
) -> HandlerResult<Page<CashTransaction>> {
    let filter = CashFilter {
        transaction_type: query.transaction_type,
        search: query.search,
    };
    let page = with_db(&state, move |db| cash::list(db, query.page, query.limit, &filter)).await?;
    Ok(Json(page))
}

/// POST /api/cash
pub async fn create_cash(
    State(state): State<AppState>,
    Json(payload): Json<Value>,
) -> HandlerResult<MutationResponse> {
    let transaction = with_db(&state, move |db| cash::create(db, &payload)).await?;
    Ok(mutated(transaction.id))
}

/// DELETE /api/cash?id=
pub async fn delete_cash(
    State(state): State<AppState>,
    Query(query): Query<IdQuery>,
) -> HandlerResult<MutationResponse> {
    let id = with_db(&state, move |db| cash::delete(db, query.id.as_deref())).await?;
    Ok(mutated(id))
}

/// GET /api/cash/summary
pub async fn cash_summary(State(state): State<AppState>) -> HandlerResult<CashSummary> {
    Ok(Json(with_db(&state, cash::summary).await?))
}

// =============================================================================
// Dashboard and POS
// =============================================================================

/// GET /api/dashboard
pub async fn dashboard(State(state): State<AppState>) -> HandlerResult<DashboardMetrics> {
    let today = Utc::now().date_naive();
    Ok(Json(with_db(&state, move |db| dashboard::metrics(db, today)).await?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutRequest {
    pub entity_id: Option<String>,
    #[serde(default)]
    pub items: Vec<CheckoutLine>,
}

/// POST /api/pos/checkout
pub async fn pos_checkout(
    State(state): State<AppState>,
    Json(request): Json<CheckoutRequest>,
) -> HandlerResult<MutationResponse> {
    let invoice = with_db(&state, move |db| {
        pos::checkout(db, request.entity_id.as_deref(), &request.items)
    })
    .await?;
    Ok(issued(invoice))
}

// =============================================================================
// Sync
// =============================================================================

/// GET /api/sync/status
pub async fn sync_status(State(state): State<AppState>) -> HandlerResult<SyncStatus> {
    let sync_state = Arc::clone(&state.sync);
    let status = with_db(&state, move |db| sync::get_sync_status(db, &sync_state)).await?;
    Ok(Json(status))
}

/// POST /api/sync/force
pub async fn sync_force(State(state): State<AppState>) -> HandlerResult<SyncReport> {
    Ok(Json(sync::force_sync(&state.db, &state.sync).await?))
}

/// POST /api/sync/retry
pub async fn sync_retry(State(state): State<AppState>) -> HandlerResult<Value> {
    let requeued = with_db(&state, sync::retry_failed).await?;
    Ok(Json(json!({ "success": true, "requeued": requeued })))
}
