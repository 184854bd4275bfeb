//! Router configuration for the HTTP API.
//!
//! Sets up every route plus the middleware stack (auth, CORS, tracing, body
//! limit) and returns a router ready for serving.

use axum::{
    extract::DefaultBodyLimit,
    middleware,
    routing::{get, post},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use super::handlers;
use super::state::AppState;

/// Create the application router with all routes and middleware.
pub fn create_router(state: AppState, body_limit: usize) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let protected = Router::new()
        .route("/users", post(handlers::create_user))
        .route(
            "/products",
            get(handlers::list_products)
                .post(handlers::create_product)
                .put(handlers::update_product)
                .delete(handlers::delete_product),
        )
        .route("/products/low-stock", get(handlers::low_stock_products))
        .route("/products/sku/{sku}", get(handlers::product_by_sku))
        .route("/products/{id}", get(handlers::get_product))
        .route("/products/{id}/movements", get(handlers::product_movements))
        .route(
            "/categories",
            get(handlers::list_categories)
                .post(handlers::create_category)
                .put(handlers::update_category)
                .delete(handlers::delete_category),
        )
        .route(
            "/entities",
            get(handlers::list_entities)
                .post(handlers::create_entity)
                .put(handlers::update_entity)
                .delete(handlers::delete_entity),
        )
        .route("/entities/{id}", get(handlers::get_entity))
        .route(
            "/invoices",
            get(handlers::list_invoices)
                .post(handlers::create_invoice)
                .put(handlers::update_invoice),
        )
        .route("/invoices/{id}", get(handlers::get_invoice))
        .route("/invoices/{id}/payments", post(handlers::record_payment))
        .route(
            "/cash",
            get(handlers::list_cash)
                .post(handlers::create_cash)
                .delete(handlers::delete_cash),
        )
        .route("/cash/summary", get(handlers::cash_summary))
        .route("/dashboard", get(handlers::dashboard))
        .route("/pos/checkout", post(handlers::pos_checkout))
        .route("/sync/status", get(handlers::sync_status))
        .route("/sync/force", post(handlers::sync_force))
        .route("/sync/retry", post(handlers::sync_retry))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            handlers::require_auth,
        ));

    let api = Router::new()
        .route(
            "/auth",
            get(handlers::current_session)
                .post(handlers::login)
                .delete(handlers::logout),
        )
        .merge(protected);

    Router::new()
        .route("/health", get(handlers::health_check))
        .nest("/api", api)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
