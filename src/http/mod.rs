//! JSON API served with axum.
//!
//! Handlers are thin: they decode the request, hand the work to the domain
//! modules on the blocking pool, and wrap the result. Every route under
//! `/api` except `/api/auth` requires a bearer token: a login session, or
//! one of the API keys configured for peer instances.

pub mod handlers;
pub mod router;
pub mod state;

pub use router::create_router;
pub use state::AppState;
