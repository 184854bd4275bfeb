//! Shared state handed to every handler.

use std::sync::Arc;

use crate::auth::AuthState;
use crate::db::DbState;
use crate::sync::SyncState;

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<DbState>,
    pub sync: Arc<SyncState>,
    pub auth: Arc<AuthState>,
}

impl AppState {
    pub fn new(db: Arc<DbState>, sync: Arc<SyncState>, auth: Arc<AuthState>) -> Self {
        Self { db, sync, auth }
    }
}
