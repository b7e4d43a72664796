use std::sync::Arc;

use crate::db::JobStore;

/// Shared state for the read-only status server.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn JobStore>,
}

impl AppState {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }
}
