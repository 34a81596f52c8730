use std::sync::Arc;

use crate::db::store::JobStore;
use crate::services::reporter::StatusReporter;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn JobStore>,
    pub reporter: StatusReporter,
}

impl AppState {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self {
            reporter: StatusReporter::new(store.clone()),
            store,
        }
    }
}
