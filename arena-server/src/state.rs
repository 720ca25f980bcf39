//! Shared application state for the ingress server.

use std::sync::Arc;

use arena::io::store::JobStore;

/// Shared state accessible from all request handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<JobStore>,
    /// Upper bound on a request body, in bytes.
    pub max_body_bytes: usize,
}

impl AppState {
    pub fn new(store: JobStore, max_body_bytes: usize) -> Self {
        Self {
            store: Arc::new(store),
            max_body_bytes,
        }
    }
}
