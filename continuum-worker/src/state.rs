//! Shared application state injected into every Axum handler.

use std::sync::Arc;

use continuum_core::{PgStore, WorkerStats};

/// State shared across all status HTTP handlers.
#[derive(Clone, Debug)]
pub struct AppState {
    /// Task store handle; the status endpoints only read through it.
    pub store: PgStore,
    /// Per-worker counters, written by the worker loop.
    pub stats: Arc<WorkerStats>,
}
