//! Axum router construction.
//!
//! [`build`] assembles the status application router:
//! - Per-request trace-id middleware
//! - Health / heartbeat route
//! - `/status` and `/global-status`
//! - OpenAPI document at `/api-docs/openapi.json`

pub mod doc;
pub mod health;
pub mod status;

use std::sync::Arc;

use axum::middleware;
use axum::Router;

use crate::middleware::trace;
use crate::state::AppState;

/// Build the complete Axum [`Router`] for the status server.
pub fn build(state: Arc<AppState>) -> Router {
    Router::new()
        .merge(health::router())
        .merge(status::router())
        .merge(doc::router())
        .layer(middleware::from_fn(trace::trace_middleware))
        .with_state(state)
}
