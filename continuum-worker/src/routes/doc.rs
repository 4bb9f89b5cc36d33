//! OpenAPI document for the status surface.

use std::sync::Arc;

use axum::routing::get;
use axum::{Json, Router};
use utoipa::OpenApi;

use crate::state::AppState;

use super::{health, status};

#[derive(OpenApi)]
#[openapi(
    info(title = "continuum-worker status API"),
    paths(health::get_health, status::get_status, status::get_global_status),
    components(schemas(status::StatusResponse, status::GlobalStatus))
)]
pub struct ApiDoc;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/api-docs/openapi.json", get(openapi_json))
}

async fn openapi_json() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}
