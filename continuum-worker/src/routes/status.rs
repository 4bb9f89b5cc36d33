//! Worker and fleet status endpoints.
//!
//! `/status` reports this process; `/global-status` aggregates the whole
//! task table. The response structs here are serialisation views; the
//! authoritative per-worker state lives in [`continuum_core::stats`].

use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use continuum_core::StatusSnapshot;
use serde::Serialize;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::error::ApiError;
use crate::state::AppState;

/// Register status routes.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/status", get(get_status))
        .route("/global-status", get(get_global_status))
}

/// JSON view of one worker's counters.
#[derive(Debug, Serialize, ToSchema)]
pub struct StatusResponse {
    pub id: Uuid,
    pub start_time: DateTime<Utc>,
    pub uptime: String,
    pub tasks_processed: u64,
    pub tasks_successful: u64,
    pub tasks_failed: u64,
    pub database_failures: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<Object>)]
    pub current_task: Option<serde_json::Value>,
}

impl From<StatusSnapshot> for StatusResponse {
    fn from(snapshot: StatusSnapshot) -> Self {
        Self {
            id: snapshot.id,
            start_time: snapshot.start_time,
            uptime: snapshot.uptime,
            tasks_processed: snapshot.tasks_processed,
            tasks_successful: snapshot.tasks_successful,
            tasks_failed: snapshot.tasks_failed,
            database_failures: snapshot.database_failures,
            current_task: snapshot
                .current_task
                .and_then(|task| serde_json::to_value(task).ok()),
        }
    }
}

/// System-wide task metrics.
#[derive(Debug, Default, Serialize, ToSchema)]
pub struct GlobalStatus {
    pub total_tasks: i64,
    pub pending_tasks: i64,
    pub running_tasks: i64,
    pub completed_tasks: i64,
    pub failed_tasks: i64,
    pub avg_execution_seconds: f64,
    pub throughput_tasks_per_hour: i64,
}

/// Per-worker status snapshot.
#[utoipa::path(
    get,
    path = "/status",
    tag = "status",
    responses(
        (status = 200, description = "Current worker statistics", body = StatusResponse)
    )
)]
pub async fn get_status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    Json(StatusResponse::from(state.stats.snapshot()))
}

/// Aggregate metrics over every task in the store.
#[utoipa::path(
    get,
    path = "/global-status",
    tag = "status",
    responses(
        (status = 200, description = "Fleet-wide task metrics", body = GlobalStatus),
        (status = 500, description = "Aggregation query failed")
    )
)]
pub async fn get_global_status(
    State(state): State<Arc<AppState>>,
) -> Result<Json<GlobalStatus>, ApiError> {
    // One round-trip for counts and execution performance combined.
    let row: (i64, i64, i64, i64, i64, f64, i64) = sqlx::query_as(
        "WITH counts AS ( \
             SELECT COUNT(*) AS total, \
                    COUNT(*) FILTER (WHERE status = 'pending') AS pending, \
                    COUNT(*) FILTER (WHERE status = 'running') AS running, \
                    COUNT(*) FILTER (WHERE status = 'completed') AS completed, \
                    COUNT(*) FILTER (WHERE status = 'failed') AS failed \
             FROM tasks \
         ), performance AS ( \
             SELECT COALESCE(AVG(EXTRACT(EPOCH FROM (finished - started))), 0)::double precision \
                        AS avg_exec, \
                    COUNT(*) FILTER (WHERE finished > NOW() - INTERVAL '1 hour') AS recent \
             FROM tasks \
             WHERE status = 'completed' AND finished IS NOT NULL AND started IS NOT NULL \
         ) \
         SELECT * FROM counts, performance",
    )
    .fetch_one(state.store.pool())
    .await?;

    let (total, pending, running, completed, failed, avg_exec, recent) = row;
    Ok(Json(GlobalStatus {
        total_tasks: total,
        pending_tasks: pending,
        running_tasks: running,
        completed_tasks: completed,
        failed_tasks: failed,
        avg_execution_seconds: avg_exec,
        throughput_tasks_per_hour: recent,
    }))
}
