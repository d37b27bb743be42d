use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use crate::app_state::AppState;
use crate::services::worker_pool::WorkerStatus;

#[derive(Serialize)]
pub struct ControlResponse {
    /// Whether the call changed the pool's state.
    pub changed: bool,
    pub workers: WorkerStatus,
}

/// GET /workers/status
pub async fn worker_status(State(state): State<AppState>) -> Json<WorkerStatus> {
    Json(state.pool.status().await)
}

/// POST /workers/start (idempotent)
pub async fn start_workers(State(state): State<AppState>) -> (StatusCode, Json<ControlResponse>) {
    if state.pool.status().await.fatal {
        return (
            StatusCode::CONFLICT,
            Json(ControlResponse {
                changed: false,
                workers: state.pool.status().await,
            }),
        );
    }
    let changed = state.pool.start().await;
    (
        StatusCode::OK,
        Json(ControlResponse {
            changed,
            workers: state.pool.status().await,
        }),
    )
}

/// POST /workers/stop, draining in-flight jobs
pub async fn stop_workers(State(state): State<AppState>) -> Json<ControlResponse> {
    let changed = state.pool.stop().await;
    Json(ControlResponse {
        changed,
        workers: state.pool.status().await,
    })
}
