//! Liveness and readiness probes

use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use tokio::time::timeout;

use crate::state::RelayState;
use crate::store::DeltaStore;

const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(10);

pub fn router<S: DeltaStore>() -> Router<RelayState<S>> {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/readyz", get(readyz_handler::<S>))
}

async fn healthz_handler() -> Response {
    (StatusCode::OK, Json(serde_json::json!({"status": "ok"}))).into_response()
}

/// Ready only while the delta store answers
async fn readyz_handler<S: DeltaStore>(State(state): State<RelayState<S>>) -> Response {
    match timeout(HEALTH_CHECK_TIMEOUT, state.store().ready()).await {
        Ok(Ok(())) => (StatusCode::OK, Json(serde_json::json!({"status": "ok"}))).into_response(),
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "readiness check failed");
            let msg = serde_json::json!({
                "status": "failure",
                "message": "delta store is not available"
            });
            (StatusCode::SERVICE_UNAVAILABLE, Json(msg)).into_response()
        }
        Err(_) => {
            let msg = serde_json::json!({
                "status": "failure",
                "message": "health check timed out"
            });
            (StatusCode::SERVICE_UNAVAILABLE, Json(msg)).into_response()
        }
    }
}
