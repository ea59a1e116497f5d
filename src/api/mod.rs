pub mod learning_api;
pub mod sync_api;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::application::DependencyContainer;
use crate::jobs::{JobKind, JobRunResult, JobRunner};
use crate::mail::SyncError;
use crate::monitoring::HealthStatus;

/// Application state for the trigger API
#[derive(Clone)]
pub struct AppState {
    pub container: Arc<DependencyContainer>,
    pub jobs: Arc<JobRunner>,
}

pub type ApiResult = Result<Json<Value>, (StatusCode, Json<Value>)>;

/// Create the main API router
pub fn create_api_router(state: AppState) -> Router {
    let timeout = Duration::from_secs(state.container.config.operational.request_timeout_seconds);

    Router::new()
        .route("/api/health", get(health_check))
        .route("/api/jobs", get(job_statistics))
        // Sync triggers
        .route("/api/sync", post(sync_api::sync_all))
        .route("/api/sync/:account_id", post(sync_api::sync_account))
        .route("/api/reconcile", post(sync_api::reconcile_all))
        .route("/api/reconcile/:account_id", post(sync_api::reconcile_account))
        // Learning and notification triggers
        .route("/api/learning/run", post(learning_api::run_learning))
        .route("/api/milestones/run", post(learning_api::run_milestones))
        .route("/metrics", get(metrics))
        .with_state(state)
        .layer(request_timeout(timeout))
        .layer(TraceLayer::new_for_http())
}

/// Long sync triggers answer 408 once the operational request timeout passes.
fn request_timeout(timeout: Duration) -> TimeoutLayer {
    TimeoutLayer::with_status_code(StatusCode::REQUEST_TIMEOUT, timeout)
}

pub(crate) fn error_response(status: StatusCode, message: impl Into<String>) -> (StatusCode, Json<Value>) {
    let message = message.into();
    if status.is_server_error() {
        error!("API request failed: {}", message);
    }
    (status, Json(json!({ "error": message })))
}

pub(crate) fn sync_error_response(err: SyncError) -> (StatusCode, Json<Value>) {
    let status = match &err {
        SyncError::NotFound { .. } => StatusCode::NOT_FOUND,
        SyncError::AlreadyInProgress { .. } => StatusCode::CONFLICT,
        SyncError::Configuration(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(status, err.to_string())
}

pub(crate) fn to_json<T: serde::Serialize>(value: &T) -> ApiResult {
    serde_json::to_value(value)
        .map(Json)
        .map_err(|e| error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

/// Runs a job through the shared runner, refusing overlap with a 409.
pub(crate) async fn trigger_job(state: &AppState, kind: JobKind) -> ApiResult {
    if state.jobs.is_running(kind).await {
        return Err(error_response(
            StatusCode::CONFLICT,
            format!("{kind} job is already running"),
        ));
    }
    let result: JobRunResult = state
        .jobs
        .trigger(kind)
        .await
        .map_err(|e| error_response(StatusCode::CONFLICT, e.to_string()))?;
    to_json(&result)
}

async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let health = state.container.health_checker.check_system_health().await;
    let status = match health.status {
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::OK,
    };
    (
        status,
        Json(json!({
            "status": health.status,
            "service": "mailflow",
            "version": env!("CARGO_PKG_VERSION"),
            "uptime_seconds": health.uptime_seconds,
            "components": health.components,
        })),
    )
}

async fn job_statistics(State(state): State<AppState>) -> Json<Value> {
    let stats = state.jobs.get_statistics().await;
    let by_name: serde_json::Map<String, Value> = stats
        .into_iter()
        .map(|(kind, s)| (kind.as_str().to_string(), json!(s)))
        .collect();
    Json(json!({
        "jobs": by_name,
        "processing_queue": state.container.processing_queue.snapshot(),
    }))
}

async fn metrics(State(state): State<AppState>) -> Response {
    if !state.container.config.operational.enable_metrics {
        return StatusCode::NOT_FOUND.into_response();
    }
    match state.container.metrics.gather() {
        Ok(body) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::ProviderRegistry;
    use crate::storage::InMemoryStore;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_health_endpoint() {
        let state =
            test_support::state_with(Arc::new(InMemoryStore::new()), ProviderRegistry::new()).await;
        let response = create_api_router(state)
            .oneshot(Request::get("/api/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "healthy");
    }

    #[tokio::test]
    async fn test_slow_request_gets_request_timeout() {
        let router = Router::new()
            .route(
                "/slow",
                get(|| async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    "done"
                }),
            )
            .layer(request_timeout(Duration::from_millis(20)));

        let response = router
            .oneshot(Request::get("/slow").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::REQUEST_TIMEOUT);
    }

    #[tokio::test]
    async fn test_metrics_endpoint_exposes_registry() {
        let state =
            test_support::state_with(Arc::new(InMemoryStore::new()), ProviderRegistry::new()).await;
        state.container.metrics.sync_runs_total.inc();
        let response = create_api_router(state)
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert!(String::from_utf8_lossy(&body).contains("mailflow_sync_runs_total 1"));
    }
}
