// HTTP surface of the coordinator

use axum::{
    Router,
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
};
use serde_json::Value;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::Orca;
use crate::error::OrcaError;
use crate::model::{ProcessorRegistration, Status, Window, WindowEmitStatus, WindowTypes};

pub type AppState = Arc<Orca>;

type ApiError = (StatusCode, Json<Value>);

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/register_processor", post(register_processor))
        .route("/emit_window", post(emit_window))
        .route("/read_window_types", post(read_window_types))
        .route("/algorithms", get(list_algorithms))
        .route("/processors", get(list_processors))
        .route("/windows", get(list_windows))
        .route("/results/stats", get(result_stats))
        .route("/results/{name}/{version}", get(results_for_algorithm))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

fn error_body(status: StatusCode, message: impl ToString) -> ApiError {
    (
        status,
        Json(serde_json::json!({ "error": message.to_string() })),
    )
}

fn internal(e: anyhow::Error) -> ApiError {
    error!("Request failed: {:#}", e);
    error_body(StatusCode::INTERNAL_SERVER_ERROR, e)
}

async fn health_check() -> Json<Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

async fn register_processor(
    State(state): State<AppState>,
    Json(registration): Json<ProcessorRegistration>,
) -> Json<Status> {
    // rejections travel in the body, not as HTTP errors
    Json(state.registry.register(registration).await)
}

async fn emit_window(
    State(state): State<AppState>,
    Json(window): Json<Window>,
) -> Result<Json<WindowEmitStatus>, ApiError> {
    match state.coordinator.emit_window(window).await {
        Ok(status) => Ok(Json(status)),
        Err(e @ OrcaError::InvalidWindow(_)) => Err(error_body(StatusCode::BAD_REQUEST, e)),
        Err(e) => Err(internal(e.into())),
    }
}

async fn read_window_types(State(state): State<AppState>) -> Json<WindowTypes> {
    Json(state.registry.list_window_types().await)
}

async fn list_algorithms(State(state): State<AppState>) -> Json<Value> {
    let algorithms = state.registry.list_algorithms().await;
    Json(serde_json::json!({
        "algorithms": algorithms,
        "count": algorithms.len(),
    }))
}

async fn list_processors(State(state): State<AppState>) -> Json<Value> {
    let processors = state.registry.list_processors().await;
    Json(serde_json::json!({
        "processors": processors,
        "count": processors.len(),
    }))
}

async fn list_windows(State(state): State<AppState>) -> Json<Value> {
    let windows = state.coordinator.read_windows().await;
    Json(serde_json::json!({
        "windows": windows,
        "count": windows.len(),
    }))
}

async fn results_for_algorithm(
    State(state): State<AppState>,
    Path((name, version)): Path<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    let results = state
        .store
        .results_for_algorithm(&name, &version)
        .await
        .map_err(internal)?;

    Ok(Json(serde_json::json!({
        "algorithm": { "name": name, "version": version },
        "results": results,
        "count": results.len(),
    })))
}

async fn result_stats(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let stats = state.store.stats().await.map_err(internal)?;
    Ok(Json(serde_json::to_value(stats).map_err(|e| internal(e.into()))?))
}
