//! HTTP surface using Axum.

use crate::error::QueueError;
use crate::scheduler::{QueueStatus, ResourceClass, SubmitRequest};
use crate::session::SessionInfo;
use crate::state::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

#[derive(Deserialize)]
struct SubmitBody {
    user_id: String,
    operation: String,
    resource_class: ResourceClass,
    #[serde(default)]
    payload: Value,
    #[serde(default)]
    priority: i32,
}

#[derive(Serialize)]
struct SubmitResponse {
    result: Value,
}

type ApiError = (StatusCode, String);

fn api_error(err: QueueError) -> ApiError {
    let status = match &err {
        QueueError::SessionExpired(_) => StatusCode::GONE,
        QueueError::UnknownOperation { .. } => StatusCode::NOT_FOUND,
        QueueError::ResourceAcquisition { .. } | QueueError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
        QueueError::InvalidPath(_) => StatusCode::BAD_REQUEST,
        QueueError::Operation(_) | QueueError::OperationPanicked(_) | QueueError::Workspace(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, err.to_string())
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/operations", post(submit))
        .route("/sessions", get(list_sessions))
        .route("/sessions/:user_id", get(get_session).delete(delete_session))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind `addr` and serve until `shutdown` resolves.
pub async fn run_server(
    addr: SocketAddr,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    serve(listener, state, shutdown).await
}

pub async fn serve(
    listener: TcpListener,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    info!("Starting HTTP server on {}", listener.local_addr()?);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn health() -> &'static str {
    "OK"
}

async fn status(State(state): State<AppState>) -> Json<QueueStatus> {
    Json(state.scheduler.status().await)
}

async fn submit(
    State(state): State<AppState>,
    Json(body): Json<SubmitBody>,
) -> Result<Json<SubmitResponse>, ApiError> {
    info!(
        user_id = %body.user_id,
        operation = %body.operation,
        resource_class = %body.resource_class,
        "POST /operations"
    );
    let request = SubmitRequest::new(body.user_id, body.operation, body.resource_class)
        .payload(body.payload)
        .priority(body.priority);
    let result = state.scheduler.submit(request).await.map_err(api_error)?;
    Ok(Json(SubmitResponse { result }))
}

async fn list_sessions(State(state): State<AppState>) -> Json<Vec<SessionInfo>> {
    Json(state.scheduler.sessions().list().await)
}

async fn get_session(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<SessionInfo>, StatusCode> {
    state
        .scheduler
        .sessions()
        .info(&user_id)
        .await
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

async fn delete_session(State(state): State<AppState>, Path(user_id): Path<String>) -> StatusCode {
    state.scheduler.cleanup_session(&user_id).await;
    info!(user_id = %user_id, "Cleaned up session");
    StatusCode::NO_CONTENT
}
