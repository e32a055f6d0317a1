use crate::config::{AppState, ServerConfig};
use crate::middleware::auth;
use anyhow::Result;
use axum::{
    http::{header, StatusCode},
    middleware::from_fn_with_state,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use shoal_core::EngineError;
use std::sync::Arc;
use tower_http::{
    cors::CorsLayer,
    sensitive_headers::SetSensitiveRequestHeadersLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};

mod handlers;

/// Start the API server and resume interrupted DAGs
pub async fn serve(addr: &str, config: ServerConfig) -> Result<()> {
    let state = Arc::new(AppState::new(&config)?);

    let resumed = state.executor.recover().await?;
    tracing::info!("Agent {} ready, {} dag(s) resumed", state.agent, resumed);

    let app = create_router(state.clone());

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("API server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Shutting down");
    state.shutdown.cancel();
    state.executor.shutdown().await;
    state.journal.flush_all().await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
    }
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    let protected = Router::new()
        .route("/api/v1/operations", get(handlers::list_operations))
        .route("/api/v1/dags", get(handlers::list_dags).post(handlers::submit_dag))
        .route("/api/v1/dags/{dag_id}", get(handlers::get_dag))
        .route("/api/v1/dags/{dag_id}/operator", post(handlers::send_operator))
        .route("/api/v1/dags/{dag_id}/events", get(handlers::get_dag_events))
        .route(
            "/api/v1/dags/{dag_id}/tasks/{task_id}/logs",
            get(handlers::get_task_logs),
        )
        .route("/api/v1/upgrade/dags/{dag_id}", get(handlers::get_upgrade_dag))
        .route("/api/v1/agent/dispatch", post(handlers::dispatch_task))
        .route_layer(from_fn_with_state(state.clone(), auth::require_token));

    let router = Router::new()
        .route("/api/health", get(health_check))
        .merge(protected);

    with_middleware(router).with_state(state)
}

/// Request tracing and CORS. The bearer token doubles as the agent-to-agent
/// credential, so it is marked sensitive before the trace layer records headers.
fn with_middleware<S: Clone + Send + Sync + 'static>(router: Router<S>) -> Router<S> {
    router
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().include_headers(true))
                .on_response(DefaultOnResponse::new().include_headers(true)),
        )
        .layer(SetSensitiveRequestHeadersLayer::new([header::AUTHORIZATION]))
        .layer(CorsLayer::permissive())
}

/// Health check endpoint
async fn health_check(
    axum::extract::State(state): axum::extract::State<Arc<AppState>>,
) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "agent": state.agent.to_string(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// API error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            details: None,
        }
    }

    pub fn with_details(error: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            details: Some(details.into()),
        }
    }
}

/// Custom error type for API handlers
pub struct ApiError {
    status: StatusCode,
    error: anyhow::Error,
}

impl ApiError {
    pub fn new(status: StatusCode, error: impl Into<anyhow::Error>) -> Self {
        Self {
            status,
            error: error.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, anyhow::anyhow!(message.into()))
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, anyhow::anyhow!(message.into()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let error_msg = self.error.to_string();
        let details = self
            .error
            .chain()
            .skip(1)
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join(": ");

        if self.status.is_server_error() {
            tracing::error!("Request failed: {:#}", self.error);
        }

        let response = if details.is_empty() {
            ErrorResponse::new(error_msg)
        } else {
            ErrorResponse::with_details(error_msg, details)
        };

        (self.status, Json(response)).into_response()
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        let status = match &err {
            EngineError::DagNotFound(_) | EngineError::TaskNotFound(_) => StatusCode::NOT_FOUND,
            EngineError::OperationNotPermitted { .. }
            | EngineError::InvalidDagState { .. }
            | EngineError::VersionConflict { .. } => StatusCode::CONFLICT,
            EngineError::UnknownOperationType(_)
            | EngineError::DuplicateOperationType(_)
            | EngineError::InvalidDag(_)
            | EngineError::InvalidAgentAddress(_) => StatusCode::BAD_REQUEST,
            EngineError::TaskExecutionFailed(_)
            | EngineError::Dispatch { .. }
            | EngineError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err)
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, err)
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
