//! REST API server for the finance assistant
//!
//! Exposes the conversation orchestrator and chat history over HTTP.
//! Authentication is out of scope: the caller's identity arrives as an
//! `X-User-Id` uuid header.

use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tower_http::cors::CorsLayer;
use tracing::info;
use uuid::Uuid;

use crate::error::AssistantError;
use crate::history::{ChatHistoryStore, DEFAULT_PAGE_SIZE};
use crate::orchestrator::{Orchestrator, StreamEvent};

/// =============================
/// Request Models
/// =============================

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub page: Option<usize>,
    pub page_size: Option<usize>,
}

/// =============================
/// Response Wrapper
/// =============================

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse {
    pub success: bool,
    pub data: Option<serde_json::Value>,
    pub error: Option<String>,
    pub timestamp: String,
}

impl ApiResponse {
    pub fn success<T: Serialize>(data: T) -> Self {
        Self {
            success: true,
            data: serde_json::to_value(data).ok(),
            error: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// =============================
/// API State
/// =============================

#[derive(Clone)]
pub struct ApiState {
    pub orchestrator: Arc<Orchestrator>,
    pub history: Arc<dyn ChatHistoryStore>,
}

fn status_for(error: &AssistantError) -> StatusCode {
    match error {
        AssistantError::Validation(_) => StatusCode::BAD_REQUEST,
        AssistantError::NotFound { .. } => StatusCode::NOT_FOUND,
        AssistantError::Upstream(_) | AssistantError::Http(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn caller_id(headers: &HeaderMap) -> Result<Uuid, (StatusCode, Json<ApiResponse>)> {
    headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| Uuid::parse_str(v).ok())
        .ok_or_else(|| {
            (
                StatusCode::BAD_REQUEST,
                Json(ApiResponse::error(
                    "Missing or invalid X-User-Id header".to_string(),
                )),
            )
        })
}

/// =============================
/// Handlers
/// =============================

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

async fn chat(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(req): Json<ChatRequest>,
) -> (StatusCode, Json<ApiResponse>) {
    let user_id = match caller_id(&headers) {
        Ok(id) => id,
        Err(rejection) => return rejection,
    };

    info!(user_id = %user_id, "Received chat request");

    match state.orchestrator.respond(&req.message, user_id).await {
        Ok(answer) => (
            StatusCode::OK,
            Json(ApiResponse::success(serde_json::json!({ "answer": answer }))),
        ),
        Err(e) => (status_for(&e), Json(ApiResponse::error(e.to_string()))),
    }
}

async fn chat_stream(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(req): Json<ChatRequest>,
) -> Result<Response, (StatusCode, Json<ApiResponse>)> {
    let user_id = caller_id(&headers)?;

    info!(user_id = %user_id, "Received streaming chat request");

    let (tx, rx) = tokio::sync::mpsc::channel::<StreamEvent>(64);
    let orchestrator = state.orchestrator.clone();
    tokio::spawn(async move {
        orchestrator.respond_stream(&req.message, user_id, tx).await;
    });

    // Newline-delimited JSON events: connected, chunk*, then complete|error.
    let body = Body::from_stream(ReceiverStream::new(rx).map(|event| {
        let line = serde_json::to_string(&event).unwrap_or_default();
        Ok::<_, Infallible>(format!("{}\n", line))
    }));

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/x-ndjson")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(body)
        .map_err(|e| {
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiResponse::error(format!(
                    "Failed to open stream: {}",
                    e
                ))),
            )
        })
}

async fn list_history(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Query(query): Query<HistoryQuery>,
) -> (StatusCode, Json<ApiResponse>) {
    let user_id = match caller_id(&headers) {
        Ok(id) => id,
        Err(rejection) => return rejection,
    };

    let page = query.page.unwrap_or(1);
    let page_size = query.page_size.unwrap_or(DEFAULT_PAGE_SIZE);

    match state.history.list(user_id, page, page_size).await {
        Ok(turns) => (StatusCode::OK, Json(ApiResponse::success(turns))),
        Err(e) => (status_for(&e), Json(ApiResponse::error(e.to_string()))),
    }
}

async fn clear_history(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> (StatusCode, Json<ApiResponse>) {
    let user_id = match caller_id(&headers) {
        Ok(id) => id,
        Err(rejection) => return rejection,
    };

    match state.history.clear(user_id).await {
        Ok(()) => (
            StatusCode::OK,
            Json(ApiResponse::success(serde_json::json!({ "cleared": true }))),
        ),
        Err(e) => (status_for(&e), Json(ApiResponse::error(e.to_string()))),
    }
}

/// =============================
/// Router
/// =============================

pub fn create_router(orchestrator: Arc<Orchestrator>, history: Arc<dyn ChatHistoryStore>) -> Router {
    let state = ApiState {
        orchestrator,
        history,
    };

    Router::new()
        .route("/health", get(health))
        .route("/api/chat", post(chat))
        .route("/api/chat/stream", post(chat_stream))
        .route("/api/chat/history", get(list_history).delete(clear_history))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// =============================
/// Server Startup
/// =============================

pub async fn start_server(
    orchestrator: Arc<Orchestrator>,
    history: Arc<dyn ChatHistoryStore>,
    port: u16,
) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let router = create_router(orchestrator, history);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;

    info!("API server listening on http://0.0.0.0:{}", port);

    axum::serve(listener, router).await?;

    Ok(())
}
