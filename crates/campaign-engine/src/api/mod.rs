//! # HTTP API
//!
//! | Route                          | Purpose                                           |
//! |--------------------------------|---------------------------------------------------|
//! | `POST /campaigns/control`      | start / pause / resume / stop a campaign          |
//! | `POST /tasks/batch`            | ingest a batch of dial-task queue messages        |
//! | `POST /dialplan/:callback`     | dialplan callbacks, fed into the call engine loop |
//! | `GET  /health`                 | live calls, slot utilization, PBX connectivity    |
//!
//! Dialplan callbacks are `call-started`, `dtmf-action`, `call-timeout`,
//! `call-failed` and `call-ended`; each body carries the `callId` plus the
//! fields of that event.

pub mod handlers;

use std::sync::Arc;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::calls::EngineHandle;
use crate::error::CampaignError;
use crate::intake::TaskQueue;
use crate::orchestrator::CampaignOrchestrator;

/// Shared state of every handler
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: CampaignOrchestrator,
    pub voice_queue: Arc<TaskQueue>,
    pub sms_queue: Arc<TaskQueue>,
    /// Absent when the engine runs elsewhere; dialplan callbacks are then refused
    pub engine: Option<EngineHandle>,
    pub version: String,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(
        orchestrator: CampaignOrchestrator,
        voice_queue: Arc<TaskQueue>,
        sms_queue: Arc<TaskQueue>,
        engine: Option<EngineHandle>,
    ) -> Self {
        Self {
            orchestrator,
            voice_queue,
            sms_queue,
            engine,
            version: env!("CARGO_PKG_VERSION").to_string(),
            started_at: Utc::now(),
        }
    }
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/campaigns/control", post(handlers::control))
        .route("/tasks/batch", post(handlers::ingest_tasks))
        .route("/dialplan/:callback", post(handlers::dialplan))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .with_state(state)
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
    code: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            ApiError::Unavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, "UNAVAILABLE"),
            ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        };
        let body = ErrorResponse {
            error: self.to_string(),
            code: code.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

impl From<CampaignError> for ApiError {
    fn from(err: CampaignError) -> Self {
        match err {
            CampaignError::InvalidInput(msg) => ApiError::BadRequest(msg),
            CampaignError::NotFound(msg) => ApiError::NotFound(msg),
            CampaignError::EngineUnavailable(msg) => ApiError::Unavailable(msg),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;
