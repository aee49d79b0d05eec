mod auth;
mod events;
mod internal;
mod sessions;
mod tasks;
mod wings;

use axum::{
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::Serialize;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::warn;

use crate::{auth::AuthError, gossip::GossipError, state::AppState, store::StoreError, ws};

pub use auth::AuthUser;
pub use internal::{is_private_peer, NodeCaller};

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health_check))
        .route("/metrics", get(events::prometheus_metrics))
        .route("/ws/wing", get(ws::wing_socket))
        .route("/api/tasks", post(tasks::submit_task).get(tasks::list_tasks))
        .route("/api/tasks/:task_id", get(tasks::get_task))
        .route("/api/tasks/:task_id/stream", get(tasks::stream_task))
        .route("/api/wings", get(wings::list_wings))
        .route("/api/wings/:wing_id/dir", get(wings::list_dir))
        .route("/api/wings/:wing_id/sessions", get(wings::sync_sessions))
        .route(
            "/api/wings/:wing_id/sessions/:session_id/history",
            get(wings::session_history),
        )
        .route("/api/wings/:wing_id/audit", get(wings::audit_stream))
        .route("/api/sessions", get(sessions::list_sessions))
        .route("/api/sessions/:session_id", delete(sessions::delete_session))
        .route("/api/sessions/:session_id/events", get(sessions::stream_session))
        .route("/api/events", get(events::stream_wing_events))
        .nest("/internal", internal::router())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check() -> &'static str {
    "ok"
}

/// `Authorization: Bearer <token>`, if present.
pub(crate) fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|auth| auth.strip_prefix("Bearer "))
        .map(|token| token.trim().to_owned())
        .filter(|token| !token.is_empty())
}

pub type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Debug)]
pub enum ApiError {
    Unauthorized,
    Forbidden(&'static str),
    NotFound(&'static str),
    Conflict(&'static str),
    BadRequest(String),
    Unavailable(String),
    Timeout(&'static str),
    Internal(String),
}

#[derive(Debug, Serialize)]
struct ApiErrorBody<'a> {
    error: &'a str,
    message: Option<String>,
}

impl ApiError {
    fn parts(self) -> (StatusCode, &'static str, Option<String>) {
        match self {
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized", None),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, "forbidden", Some(msg.to_string())),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", Some(msg.to_string())),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, "conflict", Some(msg.to_string())),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", Some(msg)),
            ApiError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, "unavailable", Some(msg)),
            ApiError::Timeout(msg) => (StatusCode::GATEWAY_TIMEOUT, "timeout", Some(msg.to_string())),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "internal", Some(msg)),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error, message) = self.parts();
        (status, Json(ApiErrorBody { error, message })).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        warn!(error = %err, "store request failed");
        ApiError::Internal(err.to_string())
    }
}

impl From<GossipError> for ApiError {
    fn from(err: GossipError) -> Self {
        warn!(error = %err, "login node request failed");
        ApiError::Unavailable(err.to_string())
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::MissingToken | AuthError::InvalidToken => ApiError::Unauthorized,
            AuthError::Backend(err) => ApiError::Unavailable(err.to_string()),
        }
    }
}
