use std::convert::Infallible;

use axum::{
    extract::{Path, State},
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use futures_core::Stream;
use serde_json::json;
use tokio_stream::{wrappers::BroadcastStream, StreamExt};
use tracing::info;

use crate::{
    sessions::{RemoteSession, SessionError},
    state::AppState,
    store::{self, AuditEntry},
};

use super::{ApiError, ApiResult, AuthUser};

pub async fn list_sessions(State(state): State<AppState>, user: AuthUser) -> ApiResult<Vec<RemoteSession>> {
    Ok(Json(state.sessions.list_for_user(user.user_id())))
}

pub async fn delete_session(
    State(state): State<AppState>,
    user: AuthUser,
    Path(session_id): Path<String>,
) -> ApiResult<RemoteSession> {
    let session = state
        .sessions
        .delete(&session_id, user.user_id())
        .map_err(|err| match err {
            SessionError::StillActive => ApiError::Conflict("session is still attached to a wing"),
            SessionError::NotFound | SessionError::Forbidden => ApiError::NotFound("session not found"),
        })?;
    info!(session_id = %session.id, user_id = %session.user_id, "session tombstoned");
    store::audit(
        state.store.as_ref(),
        AuditEntry::new(
            &session.user_id,
            Some(&session.wing_id),
            "session.tombstone",
            json!({ "session_id": session.id }),
        ),
    )
    .await;
    Ok(Json(session))
}

/// Relays the hosting wing's frames for one session, verbatim.
pub async fn stream_session(
    State(state): State<AppState>,
    user: AuthUser,
    Path(session_id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    state
        .sessions
        .get(&session_id)
        .filter(|session| session.user_id == user.user_id())
        .ok_or(ApiError::NotFound("session not found"))?;
    let rx = state.sessions.subscribe(&session_id);
    let stream = BroadcastStream::new(rx)
        .filter_map(|frame| frame.ok())
        .map(|frame| {
            let kind = frame
                .get("type")
                .and_then(|v| v.as_str())
                .unwrap_or("message")
                .to_string();
            Ok(Event::default().event(kind).data(frame.to_string()))
        });
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
