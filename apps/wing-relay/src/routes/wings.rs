use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;
use wing_proto::{DirEntry, RelayMessage, SessionInfo};

use crate::{
    pending::{new_request_id, PendingError, PendingLedger},
    registry::{ConnectedWing, WingSummary},
    state::AppState,
};

use super::{ApiError, ApiResult, AuthUser};

#[derive(Debug, Deserialize)]
pub struct DirQuery {
    #[serde(default)]
    pub path: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AuditQuery {
    #[serde(default)]
    pub since: Option<i64>,
}

pub async fn list_wings(State(state): State<AppState>, user: AuthUser) -> ApiResult<Vec<WingSummary>> {
    let mut wings: Vec<_> = state
        .registry
        .list_for_user(user.user_id())
        .iter()
        .map(|wing| wing.summary())
        .collect();
    wings.sort_by_key(|wing| wing.connection_id);
    Ok(Json(wings))
}

pub async fn list_dir(
    State(state): State<AppState>,
    user: AuthUser,
    Path(wing_id): Path<String>,
    Query(query): Query<DirQuery>,
) -> ApiResult<Vec<DirEntry>> {
    let path = query.path.unwrap_or_else(|| ".".to_string());
    let ledger = Arc::clone(&state.pending.directory);
    round_trip(&state, &user, &wing_id, &ledger, |request_id| RelayMessage::ListDir {
        request_id,
        path,
    })
    .await
    .map(Json)
}

pub async fn sync_sessions(
    State(state): State<AppState>,
    user: AuthUser,
    Path(wing_id): Path<String>,
) -> ApiResult<Vec<SessionInfo>> {
    let ledger = Arc::clone(&state.pending.session_sync);
    round_trip(&state, &user, &wing_id, &ledger, |request_id| RelayMessage::SyncSessions {
        request_id,
    })
    .await
    .map(Json)
}

pub async fn session_history(
    State(state): State<AppState>,
    user: AuthUser,
    Path((wing_id, session_id)): Path<(String, String)>,
) -> ApiResult<Vec<Value>> {
    let ledger = Arc::clone(&state.pending.history);
    round_trip(&state, &user, &wing_id, &ledger, |request_id| {
        RelayMessage::SessionHistory {
            request_id,
            session_id,
        }
    })
    .await
    .map(Json)
}

pub async fn audit_stream(
    State(state): State<AppState>,
    user: AuthUser,
    Path(wing_id): Path<String>,
    Query(query): Query<AuditQuery>,
) -> ApiResult<Vec<Value>> {
    let ledger = Arc::clone(&state.pending.audit);
    round_trip(&state, &user, &wing_id, &ledger, |request_id| RelayMessage::AuditStream {
        request_id,
        since: query.since,
    })
    .await
    .map(Json)
}

fn owned_wing(state: &AppState, user: &AuthUser, wing_id: &str) -> Result<Arc<ConnectedWing>, ApiError> {
    state
        .registry
        .list_for_user(user.user_id())
        .into_iter()
        .filter(|wing| wing.answers_to(wing_id))
        .max_by_key(|wing| wing.last_seen_ms())
        .ok_or(ApiError::NotFound("wing not connected"))
}

/// Sends one correlated command to the caller's wing and waits for the
/// matching `*_result` frame.
async fn round_trip<T>(
    state: &AppState,
    user: &AuthUser,
    wing_id: &str,
    ledger: &PendingLedger<T>,
    command: impl FnOnce(String) -> RelayMessage,
) -> Result<T, ApiError> {
    let wing = owned_wing(state, user, wing_id)?;
    let request_id = new_request_id();
    let rx = ledger
        .register(&request_id)
        .map_err(|err| ApiError::Internal(err.to_string()))?;

    if let Err(err) = wing
        .handle
        .send(command(request_id.clone()), state.config.write_timeout())
        .await
    {
        ledger.unregister(&request_id);
        debug!(table = ledger.name(), wing_id, error = %err, "correlated command not delivered");
        return Err(ApiError::Unavailable(format!("wing unreachable: {err}")));
    }

    ledger
        .wait(&request_id, rx, state.config.request_timeout())
        .await
        .map_err(|err| match err {
            PendingError::Timeout => ApiError::Timeout("wing did not answer in time"),
            other => ApiError::Unavailable(other.to_string()),
        })
}
