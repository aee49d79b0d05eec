use std::convert::Infallible;

use axum::{
    extract::{Path, State},
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use futures_core::Stream;
use futures_util::{stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::ReceiverStream;
use wing_proto::TaskSpec;

use crate::{
    state::AppState,
    store::{Task, TaskStatus},
    tasks::{TaskStreamEvent, TaskSubscription},
};

use super::{ApiError, ApiResult, AuthUser};

#[derive(Debug, Deserialize)]
pub struct SubmitTaskRequest {
    /// Wing identity to route to; any of the caller's wings otherwise.
    #[serde(default)]
    pub target: Option<String>,
    #[serde(flatten)]
    pub spec: TaskSpec,
}

#[derive(Debug, Serialize)]
pub struct SubmitTaskResponse {
    pub id: String,
    pub status: TaskStatus,
}

pub async fn submit_task(
    State(state): State<AppState>,
    user: AuthUser,
    Json(request): Json<SubmitTaskRequest>,
) -> ApiResult<SubmitTaskResponse> {
    if request.spec.prompt.trim().is_empty() && request.spec.skill.is_none() {
        return Err(ApiError::BadRequest("prompt or skill is required".into()));
    }
    let target = request.target.filter(|t| !t.trim().is_empty());
    let task = state.tasks.submit(user.user_id(), target, request.spec).await?;
    Ok(Json(SubmitTaskResponse {
        id: task.id,
        status: task.status,
    }))
}

pub async fn list_tasks(State(state): State<AppState>, user: AuthUser) -> ApiResult<Vec<Task>> {
    Ok(Json(state.store.list_tasks(user.user_id()).await?))
}

pub async fn get_task(
    State(state): State<AppState>,
    user: AuthUser,
    Path(task_id): Path<String>,
) -> ApiResult<Task> {
    owned_task(&state, &user, &task_id).await.map(Json)
}

pub async fn stream_task(
    State(state): State<AppState>,
    user: AuthUser,
    Path(task_id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let task = owned_task(&state, &user, &task_id).await?;
    let events = match state.tasks.subscribe(&task).await? {
        TaskSubscription::Live(rx) => ReceiverStream::new(rx).boxed(),
        TaskSubscription::Finished(event) => stream::once(async move { event }).boxed(),
    };
    Ok(Sse::new(events.map(|event| Ok(to_sse(&event)))).keep_alive(KeepAlive::default()))
}

async fn owned_task(state: &AppState, user: &AuthUser, task_id: &str) -> Result<Task, ApiError> {
    state
        .store
        .get_task(task_id)
        .await?
        .filter(|task| task.user_id == user.user_id())
        .ok_or(ApiError::NotFound("task not found"))
}

fn to_sse(event: &TaskStreamEvent) -> Event {
    let data = serde_json::to_string(event).unwrap_or_else(|_| "{}".into());
    Event::default().event(event.name()).data(data)
}
