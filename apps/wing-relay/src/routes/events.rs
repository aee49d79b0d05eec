use std::convert::Infallible;

use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
};
use futures_core::Stream;
use tokio_stream::{wrappers::ReceiverStream, StreamExt};

use crate::{metrics, state::AppState};

use super::AuthUser;

pub async fn prometheus_metrics() -> String {
    metrics::export_prometheus()
}

/// Presence changes for the caller's own wings.
pub async fn stream_wing_events(
    State(state): State<AppState>,
    user: AuthUser,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.registry.subscribe(Some(user.user_id().to_string()));
    let stream = ReceiverStream::new(rx).map(|event| {
        let data = serde_json::to_string(&event).unwrap_or_else(|_| "{}".into());
        Ok(Event::default().event(event.event_type.as_str()).data(data))
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}
