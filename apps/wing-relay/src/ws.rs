//! The wing control channel: handshake, one exclusive read loop per
//! connection, and a writer task that owns the socket sink.

use std::{sync::Arc, time::Duration};

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::HeaderMap,
    response::Response,
};
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use wing_proto::{RegisterPayload, RelayMessage, WingMessage};

use crate::{
    connection::{Outbound, WingHandle},
    registry::{ConnectedWing, WingEvent, WingEventType},
    routes::bearer_token,
    sessions::{Claimant, ReclaimOutcome},
    state::AppState,
    store::{self, AuditEntry, TaskOutcome},
};

#[derive(Debug, Deserialize)]
pub struct WingQuery {
    #[serde(default)]
    token: Option<String>,
}

pub async fn wing_socket(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<WingQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let token = bearer_token(&headers).or(query.token);
    ws.on_upgrade(move |socket| serve_wing(socket, state, token))
}

struct Admitted {
    user_id: String,
    org_id: Option<String>,
    register: RegisterPayload,
}

async fn serve_wing(socket: WebSocket, state: AppState, token: Option<String>) {
    let (mut sink, mut stream) = socket.split();
    let write_timeout = state.config.write_timeout();

    let admitted = match handshake(&state, &mut stream, token.as_deref()).await {
        Ok(admitted) => admitted,
        Err(reason) => {
            info!(reason = %reason, "wing handshake rejected");
            reject(&mut sink, &reason, write_timeout).await;
            return;
        }
    };

    let (handle, outbound) = WingHandle::channel();
    let (done_tx, mut done_rx) = oneshot::channel();
    let writer = tokio::spawn(async move {
        write_loop(sink, outbound, write_timeout).await;
        let _ = done_tx.send(());
    });

    let connection_id = state.registry.next_connection_id();
    let wing = state.registry.add(ConnectedWing::new(
        connection_id,
        admitted.user_id,
        admitted.org_id,
        &admitted.register,
        handle.clone(),
    ));
    info!(connection_id, wing_id = %wing.wing_id, user_id = %wing.user_id, "wing connected");
    let _ = handle.try_send(RelayMessage::Registered {
        connection_id,
        wing_id: wing.wing_id.clone(),
    });
    store::audit(
        state.store.as_ref(),
        AuditEntry::new(
            &wing.user_id,
            Some(&wing.wing_id),
            "wing.register",
            json!({ "connection_id": connection_id, "org_id": wing.org_id }),
        ),
    )
    .await;

    {
        let tasks = state.tasks.clone();
        let wing = Arc::clone(&wing);
        tokio::spawn(async move {
            tasks.drain_pending(&wing).await;
        });
    }

    loop {
        tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    state.meter.record(&wing.user_id, text.len() as u64);
                    handle_frame(&state, &wing, &text).await;
                }
                Some(Ok(Message::Binary(bytes))) => {
                    state.meter.record(&wing.user_id, bytes.len() as u64);
                    debug!(connection_id, "ignoring binary frame");
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    debug!(connection_id, error = %err, "wing socket read failed");
                    break;
                }
            },
            _ = &mut done_rx => break,
        }
    }

    state.registry.remove(connection_id);
    let detached = state.sessions.detach_connection(connection_id);
    info!(connection_id, wing_id = %wing.wing_id, detached, "wing disconnected");
    store::audit(
        state.store.as_ref(),
        AuditEntry::new(
            &wing.user_id,
            Some(&wing.wing_id),
            "wing.deregister",
            json!({ "connection_id": connection_id }),
        ),
    )
    .await;
    drop(handle);
    drop(wing);
    writer.abort();
}

async fn handshake(
    state: &AppState,
    stream: &mut SplitStream<WebSocket>,
    token: Option<&str>,
) -> Result<Admitted, String> {
    let first = tokio::time::timeout(state.config.request_timeout(), stream.next())
        .await
        .map_err(|_| "register timeout".to_string())?;
    let register = match first {
        Some(Ok(Message::Text(text))) => match serde_json::from_str::<WingMessage>(&text) {
            Ok(WingMessage::Register(register)) => register,
            Ok(other) => return Err(format!("expected register, got {}", other.kind())),
            Err(_) => return Err("expected register".to_string()),
        },
        _ => return Err("expected register".to_string()),
    };
    if register.wing_id.trim().is_empty() {
        return Err("wing_id required".to_string());
    }

    let token = token.ok_or_else(|| "unauthorized".to_string())?;
    let caller = state
        .auth
        .verify(token)
        .await
        .map_err(|err| format!("unauthorized: {err}"))?;

    let org_id = match register.org.as_deref() {
        None => None,
        Some(org) => {
            let check = state
                .identity()
                .org_check(&caller.user_id, org)
                .await
                .map_err(|err| format!("org check failed: {err}"))?
                .ok_or_else(|| format!("unknown organization {org}"))?;
            if !check.allowed {
                return Err(format!("forbidden: role in {org} cannot register wings"));
            }
            Some(check.org_id)
        }
    };

    Ok(Admitted {
        user_id: caller.user_id,
        org_id,
        register,
    })
}

async fn reject(sink: &mut SplitSink<WebSocket, Message>, reason: &str, deadline: Duration) {
    let error = RelayMessage::Error {
        message: reason.to_string(),
    };
    if let Ok(text) = serde_json::to_string(&error) {
        let _ = tokio::time::timeout(deadline, sink.send(Message::Text(text))).await;
    }
    let close = Message::Close(Some(CloseFrame {
        code: close_code::POLICY,
        reason: "registration rejected".into(),
    }));
    let _ = tokio::time::timeout(deadline, sink.send(close)).await;
}

async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<Outbound>,
    deadline: Duration,
) {
    while let Some(frame) = outbound.recv().await {
        let (message, ack) = match frame {
            Outbound::Message(message) => (message, None),
            Outbound::Tracked(message, ack) => (message, Some(ack)),
            Outbound::Close(reason) => {
                let close = Message::Close(Some(CloseFrame {
                    code: close_code::NORMAL,
                    reason: reason.into(),
                }));
                let _ = tokio::time::timeout(deadline, sink.send(close)).await;
                break;
            }
        };
        let text = match serde_json::to_string(&message) {
            Ok(text) => text,
            Err(err) => {
                warn!(error = %err, "failed to encode relay message");
                continue;
            }
        };
        match tokio::time::timeout(deadline, sink.send(Message::Text(text))).await {
            Ok(Ok(())) => {
                if let Some(ack) = ack {
                    let _ = ack.send(());
                }
            }
            Ok(Err(err)) => {
                debug!(error = %err, "wing socket write failed");
                break;
            }
            Err(_) => {
                warn!("wing socket write timed out");
                break;
            }
        }
    }
}

/// Dispatches one inbound frame. Malformed or unexpected frames are dropped.
async fn handle_frame(state: &AppState, wing: &Arc<ConnectedWing>, text: &str) {
    let raw: Value = match serde_json::from_str(text) {
        Ok(raw) => raw,
        Err(err) => {
            debug!(connection_id = wing.connection_id, error = %err, "ignoring malformed frame");
            return;
        }
    };
    let message: WingMessage = match serde_json::from_value(raw.clone()) {
        Ok(message) => message,
        Err(err) => {
            debug!(connection_id = wing.connection_id, error = %err, "ignoring unknown frame");
            return;
        }
    };

    match message {
        WingMessage::Heartbeat => {
            state.registry.touch(wing.connection_id);
        }
        WingMessage::LockState { locked } => {
            state.registry.set_locked(wing.connection_id, locked);
        }
        WingMessage::Register(_) => {
            debug!(connection_id = wing.connection_id, "duplicate register ignored");
        }
        WingMessage::SessionStarted {
            session_id, agent, cwd, ..
        } => {
            let claimant = Claimant {
                connection_id: wing.connection_id,
                wing_id: &wing.wing_id,
                user_id: &wing.user_id,
                agent: &agent,
                cwd: &cwd,
            };
            if !state.sessions.start(&session_id, &claimant) {
                let _ = wing.handle.try_send(RelayMessage::KillSession {
                    session_id: session_id.clone(),
                    reason: "session was deleted".to_string(),
                });
            }
            state.sessions.publish(&session_id, raw);
        }
        WingMessage::SessionOutput { session_id, .. } => {
            state.sessions.publish(&session_id, raw);
        }
        WingMessage::ChatEvent { session_id, extra } => {
            if extra.get("attention").and_then(Value::as_bool) == Some(true) {
                state.registry.publish(
                    WingEvent::for_wing(WingEventType::SessionAttention, wing)
                        .with_metadata(json!({ "session_id": session_id })),
                );
            }
            state.sessions.publish(&session_id, raw);
        }
        WingMessage::SessionExited { session_id, .. } => {
            state.sessions.publish(&session_id, raw);
            state.sessions.exit(&session_id, wing.connection_id);
        }
        WingMessage::DirResult {
            request_id,
            entries,
        } => {
            state.pending.directory.resolve(&request_id, entries);
        }
        WingMessage::SessionsResult {
            request_id,
            sessions,
        } => {
            state.pending.session_sync.resolve(&request_id, sessions);
        }
        WingMessage::HistoryResult {
            request_id,
            entries,
        } => {
            state.pending.history.resolve(&request_id, entries);
        }
        WingMessage::AuditResult {
            request_id,
            entries,
        } => {
            state.pending.audit.resolve(&request_id, entries);
        }
        WingMessage::Reclaim {
            session_id,
            agent,
            cwd,
        } => {
            let claimant = Claimant {
                connection_id: wing.connection_id,
                wing_id: &wing.wing_id,
                user_id: &wing.user_id,
                agent: &agent,
                cwd: &cwd,
            };
            let reply = match state.sessions.reclaim(&session_id, &claimant) {
                Ok(ReclaimOutcome::Accepted { .. }) => RelayMessage::ReclaimAccepted { session_id },
                Ok(ReclaimOutcome::Kill { reason }) => RelayMessage::KillSession { session_id, reason },
                Err(err) => RelayMessage::Error {
                    message: format!("reclaim {session_id}: {err}"),
                },
            };
            let _ = wing.handle.try_send(reply);
        }
        WingMessage::TaskOutput { task_id, chunk } => {
            state.tasks.output(&task_id, chunk);
        }
        WingMessage::TaskDone { task_id, output } => {
            state
                .tasks
                .complete(wing, &task_id, TaskOutcome::Done { output })
                .await;
        }
        WingMessage::TaskError { task_id, error } => {
            state
                .tasks
                .complete(wing, &task_id, TaskOutcome::Failed { error })
                .await;
        }
    }
}
