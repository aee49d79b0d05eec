//! Interactive remote sessions that outlive the wing connection hosting them.
//!
//! Every session has its own lock. Reclaim and delete both take it, and reclaim
//! always inspects the tombstone before touching the hosting connection.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::registry::ConnectionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Detached,
    Tombstoned,
}

#[derive(Debug, Clone, Serialize)]
pub struct RemoteSession {
    pub id: String,
    pub connection_id: ConnectionId,
    pub wing_id: String,
    pub user_id: String,
    pub agent: String,
    pub cwd: String,
    pub status: SessionStatus,
    pub updated_at: DateTime<Utc>,
}

/// The wing asking to host a session.
#[derive(Debug, Clone)]
pub struct Claimant<'a> {
    pub connection_id: ConnectionId,
    pub wing_id: &'a str,
    pub user_id: &'a str,
    pub agent: &'a str,
    pub cwd: &'a str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReclaimOutcome {
    Accepted { synthesized: bool },
    Kill { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("session not found")]
    NotFound,
    #[error("session is still attached to a wing")]
    StillActive,
    #[error("session belongs to another user")]
    Forbidden,
}

pub struct RemoteSessionTable {
    sessions: DashMap<String, Arc<Mutex<RemoteSession>>>,
    streams: DashMap<String, broadcast::Sender<Value>>,
    stream_buffer: usize,
}

impl Default for RemoteSessionTable {
    fn default() -> Self {
        Self::new(64)
    }
}

impl RemoteSessionTable {
    pub fn new(stream_buffer: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            streams: DashMap::new(),
            stream_buffer: stream_buffer.max(1),
        }
    }

    /// Records a freshly started session as Active on `claimant`'s connection.
    /// A tombstoned id is left alone so a stale wing cannot resurrect it.
    pub fn start(&self, session_id: &str, claimant: &Claimant<'_>) -> bool {
        let slot = self
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(record(session_id, claimant))))
            .clone();
        let mut session = slot.lock();
        if session.status == SessionStatus::Tombstoned {
            return false;
        }
        session.connection_id = claimant.connection_id;
        session.wing_id = claimant.wing_id.to_string();
        session.user_id = claimant.user_id.to_string();
        session.agent = claimant.agent.to_string();
        session.cwd = claimant.cwd.to_string();
        session.status = SessionStatus::Active;
        session.updated_at = Utc::now();
        true
    }

    /// Marks every Active session hosted by `connection_id` as Detached.
    pub fn detach_connection(&self, connection_id: ConnectionId) -> usize {
        let mut detached = 0;
        for slot in self.snapshot_slots() {
            let mut session = slot.lock();
            if session.connection_id == connection_id && session.status == SessionStatus::Active {
                session.status = SessionStatus::Detached;
                session.updated_at = Utc::now();
                detached += 1;
            }
        }
        if detached > 0 {
            debug!(connection_id, detached, "sessions detached");
        }
        detached
    }

    pub fn reclaim(&self, session_id: &str, claimant: &Claimant<'_>) -> Result<ReclaimOutcome, SessionError> {
        let mut synthesized = false;
        let slot = self
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(|| {
                synthesized = true;
                Arc::new(Mutex::new(record(session_id, claimant)))
            })
            .clone();

        let mut session = slot.lock();
        if session.status == SessionStatus::Tombstoned {
            return Ok(ReclaimOutcome::Kill {
                reason: "session was deleted".to_string(),
            });
        }
        if session.user_id != claimant.user_id {
            return Err(SessionError::Forbidden);
        }
        session.connection_id = claimant.connection_id;
        session.wing_id = claimant.wing_id.to_string();
        session.status = SessionStatus::Active;
        session.updated_at = Utc::now();
        if synthesized {
            info!(session_id, connection_id = claimant.connection_id, "session recreated from reclaim");
        }
        Ok(ReclaimOutcome::Accepted { synthesized })
    }

    /// Owner-initiated delete. Only a Detached session can be tombstoned.
    pub fn delete(&self, session_id: &str, user_id: &str) -> Result<RemoteSession, SessionError> {
        let slot = self
            .sessions
            .get(session_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(SessionError::NotFound)?;
        let mut session = slot.lock();
        if session.user_id != user_id {
            return Err(SessionError::NotFound);
        }
        match session.status {
            SessionStatus::Active => Err(SessionError::StillActive),
            SessionStatus::Tombstoned => Err(SessionError::NotFound),
            SessionStatus::Detached => {
                session.status = SessionStatus::Tombstoned;
                session.updated_at = Utc::now();
                let snapshot = session.clone();
                drop(session);
                self.streams.remove(session_id);
                Ok(snapshot)
            }
        }
    }

    /// The wing reported the session finished; forget it unless tombstoned.
    pub fn exit(&self, session_id: &str, connection_id: ConnectionId) {
        let removed = self.sessions.remove_if(session_id, |_, slot| {
            let session = slot.lock();
            session.connection_id == connection_id && session.status != SessionStatus::Tombstoned
        });
        if removed.is_some() {
            self.streams.remove(session_id);
        }
    }

    pub fn get(&self, session_id: &str) -> Option<RemoteSession> {
        self.sessions
            .get(session_id)
            .map(|entry| entry.value().lock().clone())
    }

    pub fn list_for_user(&self, user_id: &str) -> Vec<RemoteSession> {
        let mut sessions: Vec<_> = self
            .snapshot_slots()
            .into_iter()
            .map(|slot| slot.lock().clone())
            .filter(|session| session.user_id == user_id && session.status != SessionStatus::Tombstoned)
            .collect();
        sessions.sort_by(|a, b| a.id.cmp(&b.id));
        sessions
    }

    pub fn subscribe(&self, session_id: &str) -> broadcast::Receiver<Value> {
        self.streams
            .entry(session_id.to_string())
            .or_insert_with(|| broadcast::channel(self.stream_buffer).0)
            .subscribe()
    }

    /// Relays a raw wing frame to the session's browser subscribers. Never blocks;
    /// with no subscriber the frame is dropped and the idle channel released.
    pub fn publish(&self, session_id: &str, frame: Value) {
        if let Some(tx) = self.streams.get(session_id) {
            if tx.send(frame).is_ok() {
                return;
            }
        }
        self.streams
            .remove_if(session_id, |_, tx| tx.receiver_count() == 0);
    }

    fn snapshot_slots(&self) -> Vec<Arc<Mutex<RemoteSession>>> {
        self.sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }
}

fn record(session_id: &str, claimant: &Claimant<'_>) -> RemoteSession {
    RemoteSession {
        id: session_id.to_string(),
        connection_id: claimant.connection_id,
        wing_id: claimant.wing_id.to_string(),
        user_id: claimant.user_id.to_string(),
        agent: claimant.agent.to_string(),
        cwd: claimant.cwd.to_string(),
        status: SessionStatus::Active,
        updated_at: Utc::now(),
    }
}
