//! In-memory presence registry of wings connected to this node.
//!
//! One [`ConnectedWing`] exists per live connection. Several records may share
//! a wing identity (one user, two devices), so lookups by identity return the
//! most recently active match. Mutations are short critical sections on a
//! `parking_lot` lock; everything that talks to a socket works on a cloned
//! snapshot after the lock is released.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;
use wing_proto::{Capabilities, RegisterPayload, RelayMessage, WingLocation};

use crate::connection::WingHandle;
use crate::metrics;

pub type ConnectionId = u64;

#[derive(Debug)]
pub struct ConnectedWing {
    pub connection_id: ConnectionId,
    pub wing_id: String,
    pub user_id: String,
    pub org_id: Option<String>,
    pub capabilities: Capabilities,
    pub projects: Vec<String>,
    pub public_key: Option<String>,
    pub allowed_peers: u32,
    pub connected_at: DateTime<Utc>,
    pub handle: WingHandle,
    locked: AtomicBool,
    last_seen_ms: AtomicI64,
}

impl ConnectedWing {
    pub fn new(
        connection_id: ConnectionId,
        user_id: impl Into<String>,
        org_id: Option<String>,
        register: &RegisterPayload,
        handle: WingHandle,
    ) -> Self {
        let now = Utc::now();
        Self {
            connection_id,
            wing_id: register.wing_id.clone(),
            user_id: user_id.into(),
            org_id,
            capabilities: register.capabilities.clone(),
            projects: register.projects.clone(),
            public_key: register.public_key.clone(),
            allowed_peers: register.allowed_peers,
            connected_at: now,
            handle,
            locked: AtomicBool::new(register.locked),
            last_seen_ms: AtomicI64::new(now.timestamp_millis()),
        }
    }

    pub fn last_seen_ms(&self) -> i64 {
        self.last_seen_ms.load(Ordering::Relaxed)
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }

    /// True when `identity` is the wing id or one of its declared aliases.
    pub fn answers_to(&self, identity: &str) -> bool {
        self.wing_id == identity || self.capabilities.identities.iter().any(|id| id == identity)
    }

    pub fn location(&self, machine_id: &str) -> WingLocation {
        WingLocation {
            wing_id: self.wing_id.clone(),
            machine_id: machine_id.to_string(),
            user_id: self.user_id.clone(),
            org_id: self.org_id.clone(),
            public_key: self.public_key.clone(),
            locked: self.is_locked(),
            allowed_peers: self.allowed_peers,
        }
    }

    pub fn summary(&self) -> WingSummary {
        WingSummary {
            connection_id: self.connection_id,
            wing_id: self.wing_id.clone(),
            user_id: self.user_id.clone(),
            org_id: self.org_id.clone(),
            capabilities: self.capabilities.clone(),
            projects: self.projects.clone(),
            locked: self.is_locked(),
            connected_at: self.connected_at,
            last_seen_ms: self.last_seen_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WingSummary {
    pub connection_id: ConnectionId,
    pub wing_id: String,
    pub user_id: String,
    pub org_id: Option<String>,
    pub capabilities: Capabilities,
    pub projects: Vec<String>,
    pub locked: bool,
    pub connected_at: DateTime<Utc>,
    pub last_seen_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WingEventType {
    #[serde(rename = "wing.online")]
    WingOnline,
    #[serde(rename = "wing.offline")]
    WingOffline,
    #[serde(rename = "org.changed")]
    OrgChanged,
    #[serde(rename = "session.attention")]
    SessionAttention,
    #[serde(rename = "wing.lock")]
    LockChanged,
}

impl WingEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            WingEventType::WingOnline => "wing.online",
            WingEventType::WingOffline => "wing.offline",
            WingEventType::OrgChanged => "org.changed",
            WingEventType::SessionAttention => "session.attention",
            WingEventType::LockChanged => "wing.lock",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WingEvent {
    #[serde(rename = "type")]
    pub event_type: WingEventType,
    pub connection_id: ConnectionId,
    pub wing_id: String,
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl WingEvent {
    pub fn for_wing(event_type: WingEventType, wing: &ConnectedWing) -> Self {
        Self {
            event_type,
            connection_id: wing.connection_id,
            wing_id: wing.wing_id.clone(),
            user_id: wing.user_id.clone(),
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Side-effect hook run synchronously after each add/remove. The gossip layer
/// plugs in here to learn about local wing changes.
pub trait WingObserver: Send + Sync {
    fn on_wing_event(&self, event: &WingEvent, wing: &ConnectedWing);
}

struct Subscriber {
    user_id: Option<String>,
    tx: mpsc::Sender<WingEvent>,
}

#[derive(Clone)]
pub struct WingRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    wings: RwLock<HashMap<ConnectionId, Arc<ConnectedWing>>>,
    subscribers: Mutex<Vec<Subscriber>>,
    observer: RwLock<Option<Arc<dyn WingObserver>>>,
    next_connection_id: AtomicU64,
    subscriber_buffer: usize,
}

impl Default for WingRegistry {
    fn default() -> Self {
        Self::new(64)
    }
}

impl WingRegistry {
    pub fn new(subscriber_buffer: usize) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                wings: RwLock::new(HashMap::new()),
                subscribers: Mutex::new(Vec::new()),
                observer: RwLock::new(None),
                next_connection_id: AtomicU64::new(1),
                subscriber_buffer: subscriber_buffer.max(1),
            }),
        }
    }

    /// Connection ids are process-unique and never reused.
    pub fn next_connection_id(&self) -> ConnectionId {
        self.inner.next_connection_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn set_observer(&self, observer: Arc<dyn WingObserver>) {
        *self.inner.observer.write() = Some(observer);
    }

    pub fn add(&self, wing: ConnectedWing) -> Arc<ConnectedWing> {
        let wing = Arc::new(wing);
        let total = {
            let mut wings = self.inner.wings.write();
            wings.insert(wing.connection_id, Arc::clone(&wing));
            wings.len()
        };
        metrics::WINGS_CONNECTED.set(total as i64);

        let event = WingEvent::for_wing(WingEventType::WingOnline, &wing);
        self.publish(event.clone());
        self.notify_observer(&event, &wing);
        wing
    }

    /// Removes the record and emits `wing.offline`. Returns `None` (and emits
    /// nothing) when the connection was already gone.
    pub fn remove(&self, connection_id: ConnectionId) -> Option<Arc<ConnectedWing>> {
        let (removed, total) = {
            let mut wings = self.inner.wings.write();
            let removed = wings.remove(&connection_id);
            (removed, wings.len())
        };
        let wing = removed?;
        metrics::WINGS_CONNECTED.set(total as i64);

        let event = WingEvent::for_wing(WingEventType::WingOffline, &wing);
        self.publish(event.clone());
        self.notify_observer(&event, &wing);
        Some(wing)
    }

    /// Records a lock-state change reported by the wing and emits `wing.lock`.
    /// Returns false when the connection is gone or the state is unchanged.
    pub fn set_locked(&self, connection_id: ConnectionId, locked: bool) -> bool {
        let Some(wing) = self.get(connection_id) else {
            return false;
        };
        if wing.locked.swap(locked, Ordering::Relaxed) == locked {
            return false;
        }
        let event = WingEvent::for_wing(WingEventType::LockChanged, &wing)
            .with_metadata(serde_json::json!({ "locked": locked }));
        self.publish(event.clone());
        self.notify_observer(&event, &wing);
        true
    }

    pub fn get(&self, connection_id: ConnectionId) -> Option<Arc<ConnectedWing>> {
        self.inner.wings.read().get(&connection_id).cloned()
    }

    /// Most recently active wing answering to `identity`.
    pub fn find_by_wing_id(&self, identity: &str) -> Option<Arc<ConnectedWing>> {
        self.inner
            .wings
            .read()
            .values()
            .filter(|wing| wing.answers_to(identity))
            .max_by_key(|wing| (wing.last_seen_ms(), wing.connection_id))
            .cloned()
    }

    /// Most recently active connection registered under exactly `wing_id`,
    /// ignoring aliases.
    pub fn find_registered(&self, wing_id: &str) -> Option<Arc<ConnectedWing>> {
        self.inner
            .wings
            .read()
            .values()
            .filter(|wing| wing.wing_id == wing_id)
            .max_by_key(|wing| (wing.last_seen_ms(), wing.connection_id))
            .cloned()
    }

    pub fn list_for_user(&self, user_id: &str) -> Vec<Arc<ConnectedWing>> {
        let mut wings: Vec<_> = self
            .inner
            .wings
            .read()
            .values()
            .filter(|wing| wing.user_id == user_id)
            .cloned()
            .collect();
        wings.sort_by_key(|wing| wing.connection_id);
        wings
    }

    pub fn all(&self) -> Vec<Arc<ConnectedWing>> {
        let mut wings: Vec<_> = self.inner.wings.read().values().cloned().collect();
        wings.sort_by_key(|wing| wing.connection_id);
        wings
    }

    pub fn count_for_user(&self, user_id: &str) -> usize {
        self.inner
            .wings
            .read()
            .values()
            .filter(|wing| wing.user_id == user_id)
            .count()
    }

    pub fn len(&self) -> usize {
        self.inner.wings.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Heartbeat bookkeeping; no event is emitted.
    pub fn touch(&self, connection_id: ConnectionId) -> bool {
        match self.inner.wings.read().get(&connection_id) {
            Some(wing) => {
                wing.last_seen_ms
                    .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    /// Subscribe to lifecycle events, optionally only those for one user's wings.
    pub fn subscribe(&self, user_id: Option<String>) -> mpsc::Receiver<WingEvent> {
        let (tx, rx) = mpsc::channel(self.inner.subscriber_buffer);
        self.inner.subscribers.lock().push(Subscriber { user_id, tx });
        rx
    }

    /// Fire-and-forget fan-out. A full subscriber misses this event; a closed
    /// one is pruned.
    pub fn publish(&self, event: WingEvent) {
        metrics::WING_EVENTS
            .with_label_values(&[event.event_type.as_str()])
            .inc();
        let mut subscribers = self.inner.subscribers.lock();
        subscribers.retain(|sub| {
            if sub
                .user_id
                .as_deref()
                .is_some_and(|user| user != event.user_id)
            {
                return !sub.tx.is_closed();
            }
            match sub.tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    metrics::WING_EVENTS_DROPPED.inc();
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }

    /// Sends `message` to every wing in a point-in-time snapshot. Each write
    /// carries its own deadline. Returns how many writes succeeded.
    pub async fn broadcast_all(&self, message: RelayMessage, deadline: Duration) -> usize {
        let snapshot = self.all();
        send_to_each(&snapshot, message, deadline).await
    }

    pub async fn broadcast_to_user(
        &self,
        user_id: &str,
        message: RelayMessage,
        deadline: Duration,
    ) -> usize {
        let snapshot = self.list_for_user(user_id);
        send_to_each(&snapshot, message, deadline).await
    }

    pub async fn close_all(&self, reason: &str, deadline: Duration) {
        let snapshot = self.all();
        join_all(snapshot.iter().map(|wing| async move {
            if let Err(err) = wing.handle.close(reason, deadline).await {
                debug!(connection_id = wing.connection_id, error = %err, "close skipped");
            }
        }))
        .await;
    }

    fn notify_observer(&self, event: &WingEvent, wing: &ConnectedWing) {
        let observer = self.inner.observer.read().clone();
        if let Some(observer) = observer {
            observer.on_wing_event(event, wing);
        }
    }
}

async fn send_to_each(
    wings: &[Arc<ConnectedWing>],
    message: RelayMessage,
    deadline: Duration,
) -> usize {
    let results = join_all(wings.iter().map(|wing| {
        let message = message.clone();
        async move { wing.handle.send(message, deadline).await.is_ok() }
    }))
    .await;
    results.into_iter().filter(|ok| *ok).count()
}
