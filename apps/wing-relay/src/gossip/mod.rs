//! Wing-location gossip between edge relays and the login relay.

mod client;
mod directory;
mod edge;
mod login;

pub use client::{LoginClient, PeerClient, NODE_SECRET_HEADER};
pub use directory::WingDirectory;
pub use edge::{spawn_edge_loops, EdgeSync};
pub use login::{spawn_login_loops, LoginNode};

use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, info, warn};
use wing_proto::{
    GossipEvent, RelayMessage, SyncRequest, SyncResponse, WingEventEnvelope, WingLocation, WingSyncRequest,
    WingSyncResponse,
};

use crate::{
    identity::IdentityProvider,
    registry::{ConnectedWing, WingEvent, WingEventType, WingRegistry},
};

#[derive(Debug, thiserror::Error)]
pub enum GossipError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("peer answered {status}: {body}")]
    Status { status: u16, body: String },
    #[error("no login url configured")]
    NoLogin,
    #[error(transparent)]
    Store(#[from] crate::store::StoreError),
}

/// The node's view of the authoritative directory: over HTTP on an edge,
/// in-process on the login node itself.
#[async_trait]
pub trait DirectoryLink: Send + Sync {
    async fn sync(&self, request: SyncRequest) -> Result<SyncResponse, GossipError>;
    async fn wing_sync(&self, request: WingSyncRequest) -> Result<WingSyncResponse, GossipError>;
    async fn publish(&self, envelope: WingEventEnvelope) -> Result<(), GossipError>;
    async fn locate(&self, wing_id: &str) -> Result<Option<WingLocation>, GossipError>;
}

/// Bytes relayed per user since the last reconciliation.
#[derive(Default)]
pub struct BandwidthMeter {
    counters: DashMap<String, u64>,
}

impl BandwidthMeter {
    pub fn record(&self, user_id: &str, bytes: u64) {
        *self.counters.entry(user_id.to_string()).or_insert(0) += bytes;
    }

    pub fn take(&self) -> HashMap<String, u64> {
        let keys: Vec<String> = self.counters.iter().map(|e| e.key().clone()).collect();
        keys.into_iter()
            .filter_map(|key| self.counters.remove(&key))
            .collect()
    }

    /// Puts back counters whose report never reached login.
    pub fn restore(&self, counters: HashMap<String, u64>) {
        for (user, bytes) in counters {
            self.record(&user, bytes);
        }
    }
}

/// Edge-side cache of user → org ids, invalidated by `org_changed`.
#[derive(Default)]
pub struct OrgCache {
    entries: DashMap<String, Vec<String>>,
}

impl OrgCache {
    pub fn get(&self, user_id: &str) -> Option<Vec<String>> {
        self.entries.get(user_id).map(|e| e.value().clone())
    }

    pub fn insert(&self, user_id: &str, orgs: Vec<String>) {
        self.entries.insert(user_id.to_string(), orgs);
    }

    pub fn invalidate(&self, user_id: &str) -> bool {
        self.entries.remove(user_id).is_some()
    }
}

pub type SharedLink = Arc<dyn DirectoryLink>;

/// Translates a local registry change into the gossip event other nodes see.
/// A connection going away while another one is still registered under the
/// same identity re-asserts the survivor instead of taking the wing offline.
pub(crate) fn gossip_event_for(
    event: &WingEvent,
    wing: &ConnectedWing,
    registry: &WingRegistry,
    machine_id: &str,
) -> Option<GossipEvent> {
    match event.event_type {
        WingEventType::WingOnline => Some(GossipEvent::online(wing.location(machine_id))),
        WingEventType::WingOffline => match registry.find_registered(&wing.wing_id) {
            Some(survivor) => Some(GossipEvent::updated(survivor.location(machine_id))),
            None => Some(GossipEvent::offline(wing.wing_id.clone(), machine_id)),
        },
        WingEventType::LockChanged => Some(GossipEvent::updated(wing.location(machine_id))),
        WingEventType::OrgChanged | WingEventType::SessionAttention => None,
    }
}

/// Re-reads a user's organizations after `org_changed`. Local wings registered
/// under an organization the user no longer belongs to are closed; the rest are
/// told to refresh. Returns how many wings were closed.
pub(crate) async fn refresh_org_membership(
    registry: &WingRegistry,
    identity: &dyn IdentityProvider,
    user_id: &str,
    deadline: Duration,
) -> usize {
    let wings = registry.list_for_user(user_id);
    if wings.is_empty() {
        return 0;
    }
    let orgs = match identity.user_orgs(user_id).await {
        Ok(orgs) => orgs,
        Err(err) => {
            warn!(user_id, error = %err, "org membership refresh failed");
            return 0;
        }
    };

    let mut closed = 0;
    for wing in &wings {
        let Some(org_id) = wing.org_id.as_deref() else {
            continue;
        };
        if orgs.iter().any(|org| org == org_id) {
            continue;
        }
        info!(user_id, wing_id = %wing.wing_id, org_id, "closing wing outside its organization");
        match wing.handle.close("organization membership changed", deadline).await {
            Ok(()) => closed += 1,
            Err(err) => debug!(wing_id = %wing.wing_id, error = %err, "close skipped"),
        }
    }

    let message = RelayMessage::OrgChanged {
        user_id: user_id.to_string(),
    };
    registry.broadcast_to_user(user_id, message, deadline).await;
    closed
}

/// Closes every local wing owned by a user reported over the bandwidth limit.
pub(crate) async fn enforce_over_limit(registry: &WingRegistry, users: &[String], deadline: Duration) {
    for user_id in users {
        for wing in registry.list_for_user(user_id) {
            warn!(user_id = %user_id, wing_id = %wing.wing_id, "closing wing over bandwidth limit");
            if let Err(err) = wing.handle.close("bandwidth limit exceeded", deadline).await {
                debug!(wing_id = %wing.wing_id, error = %err, "close skipped");
            }
        }
    }
}
