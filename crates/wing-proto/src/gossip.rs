//! Node-to-node payloads exchanged between edge relays and the login relay.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Where a wing currently lives, as known by the login node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WingLocation {
    pub wing_id: String,
    pub machine_id: String,
    pub user_id: String,
    #[serde(default)]
    pub org_id: Option<String>,
    #[serde(default)]
    pub public_key: Option<String>,
    #[serde(default)]
    pub locked: bool,
    #[serde(default)]
    pub allowed_peers: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GossipEvent {
    WingOnline {
        event_id: String,
        location: WingLocation,
    },
    WingOffline {
        event_id: String,
        wing_id: String,
        machine_id: String,
    },
    /// Lock state or peer allowance changed without a reconnect.
    WingUpdated {
        event_id: String,
        location: WingLocation,
    },
    /// Membership changed; receivers re-fetch the user's orgs from login.
    OrgChanged {
        event_id: String,
        user_id: String,
    },
}

impl GossipEvent {
    pub fn online(location: WingLocation) -> Self {
        GossipEvent::WingOnline {
            event_id: new_event_id(),
            location,
        }
    }

    pub fn offline(wing_id: impl Into<String>, machine_id: impl Into<String>) -> Self {
        GossipEvent::WingOffline {
            event_id: new_event_id(),
            wing_id: wing_id.into(),
            machine_id: machine_id.into(),
        }
    }

    pub fn updated(location: WingLocation) -> Self {
        GossipEvent::WingUpdated {
            event_id: new_event_id(),
            location,
        }
    }

    pub fn org_changed(user_id: impl Into<String>) -> Self {
        GossipEvent::OrgChanged {
            event_id: new_event_id(),
            user_id: user_id.into(),
        }
    }

    pub fn event_id(&self) -> &str {
        match self {
            GossipEvent::WingOnline { event_id, .. }
            | GossipEvent::WingOffline { event_id, .. }
            | GossipEvent::WingUpdated { event_id, .. }
            | GossipEvent::OrgChanged { event_id, .. } => event_id,
        }
    }

    pub fn wing_id(&self) -> Option<&str> {
        match self {
            GossipEvent::WingOnline { location, .. } | GossipEvent::WingUpdated { location, .. } => {
                Some(&location.wing_id)
            }
            GossipEvent::WingOffline { wing_id, .. } => Some(wing_id),
            GossipEvent::OrgChanged { .. } => None,
        }
    }
}

fn new_event_id() -> String {
    Uuid::new_v4().to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequencedEvent {
    pub seq: u64,
    pub event: GossipEvent,
}

/// Incremental sync, edge → login.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRequest {
    pub machine_id: String,
    #[serde(default)]
    pub edge_url: Option<String>,
    /// Epoch of the login process the edge last synced with.
    #[serde(default)]
    pub epoch: Option<String>,
    pub last_seq: u64,
    #[serde(default)]
    pub events: Vec<GossipEvent>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncResponse {
    pub epoch: String,
    pub seq: u64,
    #[serde(default)]
    pub events: Vec<SequencedEvent>,
    /// Set when the edge's cursor cannot be trusted any more.
    #[serde(default)]
    pub stale: bool,
    /// Full directory, only present on stale responses.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<Vec<WingLocation>>,
}

/// Full reconciliation, edge → login.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WingSyncRequest {
    pub machine_id: String,
    #[serde(default)]
    pub edge_url: Option<String>,
    #[serde(default)]
    pub wings: Vec<WingLocation>,
    /// Bytes relayed per user since the previous wing-sync.
    #[serde(default)]
    pub bandwidth: HashMap<String, u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WingSyncResponse {
    #[serde(default)]
    pub over_limit_users: Vec<String>,
    #[serde(default)]
    pub swept: usize,
}

/// A single lifecycle event relayed between nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WingEventEnvelope {
    pub origin_machine: String,
    #[serde(default)]
    pub origin_url: Option<String>,
    pub event: GossipEvent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStatus {
    pub machine_id: String,
    pub role: String,
    pub epoch: Option<String>,
    pub seq: u64,
    pub wings_connected: usize,
    pub stale: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrgCheckRequest {
    pub user_id: String,
    pub org: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrgCheckResponse {
    pub org_id: String,
    pub role: String,
    pub allowed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserOrgsResponse {
    pub user_id: String,
    pub orgs: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionLookupRequest {
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionLookupResponse {
    pub user_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntitlementsRequest {
    pub user_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntitlementsResponse {
    pub tiers: HashMap<String, String>,
}
