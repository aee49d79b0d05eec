use std::{
    collections::HashMap,
    sync::{Arc, Weak},
    time::{Duration, Instant},
};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use wing_proto::{
    GossipEvent, NodeStatus, SyncRequest, SyncResponse, WingEventEnvelope,
    WingLocation, WingSyncRequest, WingSyncResponse,
};

use super::{
    enforce_over_limit, gossip_event_for, refresh_org_membership, BandwidthMeter, DirectoryLink,
    GossipError, PeerClient, WingDirectory,
};
use crate::{
    config::AppConfig,
    identity::LocalIdentity,
    registry::{ConnectedWing, WingEvent, WingObserver, WingRegistry},
    store::RelayStore,
};

/// Tiers exempt from the bandwidth policy.
const UNMETERED_TIERS: &[&str] = &["pro", "team", "enterprise"];

struct BandwidthWindow {
    started: Instant,
    totals: HashMap<String, u64>,
}

/// The authoritative side of the gossip protocol.
pub struct LoginNode {
    machine_id: String,
    directory: WingDirectory,
    store: Arc<dyn RelayStore>,
    registry: WingRegistry,
    peers: PeerClient,
    meter: Arc<BandwidthMeter>,
    window: Mutex<BandwidthWindow>,
    bandwidth_limit: u64,
    bandwidth_window: Duration,
    write_timeout: Duration,
}

impl LoginNode {
    pub fn new(
        cfg: &AppConfig,
        store: Arc<dyn RelayStore>,
        registry: WingRegistry,
        meter: Arc<BandwidthMeter>,
    ) -> Arc<Self> {
        let node = Arc::new(Self {
            machine_id: cfg.machine_id.clone(),
            directory: WingDirectory::new(cfg.event_log_capacity),
            store,
            registry: registry.clone(),
            peers: PeerClient::new(cfg.node_secret.clone(), cfg.write_timeout()),
            meter,
            window: Mutex::new(BandwidthWindow {
                started: Instant::now(),
                totals: HashMap::new(),
            }),
            bandwidth_limit: cfg.bandwidth_limit_bytes,
            bandwidth_window: cfg.bandwidth_window(),
            write_timeout: cfg.write_timeout(),
        });
        registry.set_observer(Arc::new(LocalFeed(Arc::downgrade(&node))));
        node
    }

    pub fn machine_id(&self) -> &str {
        &self.machine_id
    }

    pub fn directory(&self) -> &WingDirectory {
        &self.directory
    }

    pub fn status(&self) -> NodeStatus {
        NodeStatus {
            machine_id: self.machine_id.clone(),
            role: "login".to_string(),
            epoch: Some(self.directory.epoch().to_string()),
            seq: self.directory.seq(),
            wings_connected: self.registry.len(),
            stale: false,
        }
    }

    pub fn locate(&self, wing_id: &str) -> Option<WingLocation> {
        self.directory.locate(wing_id)
    }

    pub fn sync(&self, request: SyncRequest) -> SyncResponse {
        let machine_id = request.machine_id.clone();
        let response = self.directory.sync(request);
        if response.stale {
            info!(machine_id = %machine_id, seq = response.seq, "edge cursor stale; sending snapshot");
        }
        response
    }

    pub async fn wing_sync(&self, request: WingSyncRequest) -> Result<WingSyncResponse, GossipError> {
        self.directory
            .remember_edge(&request.machine_id, request.edge_url.as_deref());
        let reconciled = self.directory.reconcile(&request.machine_id, request.wings);
        if !reconciled.swept.is_empty() {
            info!(
                machine_id = %request.machine_id,
                swept = reconciled.swept.len(),
                "reconciliation removed unreported wings"
            );
        }
        for event in reconciled.events {
            self.relay(
                WingEventEnvelope {
                    origin_machine: request.machine_id.clone(),
                    origin_url: None,
                    event,
                },
                Some(&request.machine_id),
            );
        }
        let over_limit_users = self.over_limit(request.bandwidth).await?;
        Ok(WingSyncResponse {
            over_limit_users,
            swept: reconciled.swept.len(),
        })
    }

    /// Applies an event relayed from an edge (or an external membership
    /// service) and fans it out to every other edge. Duplicates are dropped.
    pub fn wing_event(&self, envelope: WingEventEnvelope) -> bool {
        self.directory
            .remember_edge(&envelope.origin_machine, envelope.origin_url.as_deref());
        if !self.directory.apply(envelope.event.clone(), "relay") {
            debug!(event_id = envelope.event.event_id(), "duplicate gossip event");
            return false;
        }
        if let GossipEvent::OrgChanged { user_id, .. } = &envelope.event {
            self.push_org_changed(user_id);
        }
        let origin = envelope.origin_machine.clone();
        self.relay(envelope, Some(&origin));
        true
    }

    pub fn register(&self, location: WingLocation) -> bool {
        let origin = location.machine_id.clone();
        self.wing_event(WingEventEnvelope {
            origin_machine: origin,
            origin_url: None,
            event: GossipEvent::online(location),
        })
    }

    pub fn deregister(&self, wing_id: &str, machine_id: &str) -> bool {
        self.wing_event(WingEventEnvelope {
            origin_machine: machine_id.to_string(),
            origin_url: None,
            event: GossipEvent::offline(wing_id, machine_id),
        })
    }

    /// Reconciles this node's own wings and enforces the bandwidth policy on them.
    pub async fn reconcile_local(&self) -> Result<WingSyncResponse, GossipError> {
        let wings = self
            .registry
            .all()
            .iter()
            .map(|wing| wing.location(&self.machine_id))
            .collect();
        let bandwidth = self.meter.take();
        let response = self
            .wing_sync(WingSyncRequest {
                machine_id: self.machine_id.clone(),
                edge_url: None,
                wings,
                bandwidth,
            })
            .await?;
        enforce_over_limit(&self.registry, &response.over_limit_users, self.write_timeout).await;
        Ok(response)
    }

    fn push_org_changed(&self, user_id: &str) {
        let registry = self.registry.clone();
        let identity = LocalIdentity::new(Arc::clone(&self.store));
        let user_id = user_id.to_string();
        let deadline = self.write_timeout;
        tokio::spawn(async move {
            refresh_org_membership(&registry, &identity, &user_id, deadline).await;
        });
    }

    /// Fire-and-forget delivery to every known edge except `exclude`.
    fn relay(&self, envelope: WingEventEnvelope, exclude: Option<&str>) {
        let edges = self.directory.edges_except(exclude);
        if edges.is_empty() {
            return;
        }
        let envelope = Arc::new(envelope);
        for (machine_id, url) in edges {
            let peers = self.peers.clone();
            let envelope = Arc::clone(&envelope);
            tokio::spawn(async move {
                if let Err(err) = peers.relay(&url, &envelope).await {
                    warn!(machine_id = %machine_id, error = %err, "event relay to edge failed");
                }
            });
        }
    }

    async fn over_limit(&self, usage: HashMap<String, u64>) -> Result<Vec<String>, GossipError> {
        let candidates: Vec<String> = {
            let mut window = self.window.lock();
            if window.started.elapsed() >= self.bandwidth_window {
                window.started = Instant::now();
                window.totals.clear();
            }
            for (user, bytes) in usage {
                *window.totals.entry(user).or_insert(0) += bytes;
            }
            let mut users: Vec<String> = window
                .totals
                .iter()
                .filter(|(_, total)| **total > self.bandwidth_limit)
                .map(|(user, _)| user.clone())
                .collect();
            users.sort();
            users
        };
        if candidates.is_empty() {
            return Ok(candidates);
        }
        let tiers = self.store.entitlement_tiers(&candidates).await?;
        Ok(candidates
            .into_iter()
            .filter(|user| {
                !tiers
                    .get(user)
                    .is_some_and(|tier| UNMETERED_TIERS.contains(&tier.as_str()))
            })
            .collect())
    }

    fn observe_local(&self, event: &WingEvent, wing: &ConnectedWing) {
        if let Some(gossip) = gossip_event_for(event, wing, &self.registry, &self.machine_id) {
            self.directory.apply(gossip.clone(), "local");
            self.relay(
                WingEventEnvelope {
                    origin_machine: self.machine_id.clone(),
                    origin_url: None,
                    event: gossip,
                },
                None,
            );
        }
    }
}

struct LocalFeed(Weak<LoginNode>);

impl WingObserver for LocalFeed {
    fn on_wing_event(&self, event: &WingEvent, wing: &ConnectedWing) {
        if let Some(node) = self.0.upgrade() {
            node.observe_local(event, wing);
        }
    }
}

#[async_trait]
impl DirectoryLink for LoginNode {
    async fn sync(&self, request: SyncRequest) -> Result<SyncResponse, GossipError> {
        Ok(LoginNode::sync(self, request))
    }

    async fn wing_sync(&self, request: WingSyncRequest) -> Result<WingSyncResponse, GossipError> {
        LoginNode::wing_sync(self, request).await
    }

    async fn publish(&self, envelope: WingEventEnvelope) -> Result<(), GossipError> {
        self.wing_event(envelope);
        Ok(())
    }

    async fn locate(&self, wing_id: &str) -> Result<Option<WingLocation>, GossipError> {
        Ok(LoginNode::locate(self, wing_id))
    }
}

pub fn spawn_login_loops(node: Arc<LoginNode>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Err(err) = node.reconcile_local().await {
                warn!(error = %err, "local reconciliation failed");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{Outbound, WingHandle};
    use crate::store::MemoryStore;
    use wing_proto::{RegisterPayload, RelayMessage};

    fn node(store: Arc<MemoryStore>, limit: u64) -> (Arc<LoginNode>, WingRegistry) {
        let cfg = AppConfig {
            machine_id: "login".into(),
            bandwidth_limit_bytes: limit,
            ..AppConfig::default()
        };
        let registry = WingRegistry::new(8);
        let node = LoginNode::new(&cfg, store, registry.clone(), Arc::new(BandwidthMeter::default()));
        (node, registry)
    }

    fn loc(wing_id: &str, machine: &str, user: &str) -> WingLocation {
        WingLocation {
            wing_id: wing_id.into(),
            machine_id: machine.into(),
            user_id: user.into(),
            org_id: None,
            public_key: None,
            locked: false,
            allowed_peers: 0,
        }
    }

    fn add_wing(registry: &WingRegistry, wing_id: &str) -> Arc<ConnectedWing> {
        let (handle, rx) = WingHandle::channel();
        std::mem::forget(rx);
        let register = RegisterPayload {
            wing_id: wing_id.into(),
            org: None,
            capabilities: Default::default(),
            projects: vec![],
            public_key: None,
            locked: false,
            allowed_peers: 0,
        };
        registry.add(ConnectedWing::new(registry.next_connection_id(), "u", None, &register, handle))
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn local_wings_land_in_directory() {
        let (node, registry) = node(Arc::new(MemoryStore::default()), u64::MAX);
        let wing = add_wing(&registry, "w-local");
        assert_eq!(node.locate("w-local").unwrap().machine_id, "login");
        registry.remove(wing.connection_id);
        assert!(node.locate("w-local").is_none());
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn second_device_keeps_wing_located() {
        let (node, registry) = node(Arc::new(MemoryStore::default()), u64::MAX);
        let first = add_wing(&registry, "laptop");
        let second = add_wing(&registry, "laptop");

        registry.remove(first.connection_id);
        assert!(registry.find_by_wing_id("laptop").is_some());
        assert_eq!(node.locate("laptop").unwrap().machine_id, "login");

        registry.remove(second.connection_id);
        assert!(node.locate("laptop").is_none());
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn org_changed_closes_wings_in_orgs_the_user_left() {
        let store = Arc::new(MemoryStore::default());
        store.set_member("org-keep", "u", "admin").await;
        let (node, registry) = node(store, u64::MAX);
        let mut wings = Vec::new();
        for org in ["org-keep", "org-gone"] {
            let (handle, rx) = WingHandle::channel();
            let register = RegisterPayload {
                wing_id: format!("w-{org}"),
                org: Some(org.into()),
                capabilities: Default::default(),
                projects: vec![],
                public_key: None,
                locked: false,
                allowed_peers: 0,
            };
            registry.add(ConnectedWing::new(
                registry.next_connection_id(),
                "u",
                Some(org.into()),
                &register,
                handle,
            ));
            wings.push(rx);
        }

        assert!(node.wing_event(WingEventEnvelope {
            origin_machine: "membership".into(),
            origin_url: None,
            event: GossipEvent::org_changed("u"),
        }));
        let mut gone = wings.pop().unwrap();
        let mut kept = wings.pop().unwrap();
        assert!(matches!(gone.recv().await, Some(Outbound::Close(_))));
        assert!(matches!(
            kept.recv().await,
            Some(Outbound::Message(RelayMessage::OrgChanged { .. }))
        ));
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn lock_changes_reach_directory() {
        let (node, registry) = node(Arc::new(MemoryStore::default()), u64::MAX);
        let wing = add_wing(&registry, "desk");
        assert!(!node.locate("desk").unwrap().locked);
        assert!(registry.set_locked(wing.connection_id, true));
        assert!(node.locate("desk").unwrap().locked);
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn relayed_events_are_idempotent() {
        let (node, _registry) = node(Arc::new(MemoryStore::default()), u64::MAX);
        let envelope = WingEventEnvelope {
            origin_machine: "edge-a".into(),
            origin_url: None,
            event: GossipEvent::online(loc("w-1", "edge-a", "u")),
        };
        assert!(node.wing_event(envelope.clone()));
        assert!(!node.wing_event(envelope));
        assert_eq!(node.directory().seq(), 1);
        assert!(node.deregister("w-1", "edge-a"));
        assert!(node.locate("w-1").is_none());
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn bandwidth_policy_spares_paid_tiers() {
        let store = Arc::new(MemoryStore::default());
        store.set_tier("paid", "team").await;
        store.set_tier("free", "free").await;
        let (node, _registry) = node(store, 100);

        let mut bandwidth = HashMap::new();
        bandwidth.insert("paid".to_string(), 500);
        bandwidth.insert("free".to_string(), 500);
        bandwidth.insert("anon".to_string(), 60);
        let resp = LoginNode::wing_sync(
            &node,
            WingSyncRequest {
                machine_id: "edge-a".into(),
                edge_url: None,
                wings: vec![],
                bandwidth: bandwidth.clone(),
            },
        )
        .await
        .unwrap();
        assert_eq!(resp.over_limit_users, vec!["free".to_string()]);

        // Usage accumulates across reports within the window.
        let resp = LoginNode::wing_sync(
            &node,
            WingSyncRequest {
                machine_id: "edge-a".into(),
                edge_url: None,
                wings: vec![],
                bandwidth: HashMap::from([("anon".to_string(), 60)]),
            },
        )
        .await
        .unwrap();
        assert_eq!(resp.over_limit_users, vec!["anon".to_string(), "free".to_string()]);
    }
}
