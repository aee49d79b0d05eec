use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use wing_proto::{
    GossipEvent, NodeStatus, SyncRequest, SyncResponse, WingEventEnvelope,
    WingLocation, WingSyncRequest, WingSyncResponse,
};

use super::{
    enforce_over_limit, gossip_event_for, refresh_org_membership, BandwidthMeter, GossipError,
    OrgCache, SharedLink,
};
use crate::{
    identity::IdentityProvider,
    metrics,
    registry::{ConnectedWing, WingEvent, WingObserver, WingRegistry},
};

const SEEN_CAPACITY: usize = 4_096;

#[derive(Debug, Clone, Default)]
struct Cursor {
    epoch: Option<String>,
    last_seq: u64,
}

#[derive(Default)]
struct SeenEvents {
    ids: HashSet<String>,
    order: VecDeque<String>,
}

impl SeenEvents {
    fn first_time(&mut self, event_id: &str) -> bool {
        if !self.ids.insert(event_id.to_string()) {
            return false;
        }
        self.order.push_back(event_id.to_string());
        while self.order.len() > SEEN_CAPACITY {
            if let Some(old) = self.order.pop_front() {
                self.ids.remove(&old);
            }
        }
        true
    }
}

/// Edge-side half of the gossip protocol: a read-through cache of remote
/// wing locations plus the cursor into login's event log.
pub struct EdgeSync {
    machine_id: String,
    edge_url: Option<String>,
    link: SharedLink,
    registry: WingRegistry,
    meter: Arc<BandwidthMeter>,
    orgs: Arc<OrgCache>,
    identity: Arc<dyn IdentityProvider>,
    write_timeout: Duration,
    wing_map: RwLock<HashMap<String, WingLocation>>,
    cursor: Mutex<Cursor>,
    stale: AtomicBool,
    outbox: Mutex<Vec<GossipEvent>>,
    seen: Mutex<SeenEvents>,
    round: tokio::sync::Mutex<()>,
}

impl EdgeSync {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        machine_id: impl Into<String>,
        edge_url: Option<String>,
        link: SharedLink,
        registry: WingRegistry,
        meter: Arc<BandwidthMeter>,
        orgs: Arc<OrgCache>,
        identity: Arc<dyn IdentityProvider>,
        write_timeout: Duration,
    ) -> Arc<Self> {
        let edge = Arc::new(Self {
            machine_id: machine_id.into(),
            edge_url,
            link,
            registry: registry.clone(),
            meter,
            orgs,
            identity,
            write_timeout,
            wing_map: RwLock::new(HashMap::new()),
            cursor: Mutex::new(Cursor::default()),
            stale: AtomicBool::new(false),
            outbox: Mutex::new(Vec::new()),
            seen: Mutex::new(SeenEvents::default()),
            round: tokio::sync::Mutex::new(()),
        });
        registry.set_observer(Arc::new(EdgeFeed(Arc::downgrade(&edge))));
        edge
    }

    pub fn machine_id(&self) -> &str {
        &self.machine_id
    }

    pub fn is_stale(&self) -> bool {
        self.stale.load(Ordering::Acquire)
    }

    pub fn last_seq(&self) -> u64 {
        self.cursor.lock().last_seq
    }

    pub fn epoch(&self) -> Option<String> {
        self.cursor.lock().epoch.clone()
    }

    pub fn cached(&self, wing_id: &str) -> Option<WingLocation> {
        self.wing_map.read().get(wing_id).cloned()
    }

    pub fn status(&self) -> NodeStatus {
        let cursor = self.cursor.lock().clone();
        NodeStatus {
            machine_id: self.machine_id.clone(),
            role: "edge".to_string(),
            epoch: cursor.epoch,
            seq: cursor.last_seq,
            wings_connected: self.registry.len(),
            stale: self.is_stale(),
        }
    }

    /// Local registry first, then the cache, then login. The cache is skipped
    /// while stale.
    pub async fn locate(&self, wing_id: &str) -> Result<Option<WingLocation>, GossipError> {
        if let Some(wing) = self.registry.find_by_wing_id(wing_id) {
            return Ok(Some(wing.location(&self.machine_id)));
        }
        if !self.is_stale() {
            if let Some(location) = self.cached(wing_id) {
                return Ok(Some(location));
            }
        }
        let found = self.link.locate(wing_id).await?;
        if let Some(location) = &found {
            if location.machine_id != self.machine_id {
                self.wing_map
                    .write()
                    .insert(location.wing_id.clone(), location.clone());
            }
        }
        Ok(found)
    }

    /// One incremental sync round. Local events that fail to reach login are
    /// kept for the next round.
    pub async fn sync_once(&self) -> Result<(), GossipError> {
        let _round = self.round.lock().await;
        let events = std::mem::take(&mut *self.outbox.lock());
        let cursor = self.cursor.lock().clone();
        let request = SyncRequest {
            machine_id: self.machine_id.clone(),
            edge_url: self.edge_url.clone(),
            epoch: cursor.epoch,
            last_seq: cursor.last_seq,
            events: events.clone(),
        };
        let response = match self.link.sync(request).await {
            Ok(response) => response,
            Err(err) => {
                let mut outbox = self.outbox.lock();
                let newer = std::mem::replace(&mut *outbox, events);
                outbox.extend(newer);
                return Err(err);
            }
        };

        if response.stale {
            self.enter_stale(response);
            self.push_full().await?;
            return Ok(());
        }

        let mut applied = 0;
        for entry in &response.events {
            if entry.seq > cursor.last_seq && self.apply_remote(&entry.event) {
                applied += 1;
            }
        }
        if applied > 0 {
            metrics::GOSSIP_EVENTS_APPLIED
                .with_label_values(&["edge_sync"])
                .inc_by(applied);
        }
        *self.cursor.lock() = Cursor {
            epoch: Some(response.epoch),
            last_seq: response.seq,
        };
        Ok(())
    }

    /// Full reconciliation of this edge's wings against login.
    pub async fn wing_sync_once(&self) -> Result<WingSyncResponse, GossipError> {
        let _round = self.round.lock().await;
        self.push_full().await
    }

    /// Applies an event relayed by login. Returns false for repeats.
    pub fn handle_relayed(&self, envelope: WingEventEnvelope) -> bool {
        self.apply_remote(&envelope.event)
    }

    fn enter_stale(&self, response: SyncResponse) {
        if !self.stale.swap(true, Ordering::AcqRel) {
            metrics::STALE_MODE_ENTERED.inc();
        }
        warn!(epoch = %response.epoch, seq = response.seq, "login cursor regressed; rebuilding from snapshot");
        let snapshot = response.snapshot.unwrap_or_default();
        let remote: HashMap<String, WingLocation> = snapshot
            .into_iter()
            .filter(|loc| loc.machine_id != self.machine_id)
            .map(|loc| (loc.wing_id.clone(), loc))
            .collect();
        *self.wing_map.write() = remote;
        *self.cursor.lock() = Cursor {
            epoch: Some(response.epoch),
            last_seq: response.seq,
        };
    }

    async fn push_full(&self) -> Result<WingSyncResponse, GossipError> {
        let wings = self
            .registry
            .all()
            .iter()
            .map(|wing| wing.location(&self.machine_id))
            .collect();
        let bandwidth = self.meter.take();
        let request = WingSyncRequest {
            machine_id: self.machine_id.clone(),
            edge_url: self.edge_url.clone(),
            wings,
            bandwidth: bandwidth.clone(),
        };
        let response = match self.link.wing_sync(request).await {
            Ok(response) => response,
            Err(err) => {
                self.meter.restore(bandwidth);
                return Err(err);
            }
        };
        enforce_over_limit(&self.registry, &response.over_limit_users, self.write_timeout).await;
        if self.stale.swap(false, Ordering::AcqRel) {
            info!("full wing-sync accepted; leaving stale mode");
        }
        Ok(response)
    }

    fn apply_remote(&self, event: &GossipEvent) -> bool {
        if !self.seen.lock().first_time(event.event_id()) {
            return false;
        }
        match event {
            GossipEvent::WingOnline { location, .. } | GossipEvent::WingUpdated { location, .. } => {
                if location.machine_id != self.machine_id {
                    self.wing_map
                        .write()
                        .insert(location.wing_id.clone(), location.clone());
                }
            }
            GossipEvent::WingOffline {
                wing_id, machine_id, ..
            } => {
                let mut map = self.wing_map.write();
                if map.get(wing_id).is_some_and(|loc| &loc.machine_id == machine_id) {
                    map.remove(wing_id);
                }
            }
            GossipEvent::OrgChanged { user_id, .. } => {
                self.orgs.invalidate(user_id);
                let registry = self.registry.clone();
                let identity = Arc::clone(&self.identity);
                let user_id = user_id.clone();
                let deadline = self.write_timeout;
                tokio::spawn(async move {
                    refresh_org_membership(&registry, identity.as_ref(), &user_id, deadline).await;
                });
            }
        }
        true
    }

    fn observe_local(&self, event: &WingEvent, wing: &ConnectedWing) {
        let Some(gossip) = gossip_event_for(event, wing, &self.registry, &self.machine_id) else {
            return;
        };
        self.seen.lock().first_time(gossip.event_id());
        self.outbox.lock().push(gossip.clone());

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let link = Arc::clone(&self.link);
        let envelope = WingEventEnvelope {
            origin_machine: self.machine_id.clone(),
            origin_url: self.edge_url.clone(),
            event: gossip,
        };
        runtime.spawn(async move {
            if let Err(err) = link.publish(envelope).await {
                debug!(error = %err, "immediate event relay failed; next sync carries it");
            }
        });
    }
}

struct EdgeFeed(Weak<EdgeSync>);

impl WingObserver for EdgeFeed {
    fn on_wing_event(&self, event: &WingEvent, wing: &ConnectedWing) {
        if let Some(edge) = self.0.upgrade() {
            edge.observe_local(event, wing);
        }
    }
}

pub fn spawn_edge_loops(
    edge: Arc<EdgeSync>,
    sync_every: Duration,
    wing_sync_every: Duration,
) -> Vec<JoinHandle<()>> {
    let incremental = {
        let edge = Arc::clone(&edge);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sync_every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(err) = edge.sync_once().await {
                    warn!(error = %err, "incremental sync failed");
                }
            }
        })
    };
    let full = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(wing_sync_every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(err) = edge.wing_sync_once().await {
                warn!(error = %err, "wing-sync failed");
            }
        }
    });
    vec![incremental, full]
}
