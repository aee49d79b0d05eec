use std::collections::{HashMap, HashSet, VecDeque};

use parking_lot::Mutex;
use wing_proto::{GossipEvent, SequencedEvent, SyncRequest, SyncResponse, WingLocation};

use crate::metrics;

/// Authoritative wing → machine directory held by the login node, plus the
/// sequenced event log edges replay from.
pub struct WingDirectory {
    epoch: String,
    capacity: usize,
    inner: Mutex<DirectoryInner>,
}

#[derive(Default)]
struct DirectoryInner {
    locations: HashMap<String, WingLocation>,
    log: VecDeque<SequencedEvent>,
    seq: u64,
    seen: HashSet<String>,
    seen_order: VecDeque<String>,
    edges: HashMap<String, String>,
}

/// Result of a full reconciliation against one machine's wing list.
#[derive(Debug, Default)]
pub struct Reconciled {
    pub swept: Vec<String>,
    pub events: Vec<GossipEvent>,
}

impl WingDirectory {
    pub fn new(capacity: usize) -> Self {
        Self {
            epoch: uuid::Uuid::new_v4().to_string(),
            capacity: capacity.max(1),
            inner: Mutex::new(DirectoryInner::default()),
        }
    }

    pub fn epoch(&self) -> &str {
        &self.epoch
    }

    pub fn seq(&self) -> u64 {
        self.inner.lock().seq
    }

    /// Applies `event` once. A repeated `event_id` is ignored and returns false.
    pub fn apply(&self, event: GossipEvent, source: &str) -> bool {
        let mut inner = self.inner.lock();
        let applied = inner.apply(event, self.capacity);
        if applied {
            metrics::GOSSIP_EVENTS_APPLIED
                .with_label_values(&[source])
                .inc();
        }
        applied
    }

    pub fn locate(&self, wing_id: &str) -> Option<WingLocation> {
        self.inner.lock().locations.get(wing_id).cloned()
    }

    pub fn snapshot(&self) -> Vec<WingLocation> {
        let mut all: Vec<_> = self.inner.lock().locations.values().cloned().collect();
        all.sort_by(|a, b| a.wing_id.cmp(&b.wing_id));
        all
    }

    pub fn len(&self) -> usize {
        self.inner.lock().locations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn remember_edge(&self, machine_id: &str, url: Option<&str>) {
        if let Some(url) = url {
            self.inner
                .lock()
                .edges
                .insert(machine_id.to_string(), url.to_string());
        }
    }

    /// Callback URLs of every known edge except `exclude`.
    pub fn edges_except(&self, exclude: Option<&str>) -> Vec<(String, String)> {
        self.inner
            .lock()
            .edges
            .iter()
            .filter(|(machine, _)| Some(machine.as_str()) != exclude)
            .map(|(machine, url)| (machine.clone(), url.clone()))
            .collect()
    }

    /// Incremental sync. The edge's cursor is judged before its own events are
    /// applied: a different epoch, a cursor ahead of ours, or one older than the
    /// retained log all mean the edge must rebuild from a snapshot.
    pub fn sync(&self, request: SyncRequest) -> SyncResponse {
        let mut inner = self.inner.lock();
        if let Some(url) = request.edge_url.as_deref() {
            inner.edges.insert(request.machine_id.clone(), url.to_string());
        }

        let stale = inner.cursor_is_stale(&self.epoch, request.epoch.as_deref(), request.last_seq);

        let mut applied = 0;
        for event in request.events {
            if inner.apply(event, self.capacity) {
                applied += 1;
            }
        }
        if applied > 0 {
            metrics::GOSSIP_EVENTS_APPLIED
                .with_label_values(&["sync"])
                .inc_by(applied);
        }

        if stale {
            let mut snapshot: Vec<_> = inner.locations.values().cloned().collect();
            snapshot.sort_by(|a, b| a.wing_id.cmp(&b.wing_id));
            return SyncResponse {
                epoch: self.epoch.clone(),
                seq: inner.seq,
                events: Vec::new(),
                stale: true,
                snapshot: Some(snapshot),
            };
        }

        let events = inner
            .log
            .iter()
            .filter(|entry| entry.seq > request.last_seq)
            .cloned()
            .collect();
        SyncResponse {
            epoch: self.epoch.clone(),
            seq: inner.seq,
            events,
            stale: false,
            snapshot: None,
        }
    }

    /// Full reconciliation for `machine_id`: upserts every reported wing, then
    /// removes any wing previously attributed to that machine that was not
    /// reported. Wings of other machines are untouched.
    pub fn reconcile(&self, machine_id: &str, wings: Vec<WingLocation>) -> Reconciled {
        let mut inner = self.inner.lock();
        let mut out = Reconciled::default();
        let reported: HashSet<String> = wings.iter().map(|w| w.wing_id.clone()).collect();

        for mut location in wings {
            location.machine_id = machine_id.to_string();
            let event = match inner.locations.get(&location.wing_id) {
                Some(existing) if *existing == location => continue,
                Some(existing) if existing.machine_id == location.machine_id => {
                    GossipEvent::updated(location)
                }
                _ => GossipEvent::online(location),
            };
            inner.apply(event.clone(), self.capacity);
            out.events.push(event);
        }

        let missing: Vec<String> = inner
            .locations
            .values()
            .filter(|loc| loc.machine_id == machine_id && !reported.contains(&loc.wing_id))
            .map(|loc| loc.wing_id.clone())
            .collect();
        for wing_id in missing {
            let event = GossipEvent::offline(wing_id.clone(), machine_id);
            inner.apply(event.clone(), self.capacity);
            out.events.push(event);
            out.swept.push(wing_id);
        }
        if !out.swept.is_empty() {
            metrics::RECONCILE_SWEPT.inc_by(out.swept.len() as u64);
        }
        out
    }
}

impl DirectoryInner {
    fn cursor_is_stale(&self, epoch: &str, claimed_epoch: Option<&str>, last_seq: u64) -> bool {
        match claimed_epoch {
            Some(claimed) if claimed != epoch => return true,
            None if last_seq > 0 => return true,
            _ => {}
        }
        if last_seq > self.seq {
            return true;
        }
        // Events between the cursor and the oldest retained entry are gone.
        match self.log.front() {
            Some(oldest) => last_seq + 1 < oldest.seq,
            None => false,
        }
    }

    fn apply(&mut self, event: GossipEvent, capacity: usize) -> bool {
        let event_id = event.event_id().to_string();
        if self.seen.contains(&event_id) {
            return false;
        }
        match &event {
            GossipEvent::WingOnline { location, .. } | GossipEvent::WingUpdated { location, .. } => {
                self.locations
                    .insert(location.wing_id.clone(), location.clone());
            }
            GossipEvent::WingOffline {
                wing_id, machine_id, ..
            } => {
                // A wing that already moved to another machine stays put.
                if self
                    .locations
                    .get(wing_id)
                    .is_some_and(|loc| &loc.machine_id == machine_id)
                {
                    self.locations.remove(wing_id);
                }
            }
            GossipEvent::OrgChanged { .. } => {}
        }

        self.seq += 1;
        self.log.push_back(SequencedEvent {
            seq: self.seq,
            event,
        });
        while self.log.len() > capacity {
            self.log.pop_front();
        }

        self.seen.insert(event_id.clone());
        self.seen_order.push_back(event_id);
        while self.seen_order.len() > capacity * 4 {
            if let Some(old) = self.seen_order.pop_front() {
                self.seen.remove(&old);
            }
        }
        true
    }
}
