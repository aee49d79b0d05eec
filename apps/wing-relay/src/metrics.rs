use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

pub static WINGS_CONNECTED: Lazy<IntGauge> = Lazy::new(|| {
    let g = IntGauge::new("wings_connected", "Live wing connections on this node").unwrap();
    REGISTRY.register(Box::new(g.clone())).ok();
    g
});

pub static WING_EVENTS: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new("wing_events_total", "Wing lifecycle events published"),
        &["event_type"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static WING_EVENTS_DROPPED: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new(
        "wing_events_dropped_total",
        "Events skipped because a subscriber buffer was full",
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static TASK_TRANSITIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new("task_transitions_total", "Task status transitions"),
        &["status"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static DISPATCH_FAILURES: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new(
        "task_dispatch_failures_total",
        "Task dispatches that failed and stayed queued",
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static CORRELATION_MISSES: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new(
            "correlation_misses_total",
            "Wing replies with no waiting caller",
        ),
        &["table"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static GOSSIP_EVENTS_APPLIED: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new("gossip_events_applied_total", "Gossip events applied"),
        &["source"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static RECONCILE_SWEPT: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new(
        "reconcile_swept_total",
        "Directory entries removed by full reconciliation",
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static STALE_MODE_ENTERED: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new(
        "gossip_stale_mode_total",
        "Times this edge entered stale mode",
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub fn export_prometheus() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
