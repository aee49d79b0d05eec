mod common;

use std::{sync::Arc, time::Duration};

use common::{recv, spawn_relay, spawn_with};
use serde_json::json;
use wing_proto::{GossipEvent, WingEventEnvelope};
use wing_relay::{
    config::{AppConfig, NodeRole},
    store::MemoryStore,
};

async fn spawn_edge(login: &common::Relay) -> common::Relay {
    spawn_with(
        AppConfig {
            node_role: NodeRole::Edge,
            machine_id: "edge-test".into(),
            login_url: Some(login.url("")),
            ..AppConfig::default()
        },
        Arc::new(MemoryStore::default()),
    )
    .await
}

async fn wait_until(mut check: impl FnMut() -> bool) {
    for _ in 0..100 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition never held");
}

#[test_timeout::tokio_timeout_test(30, multi_thread)]
async fn edge_wings_become_locatable_through_login() {
    let login = spawn_relay().await;
    let edge = spawn_with(
        AppConfig {
            node_role: NodeRole::Edge,
            machine_id: "edge-test".into(),
            login_url: Some(login.url("")),
            ..AppConfig::default()
        },
        Arc::new(MemoryStore::default()),
    )
    .await;
    let edge_sync = Arc::clone(edge.state.node.as_edge().unwrap());
    let login_node = Arc::clone(login.state.node.as_login().unwrap());

    // Tokens and org membership are answered by login over the internal API.
    let wing = edge
        .register(
            "tok-alice",
            json!({ "type": "register", "wing_id": "w-edge", "org": "acme" }),
        )
        .await;
    edge_sync.sync_once().await.unwrap();
    let located = login_node.locate("w-edge").expect("located on login");
    assert_eq!(located.machine_id, "edge-test");
    assert_eq!(located.org_id.as_deref(), Some("org-acme"));

    // A wing connected to login itself reaches the edge through the sync log.
    let _home = login
        .register("tok-bob", json!({ "type": "register", "wing_id": "w-home" }))
        .await;
    edge_sync.sync_once().await.unwrap();
    assert_eq!(edge_sync.cached("w-home").unwrap().machine_id, "login-test");
    assert!(!edge_sync.is_stale());

    drop(wing);
    let registry = edge.state.registry.clone();
    wait_until(|| registry.is_empty()).await;
    let swept = edge_sync.wing_sync_once().await.unwrap();
    assert!(swept.over_limit_users.is_empty());
    assert!(login_node.locate("w-edge").is_none());
}

#[test_timeout::tokio_timeout_test(30, multi_thread)]
async fn second_device_keeps_wing_located_across_nodes() {
    let login = spawn_relay().await;
    let edge = spawn_edge(&login).await;
    let edge_sync = Arc::clone(edge.state.node.as_edge().unwrap());
    let login_node = Arc::clone(login.state.node.as_login().unwrap());

    let phone = edge
        .register("tok-alice", json!({ "type": "register", "wing_id": "laptop" }))
        .await;
    let _desk = edge
        .register("tok-alice", json!({ "type": "register", "wing_id": "laptop" }))
        .await;
    edge_sync.sync_once().await.unwrap();
    assert_eq!(login_node.locate("laptop").unwrap().machine_id, "edge-test");

    drop(phone);
    let registry = edge.state.registry.clone();
    wait_until(|| registry.len() == 1).await;
    edge_sync.sync_once().await.unwrap();
    assert_eq!(login_node.locate("laptop").unwrap().machine_id, "edge-test");

    // The same holds for wings on login itself.
    let first = login
        .register("tok-bob", json!({ "type": "register", "wing_id": "tablet" }))
        .await;
    let _second = login
        .register("tok-bob", json!({ "type": "register", "wing_id": "tablet" }))
        .await;
    drop(first);
    let login_registry = login.state.registry.clone();
    wait_until(|| login_registry.len() == 1).await;
    assert_eq!(login_node.locate("tablet").unwrap().machine_id, "login-test");
}

#[test_timeout::tokio_timeout_test(30, multi_thread)]
async fn edge_closes_org_wing_after_membership_is_revoked() {
    let login = spawn_relay().await;
    let edge = spawn_edge(&login).await;

    let mut org_wing = edge
        .register(
            "tok-alice",
            json!({ "type": "register", "wing_id": "w-work", "org": "acme" }),
        )
        .await;
    let mut own_wing = edge
        .register("tok-alice", json!({ "type": "register", "wing_id": "w-home" }))
        .await;

    login.store.remove_member("org-acme", "alice").await;
    let envelope = WingEventEnvelope {
        origin_machine: "login-test".into(),
        origin_url: None,
        event: GossipEvent::org_changed("alice"),
    };
    let res = reqwest::Client::new()
        .post(edge.url("/internal/wing-event"))
        .json(&envelope)
        .send()
        .await
        .unwrap();
    assert!(res.status().is_success());

    // The org wing is closed; the personal one is only told to refresh.
    loop {
        match recv(&mut org_wing).await {
            Some(frame) if frame["type"] == "org_changed" => continue,
            Some(frame) => panic!("unexpected frame {frame}"),
            None => break,
        }
    }
    let refresh = recv(&mut own_wing).await.expect("org_changed frame");
    assert_eq!(refresh["type"], "org_changed");
    let registry = edge.state.registry.clone();
    wait_until(|| registry.len() == 1).await;
}
