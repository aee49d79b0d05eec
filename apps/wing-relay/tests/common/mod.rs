#![allow(dead_code)]

use std::{net::SocketAddr, sync::Arc, time::Duration};

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio_tungstenite::{tungstenite::Message, MaybeTlsStream, WebSocketStream};
use wing_relay::{
    config::AppConfig,
    routes::build_router,
    state::AppState,
    store::{MemoryStore, Organization},
};

pub type WingSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct Relay {
    pub addr: SocketAddr,
    pub store: Arc<MemoryStore>,
    pub state: AppState,
    http: reqwest::Client,
}

/// Seeds:
/// - `tok-alice` → alice, owner of `acme`
/// - `tok-bob` → bob, plain member of `acme`
pub async fn seeded_store() -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::default());
    store.insert_api_token("tok-alice", "alice", None).await;
    store.insert_api_token("tok-bob", "bob", None).await;
    store
        .upsert_org(Organization {
            id: "org-acme".into(),
            slug: "acme".into(),
            name: "Acme".into(),
        })
        .await;
    store.set_member("org-acme", "alice", "owner").await;
    store.set_member("org-acme", "bob", "member").await;
    store
}

/// Login-role relay on an ephemeral port over [`seeded_store`].
pub async fn spawn_relay() -> Relay {
    let config = AppConfig {
        machine_id: "login-test".into(),
        request_timeout_ms: 2_000,
        ..AppConfig::default()
    };
    spawn_with(config, seeded_store().await).await
}

pub async fn spawn_with(config: AppConfig, store: Arc<MemoryStore>) -> Relay {
    let state = AppState::build(config, store.clone()).expect("state");
    let app = build_router(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .expect("serve");
    });

    Relay {
        addr,
        store,
        state,
        http: reqwest::Client::new(),
    }
}

impl Relay {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub async fn connect(&self, token: &str) -> WingSocket {
        let url = format!("ws://{}/ws/wing?token={}", self.addr, token);
        let (socket, _) = tokio_tungstenite::connect_async(url).await.expect("ws connect");
        socket
    }

    /// Connects and completes the register handshake.
    pub async fn register(&self, token: &str, register: Value) -> WingSocket {
        let mut socket = self.connect(token).await;
        send(&mut socket, register).await;
        let reply = recv(&mut socket).await.expect("registered frame");
        assert_eq!(reply["type"], "registered", "unexpected reply: {reply}");
        socket
    }

    pub async fn get(&self, token: &str, path: &str) -> (u16, Value) {
        let res = self
            .http
            .get(self.url(path))
            .bearer_auth(token)
            .send()
            .await
            .expect("request");
        let status = res.status().as_u16();
        (status, res.json().await.unwrap_or(Value::Null))
    }

    pub async fn post(&self, token: &str, path: &str, body: Value) -> (u16, Value) {
        let res = self
            .http
            .post(self.url(path))
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .expect("request");
        let status = res.status().as_u16();
        (status, res.json().await.unwrap_or(Value::Null))
    }

    pub async fn delete(&self, token: &str, path: &str) -> (u16, Value) {
        let res = self
            .http
            .delete(self.url(path))
            .bearer_auth(token)
            .send()
            .await
            .expect("request");
        let status = res.status().as_u16();
        (status, res.json().await.unwrap_or(Value::Null))
    }

    /// Polls `path` until `check` accepts the body.
    pub async fn wait_for(&self, token: &str, path: &str, check: impl Fn(&Value) -> bool) -> Value {
        for _ in 0..100 {
            let (status, body) = self.get(token, path).await;
            if status == 200 && check(&body) {
                return body;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("condition on {path} never held");
    }
}

pub async fn send(socket: &mut WingSocket, frame: Value) {
    socket
        .send(Message::Text(frame.to_string()))
        .await
        .expect("ws send");
}

/// Next JSON text frame, or `None` once the relay closes the socket.
pub async fn recv(socket: &mut WingSocket) -> Option<Value> {
    loop {
        let next = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("timed out waiting for relay frame");
        match next {
            Some(Ok(Message::Text(text))) => return Some(serde_json::from_str(&text).expect("json frame")),
            Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return None,
            Some(Ok(_)) => continue,
        }
    }
}

/// Skips frames until one of type `kind` arrives.
pub async fn recv_kind(socket: &mut WingSocket, kind: &str) -> Value {
    loop {
        let frame = recv(socket).await.unwrap_or_else(|| panic!("socket closed before {kind}"));
        if frame["type"] == kind {
            return frame;
        }
    }
}
