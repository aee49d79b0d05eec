//! Node-to-node endpoints. Only callers on a private network, or presenting
//! the shared node secret, get past [`NodeCaller`].

use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
};

use axum::{
    async_trait,
    extract::{ConnectInfo, FromRequestParts, Query, State},
    http::request::Parts,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;
use wing_proto::{
    EntitlementsRequest, EntitlementsResponse, NodeStatus, OrgCheckRequest, OrgCheckResponse,
    SessionLookupRequest, SessionLookupResponse, SyncRequest, SyncResponse, UserOrgsResponse,
    WingEventEnvelope, WingLocation, WingSyncRequest, WingSyncResponse,
};

use crate::{
    gossip::{LoginNode, NODE_SECRET_HEADER},
    state::{AppState, Node},
};

use super::{ApiError, ApiResult};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/status", get(status))
        .route("/entitlements", post(entitlements))
        .route("/session-lookup", post(session_lookup))
        .route("/wing/register", post(register_wing))
        .route("/wing/deregister", post(deregister_wing))
        .route("/wing/locate", get(locate_wing))
        .route("/sync", post(sync))
        .route("/wing-sync", post(wing_sync))
        .route("/org-check", post(org_check))
        .route("/wing-event", post(wing_event))
        .route("/user-orgs", get(user_orgs))
}

/// A peer relay (or other trusted internal service).
#[derive(Debug, Clone, Copy)]
pub struct NodeCaller;

#[async_trait]
impl FromRequestParts<AppState> for NodeCaller {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip());
        if peer.is_some_and(is_private_peer) {
            return Ok(NodeCaller);
        }
        if let Some(secret) = state.config.node_secret.as_deref() {
            let presented = parts
                .headers
                .get(NODE_SECRET_HEADER)
                .and_then(|value| value.to_str().ok());
            if presented.is_some_and(|presented| secrets_match(presented, secret)) {
                return Ok(NodeCaller);
            }
        }
        debug!(peer = ?peer, path = %parts.uri.path(), "internal request rejected");
        Err(ApiError::Forbidden("internal endpoint"))
    }
}

/// Loopback, RFC 1918, link-local and IPv6 unique-local addresses, including
/// IPv4-mapped IPv6 forms of the former.
pub fn is_private_peer(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_private() || v4.is_loopback() || v4.is_link_local(),
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => is_private_peer(IpAddr::V4(v4)),
            None => v6.is_loopback() || (v6.segments()[0] & 0xfe00) == 0xfc00,
        },
    }
}

fn secrets_match(presented: &str, expected: &str) -> bool {
    Sha256::digest(presented.as_bytes()) == Sha256::digest(expected.as_bytes())
}

fn login_only(state: &AppState) -> Result<&Arc<LoginNode>, ApiError> {
    state
        .node
        .as_login()
        .ok_or(ApiError::NotFound("served by the login node"))
}

#[derive(Debug, Serialize)]
pub struct Applied {
    pub applied: bool,
}

#[derive(Debug, Deserialize)]
pub struct DeregisterRequest {
    pub wing_id: String,
    pub machine_id: String,
}

#[derive(Debug, Deserialize)]
pub struct LocateQuery {
    pub wing_id: String,
}

#[derive(Debug, Deserialize)]
pub struct UserOrgsQuery {
    pub user_id: String,
}

async fn status(State(state): State<AppState>, _node: NodeCaller) -> ApiResult<NodeStatus> {
    Ok(Json(state.node.status()))
}

async fn entitlements(
    State(state): State<AppState>,
    _node: NodeCaller,
    Json(request): Json<EntitlementsRequest>,
) -> ApiResult<EntitlementsResponse> {
    login_only(&state)?;
    let tiers = state.store.entitlement_tiers(&request.user_ids).await?;
    Ok(Json(EntitlementsResponse { tiers }))
}

async fn session_lookup(
    State(state): State<AppState>,
    _node: NodeCaller,
    Json(request): Json<SessionLookupRequest>,
) -> ApiResult<SessionLookupResponse> {
    login_only(&state)?;
    let user_id = state
        .store
        .resolve_api_token(&request.token)
        .await?
        .ok_or(ApiError::NotFound("unknown token"))?;
    Ok(Json(SessionLookupResponse { user_id }))
}

async fn register_wing(
    State(state): State<AppState>,
    _node: NodeCaller,
    Json(location): Json<WingLocation>,
) -> ApiResult<Applied> {
    let login = login_only(&state)?;
    Ok(Json(Applied {
        applied: login.register(location),
    }))
}

async fn deregister_wing(
    State(state): State<AppState>,
    _node: NodeCaller,
    Json(request): Json<DeregisterRequest>,
) -> ApiResult<Applied> {
    let login = login_only(&state)?;
    Ok(Json(Applied {
        applied: login.deregister(&request.wing_id, &request.machine_id),
    }))
}

async fn locate_wing(
    State(state): State<AppState>,
    _node: NodeCaller,
    Query(query): Query<LocateQuery>,
) -> ApiResult<WingLocation> {
    let found = match &state.node {
        Node::Login(login) => login.locate(&query.wing_id),
        Node::Edge(edge) => edge.locate(&query.wing_id).await?,
    };
    found.map(Json).ok_or(ApiError::NotFound("wing not located"))
}

async fn sync(
    State(state): State<AppState>,
    _node: NodeCaller,
    Json(request): Json<SyncRequest>,
) -> ApiResult<SyncResponse> {
    let login = login_only(&state)?;
    Ok(Json(login.sync(request)))
}

async fn wing_sync(
    State(state): State<AppState>,
    _node: NodeCaller,
    Json(request): Json<WingSyncRequest>,
) -> ApiResult<WingSyncResponse> {
    let login = login_only(&state)?;
    Ok(Json(login.wing_sync(request).await?))
}

async fn org_check(
    State(state): State<AppState>,
    _node: NodeCaller,
    Json(request): Json<OrgCheckRequest>,
) -> ApiResult<OrgCheckResponse> {
    login_only(&state)?;
    state
        .identity()
        .org_check(&request.user_id, &request.org)
        .await
        .map_err(|err| ApiError::Internal(err.to_string()))?
        .map(Json)
        .ok_or(ApiError::NotFound("organization not found"))
}

async fn wing_event(
    State(state): State<AppState>,
    _node: NodeCaller,
    Json(envelope): Json<WingEventEnvelope>,
) -> ApiResult<Applied> {
    let applied = match &state.node {
        Node::Login(login) => login.wing_event(envelope),
        Node::Edge(edge) => edge.handle_relayed(envelope),
    };
    Ok(Json(Applied { applied }))
}

async fn user_orgs(
    State(state): State<AppState>,
    _node: NodeCaller,
    Query(query): Query<UserOrgsQuery>,
) -> ApiResult<UserOrgsResponse> {
    login_only(&state)?;
    let orgs = state.store.user_orgs(&query.user_id).await?;
    Ok(Json(UserOrgsResponse {
        user_id: query.user_id,
        orgs,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use std::net::{Ipv4Addr, Ipv6Addr};
    use tower::util::ServiceExt;

    use crate::{config::AppConfig, routes::build_router, store::MemoryStore};

    fn login_app() -> Router {
        let config = AppConfig {
            node_secret: Some("s3cret".into()),
            machine_id: "login-1".into(),
            ..AppConfig::default()
        };
        let state = AppState::build(config, Arc::new(MemoryStore::default())).unwrap();
        build_router(state)
    }

    fn request(method: &str, uri: &str, peer: Option<[u8; 4]>, secret: Option<&str>, body: Option<Value>) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(secret) = secret {
            builder = builder.header(NODE_SECRET_HEADER, secret);
        }
        let body = match body {
            Some(json) => {
                builder = builder.header("content-type", "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };
        let mut req = builder.body(body).unwrap();
        if let Some(octets) = peer {
            req.extensions_mut()
                .insert(ConnectInfo(SocketAddr::from((octets, 40000))));
        }
        req
    }

    async fn json_body(response: axum::response::Response) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    }

    #[test_timeout::timeout]
    fn private_ranges() {
        assert!(is_private_peer(Ipv4Addr::new(10, 1, 2, 3).into()));
        assert!(is_private_peer(Ipv4Addr::new(172, 16, 0, 1).into()));
        assert!(is_private_peer(Ipv4Addr::new(192, 168, 1, 1).into()));
        assert!(is_private_peer(Ipv4Addr::LOCALHOST.into()));
        assert!(is_private_peer(Ipv4Addr::new(169, 254, 0, 7).into()));
        assert!(!is_private_peer(Ipv4Addr::new(8, 8, 8, 8).into()));
        assert!(!is_private_peer(Ipv4Addr::new(172, 32, 0, 1).into()));

        assert!(is_private_peer(Ipv6Addr::LOCALHOST.into()));
        assert!(is_private_peer("fd12:3456::1".parse::<Ipv6Addr>().unwrap().into()));
        assert!(is_private_peer("::ffff:10.0.0.1".parse::<Ipv6Addr>().unwrap().into()));
        assert!(!is_private_peer("::ffff:8.8.8.8".parse::<Ipv6Addr>().unwrap().into()));
        assert!(!is_private_peer("2001:db8::1".parse::<Ipv6Addr>().unwrap().into()));
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn public_callers_need_the_secret() {
        let app = login_app();
        let public = Some([203, 0, 113, 9]);

        let res = app.clone().oneshot(request("GET", "/internal/status", public, None, None)).await.unwrap();
        assert_eq!(res.status(), StatusCode::FORBIDDEN);

        let res = app
            .clone()
            .oneshot(request("GET", "/internal/status", public, Some("wrong"), None))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::FORBIDDEN);

        let res = app
            .clone()
            .oneshot(request("GET", "/internal/status", public, Some("s3cret"), None))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let status = json_body(res).await;
        assert_eq!(status["role"], "login");
        assert_eq!(status["machine_id"], "login-1");

        let res = app
            .oneshot(request("GET", "/internal/status", Some([10, 0, 0, 4]), None, None))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn register_locate_and_reconcile_through_http() {
        let app = login_app();
        let private = Some([10, 0, 0, 2]);
        let location = json!({
            "wing_id": "w-remote",
            "machine_id": "edge-a",
            "user_id": "u1",
            "locked": false,
            "allowed_peers": 0
        });

        let res = app
            .clone()
            .oneshot(request("POST", "/internal/wing/register", private, None, Some(location)))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(json_body(res).await["applied"], true);

        let res = app
            .clone()
            .oneshot(request("GET", "/internal/wing/locate?wing_id=w-remote", private, None, None))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(json_body(res).await["machine_id"], "edge-a");

        let res = app
            .clone()
            .oneshot(request(
                "POST",
                "/internal/wing-sync",
                private,
                None,
                Some(json!({ "machine_id": "edge-a", "wings": [] })),
            ))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(json_body(res).await["swept"], 1);

        let res = app
            .oneshot(request("GET", "/internal/wing/locate?wing_id=w-remote", private, None, None))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn sync_returns_events_after_cursor() {
        let app = login_app();
        let private = Some([127, 0, 0, 1]);
        let body = json!({
            "machine_id": "edge-b",
            "last_seq": 0,
            "events": [{
                "kind": "wing_online",
                "event_id": "ev-1",
                "location": {
                    "wing_id": "w-b",
                    "machine_id": "edge-b",
                    "user_id": "u2",
                    "locked": false,
                    "allowed_peers": 0
                }
            }]
        });
        let res = app
            .oneshot(request("POST", "/internal/sync", private, None, Some(body)))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let sync = json_body(res).await;
        assert_eq!(sync["stale"], false);
        assert_eq!(sync["seq"], 1);
        assert_eq!(sync["events"].as_array().unwrap().len(), 1);
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn unknown_tokens_and_orgs_are_not_found() {
        let app = login_app();
        let private = Some([192, 168, 0, 3]);
        let res = app
            .clone()
            .oneshot(request(
                "POST",
                "/internal/session-lookup",
                private,
                None,
                Some(json!({ "token": "nope" })),
            ))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::NOT_FOUND);

        let res = app
            .oneshot(request(
                "POST",
                "/internal/org-check",
                private,
                None,
                Some(json!({ "user_id": "u1", "org": "acme" })),
            ))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }
}
