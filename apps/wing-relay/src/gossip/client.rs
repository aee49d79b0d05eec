use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use wing_proto::{
    EntitlementsRequest, EntitlementsResponse, OrgCheckRequest, OrgCheckResponse,
    SessionLookupRequest, SessionLookupResponse, SyncRequest, SyncResponse, UserOrgsResponse,
    WingEventEnvelope, WingLocation, WingSyncRequest, WingSyncResponse,
};

use super::{DirectoryLink, GossipError};

pub const NODE_SECRET_HEADER: &str = "x-relay-secret";

/// HTTP client an edge uses to reach the login node's internal endpoints.
#[derive(Clone)]
pub struct LoginClient {
    http: Client,
    base_url: String,
    secret: Option<String>,
}

impl LoginClient {
    pub fn new(base_url: impl Into<String>, secret: Option<String>, timeout: Duration) -> Self {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            http,
            base_url: base_url.into(),
            secret,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn with_secret(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.secret {
            Some(secret) => builder.header(NODE_SECRET_HEADER, secret),
            None => builder,
        }
    }

    async fn post<B, T>(&self, path: &str, body: &B) -> Result<T, GossipError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = format!("{}{}", self.base_url, path);
        let res = self.with_secret(self.http.post(url).json(body)).send().await?;
        decode(res).await
    }

    async fn get_optional<T>(&self, path: &str, query: &[(&str, &str)]) -> Result<Option<T>, GossipError>
    where
        T: DeserializeOwned,
    {
        let url = format!("{}{}", self.base_url, path);
        let res = self
            .with_secret(self.http.get(url).query(query))
            .send()
            .await?;
        if res.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        decode(res).await.map(Some)
    }

    pub async fn org_check(&self, user_id: &str, org: &str) -> Result<Option<OrgCheckResponse>, GossipError> {
        let request = OrgCheckRequest {
            user_id: user_id.to_string(),
            org: org.to_string(),
        };
        let url = format!("{}/internal/org-check", self.base_url);
        let res = self.with_secret(self.http.post(url).json(&request)).send().await?;
        if res.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        decode(res).await.map(Some)
    }

    pub async fn user_orgs(&self, user_id: &str) -> Result<Vec<String>, GossipError> {
        let resp: Option<UserOrgsResponse> = self
            .get_optional("/internal/user-orgs", &[("user_id", user_id)])
            .await?;
        Ok(resp.map(|r| r.orgs).unwrap_or_default())
    }

    pub async fn session_lookup(&self, token: &str) -> Result<Option<String>, GossipError> {
        let request = SessionLookupRequest {
            token: token.to_string(),
        };
        let url = format!("{}/internal/session-lookup", self.base_url);
        let res = self.with_secret(self.http.post(url).json(&request)).send().await?;
        if matches!(res.status(), StatusCode::NOT_FOUND | StatusCode::UNAUTHORIZED) {
            return Ok(None);
        }
        let resp: SessionLookupResponse = decode(res).await?;
        Ok(Some(resp.user_id))
    }

    pub async fn entitlements(&self, user_ids: Vec<String>) -> Result<EntitlementsResponse, GossipError> {
        self.post("/internal/entitlements", &EntitlementsRequest { user_ids })
            .await
    }
}

#[async_trait]
impl DirectoryLink for LoginClient {
    async fn sync(&self, request: SyncRequest) -> Result<SyncResponse, GossipError> {
        self.post("/internal/sync", &request).await
    }

    async fn wing_sync(&self, request: WingSyncRequest) -> Result<WingSyncResponse, GossipError> {
        self.post("/internal/wing-sync", &request).await
    }

    async fn publish(&self, envelope: WingEventEnvelope) -> Result<(), GossipError> {
        let _: serde_json::Value = self.post("/internal/wing-event", &envelope).await?;
        Ok(())
    }

    async fn locate(&self, wing_id: &str) -> Result<Option<WingLocation>, GossipError> {
        self.get_optional("/internal/wing/locate", &[("wing_id", wing_id)])
            .await
    }
}

/// Login → edge relay of single events, one short deadline per edge.
#[derive(Clone)]
pub struct PeerClient {
    http: Client,
    secret: Option<String>,
}

impl PeerClient {
    pub fn new(secret: Option<String>, timeout: Duration) -> Self {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self { http, secret }
    }

    pub async fn relay(&self, edge_url: &str, envelope: &WingEventEnvelope) -> Result<(), GossipError> {
        let url = format!("{edge_url}/internal/wing-event");
        let mut builder = self.http.post(url).json(envelope);
        if let Some(secret) = &self.secret {
            builder = builder.header(NODE_SECRET_HEADER, secret);
        }
        let res = builder.send().await?;
        if res.status().is_success() {
            Ok(())
        } else {
            Err(unexpected(res).await)
        }
    }
}

async fn decode<T: DeserializeOwned>(res: Response) -> Result<T, GossipError> {
    if res.status().is_success() {
        Ok(res.json::<T>().await?)
    } else {
        Err(unexpected(res).await)
    }
}

async fn unexpected(res: Response) -> GossipError {
    let status = res.status().as_u16();
    let body = res.text().await.unwrap_or_default();
    GossipError::Status { status, body }
}
