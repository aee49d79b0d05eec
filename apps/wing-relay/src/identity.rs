//! Who a token belongs to and which organizations they may act for.
//!
//! The login node answers from its own store; edges ask login over the
//! internal API and cache org membership until an `org_changed` event.

use std::sync::Arc;

use async_trait::async_trait;
use wing_proto::OrgCheckResponse;

use crate::{
    gossip::{GossipError, LoginClient, OrgCache},
    store::{is_elevated_role, RelayStore, StoreError},
};

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Remote(#[from] GossipError),
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Resolves an opaque API token to a user id.
    async fn lookup_token(&self, token: &str) -> Result<Option<String>, IdentityError>;
    /// `None` when the organization does not exist.
    async fn org_check(&self, user_id: &str, org: &str) -> Result<Option<OrgCheckResponse>, IdentityError>;
    async fn user_orgs(&self, user_id: &str) -> Result<Vec<String>, IdentityError>;
}

pub struct LocalIdentity {
    store: Arc<dyn RelayStore>,
}

impl LocalIdentity {
    pub fn new(store: Arc<dyn RelayStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl IdentityProvider for LocalIdentity {
    async fn lookup_token(&self, token: &str) -> Result<Option<String>, IdentityError> {
        Ok(self.store.resolve_api_token(token).await?)
    }

    async fn org_check(&self, user_id: &str, org: &str) -> Result<Option<OrgCheckResponse>, IdentityError> {
        let Some(found) = self.store.find_org(org).await? else {
            return Ok(None);
        };
        let role = self
            .store
            .membership_role(&found.id, user_id)
            .await?
            .unwrap_or_default();
        Ok(Some(OrgCheckResponse {
            allowed: is_elevated_role(&role),
            org_id: found.id,
            role,
        }))
    }

    async fn user_orgs(&self, user_id: &str) -> Result<Vec<String>, IdentityError> {
        Ok(self.store.user_orgs(user_id).await?)
    }
}

pub struct RemoteIdentity {
    login: LoginClient,
    orgs: Arc<OrgCache>,
}

impl RemoteIdentity {
    pub fn new(login: LoginClient, orgs: Arc<OrgCache>) -> Self {
        Self { login, orgs }
    }
}

#[async_trait]
impl IdentityProvider for RemoteIdentity {
    async fn lookup_token(&self, token: &str) -> Result<Option<String>, IdentityError> {
        Ok(self.login.session_lookup(token).await?)
    }

    async fn org_check(&self, user_id: &str, org: &str) -> Result<Option<OrgCheckResponse>, IdentityError> {
        Ok(self.login.org_check(user_id, org).await?)
    }

    async fn user_orgs(&self, user_id: &str) -> Result<Vec<String>, IdentityError> {
        if let Some(cached) = self.orgs.get(user_id) {
            return Ok(cached);
        }
        let orgs = self.login.user_orgs(user_id).await?;
        self.orgs.insert(user_id, orgs.clone());
        Ok(orgs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, Organization};

    #[test_timeout::tokio_timeout_test(10)]
    async fn org_check_requires_elevated_role() {
        let store = Arc::new(MemoryStore::default());
        store
            .upsert_org(Organization {
                id: "org-1".into(),
                slug: "acme".into(),
                name: "Acme".into(),
            })
            .await;
        store.set_member("org-1", "admin-user", "admin").await;
        store.set_member("org-1", "plain-user", "member").await;
        let identity = LocalIdentity::new(store);

        let admin = identity.org_check("admin-user", "acme").await.unwrap().unwrap();
        assert!(admin.allowed);
        assert_eq!(admin.org_id, "org-1");

        let member = identity.org_check("plain-user", "acme").await.unwrap().unwrap();
        assert!(!member.allowed);

        let stranger = identity.org_check("nobody", "org-1").await.unwrap().unwrap();
        assert!(!stranger.allowed);
        assert_eq!(stranger.role, "");

        assert!(identity.org_check("admin-user", "globex").await.unwrap().is_none());
    }
}
