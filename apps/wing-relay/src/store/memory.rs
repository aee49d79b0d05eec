use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::{
    hash_token, AuditEntry, Organization, RelayStore, StoreError, Task, TaskOutcome, TaskStatus,
};

struct TokenRecord {
    user_id: String,
    expires_at: Option<DateTime<Utc>>,
}

/// Single-process store used when no database is configured and in tests.
#[derive(Default)]
pub struct MemoryStore {
    tasks: RwLock<Vec<Task>>,
    tokens: RwLock<HashMap<String, TokenRecord>>,
    orgs: RwLock<Vec<Organization>>,
    members: RwLock<HashMap<(String, String), String>>,
    tiers: RwLock<HashMap<String, String>>,
    audit: RwLock<Vec<AuditEntry>>,
}

impl MemoryStore {
    pub async fn insert_api_token(&self, token: &str, user_id: &str, expires_at: Option<DateTime<Utc>>) {
        self.tokens.write().await.insert(
            hash_token(token),
            TokenRecord {
                user_id: user_id.to_string(),
                expires_at,
            },
        );
    }

    pub async fn upsert_org(&self, org: Organization) {
        let mut orgs = self.orgs.write().await;
        orgs.retain(|existing| existing.id != org.id);
        orgs.push(org);
    }

    pub async fn set_member(&self, org_id: &str, user_id: &str, role: &str) {
        self.members
            .write()
            .await
            .insert((org_id.to_string(), user_id.to_string()), role.to_string());
    }

    pub async fn remove_member(&self, org_id: &str, user_id: &str) {
        self.members
            .write()
            .await
            .remove(&(org_id.to_string(), user_id.to_string()));
    }

    pub async fn set_tier(&self, user_id: &str, tier: &str) {
        self.tiers
            .write()
            .await
            .insert(user_id.to_string(), tier.to_string());
    }

    pub async fn audit_entries(&self) -> Vec<AuditEntry> {
        self.audit.read().await.clone()
    }
}

#[async_trait]
impl RelayStore for MemoryStore {
    async fn insert_task(&self, task: &Task) -> Result<(), StoreError> {
        self.tasks.write().await.push(task.clone());
        Ok(())
    }

    async fn get_task(&self, task_id: &str) -> Result<Option<Task>, StoreError> {
        Ok(self
            .tasks
            .read()
            .await
            .iter()
            .find(|task| task.id == task_id)
            .cloned())
    }

    async fn list_tasks(&self, user_id: &str) -> Result<Vec<Task>, StoreError> {
        Ok(self
            .tasks
            .read()
            .await
            .iter()
            .rev()
            .filter(|task| task.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn pending_tasks_for_user(&self, user_id: &str) -> Result<Vec<Task>, StoreError> {
        Ok(self
            .tasks
            .read()
            .await
            .iter()
            .filter(|task| task.user_id == user_id && task.status == TaskStatus::Pending)
            .cloned()
            .collect())
    }

    async fn mark_running(&self, task_id: &str, wing_id: &str) -> Result<bool, StoreError> {
        let mut tasks = self.tasks.write().await;
        match tasks
            .iter_mut()
            .find(|task| task.id == task_id && task.status == TaskStatus::Pending)
        {
            Some(task) => {
                task.status = TaskStatus::Running;
                task.wing_id = Some(wing_id.to_string());
                task.started_at = Some(Utc::now());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn complete_task(&self, task_id: &str, outcome: &TaskOutcome) -> Result<bool, StoreError> {
        let mut tasks = self.tasks.write().await;
        let Some(task) = tasks
            .iter_mut()
            .find(|task| task.id == task_id && !task.status.is_terminal())
        else {
            return Ok(false);
        };
        match outcome {
            TaskOutcome::Done { output } => {
                task.status = TaskStatus::Done;
                task.output = Some(output.clone());
            }
            TaskOutcome::Failed { error } => {
                task.status = TaskStatus::Failed;
                task.error = Some(error.clone());
            }
        }
        task.finished_at = Some(Utc::now());
        Ok(true)
    }

    async fn resolve_api_token(&self, token: &str) -> Result<Option<String>, StoreError> {
        let tokens = self.tokens.read().await;
        Ok(tokens
            .get(&hash_token(token))
            .filter(|record| record.expires_at.map_or(true, |at| at > Utc::now()))
            .map(|record| record.user_id.clone()))
    }

    async fn find_org(&self, reference: &str) -> Result<Option<Organization>, StoreError> {
        Ok(self
            .orgs
            .read()
            .await
            .iter()
            .find(|org| org.id == reference || org.slug == reference)
            .cloned())
    }

    async fn membership_role(&self, org_id: &str, user_id: &str) -> Result<Option<String>, StoreError> {
        Ok(self
            .members
            .read()
            .await
            .get(&(org_id.to_string(), user_id.to_string()))
            .cloned())
    }

    async fn user_orgs(&self, user_id: &str) -> Result<Vec<String>, StoreError> {
        let mut orgs: Vec<String> = self
            .members
            .read()
            .await
            .keys()
            .filter(|(_, member)| member == user_id)
            .map(|(org, _)| org.clone())
            .collect();
        orgs.sort();
        Ok(orgs)
    }

    async fn entitlement_tiers(&self, user_ids: &[String]) -> Result<HashMap<String, String>, StoreError> {
        let tiers = self.tiers.read().await;
        Ok(user_ids
            .iter()
            .filter_map(|user| tiers.get(user).map(|tier| (user.clone(), tier.clone())))
            .collect())
    }

    async fn append_audit(&self, entry: AuditEntry) -> Result<(), StoreError> {
        self.audit.write().await.push(entry);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use wing_proto::TaskSpec;

    fn task(user: &str) -> Task {
        Task::new(
            user,
            None,
            TaskSpec {
                prompt: "hi".into(),
                ..TaskSpec::default()
            },
        )
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn task_transitions_are_guarded() {
        let store = MemoryStore::default();
        let t = task("u");
        store.insert_task(&t).await.unwrap();

        assert!(store.mark_running(&t.id, "w").await.unwrap());
        assert!(!store.mark_running(&t.id, "w2").await.unwrap());

        let done = TaskOutcome::Done { output: "ok".into() };
        assert!(store.complete_task(&t.id, &done).await.unwrap());
        let failed = TaskOutcome::Failed { error: "late".into() };
        assert!(!store.complete_task(&t.id, &failed).await.unwrap());

        let stored = store.get_task(&t.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Done);
        assert_eq!(stored.output.as_deref(), Some("ok"));
        assert_eq!(stored.wing_id.as_deref(), Some("w"));
        assert!(stored.error.is_none());
        assert!(stored.finished_at.is_some());
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn pending_tasks_come_back_oldest_first() {
        let store = MemoryStore::default();
        let first = task("u");
        let second = task("u");
        let other = task("v");
        for t in [&first, &other, &second] {
            store.insert_task(t).await.unwrap();
        }
        let pending: Vec<_> = store
            .pending_tasks_for_user("u")
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(pending, vec![first.id.clone(), second.id.clone()]);
        assert_eq!(store.list_tasks("u").await.unwrap()[0].id, second.id);
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn expired_tokens_do_not_resolve() {
        let store = MemoryStore::default();
        store.insert_api_token("live", "u-1", None).await;
        store
            .insert_api_token("old", "u-2", Some(Utc::now() - Duration::minutes(1)))
            .await;
        assert_eq!(store.resolve_api_token("live").await.unwrap().as_deref(), Some("u-1"));
        assert!(store.resolve_api_token("old").await.unwrap().is_none());
        assert!(store.resolve_api_token("missing").await.unwrap().is_none());
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn orgs_resolve_by_id_or_slug() {
        let store = MemoryStore::default();
        store
            .upsert_org(Organization {
                id: "org-1".into(),
                slug: "acme".into(),
                name: "Acme".into(),
            })
            .await;
        store.set_member("org-1", "u", "admin").await;
        assert_eq!(store.find_org("acme").await.unwrap().unwrap().id, "org-1");
        assert_eq!(store.find_org("org-1").await.unwrap().unwrap().slug, "acme");
        assert_eq!(
            store.membership_role("org-1", "u").await.unwrap().as_deref(),
            Some("admin")
        );
        assert_eq!(store.user_orgs("u").await.unwrap(), vec!["org-1".to_string()]);
    }
}
