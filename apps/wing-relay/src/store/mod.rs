mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::warn;
use wing_proto::TaskSpec;

use crate::config::AppConfig;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("invalid stored value: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Done,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Done => "done",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(TaskStatus::Pending),
            "running" => Some(TaskStatus::Running),
            "done" => Some(TaskStatus::Done),
            "failed" => Some(TaskStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub user_id: String,
    pub target: Option<String>,
    #[serde(flatten)]
    pub spec: TaskSpec,
    pub status: TaskStatus,
    pub wing_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub output: Option<String>,
    pub error: Option<String>,
}

impl Task {
    pub fn new(user_id: impl Into<String>, target: Option<String>, spec: TaskSpec) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            target,
            spec,
            status: TaskStatus::Pending,
            wing_id: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            output: None,
            error: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Done { output: String },
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Organization {
    pub id: String,
    pub slug: String,
    pub name: String,
}

/// Roles allowed to attach wings to an organization.
pub fn is_elevated_role(role: &str) -> bool {
    matches!(role, "owner" | "admin")
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    pub user_id: String,
    pub wing_id: Option<String>,
    pub action: String,
    pub detail: Value,
    pub at: DateTime<Utc>,
}

impl AuditEntry {
    pub fn new(user_id: &str, wing_id: Option<&str>, action: &str, detail: Value) -> Self {
        Self {
            user_id: user_id.to_string(),
            wing_id: wing_id.map(str::to_string),
            action: action.to_string(),
            detail,
            at: Utc::now(),
        }
    }
}

/// Opaque API tokens are stored hashed; only the digest ever hits storage.
pub fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

#[async_trait]
pub trait RelayStore: Send + Sync {
    async fn insert_task(&self, task: &Task) -> Result<(), StoreError>;
    async fn get_task(&self, task_id: &str) -> Result<Option<Task>, StoreError>;
    /// Newest first.
    async fn list_tasks(&self, user_id: &str) -> Result<Vec<Task>, StoreError>;
    /// Oldest first.
    async fn pending_tasks_for_user(&self, user_id: &str) -> Result<Vec<Task>, StoreError>;
    /// pending → running. Returns false if the task was not pending.
    async fn mark_running(&self, task_id: &str, wing_id: &str) -> Result<bool, StoreError>;
    /// Moves a non-terminal task to done/failed. Returns false if it was
    /// already terminal (or unknown), leaving the stored result untouched.
    async fn complete_task(&self, task_id: &str, outcome: &TaskOutcome) -> Result<bool, StoreError>;

    async fn resolve_api_token(&self, token: &str) -> Result<Option<String>, StoreError>;
    /// Looks an organization up by id or slug.
    async fn find_org(&self, reference: &str) -> Result<Option<Organization>, StoreError>;
    async fn membership_role(&self, org_id: &str, user_id: &str) -> Result<Option<String>, StoreError>;
    async fn user_orgs(&self, user_id: &str) -> Result<Vec<String>, StoreError>;
    async fn entitlement_tiers(&self, user_ids: &[String]) -> Result<HashMap<String, String>, StoreError>;

    async fn append_audit(&self, entry: AuditEntry) -> Result<(), StoreError>;
}

pub async fn build_store(cfg: &AppConfig) -> Arc<dyn RelayStore> {
    if let Some(url) = cfg.database_url.as_deref() {
        match PgStore::connect(url).await {
            Ok(store) => return Arc::new(store),
            Err(err) => warn!(error = %err, "postgres unavailable; falling back to in-memory store"),
        }
    }
    Arc::new(MemoryStore::default())
}

/// Best-effort audit append; failures are logged and swallowed.
pub async fn audit(store: &dyn RelayStore, entry: AuditEntry) {
    let action = entry.action.clone();
    if let Err(err) = store.append_audit(entry).await {
        warn!(action, error = %err, "audit append failed");
    }
}
