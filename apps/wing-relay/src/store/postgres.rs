use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{types::Json, FromRow, PgPool};
use wing_proto::TaskSpec;

use super::{
    hash_token, AuditEntry, Organization, RelayStore, StoreError, Task, TaskOutcome, TaskStatus,
};

const TASK_COLUMNS: &str = "id, user_id, target, prompt, skill, agent, isolation, status, wing_id, \
     created_at, started_at, finished_at, output, error";

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(url).await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[derive(Debug, FromRow)]
struct TaskRow {
    id: String,
    user_id: String,
    target: Option<String>,
    prompt: String,
    skill: Option<String>,
    agent: Option<String>,
    isolation: Option<String>,
    status: String,
    wing_id: Option<String>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    output: Option<String>,
    error: Option<String>,
}

impl TryFrom<TaskRow> for Task {
    type Error = StoreError;

    fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
        let status = TaskStatus::parse(&row.status)
            .ok_or_else(|| StoreError::Invalid(format!("task status {}", row.status)))?;
        Ok(Task {
            id: row.id,
            user_id: row.user_id,
            target: row.target,
            spec: TaskSpec {
                prompt: row.prompt,
                skill: row.skill,
                agent: row.agent,
                isolation: row.isolation,
            },
            status,
            wing_id: row.wing_id,
            created_at: row.created_at,
            started_at: row.started_at,
            finished_at: row.finished_at,
            output: row.output,
            error: row.error,
        })
    }
}

#[derive(Debug, FromRow)]
struct OrgRow {
    id: String,
    slug: String,
    name: String,
}

fn rows_to_tasks(rows: Vec<TaskRow>) -> Result<Vec<Task>, StoreError> {
    rows.into_iter().map(Task::try_from).collect()
}

#[async_trait]
impl RelayStore for PgStore {
    async fn insert_task(&self, task: &Task) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO tasks (id, user_id, target, prompt, skill, agent, isolation, status, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(&task.id)
        .bind(&task.user_id)
        .bind(&task.target)
        .bind(&task.spec.prompt)
        .bind(&task.spec.skill)
        .bind(&task.spec.agent)
        .bind(&task.spec.isolation)
        .bind(task.status.as_str())
        .bind(task.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_task(&self, task_id: &str) -> Result<Option<Task>, StoreError> {
        let row: Option<TaskRow> =
            sqlx::query_as(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = $1"))
                .bind(task_id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(Task::try_from).transpose()
    }

    async fn list_tasks(&self, user_id: &str) -> Result<Vec<Task>, StoreError> {
        let rows: Vec<TaskRow> = sqlx::query_as(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE user_id = $1 ORDER BY seq DESC"
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        rows_to_tasks(rows)
    }

    async fn pending_tasks_for_user(&self, user_id: &str) -> Result<Vec<Task>, StoreError> {
        let rows: Vec<TaskRow> = sqlx::query_as(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE user_id = $1 AND status = 'pending' ORDER BY seq ASC"
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        rows_to_tasks(rows)
    }

    async fn mark_running(&self, task_id: &str, wing_id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'running', wing_id = $2, started_at = now()
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(task_id)
        .bind(wing_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn complete_task(&self, task_id: &str, outcome: &TaskOutcome) -> Result<bool, StoreError> {
        let (status, output, error) = match outcome {
            TaskOutcome::Done { output } => (TaskStatus::Done, Some(output.as_str()), None),
            TaskOutcome::Failed { error } => (TaskStatus::Failed, None, Some(error.as_str())),
        };
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET status = $2, output = $3, error = $4, finished_at = now()
            WHERE id = $1 AND status IN ('pending', 'running')
            "#,
        )
        .bind(task_id)
        .bind(status.as_str())
        .bind(output)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn resolve_api_token(&self, token: &str) -> Result<Option<String>, StoreError> {
        let user: Option<(String,)> = sqlx::query_as(
            r#"
            SELECT user_id FROM api_tokens
            WHERE token_hash = $1 AND (expires_at IS NULL OR expires_at > now())
            "#,
        )
        .bind(hash_token(token))
        .fetch_optional(&self.pool)
        .await?;
        Ok(user.map(|(user_id,)| user_id))
    }

    async fn find_org(&self, reference: &str) -> Result<Option<Organization>, StoreError> {
        let row: Option<OrgRow> = sqlx::query_as(
            "SELECT id, slug, name FROM organizations WHERE id = $1 OR slug = $1 LIMIT 1",
        )
        .bind(reference)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|row| Organization {
            id: row.id,
            slug: row.slug,
            name: row.name,
        }))
    }

    async fn membership_role(&self, org_id: &str, user_id: &str) -> Result<Option<String>, StoreError> {
        let role: Option<(String,)> =
            sqlx::query_as("SELECT role FROM org_members WHERE org_id = $1 AND user_id = $2")
                .bind(org_id)
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(role.map(|(role,)| role))
    }

    async fn user_orgs(&self, user_id: &str) -> Result<Vec<String>, StoreError> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT org_id FROM org_members WHERE user_id = $1 ORDER BY org_id")
                .bind(user_id)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|(org,)| org).collect())
    }

    async fn entitlement_tiers(&self, user_ids: &[String]) -> Result<HashMap<String, String>, StoreError> {
        if user_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT user_id, tier FROM entitlements WHERE user_id = ANY($1)")
                .bind(user_ids)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().collect())
    }

    async fn append_audit(&self, entry: AuditEntry) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO audit_log (user_id, wing_id, action, detail, at) VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(&entry.user_id)
        .bind(&entry.wing_id)
        .bind(&entry.action)
        .bind(Json(&entry.detail))
        .bind(entry.at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::tokio_timeout_test(60)]
    #[ignore]
    async fn postgres_task_lifecycle() {
        let url = std::env::var("DATABASE_URL").expect("set DATABASE_URL");
        let store = PgStore::connect(&url).await.unwrap();
        let task = Task::new(
            format!("user-{}", uuid::Uuid::new_v4()),
            None,
            TaskSpec {
                prompt: "hello".into(),
                ..TaskSpec::default()
            },
        );
        store.insert_task(&task).await.unwrap();
        assert_eq!(store.pending_tasks_for_user(&task.user_id).await.unwrap().len(), 1);
        assert!(store.mark_running(&task.id, "w-1").await.unwrap());
        let outcome = TaskOutcome::Done { output: "ok".into() };
        assert!(store.complete_task(&task.id, &outcome).await.unwrap());
        assert!(!store.complete_task(&task.id, &outcome).await.unwrap());
        let stored = store.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Done);
        assert_eq!(stored.output.as_deref(), Some("ok"));
    }
}
