//! SQLite task store.
//!
//! Status lives in its own column so that every transition can be written as
//! a single guarded `UPDATE`; the row count tells the caller whether it won.

use std::path::Path;

use async_trait::async_trait;
use chrono::SecondsFormat;
use overseer_core::{GoalId, Task, TaskFilter, TaskId, TaskStatus, Time};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use tracing::debug;

use crate::query::{CandidateQuery, TASK_COLUMNS};
use crate::record::DecisionRecord;
use crate::trait_::{Result, StorageError, TaskStore};

/// SQLite storage implementation.
#[derive(Clone)]
pub struct SqliteStore {
    /// Database connection pool
    pool: sqlx::SqlitePool,
}

impl SqliteStore {
    /// Open (or create) a database file.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new().connect_with(options).await?;

        let store = Self { pool };
        store.init_schema().await?;
        debug!("Opened task store at {}", path.display());
        Ok(store)
    }

    /// Create an in-memory SQLite store for testing.
    ///
    /// The pool is capped at one connection: every connection to `:memory:`
    /// would otherwise see its own empty database.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// Initialize the database schema.
    async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                goal_id TEXT,
                title TEXT NOT NULL,
                description TEXT NOT NULL,
                prd_content TEXT,
                priority TEXT NOT NULL,
                task_type TEXT NOT NULL,
                skill TEXT,
                status TEXT NOT NULL,
                payload TEXT NOT NULL DEFAULT '{}',
                metadata TEXT NOT NULL DEFAULT '{}',
                error TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_tasks_dispatch ON tasks(status, priority, created_at)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS working_memory (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS decisions (
                id TEXT PRIMARY KEY,
                action TEXT NOT NULL,
                task_id TEXT,
                reason TEXT,
                detail TEXT NOT NULL,
                created_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Check if the database is healthy.
    pub async fn health_check(&self) -> bool {
        sqlx::query("SELECT 1").fetch_one(&self.pool).await.is_ok()
    }

    async fn guarded_transition(
        &self,
        id: TaskId,
        to: TaskStatus,
        reason: Option<&str>,
        now: Time,
    ) -> Result<bool> {
        let now = fmt_time(now);
        let result = sqlx::query(
            "UPDATE tasks SET status = ?, error = COALESCE(?, error), updated_at = ?, completed_at = ?
             WHERE id = ? AND status = 'in_progress'",
        )
        .bind(to.as_str())
        .bind(reason)
        .bind(&now)
        .bind(&now)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn merge_json_column(&self, column: &str, id: TaskId, patch: &Value) -> Result<()> {
        let sql = format!(
            "UPDATE tasks SET {column} = json_patch(COALESCE({column}, '{{}}'), ?), updated_at = ? WHERE id = ?"
        );
        let result = sqlx::query(&sql)
            .bind(serde_json::to_string(patch)?)
            .bind(fmt_time(chrono::Utc::now()))
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(id.to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl TaskStore for SqliteStore {
    async fn save_task(&self, task: &Task) -> Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO tasks (id, goal_id, title, description, prd_content, priority,
                task_type, skill, status, payload, metadata, error, created_at, updated_at,
                started_at, completed_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(task.id.to_string())
        .bind(task.goal_id.map(|g| g.to_string()))
        .bind(&task.title)
        .bind(&task.description)
        .bind(&task.prd_content)
        .bind(&task.priority)
        .bind(&task.task_type)
        .bind(&task.skill)
        .bind(task.status.as_str())
        .bind(serde_json::to_string(&task.payload)?)
        .bind(serde_json::to_string(&task.metadata)?)
        .bind(&task.error)
        .bind(fmt_time(task.created_at))
        .bind(fmt_time(task.updated_at))
        .bind(task.started_at.map(fmt_time))
        .bind(task.completed_at.map(fmt_time))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn load_task(&self, id: TaskId) -> Result<Option<Task>> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?");
        let row = sqlx::query(&sql)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_task).transpose()
    }

    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        let mut sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE 1 = 1");
        let mut args: Vec<String> = Vec::new();

        if let Some(statuses) = &filter.status {
            if statuses.is_empty() {
                return Ok(Vec::new());
            }
            sql.push_str(" AND status IN (");
            sql.push_str(&vec!["?"; statuses.len()].join(", "));
            sql.push(')');
            args.extend(statuses.iter().map(|s| s.as_str().to_string()));
        }
        if let Some(goal) = filter.goal_id {
            sql.push_str(" AND goal_id = ?");
            args.push(goal.to_string());
        }
        sql.push_str(" ORDER BY created_at ASC, id ASC");
        if let Some(limit) = filter.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }

        let mut query = sqlx::query(&sql);
        for arg in &args {
            query = query.bind(arg.as_str());
        }
        let rows = query.fetch_all(&self.pool).await?;

        rows.iter().map(row_to_task).collect()
    }

    async fn select_next_queued(&self, candidate: &CandidateQuery) -> Result<Option<Task>> {
        let stmt = candidate.to_sql();
        let mut query = sqlx::query(&stmt.sql);
        for arg in &stmt.args {
            query = query.bind(arg.as_str());
        }
        let row = query.fetch_optional(&self.pool).await?;

        row.as_ref().map(row_to_task).transpose()
    }

    async fn cas_to_in_progress(&self, id: TaskId, now: Time) -> Result<bool> {
        let now = fmt_time(now);
        let result = sqlx::query(
            "UPDATE tasks SET status = 'in_progress', started_at = ?, updated_at = ?
             WHERE id = ? AND status = 'queued'",
        )
        .bind(&now)
        .bind(&now)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn revert_to_queued(&self, id: TaskId, now: Time) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE tasks SET status = 'queued', started_at = NULL, updated_at = ? WHERE id = ?",
        )
        .bind(fmt_time(now))
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn mark_failed(&self, id: TaskId, reason: &str, now: Time) -> Result<bool> {
        self.guarded_transition(id, TaskStatus::Failed, Some(reason), now).await
    }

    async fn mark_completed(&self, id: TaskId, now: Time) -> Result<bool> {
        self.guarded_transition(id, TaskStatus::Completed, None, now).await
    }

    async fn mark_quarantined(&self, id: TaskId, reason: &str, now: Time) -> Result<bool> {
        self.guarded_transition(id, TaskStatus::Quarantined, Some(reason), now).await
    }

    async fn merge_payload(&self, id: TaskId, patch: &Value) -> Result<()> {
        self.merge_json_column("payload", id, patch).await
    }

    async fn merge_metadata(&self, id: TaskId, patch: &Value) -> Result<()> {
        self.merge_json_column("metadata", id, patch).await
    }

    async fn load_working_memory(&self, key: &str) -> Result<Option<Value>> {
        let row = sqlx::query("SELECT value FROM working_memory WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let raw: String = row.try_get("value")?;
                Ok(Some(serde_json::from_str(&raw)?))
            }
            None => Ok(None),
        }
    }

    async fn save_working_memory(&self, key: &str, value: &Value) -> Result<()> {
        sqlx::query(
            "INSERT INTO working_memory (key, value, updated_at) VALUES (?, ?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        )
        .bind(key)
        .bind(serde_json::to_string(value)?)
        .bind(fmt_time(chrono::Utc::now()))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn append_decision(&self, record: &DecisionRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO decisions (id, action, task_id, reason, detail, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(record.id.to_string())
        .bind(&record.action)
        .bind(record.task_id.map(|t| t.to_string()))
        .bind(&record.reason)
        .bind(serde_json::to_string(&record.detail)?)
        .bind(fmt_time(record.created_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_decisions(&self, limit: usize) -> Result<Vec<DecisionRecord>> {
        let rows = sqlx::query(
            "SELECT id, action, task_id, reason, detail, created_at FROM decisions
             ORDER BY created_at DESC, id DESC LIMIT ?",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let id: String = row.try_get("id")?;
                let task_id: Option<String> = row.try_get("task_id")?;
                let detail: String = row.try_get("detail")?;
                let created_at: String = row.try_get("created_at")?;
                Ok(DecisionRecord {
                    id: id.parse().map_err(|e| bad_column("decisions.id", &id, e))?,
                    action: row.try_get("action")?,
                    task_id: task_id
                        .map(|t| t.parse().map_err(|e| bad_column("decisions.task_id", &t, e)))
                        .transpose()?,
                    reason: row.try_get("reason")?,
                    detail: serde_json::from_str(&detail)?,
                    created_at: parse_time(&created_at)?,
                })
            })
            .collect()
    }
}

/// Fixed-width UTC timestamps so that text ordering equals time ordering.
fn fmt_time(t: Time) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_time(s: &str) -> Result<Time> {
    chrono::DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&chrono::Utc))
        .map_err(|e| bad_column("timestamp", s, e))
}

fn bad_column(column: &str, value: &str, e: impl std::fmt::Display) -> StorageError {
    StorageError::Other(format!("invalid {column} '{value}': {e}"))
}

fn row_to_task(row: &SqliteRow) -> Result<Task> {
    let id: String = row.try_get("id")?;
    let goal_id: Option<String> = row.try_get("goal_id")?;
    let status: String = row.try_get("status")?;
    let payload: String = row.try_get("payload")?;
    let metadata: String = row.try_get("metadata")?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;
    let started_at: Option<String> = row.try_get("started_at")?;
    let completed_at: Option<String> = row.try_get("completed_at")?;

    Ok(Task {
        id: id.parse().map_err(|e| bad_column("tasks.id", &id, e))?,
        goal_id: goal_id
            .map(|g| g.parse::<GoalId>().map_err(|e| bad_column("tasks.goal_id", &g, e)))
            .transpose()?,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        prd_content: row.try_get("prd_content")?,
        priority: row.try_get("priority")?,
        task_type: row.try_get("task_type")?,
        skill: row.try_get("skill")?,
        status: status.parse().map_err(|e| bad_column("tasks.status", &status, e))?,
        payload: serde_json::from_str(&payload)?,
        metadata: serde_json::from_str(&metadata)?,
        error: row.try_get("error")?,
        created_at: parse_time(&created_at)?,
        updated_at: parse_time(&updated_at)?,
        started_at: started_at.as_deref().map(parse_time).transpose()?,
        completed_at: completed_at.as_deref().map(parse_time).transpose()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use overseer_core::RunId;
    use serde_json::json;

    fn create_test_task(title: &str) -> Task {
        Task::new(title, "A description long enough to pass the gate")
    }

    #[tokio::test]
    async fn test_task_round_trip() {
        let store = SqliteStore::in_memory().await.unwrap();

        let mut task = create_test_task("Test Task")
            .with_goal(GoalId::new())
            .with_skill("dev")
            .with_decomposition(true);
        task.stamp_run(&RunId::from("run-1"), chrono::Utc::now());

        store.save_task(&task).await.unwrap();
        let loaded = store.load_task(task.id).await.unwrap().unwrap();

        assert_eq!(loaded.title, task.title);
        assert_eq!(loaded.goal_id, task.goal_id);
        assert_eq!(loaded.current_run_id(), Some(RunId::from("run-1")));
        assert!(loaded.is_decomposition());
        assert!(store.load_task(TaskId::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cas_and_revert() {
        let store = SqliteStore::in_memory().await.unwrap();
        let task = create_test_task("Test Task");
        store.save_task(&task).await.unwrap();
        let now = chrono::Utc::now();

        assert!(store.cas_to_in_progress(task.id, now).await.unwrap());
        assert!(!store.cas_to_in_progress(task.id, now).await.unwrap());

        assert!(store.revert_to_queued(task.id, now).await.unwrap());
        let loaded = store.load_task(task.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Queued);
        assert!(loaded.started_at.is_none());
    }

    #[tokio::test]
    async fn test_revert_applies_to_any_status() {
        let store = SqliteStore::in_memory().await.unwrap();
        let mut task = create_test_task("Test Task");
        task.status = TaskStatus::Failed;
        store.save_task(&task).await.unwrap();
        let now = chrono::Utc::now();

        assert!(!store.cas_to_in_progress(task.id, now).await.unwrap());
        assert!(store.revert_to_queued(task.id, now).await.unwrap());
    }

    #[tokio::test]
    async fn test_guarded_terminal_transitions() {
        let store = SqliteStore::in_memory().await.unwrap();
        let task = create_test_task("Test Task");
        store.save_task(&task).await.unwrap();
        let now = chrono::Utc::now();

        assert!(!store.mark_failed(task.id, "dead", now).await.unwrap());
        store.cas_to_in_progress(task.id, now).await.unwrap();
        assert!(store.mark_failed(task.id, "dead", now).await.unwrap());
        assert!(!store.mark_completed(task.id, now).await.unwrap());

        let loaded = store.load_task(task.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Failed);
        assert_eq!(loaded.error.as_deref(), Some("dead"));
    }

    #[tokio::test]
    async fn test_select_next_ordering_and_exclusion() {
        let store = SqliteStore::in_memory().await.unwrap();
        let earlier = chrono::Utc::now() - chrono::Duration::minutes(10);

        let old_p1 = create_test_task("old p1").with_priority("P1").with_created_at(earlier);
        let new_p0 = create_test_task("new p0").with_priority("P0");
        let new_p1 = create_test_task("new p1").with_priority("P1");
        for t in [&old_p1, &new_p0, &new_p1] {
            store.save_task(t).await.unwrap();
        }

        let q = CandidateQuery::default();
        assert_eq!(store.select_next_queued(&q).await.unwrap().unwrap().id, new_p0.id);

        let q = q.excluding(&[new_p0.id]);
        assert_eq!(store.select_next_queued(&q).await.unwrap().unwrap().id, old_p1.id);

        let q = q.excluding(&[new_p0.id, old_p1.id, new_p1.id]);
        assert!(store.select_next_queued(&q).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_select_next_goal_scope() {
        let store = SqliteStore::in_memory().await.unwrap();
        let goal = GoalId::new();
        let scoped = create_test_task("scoped").with_goal(goal);
        let other = create_test_task("other").with_priority("P0");
        store.save_task(&scoped).await.unwrap();
        store.save_task(&other).await.unwrap();

        let q = CandidateQuery::new(Some(vec![goal]));
        assert_eq!(store.select_next_queued(&q).await.unwrap().unwrap().id, scoped.id);
    }

    #[tokio::test]
    async fn test_merge_metadata() {
        let store = SqliteStore::in_memory().await.unwrap();
        let task = create_test_task("Test Task");
        store.save_task(&task).await.unwrap();

        store
            .merge_metadata(
                task.id,
                &json!({"pre_flight_failed": true, "pre_flight_issues": ["x"]}),
            )
            .await
            .unwrap();
        store.merge_metadata(task.id, &json!({"note": "kept"})).await.unwrap();

        let loaded = store.load_task(task.id).await.unwrap().unwrap();
        assert_eq!(loaded.metadata["pre_flight_failed"], true);
        assert_eq!(loaded.metadata["note"], "kept");

        let missing = store.merge_metadata(TaskId::new(), &json!({})).await;
        assert!(matches!(missing, Err(StorageError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_working_memory_upsert() {
        let store = SqliteStore::in_memory().await.unwrap();
        assert!(store.load_working_memory("dispatch_stats").await.unwrap().is_none());

        store.save_working_memory("dispatch_stats", &json!({"events": []})).await.unwrap();
        store.save_working_memory("dispatch_stats", &json!({"events": [1]})).await.unwrap();

        let value = store.load_working_memory("dispatch_stats").await.unwrap().unwrap();
        assert_eq!(value, json!({"events": [1]}));
    }

    #[tokio::test]
    async fn test_decision_log() {
        let store = SqliteStore::in_memory().await.unwrap();
        let task_id = TaskId::new();
        let t0 = chrono::Utc::now();

        store
            .append_decision(&DecisionRecord::new("no_dispatchable_task", t0))
            .await
            .unwrap();
        store
            .append_decision(
                &DecisionRecord::new("dispatched", t0 + chrono::Duration::seconds(1))
                    .with_task(task_id)
                    .with_detail(json!({"run_id": "r1"})),
            )
            .await
            .unwrap();

        let decisions = store.list_decisions(10).await.unwrap();
        assert_eq!(decisions.len(), 2);
        assert_eq!(decisions[0].action, "dispatched");
        assert_eq!(decisions[0].task_id, Some(task_id));
        assert_eq!(decisions[1].task_id, None);
    }

    #[tokio::test]
    async fn test_list_tasks_filter() {
        let store = SqliteStore::in_memory().await.unwrap();
        for i in 0..3 {
            let mut task = create_test_task(&format!("Task {}", i));
            if i == 0 {
                task.status = TaskStatus::Completed;
            }
            store.save_task(&task).await.unwrap();
        }

        let queued = store.list_tasks(&TaskFilter::status(TaskStatus::Queued)).await.unwrap();
        assert_eq!(queued.len(), 2);
        let all = store.list_tasks(&TaskFilter::default()).await.unwrap();
        assert_eq!(all.len(), 3);
    }

    #[tokio::test]
    async fn test_file_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("overseer.db");
        let task = create_test_task("Persisted");

        {
            let store = SqliteStore::open(&path).await.unwrap();
            store.save_task(&task).await.unwrap();
        }

        let store = SqliteStore::open(&path).await.unwrap();
        let loaded = store.load_task(task.id).await.unwrap().unwrap();
        assert_eq!(loaded.title, "Persisted");
    }

    #[tokio::test]
    async fn test_health_check() {
        let store = SqliteStore::in_memory().await.unwrap();
        assert!(store.health_check().await);
    }
}
