//! Metadata store for migration tasks.
//!
//! The store is deliberately dumb: it persists whatever state it is handed
//! and enforces only the bookkeeping rules (`started_at` once, `completed_at`
//! once, `last_error` iff failed, `resume_state` across pauses). Transition
//! legality lives in [`TaskState::can_transition`] and is enforced by the
//! façade and the worker, never here.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::Pool;
use tokio::sync::RwLock;

use crate::error::{DtsError, Result};
use crate::task::{Task, TaskState};

/// Storage abstraction over the `migration_tasks` table.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Persist a new task; fails with `AlreadyExists` on id collision.
    async fn create(&self, task: &Task) -> Result<()>;

    /// Load a task; fails with `NotFound` when absent.
    async fn get(&self, task_id: &str) -> Result<Task>;

    /// Tasks ordered by creation time, newest first.
    async fn list(&self, limit: i64, offset: i64) -> Result<Vec<Task>>;

    /// Atomic state write with timestamp/error bookkeeping.
    async fn update_state(
        &self,
        task_id: &str,
        new_state: TaskState,
        error: Option<&str>,
    ) -> Result<()>;

    /// Monotone progress write; decreasing values are dropped silently.
    async fn update_progress(&self, task_id: &str, progress: i32) -> Result<()>;

    /// Remove the task row; idempotent.
    async fn delete(&self, task_id: &str) -> Result<()>;
}

/// Applies the state-write bookkeeping to an in-memory task.
///
/// `started_at` is stamped exactly once, on first entry to `connect`;
/// `completed_at` exactly once, on entry to a terminal state. `last_error`
/// is non-empty iff the task is failed. Pausing records the prior state so
/// resume can return to it.
fn apply_state_write(task: &mut Task, new_state: TaskState, error: Option<&str>) {
    let now = Utc::now();
    if new_state == TaskState::Paused {
        if task.state != TaskState::Paused {
            task.resume_state = Some(task.state);
        }
    } else {
        task.resume_state = None;
    }
    task.state = new_state;
    task.last_error = if new_state == TaskState::Failed {
        error.unwrap_or("task failed").to_string()
    } else {
        String::new()
    };
    if new_state == TaskState::Connect && task.started_at.is_none() {
        task.started_at = Some(now);
    }
    if new_state.is_terminal() && task.completed_at.is_none() {
        task.completed_at = Some(now);
    }
    task.updated_at = now;
}

/// PostgreSQL-backed task store over the metadata database.
pub struct PgTaskStore {
    pool: Pool,
}

impl PgTaskStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Create the `migration_tasks` table if it does not exist.
    pub async fn init_schema(&self) -> Result<()> {
        let conn = self
            .pool
            .get()
            .await
            .map_err(|e| DtsError::pool(e, "initializing metadata schema"))?;

        conn.batch_execute(
            "CREATE TABLE IF NOT EXISTS migration_tasks (
                task_id       TEXT PRIMARY KEY,
                database_type TEXT NOT NULL DEFAULT 'postgresql',
                source        JSONB NOT NULL,
                dest          JSONB NOT NULL,
                tables        JSONB NOT NULL DEFAULT '[]',
                table_suffix  TEXT NOT NULL DEFAULT '',
                state         TEXT NOT NULL DEFAULT 'init',
                resume_state  TEXT,
                progress      INT NOT NULL DEFAULT 0,
                last_error    TEXT NOT NULL DEFAULT '',
                created_at    TIMESTAMPTZ NOT NULL DEFAULT now(),
                updated_at    TIMESTAMPTZ NOT NULL DEFAULT now(),
                started_at    TIMESTAMPTZ,
                completed_at  TIMESTAMPTZ
            );
            CREATE INDEX IF NOT EXISTS idx_migration_tasks_created
                ON migration_tasks (created_at DESC);",
        )
        .await?;
        Ok(())
    }

    fn task_from_row(row: &tokio_postgres::Row) -> Result<Task> {
        let state: String = row.get("state");
        let resume_state: Option<String> = row.get("resume_state");
        Ok(Task {
            task_id: row.get("task_id"),
            database_type: row.get("database_type"),
            source: serde_json::from_value(row.get("source"))?,
            dest: serde_json::from_value(row.get("dest"))?,
            tables: serde_json::from_value(row.get("tables"))?,
            table_suffix: row.get("table_suffix"),
            state: state.parse()?,
            resume_state: resume_state.as_deref().map(str::parse).transpose()?,
            progress: row.get("progress"),
            last_error: row.get("last_error"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
            started_at: row.get("started_at"),
            completed_at: row.get("completed_at"),
        })
    }
}

const SELECT_COLUMNS: &str = "task_id, database_type, source, dest, tables, table_suffix, \
     state, resume_state, progress, last_error, created_at, updated_at, started_at, completed_at";

#[async_trait]
impl TaskStore for PgTaskStore {
    async fn create(&self, task: &Task) -> Result<()> {
        let conn = self
            .pool
            .get()
            .await
            .map_err(|e| DtsError::pool(e, "creating task"))?;

        let inserted = conn
            .execute(
                "INSERT INTO migration_tasks
                   (task_id, database_type, source, dest, tables, table_suffix,
                    state, progress, last_error, created_at, updated_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                 ON CONFLICT (task_id) DO NOTHING",
                &[
                    &task.task_id,
                    &task.database_type,
                    &serde_json::to_value(&task.source)?,
                    &serde_json::to_value(&task.dest)?,
                    &serde_json::to_value(&task.tables)?,
                    &task.table_suffix,
                    &task.state.as_str(),
                    &task.progress,
                    &task.last_error,
                    &task.created_at,
                    &task.updated_at,
                ],
            )
            .await?;

        if inserted == 0 {
            return Err(DtsError::AlreadyExists(task.task_id.clone()));
        }
        Ok(())
    }

    async fn get(&self, task_id: &str) -> Result<Task> {
        let conn = self
            .pool
            .get()
            .await
            .map_err(|e| DtsError::pool(e, "loading task"))?;

        let row = conn
            .query_opt(
                &format!("SELECT {SELECT_COLUMNS} FROM migration_tasks WHERE task_id = $1"),
                &[&task_id],
            )
            .await?
            .ok_or_else(|| DtsError::NotFound(task_id.to_string()))?;

        Self::task_from_row(&row)
    }

    async fn list(&self, limit: i64, offset: i64) -> Result<Vec<Task>> {
        let conn = self
            .pool
            .get()
            .await
            .map_err(|e| DtsError::pool(e, "listing tasks"))?;

        let rows = conn
            .query(
                &format!(
                    "SELECT {SELECT_COLUMNS} FROM migration_tasks
                     ORDER BY created_at DESC LIMIT $1 OFFSET $2"
                ),
                &[&limit, &offset],
            )
            .await?;

        rows.iter().map(Self::task_from_row).collect()
    }

    async fn update_state(
        &self,
        task_id: &str,
        new_state: TaskState,
        error: Option<&str>,
    ) -> Result<()> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| DtsError::pool(e, "updating task state"))?;

        // Read-modify-write under a row lock so concurrent writers from the
        // façade and the worker serialize.
        let tx = conn.transaction().await?;
        let row = tx
            .query_opt(
                "SELECT state, resume_state, started_at, completed_at
                 FROM migration_tasks WHERE task_id = $1 FOR UPDATE",
                &[&task_id],
            )
            .await?
            .ok_or_else(|| DtsError::NotFound(task_id.to_string()))?;

        let current: TaskState = row.get::<_, String>("state").parse()?;
        let started_at: Option<DateTime<Utc>> = row.get("started_at");
        let completed_at: Option<DateTime<Utc>> = row.get("completed_at");

        let now = Utc::now();
        let resume_state: Option<&str> = if new_state == TaskState::Paused {
            if current == TaskState::Paused {
                row.get("resume_state")
            } else {
                Some(current.as_str())
            }
        } else {
            None
        };
        let last_error = if new_state == TaskState::Failed {
            error.unwrap_or("task failed")
        } else {
            ""
        };
        let started_at = match (new_state, started_at) {
            (TaskState::Connect, None) => Some(now),
            (_, existing) => existing,
        };
        let completed_at = match (new_state.is_terminal(), completed_at) {
            (true, None) => Some(now),
            (_, existing) => existing,
        };

        tx.execute(
            "UPDATE migration_tasks
             SET state = $2, resume_state = $3, last_error = $4,
                 started_at = $5, completed_at = $6, updated_at = $7
             WHERE task_id = $1",
            &[
                &task_id,
                &new_state.as_str(),
                &resume_state,
                &last_error,
                &started_at,
                &completed_at,
                &now,
            ],
        )
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn update_progress(&self, task_id: &str, progress: i32) -> Result<()> {
        let conn = self
            .pool
            .get()
            .await
            .map_err(|e| DtsError::pool(e, "updating task progress"))?;

        conn.execute(
            "UPDATE migration_tasks
             SET progress = $2, updated_at = now()
             WHERE task_id = $1 AND progress < $2",
            &[&task_id, &progress],
        )
        .await?;
        Ok(())
    }

    async fn delete(&self, task_id: &str) -> Result<()> {
        let conn = self
            .pool
            .get()
            .await
            .map_err(|e| DtsError::pool(e, "deleting task"))?;

        conn.execute("DELETE FROM migration_tasks WHERE task_id = $1", &[&task_id])
            .await?;
        Ok(())
    }
}

/// In-memory task store used by the test suite and embeddable deployments.
#[derive(Default)]
pub struct MemoryTaskStore {
    tasks: RwLock<HashMap<String, Task>>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn create(&self, task: &Task) -> Result<()> {
        let mut tasks = self.tasks.write().await;
        if tasks.contains_key(&task.task_id) {
            return Err(DtsError::AlreadyExists(task.task_id.clone()));
        }
        tasks.insert(task.task_id.clone(), task.clone());
        Ok(())
    }

    async fn get(&self, task_id: &str) -> Result<Task> {
        self.tasks
            .read()
            .await
            .get(task_id)
            .cloned()
            .ok_or_else(|| DtsError::NotFound(task_id.to_string()))
    }

    async fn list(&self, limit: i64, offset: i64) -> Result<Vec<Task>> {
        let tasks = self.tasks.read().await;
        let mut all: Vec<Task> = tasks.values().cloned().collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(all
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn update_state(
        &self,
        task_id: &str,
        new_state: TaskState,
        error: Option<&str>,
    ) -> Result<()> {
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .get_mut(task_id)
            .ok_or_else(|| DtsError::NotFound(task_id.to_string()))?;
        apply_state_write(task, new_state, error);
        Ok(())
    }

    async fn update_progress(&self, task_id: &str, progress: i32) -> Result<()> {
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .get_mut(task_id)
            .ok_or_else(|| DtsError::NotFound(task_id.to_string()))?;
        if progress > task.progress {
            task.progress = progress;
            task.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn delete(&self, task_id: &str) -> Result<()> {
        self.tasks.write().await.remove(task_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Endpoint;

    fn endpoint() -> Endpoint {
        Endpoint {
            host: "localhost".into(),
            port: 5432,
            user: "postgres".into(),
            password: "postgres".into(),
            database: "postgres".into(),
            ssl_mode: "disable".into(),
        }
    }

    fn task(id: &str) -> Task {
        Task::new(id, endpoint(), endpoint(), vec![], "")
    }

    #[tokio::test]
    async fn test_create_get_delete() {
        let store = MemoryTaskStore::new();
        store.create(&task("a")).await.unwrap();
        assert!(matches!(
            store.create(&task("a")).await,
            Err(DtsError::AlreadyExists(_))
        ));
        assert_eq!(store.get("a").await.unwrap().task_id, "a");
        assert!(matches!(store.get("b").await, Err(DtsError::NotFound(_))));

        store.delete("a").await.unwrap();
        store.delete("a").await.unwrap(); // idempotent
        assert!(store.get("a").await.is_err());
    }

    #[tokio::test]
    async fn test_started_and_completed_stamped_once() {
        let store = MemoryTaskStore::new();
        store.create(&task("t")).await.unwrap();

        store
            .update_state("t", TaskState::Connect, None)
            .await
            .unwrap();
        let first_start = store.get("t").await.unwrap().started_at.unwrap();

        // a later re-entry into connect must not move started_at
        store
            .update_state("t", TaskState::Connect, None)
            .await
            .unwrap();
        assert_eq!(store.get("t").await.unwrap().started_at.unwrap(), first_start);

        store
            .update_state("t", TaskState::Failed, Some("boom"))
            .await
            .unwrap();
        let t = store.get("t").await.unwrap();
        assert_eq!(t.last_error, "boom");
        assert!(t.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_last_error_nonempty_iff_failed() {
        let store = MemoryTaskStore::new();
        store.create(&task("t")).await.unwrap();

        store
            .update_state("t", TaskState::Failed, Some("kaput"))
            .await
            .unwrap();
        assert_eq!(store.get("t").await.unwrap().last_error, "kaput");

        store.update_state("t", TaskState::Failed, None).await.unwrap();
        assert!(!store.get("t").await.unwrap().last_error.is_empty());
    }

    #[tokio::test]
    async fn test_pause_records_resume_state() {
        let store = MemoryTaskStore::new();
        store.create(&task("t")).await.unwrap();
        store
            .update_state("t", TaskState::Connect, None)
            .await
            .unwrap();
        store
            .update_state("t", TaskState::CreateTables, None)
            .await
            .unwrap();
        store.update_state("t", TaskState::Paused, None).await.unwrap();

        let t = store.get("t").await.unwrap();
        assert_eq!(t.state, TaskState::Paused);
        assert_eq!(t.resume_state, Some(TaskState::CreateTables));

        // resume clears the marker
        store
            .update_state("t", TaskState::CreateTables, None)
            .await
            .unwrap();
        assert_eq!(store.get("t").await.unwrap().resume_state, None);
    }

    #[tokio::test]
    async fn test_progress_is_monotone() {
        let store = MemoryTaskStore::new();
        store.create(&task("t")).await.unwrap();

        store.update_progress("t", 30).await.unwrap();
        store.update_progress("t", 15).await.unwrap(); // dropped
        assert_eq!(store.get("t").await.unwrap().progress, 30);
        store.update_progress("t", 60).await.unwrap();
        assert_eq!(store.get("t").await.unwrap().progress, 60);
    }

    #[tokio::test]
    async fn test_list_orders_newest_first() {
        let store = MemoryTaskStore::new();
        let mut a = task("a");
        a.created_at = Utc::now() - chrono::Duration::seconds(10);
        let b = task("b");
        store.create(&a).await.unwrap();
        store.create(&b).await.unwrap();

        let listed = store.list(10, 0).await.unwrap();
        assert_eq!(listed[0].task_id, "b");
        assert_eq!(listed[1].task_id, "a");

        assert_eq!(store.list(1, 1).await.unwrap()[0].task_id, "a");
    }
}
