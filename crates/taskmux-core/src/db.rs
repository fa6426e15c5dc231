//! SQLite persistence for tasks and the rate-limit state.

use crate::{Result, TaskmuxError};
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::sync::Mutex;
use taskmux_types::{RateLimitState, Task, TaskError, TaskStatus};
use tracing::info;
use uuid::Uuid;

/// SQLite-based store for the task queue.
///
/// The rate-limit condition is a singleton row so an in-flight cooldown
/// survives a process restart.
pub struct TaskStore {
    conn: Mutex<Connection>,
}

impl TaskStore {
    /// Open or create the database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        store.migrate()?;
        Ok(store)
    }

    /// In-memory store, used by tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        store.migrate()?;
        Ok(store)
    }

    /// Initialize database schema.
    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                description TEXT NOT NULL,
                status TEXT NOT NULL,
                assigned_to TEXT,
                paused_reason TEXT,
                failure_reason TEXT,
                error_history TEXT NOT NULL DEFAULT '[]',
                retry_count INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
            CREATE INDEX IF NOT EXISTS idx_tasks_created ON tasks(created_at);

            CREATE TABLE IF NOT EXISTS rate_limit (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                state TEXT NOT NULL
            );
            "#,
        )?;
        Ok(())
    }

    /// Run migrations for schema updates.
    fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();

        // Check if error_history column exists (pre-dates failure logging)
        let has_error_history: bool = conn
            .query_row(
                "SELECT COUNT(*) > 0 FROM pragma_table_info('tasks') WHERE name = 'error_history'",
                [],
                |row| row.get(0),
            )
            .unwrap_or(false);

        if !has_error_history {
            conn.execute_batch(
                r#"
                ALTER TABLE tasks ADD COLUMN error_history TEXT NOT NULL DEFAULT '[]';
                ALTER TABLE tasks ADD COLUMN retry_count INTEGER NOT NULL DEFAULT 0;
                "#,
            )?;
        }

        Ok(())
    }

    /// Insert a new task.
    pub fn insert(&self, task: &Task) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO tasks (
                id, title, description, status, assigned_to, paused_reason,
                failure_reason, error_history, retry_count, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
            params![
                task.id.to_string(),
                task.title,
                task.description,
                serde_json::to_string(&task.status)?,
                task.assigned_to,
                task.paused_reason,
                task.failure_reason,
                serde_json::to_string(&task.error_history)?,
                task.retry_count as i64,
                task.created_at.to_rfc3339(),
                task.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Get a task by ID.
    pub fn get(&self, id: Uuid) -> Result<Option<Task>> {
        let conn = self.conn.lock().unwrap();
        let task = conn
            .query_row(
                "SELECT * FROM tasks WHERE id = ?1",
                params![id.to_string()],
                |row| Self::row_to_task(row),
            )
            .optional()?;
        Ok(task)
    }

    /// List all tasks, oldest first.
    pub fn list(&self) -> Result<Vec<Task>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT * FROM tasks ORDER BY created_at ASC")?;
        let tasks = stmt
            .query_map([], |row| Self::row_to_task(row))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(tasks)
    }

    /// List tasks in a given status, oldest first.
    pub fn list_by_status(&self, status: TaskStatus) -> Result<Vec<Task>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT * FROM tasks WHERE status = ?1 ORDER BY created_at ASC")?;
        let tasks = stmt
            .query_map(params![serde_json::to_string(&status)?], |row| {
                Self::row_to_task(row)
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(tasks)
    }

    /// Persist every mutable field of a task, returning the stored row.
    ///
    /// Fails with `TaskNotFound` when the id does not exist, so callers
    /// never hand back a record the store silently dropped.
    pub fn update(&self, task: &Task) -> Result<Task> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            r#"
            UPDATE tasks SET
                title = ?1,
                description = ?2,
                status = ?3,
                assigned_to = ?4,
                paused_reason = ?5,
                failure_reason = ?6,
                error_history = ?7,
                retry_count = ?8,
                updated_at = ?9
            WHERE id = ?10
            "#,
            params![
                task.title,
                task.description,
                serde_json::to_string(&task.status)?,
                task.assigned_to,
                task.paused_reason,
                task.failure_reason,
                serde_json::to_string(&task.error_history)?,
                task.retry_count as i64,
                task.updated_at.to_rfc3339(),
                task.id.to_string(),
            ],
        )?;
        if changed != 1 {
            return Err(TaskmuxError::TaskNotFound(task.id));
        }
        let stored = conn.query_row(
            "SELECT * FROM tasks WHERE id = ?1",
            params![task.id.to_string()],
            |row| Self::row_to_task(row),
        )?;
        Ok(stored)
    }

    /// Compare-and-set status transition.
    ///
    /// Updates the row only if its status still equals `from`, so two
    /// concurrent dispatchers cannot both claim the same task. Returns
    /// whether the transition happened.
    pub fn transition_status(&self, id: Uuid, from: TaskStatus, to: TaskStatus) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE tasks SET status = ?1, updated_at = ?2 WHERE id = ?3 AND status = ?4",
            params![
                serde_json::to_string(&to)?,
                chrono::Utc::now().to_rfc3339(),
                id.to_string(),
                serde_json::to_string(&from)?,
            ],
        )?;
        Ok(changed == 1)
    }

    /// Delete a task.
    pub fn delete(&self, id: Uuid) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM tasks WHERE id = ?1", params![id.to_string()])?;
        Ok(())
    }

    /// Load the persisted rate-limit state, defaulting to unlimited.
    pub fn load_rate_limit(&self) -> Result<RateLimitState> {
        let conn = self.conn.lock().unwrap();
        let json: Option<String> = conn
            .query_row("SELECT state FROM rate_limit WHERE id = 1", [], |row| {
                row.get(0)
            })
            .optional()?;
        match json {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Ok(RateLimitState::default()),
        }
    }

    /// Persist the rate-limit state.
    pub fn save_rate_limit(&self, state: &RateLimitState) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO rate_limit (id, state) VALUES (1, ?1)
            ON CONFLICT(id) DO UPDATE SET state = excluded.state
            "#,
            params![serde_json::to_string(state)?],
        )?;
        if state.is_limited {
            info!(
                target: "taskmux::db",
                "Rate-limit state persisted (retry at {:?})", state.next_retry_at
            );
        }
        Ok(())
    }

    fn row_to_task(row: &rusqlite::Row) -> rusqlite::Result<Task> {
        let id: String = row.get("id")?;
        let title: String = row.get("title")?;
        let description: String = row.get("description")?;
        let status: String = row.get("status")?;
        let assigned_to: Option<String> = row.get("assigned_to")?;
        let paused_reason: Option<String> = row.get("paused_reason")?;
        let failure_reason: Option<String> = row.get("failure_reason")?;
        let error_history_json: String = row
            .get("error_history")
            .unwrap_or_else(|_| "[]".to_string());
        let error_history: Vec<TaskError> =
            serde_json::from_str(&error_history_json).unwrap_or_default();
        let retry_count: i64 = row.get("retry_count").unwrap_or(0);
        let created_at: String = row.get("created_at")?;
        let updated_at: String = row.get("updated_at")?;

        Ok(Task {
            id: Uuid::parse_str(&id).unwrap_or_default(),
            title,
            description,
            status: serde_json::from_str(&status).unwrap_or(TaskStatus::Failed),
            assigned_to,
            paused_reason,
            failure_reason,
            error_history,
            retry_count: retry_count as u32,
            created_at: chrono::DateTime::parse_from_rfc3339(&created_at)
                .map(|dt| dt.with_timezone(&chrono::Utc))
                .unwrap_or_default(),
            updated_at: chrono::DateTime::parse_from_rfc3339(&updated_at)
                .map(|dt| dt.with_timezone(&chrono::Utc))
                .unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_insert_and_get() {
        let store = TaskStore::open_in_memory().unwrap();
        let task = Task::new("Build feature", "Do the thing");
        store.insert(&task).unwrap();

        let loaded = store.get(task.id).unwrap().unwrap();
        assert_eq!(loaded.title, "Build feature");
        assert_eq!(loaded.status, TaskStatus::Pending);
    }

    #[test]
    fn test_get_missing_is_none() {
        let store = TaskStore::open_in_memory().unwrap();
        assert!(store.get(Uuid::new_v4()).unwrap().is_none());
    }

    #[test]
    fn test_list_by_status_is_oldest_first() {
        let store = TaskStore::open_in_memory().unwrap();
        let mut first = Task::new("first", "");
        first.created_at = Utc::now() - chrono::Duration::minutes(10);
        let second = Task::new("second", "");
        store.insert(&second).unwrap();
        store.insert(&first).unwrap();

        let pending = store.list_by_status(TaskStatus::Pending).unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].title, "first");
    }

    #[test]
    fn test_update_returns_stored_row_or_not_found() {
        let store = TaskStore::open_in_memory().unwrap();
        let mut task = Task::new("t", "");
        store.insert(&task).unwrap();

        task.retry_count = 3;
        let stored = store.update(&task).unwrap();
        assert_eq!(stored.id, task.id);
        assert_eq!(stored.retry_count, 3);

        // An id the store has never seen is a signal, not a silent no-op.
        let ghost = Task::new("ghost", "");
        assert!(matches!(
            store.update(&ghost),
            Err(TaskmuxError::TaskNotFound(id)) if id == ghost.id
        ));
    }

    #[test]
    fn test_cas_transition() {
        let store = TaskStore::open_in_memory().unwrap();
        let task = Task::new("t", "");
        store.insert(&task).unwrap();

        assert!(
            store
                .transition_status(task.id, TaskStatus::Pending, TaskStatus::InProgress)
                .unwrap()
        );
        // Second claim loses: the row is no longer pending.
        assert!(
            !store
                .transition_status(task.id, TaskStatus::Pending, TaskStatus::InProgress)
                .unwrap()
        );
        assert_eq!(
            store.get(task.id).unwrap().unwrap().status,
            TaskStatus::InProgress
        );
    }

    #[test]
    fn test_error_history_round_trip() {
        let store = TaskStore::open_in_memory().unwrap();
        let mut task = Task::new("t", "");
        store.insert(&task).unwrap();

        task.error_history.push(TaskError {
            timestamp: Utc::now(),
            reason: "session vanished".into(),
            retry_count_at_failure: 0,
        });
        task.status = TaskStatus::Failed;
        task.failure_reason = Some("session vanished".into());
        store.update(&task).unwrap();

        let loaded = store.get(task.id).unwrap().unwrap();
        assert_eq!(loaded.error_history.len(), 1);
        assert_eq!(loaded.error_history[0].reason, "session vanished");
        assert_eq!(loaded.status, TaskStatus::Failed);
    }

    #[test]
    fn test_rate_limit_singleton_round_trip() {
        let store = TaskStore::open_in_memory().unwrap();
        assert!(!store.load_rate_limit().unwrap().is_limited);

        let state = RateLimitState {
            is_limited: true,
            paused_at: Some(Utc::now()),
            next_retry_at: Some(Utc::now() + chrono::Duration::minutes(30)),
            retry_count: 2,
            last_error_message: Some("rate limited".into()),
        };
        store.save_rate_limit(&state).unwrap();
        assert_eq!(store.load_rate_limit().unwrap(), state);

        // Saving again overwrites the singleton rather than inserting.
        store.save_rate_limit(&RateLimitState::default()).unwrap();
        assert!(!store.load_rate_limit().unwrap().is_limited);
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.db");
        let task = Task::new("durable", "");
        {
            let store = TaskStore::open(&path).unwrap();
            store.insert(&task).unwrap();
        }
        let store = TaskStore::open(&path).unwrap();
        assert_eq!(store.get(task.id).unwrap().unwrap().title, "durable");
    }
}
