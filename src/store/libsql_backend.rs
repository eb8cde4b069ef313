//! libSQL backend — async `Store` trait implementation.
//!
//! Supports local file and in-memory databases. `libsql::Connection` is
//! `Send + Sync` and safe for concurrent async use; row-level constraints
//! do the cross-request coordination.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use serde_json::Value;
use tracing::info;

use crate::error::DatabaseError;
use crate::model::{
    AuditDecision, LocalRunner, PrActionAudit, ResultDoc, Subtask, SubtaskStatus, Task, TaskLabels,
    TaskStatusDoc, User,
};
use crate::store::traits::{NewAudit, NewSubtask, Store, SubtaskExecutionUpdate};

/// libSQL store backend.
pub struct LibSqlStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Connection(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Connection(format!("Failed to open database: {e}")))?;
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Connection(format!("Failed to create connection: {e}")))?;

        let store = Self {
            db: Arc::new(db),
            conn,
        };
        store.init_schema().await?;
        info!(path = %path.display(), "Database opened");
        Ok(store)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Connection(format!("Failed to create in-memory database: {e}"))
            })?;
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Connection(format!("Failed to create connection: {e}")))?;

        let store = Self {
            db: Arc::new(db),
            conn,
        };
        store.init_schema().await?;
        Ok(store)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn init_schema(&self) -> Result<(), DatabaseError> {
        self.conn()
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS users (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    username TEXT NOT NULL UNIQUE,
                    api_key TEXT NOT NULL UNIQUE,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS tasks (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    user_id INTEGER NOT NULL,
                    title TEXT NOT NULL,
                    model TEXT,
                    local_runner_id TEXT,
                    local_workspace_id TEXT,
                    task_type TEXT NOT NULL DEFAULT 'online',
                    status TEXT NOT NULL,
                    status_json TEXT NOT NULL,
                    is_active INTEGER NOT NULL DEFAULT 1,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_tasks_user ON tasks(user_id);
                CREATE INDEX IF NOT EXISTS idx_tasks_runner ON tasks(local_runner_id, status);

                CREATE TABLE IF NOT EXISTS subtasks (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    user_id INTEGER NOT NULL,
                    task_id INTEGER NOT NULL,
                    title TEXT NOT NULL,
                    role TEXT NOT NULL,
                    status TEXT NOT NULL,
                    progress INTEGER NOT NULL DEFAULT 0,
                    message_id INTEGER NOT NULL,
                    parent_id INTEGER NOT NULL DEFAULT 0,
                    prompt TEXT NOT NULL DEFAULT '',
                    result TEXT NOT NULL DEFAULT '{}',
                    error_message TEXT NOT NULL DEFAULT '',
                    executor_name TEXT,
                    executor_namespace TEXT,
                    is_active INTEGER NOT NULL DEFAULT 1,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    completed_at TEXT
                );
                CREATE INDEX IF NOT EXISTS idx_subtasks_task_message
                    ON subtasks(task_id, message_id);
                CREATE INDEX IF NOT EXISTS idx_subtasks_task_status
                    ON subtasks(task_id, status);

                CREATE TABLE IF NOT EXISTS local_runners (
                    id TEXT NOT NULL,
                    user_id INTEGER NOT NULL,
                    name TEXT NOT NULL,
                    disabled INTEGER NOT NULL DEFAULT 0,
                    capabilities TEXT NOT NULL DEFAULT '{}',
                    workspaces TEXT NOT NULL DEFAULT '[]',
                    last_seen_at TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    PRIMARY KEY (user_id, id)
                );

                CREATE TABLE IF NOT EXISTS pr_action_audits (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    user_id INTEGER NOT NULL,
                    idempotency_key TEXT NOT NULL,
                    action TEXT NOT NULL,
                    provider TEXT NOT NULL DEFAULT 'github',
                    git_domain TEXT NOT NULL DEFAULT 'github.com',
                    repo_full_name TEXT NOT NULL,
                    base_branch TEXT NOT NULL,
                    head_branch TEXT NOT NULL,
                    decision TEXT NOT NULL,
                    policy_code TEXT,
                    policy_message TEXT,
                    request_json TEXT NOT NULL DEFAULT '{}',
                    response_json TEXT,
                    pr_number INTEGER,
                    pr_url TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );
                CREATE UNIQUE INDEX IF NOT EXISTS uq_pr_action_idempotency
                    ON pr_action_audits(user_id, idempotency_key);

                CREATE TABLE IF NOT EXISTS artifacts (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    user_id INTEGER NOT NULL,
                    subtask_id INTEGER NOT NULL,
                    filename TEXT NOT NULL,
                    size INTEGER NOT NULL,
                    data BLOB NOT NULL,
                    created_at TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_artifacts_subtask ON artifacts(subtask_id);",
            )
            .await
            .map_err(|e| DatabaseError::Migration(e.to_string()))?;
        Ok(())
    }
}

// ── Helper functions ────────────────────────────────────────────────

fn query_err(e: libsql::Error) -> DatabaseError {
    let msg = e.to_string();
    if msg.contains("UNIQUE") {
        DatabaseError::Constraint(msg)
    } else {
        DatabaseError::Query(msg)
    }
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn fmt_datetime(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn parse_json_or(s: &str, default: Value) -> Value {
    serde_json::from_str(s).unwrap_or(default)
}

fn row_to_task(row: &libsql::Row) -> Result<Task, libsql::Error> {
    let id: i64 = row.get(0)?;
    let user_id: i64 = row.get(1)?;
    let title: String = row.get(2)?;
    let model: Option<String> = row.get::<String>(3).ok();
    let local_runner_id: Option<String> = row.get::<String>(4).ok();
    let local_workspace_id: Option<String> = row.get::<String>(5).ok();
    let task_type: String = row.get(6)?;
    // Column 7 is the denormalized status string; the document is canonical.
    let status_json: String = row.get(8)?;
    let is_active: i64 = row.get(9)?;
    let created_str: String = row.get(10)?;
    let updated_str: String = row.get(11)?;

    let created_at = parse_datetime(&created_str);
    let status: TaskStatusDoc =
        serde_json::from_str(&status_json).unwrap_or_else(|_| TaskStatusDoc::pending(created_at));

    Ok(Task {
        id,
        user_id,
        title,
        labels: TaskLabels {
            model,
            local_runner_id,
            local_workspace_id,
            task_type,
        },
        status,
        is_active: is_active != 0,
        created_at,
        updated_at: parse_datetime(&updated_str),
    })
}

fn row_to_subtask(row: &libsql::Row) -> Result<Subtask, libsql::Error> {
    let result_str: String = row.get(10)?;
    let role_str: String = row.get(4)?;
    let status_str: String = row.get(5)?;
    let completed_str: Option<String> = row.get::<String>(17).ok();

    Ok(Subtask {
        id: row.get(0)?,
        user_id: row.get(1)?,
        task_id: row.get(2)?,
        title: row.get(3)?,
        role: role_str.parse().unwrap_or(crate::model::SubtaskRole::User),
        status: status_str.parse().unwrap_or(SubtaskStatus::Pending),
        progress: row.get::<i64>(6)?.clamp(0, 100) as u8,
        message_id: row.get(7)?,
        parent_id: row.get(8)?,
        prompt: row.get(9)?,
        result: ResultDoc::from_value(parse_json_or(&result_str, Value::Null)),
        error_message: row.get(11)?,
        executor_name: row.get::<String>(12).ok(),
        executor_namespace: row.get::<String>(13).ok(),
        is_active: row.get::<i64>(14)? != 0,
        created_at: parse_datetime(&row.get::<String>(15)?),
        updated_at: parse_datetime(&row.get::<String>(16)?),
        completed_at: completed_str.as_deref().map(parse_datetime),
    })
}

fn row_to_runner(row: &libsql::Row) -> Result<LocalRunner, libsql::Error> {
    let capabilities: String = row.get(4)?;
    let workspaces: String = row.get(5)?;
    Ok(LocalRunner {
        id: row.get(0)?,
        user_id: row.get(1)?,
        name: row.get(2)?,
        disabled: row.get::<i64>(3)? != 0,
        capabilities: parse_json_or(&capabilities, Value::Object(Default::default())),
        workspaces: parse_json_or(&workspaces, Value::Array(Default::default())),
        last_seen_at: parse_datetime(&row.get::<String>(6)?),
        created_at: parse_datetime(&row.get::<String>(7)?),
        updated_at: parse_datetime(&row.get::<String>(8)?),
    })
}

fn row_to_audit(row: &libsql::Row) -> Result<PrActionAudit, libsql::Error> {
    let decision_str: String = row.get(9)?;
    Ok(PrActionAudit {
        id: row.get(0)?,
        user_id: row.get(1)?,
        idempotency_key: row.get(2)?,
        action: row.get(3)?,
        provider: row.get(4)?,
        git_domain: row.get(5)?,
        repo_full_name: row.get(6)?,
        base_branch: row.get(7)?,
        head_branch: row.get(8)?,
        decision: decision_str.parse().unwrap_or(AuditDecision::Error),
        policy_code: row.get::<String>(10).ok(),
        policy_message: row.get::<String>(11).ok(),
        request_json: row.get(12)?,
        response_json: row.get::<String>(13).ok(),
        pr_number: row.get::<i64>(14).ok(),
        pr_url: row.get::<String>(15).ok(),
        created_at: parse_datetime(&row.get::<String>(16)?),
        updated_at: parse_datetime(&row.get::<String>(17)?),
    })
}

const TASK_COLUMNS: &str = "id, user_id, title, model, local_runner_id, local_workspace_id, \
     task_type, status, status_json, is_active, created_at, updated_at";

const SUBTASK_COLUMNS: &str = "id, user_id, task_id, title, role, status, progress, message_id, \
     parent_id, prompt, result, error_message, executor_name, executor_namespace, is_active, \
     created_at, updated_at, completed_at";

const RUNNER_COLUMNS: &str =
    "id, user_id, name, disabled, capabilities, workspaces, last_seen_at, created_at, updated_at";

const AUDIT_COLUMNS: &str = "id, user_id, idempotency_key, action, provider, git_domain, \
     repo_full_name, base_branch, head_branch, decision, policy_code, policy_message, \
     request_json, response_json, pr_number, pr_url, created_at, updated_at";

#[async_trait]
impl Store for LibSqlStore {
    // ── Users ───────────────────────────────────────────────────────

    async fn upsert_user(&self, username: &str, api_key: &str) -> Result<User, DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO users (username, api_key, created_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(username) DO UPDATE SET api_key = excluded.api_key",
                params![username, api_key, fmt_datetime(Utc::now())],
            )
            .await
            .map_err(query_err)?;

        let mut rows = self
            .conn()
            .query(
                "SELECT id, username, api_key FROM users WHERE username = ?1",
                params![username],
            )
            .await
            .map_err(query_err)?;
        let row = rows.next().await.map_err(query_err)?.ok_or_else(|| {
            DatabaseError::NotFound {
                entity: "user".into(),
                id: username.into(),
            }
        })?;
        Ok(User {
            id: row.get(0).map_err(query_err)?,
            username: row.get(1).map_err(query_err)?,
            api_key: row.get(2).map_err(query_err)?,
        })
    }

    async fn find_user_by_api_key(&self, api_key: &str) -> Result<Option<User>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, username, api_key FROM users WHERE api_key = ?1",
                params![api_key],
            )
            .await
            .map_err(query_err)?;
        match rows.next().await.map_err(query_err)? {
            Some(row) => Ok(Some(User {
                id: row.get(0).map_err(query_err)?,
                username: row.get(1).map_err(query_err)?,
                api_key: row.get(2).map_err(query_err)?,
            })),
            None => Ok(None),
        }
    }

    // ── Tasks ───────────────────────────────────────────────────────

    async fn insert_task(
        &self,
        user_id: i64,
        title: &str,
        labels: &TaskLabels,
        status: &TaskStatusDoc,
    ) -> Result<Task, DatabaseError> {
        let status_json = serde_json::to_string(status)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        let now = fmt_datetime(status.created_at);

        self.conn()
            .execute(
                "INSERT INTO tasks (user_id, title, model, local_runner_id, local_workspace_id, \
                 task_type, status, status_json, is_active, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 1, ?9, ?9)",
                params![
                    user_id,
                    title,
                    labels.model.clone(),
                    labels.local_runner_id.clone(),
                    labels.local_workspace_id.clone(),
                    labels.task_type.clone(),
                    status.status.as_str(),
                    status_json,
                    now
                ],
            )
            .await
            .map_err(query_err)?;

        let id = self.conn().last_insert_rowid();
        self.get_task(id).await?.ok_or(DatabaseError::NotFound {
            entity: "task".into(),
            id: id.to_string(),
        })
    }

    async fn get_task(&self, task_id: i64) -> Result<Option<Task>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1 AND is_active = 1"),
                params![task_id],
            )
            .await
            .map_err(query_err)?;
        match rows.next().await.map_err(query_err)? {
            Some(row) => Ok(Some(row_to_task(&row).map_err(query_err)?)),
            None => Ok(None),
        }
    }

    async fn update_task_status(
        &self,
        task_id: i64,
        status: &TaskStatusDoc,
    ) -> Result<(), DatabaseError> {
        let status_json = serde_json::to_string(status)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        self.conn()
            .execute(
                "UPDATE tasks SET status = ?1, status_json = ?2, updated_at = ?3 WHERE id = ?4",
                params![
                    status.status.as_str(),
                    status_json,
                    fmt_datetime(status.updated_at),
                    task_id
                ],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    // ── Subtasks ────────────────────────────────────────────────────

    async fn insert_subtask(&self, new: NewSubtask) -> Result<Subtask, DatabaseError> {
        let result_json = serde_json::to_string(&new.result)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        let now = fmt_datetime(Utc::now());

        self.conn()
            .execute(
                "INSERT INTO subtasks (user_id, task_id, title, role, status, progress, \
                 message_id, parent_id, prompt, result, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)",
                params![
                    new.user_id,
                    new.task_id,
                    new.title,
                    new.role.as_str(),
                    new.status.as_str(),
                    new.progress as i64,
                    new.message_id,
                    new.parent_id,
                    new.prompt,
                    result_json,
                    now
                ],
            )
            .await
            .map_err(query_err)?;

        let id = self.conn().last_insert_rowid();
        self.get_subtask(id).await?.ok_or(DatabaseError::NotFound {
            entity: "subtask".into(),
            id: id.to_string(),
        })
    }

    async fn get_subtask(&self, subtask_id: i64) -> Result<Option<Subtask>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {SUBTASK_COLUMNS} FROM subtasks WHERE id = ?1 AND is_active = 1"),
                params![subtask_id],
            )
            .await
            .map_err(query_err)?;
        match rows.next().await.map_err(query_err)? {
            Some(row) => Ok(Some(row_to_subtask(&row).map_err(query_err)?)),
            None => Ok(None),
        }
    }

    async fn max_message_id(&self, task_id: i64) -> Result<i64, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT COALESCE(MAX(message_id), 0) FROM subtasks WHERE task_id = ?1",
                params![task_id],
            )
            .await
            .map_err(query_err)?;
        match rows.next().await.map_err(query_err)? {
            Some(row) => row.get(0).map_err(query_err),
            None => Ok(0),
        }
    }

    async fn list_task_subtasks(&self, task_id: i64) -> Result<Vec<Subtask>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {SUBTASK_COLUMNS} FROM subtasks \
                     WHERE task_id = ?1 AND is_active = 1 ORDER BY message_id ASC"
                ),
                params![task_id],
            )
            .await
            .map_err(query_err)?;

        let mut out = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err)? {
            out.push(row_to_subtask(&row).map_err(query_err)?);
        }
        Ok(out)
    }

    async fn find_user_subtask(
        &self,
        task_id: i64,
        message_id: i64,
    ) -> Result<Option<Subtask>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {SUBTASK_COLUMNS} FROM subtasks \
                     WHERE task_id = ?1 AND message_id = ?2 AND role = 'USER' AND is_active = 1"
                ),
                params![task_id, message_id],
            )
            .await
            .map_err(query_err)?;
        match rows.next().await.map_err(query_err)? {
            Some(row) => Ok(Some(row_to_subtask(&row).map_err(query_err)?)),
            None => Ok(None),
        }
    }

    async fn latest_user_subtask_before(
        &self,
        task_id: i64,
        message_id: i64,
    ) -> Result<Option<Subtask>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {SUBTASK_COLUMNS} FROM subtasks \
                     WHERE task_id = ?1 AND message_id < ?2 AND role = 'USER' AND is_active = 1 \
                     ORDER BY message_id DESC LIMIT 1"
                ),
                params![task_id, message_id],
            )
            .await
            .map_err(query_err)?;
        match rows.next().await.map_err(query_err)? {
            Some(row) => Ok(Some(row_to_subtask(&row).map_err(query_err)?)),
            None => Ok(None),
        }
    }

    async fn claimable_subtasks(
        &self,
        user_id: i64,
        runner_id: &str,
        status: SubtaskStatus,
        limit: u32,
    ) -> Result<Vec<Subtask>, DatabaseError> {
        let columns: String = SUBTASK_COLUMNS
            .split(", ")
            .map(|c| format!("s.{c}"))
            .collect::<Vec<_>>()
            .join(", ");
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {columns} FROM subtasks s \
                     JOIN tasks t ON t.id = s.task_id \
                     WHERE s.role = 'ASSISTANT' AND s.status = ?1 AND s.is_active = 1 \
                       AND t.is_active = 1 AND t.user_id = ?2 \
                       AND t.task_type = 'local' AND t.local_runner_id = ?3 \
                       AND t.status IN ('PENDING', 'RUNNING') \
                     ORDER BY s.id ASC LIMIT ?4"
                ),
                params![status.as_str(), user_id, runner_id, limit as i64],
            )
            .await
            .map_err(query_err)?;

        let mut out = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err)? {
            out.push(row_to_subtask(&row).map_err(query_err)?);
        }
        Ok(out)
    }

    async fn persist_callback(
        &self,
        update: &SubtaskExecutionUpdate,
        task_id: i64,
        task_status: &TaskStatusDoc,
    ) -> Result<(), DatabaseError> {
        let result_json = serde_json::to_string(&update.result)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        let status_json = serde_json::to_string(task_status)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

        let tx = self
            .conn()
            .transaction()
            .await
            .map_err(query_err)?;
        tx.execute(
            "UPDATE subtasks SET status = ?1, progress = ?2, result = ?3, \
             error_message = ?4, executor_name = ?5, executor_namespace = ?6, \
             completed_at = ?7, updated_at = ?8 WHERE id = ?9",
            params![
                update.status.as_str(),
                update.progress as i64,
                result_json,
                update.error_message.clone(),
                update.executor_name.clone(),
                update.executor_namespace.clone(),
                update.completed_at.map(fmt_datetime),
                fmt_datetime(update.updated_at),
                update.subtask_id
            ],
        )
        .await
        .map_err(query_err)?;
        tx.execute(
            "UPDATE tasks SET status = ?1, status_json = ?2, updated_at = ?3 WHERE id = ?4",
            params![
                task_status.status.as_str(),
                status_json,
                fmt_datetime(task_status.updated_at),
                task_id
            ],
        )
        .await
        .map_err(query_err)?;
        tx.commit().await.map_err(query_err)?;
        Ok(())
    }

    async fn reset_subtask(
        &self,
        subtask_id: i64,
        result: &ResultDoc,
        now: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        let result_json = serde_json::to_string(result)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        self.conn()
            .execute(
                "UPDATE subtasks SET status = 'PENDING', progress = 0, result = ?1, \
                 error_message = '', executor_name = NULL, executor_namespace = NULL, \
                 completed_at = NULL, updated_at = ?2 WHERE id = ?3",
                params![result_json, fmt_datetime(now), subtask_id],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn reset_for_retry(
        &self,
        subtask_id: i64,
        result: &ResultDoc,
        task_id: i64,
        task_status: &TaskStatusDoc,
        now: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        let result_json = serde_json::to_string(result)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        let status_json = serde_json::to_string(task_status)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

        let tx = self
            .conn()
            .transaction()
            .await
            .map_err(query_err)?;
        tx.execute(
            "UPDATE subtasks SET status = 'PENDING', progress = 0, result = ?1, \
             error_message = '', executor_name = NULL, executor_namespace = NULL, \
             completed_at = NULL, updated_at = ?2 WHERE id = ?3",
            params![result_json, fmt_datetime(now), subtask_id],
        )
        .await
        .map_err(query_err)?;
        tx.execute(
            "UPDATE tasks SET status = ?1, status_json = ?2, updated_at = ?3 WHERE id = ?4",
            params![
                task_status.status.as_str(),
                status_json,
                fmt_datetime(task_status.updated_at),
                task_id
            ],
        )
        .await
        .map_err(query_err)?;
        tx.commit().await.map_err(query_err)?;
        Ok(())
    }

    // ── Local runners ───────────────────────────────────────────────

    async fn get_runner(
        &self,
        user_id: i64,
        runner_id: &str,
    ) -> Result<Option<LocalRunner>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {RUNNER_COLUMNS} FROM local_runners WHERE user_id = ?1 AND id = ?2"
                ),
                params![user_id, runner_id],
            )
            .await
            .map_err(query_err)?;
        match rows.next().await.map_err(query_err)? {
            Some(row) => Ok(Some(row_to_runner(&row).map_err(query_err)?)),
            None => Ok(None),
        }
    }

    async fn insert_runner(&self, runner: &LocalRunner) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO local_runners (id, user_id, name, disabled, capabilities, \
                 workspaces, last_seen_at, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
                params![
                    runner.id.clone(),
                    runner.user_id,
                    runner.name.clone(),
                    runner.disabled as i64,
                    runner.capabilities.to_string(),
                    runner.workspaces.to_string(),
                    fmt_datetime(runner.last_seen_at),
                    fmt_datetime(runner.created_at)
                ],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn update_runner_heartbeat(
        &self,
        user_id: i64,
        runner_id: &str,
        name: Option<&str>,
        capabilities: &Value,
        workspaces: &Value,
        now: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE local_runners SET name = COALESCE(?1, name), capabilities = ?2, \
                 workspaces = ?3, last_seen_at = ?4, updated_at = ?4 \
                 WHERE user_id = ?5 AND id = ?6",
                params![
                    name.map(|s| s.to_string()),
                    capabilities.to_string(),
                    workspaces.to_string(),
                    fmt_datetime(now),
                    user_id,
                    runner_id
                ],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn list_runners(&self, user_id: i64) -> Result<Vec<LocalRunner>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {RUNNER_COLUMNS} FROM local_runners \
                     WHERE user_id = ?1 ORDER BY last_seen_at DESC"
                ),
                params![user_id],
            )
            .await
            .map_err(query_err)?;

        let mut out = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err)? {
            out.push(row_to_runner(&row).map_err(query_err)?);
        }
        Ok(out)
    }

    async fn set_runner_disabled(
        &self,
        user_id: i64,
        runner_id: &str,
        disabled: bool,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE local_runners SET disabled = ?1, updated_at = ?2 \
                 WHERE user_id = ?3 AND id = ?4",
                params![
                    disabled as i64,
                    fmt_datetime(Utc::now()),
                    user_id,
                    runner_id
                ],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    // ── PR action audits ────────────────────────────────────────────

    async fn insert_audit(&self, new: NewAudit) -> Result<PrActionAudit, DatabaseError> {
        let now = fmt_datetime(Utc::now());
        self.conn()
            .execute(
                "INSERT INTO pr_action_audits (user_id, idempotency_key, action, provider, \
                 git_domain, repo_full_name, base_branch, head_branch, decision, request_json, \
                 created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'error', ?9, ?10, ?10)",
                params![
                    new.user_id,
                    new.idempotency_key.clone(),
                    new.action,
                    new.provider,
                    new.git_domain,
                    new.repo_full_name,
                    new.base_branch,
                    new.head_branch,
                    new.request_json,
                    now
                ],
            )
            .await
            .map_err(query_err)?;

        self.get_audit(new.user_id, &new.idempotency_key)
            .await?
            .ok_or(DatabaseError::NotFound {
                entity: "pr_action_audit".into(),
                id: new.idempotency_key,
            })
    }

    async fn get_audit(
        &self,
        user_id: i64,
        idempotency_key: &str,
    ) -> Result<Option<PrActionAudit>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {AUDIT_COLUMNS} FROM pr_action_audits \
                     WHERE user_id = ?1 AND idempotency_key = ?2"
                ),
                params![user_id, idempotency_key],
            )
            .await
            .map_err(query_err)?;
        match rows.next().await.map_err(query_err)? {
            Some(row) => Ok(Some(row_to_audit(&row).map_err(query_err)?)),
            None => Ok(None),
        }
    }

    async fn update_audit_decision(
        &self,
        audit_id: i64,
        decision: AuditDecision,
        policy_code: &str,
        policy_message: &str,
        pr_number: Option<i64>,
        pr_url: Option<&str>,
        response_json: Option<&str>,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE pr_action_audits SET decision = ?1, policy_code = ?2, \
                 policy_message = ?3, pr_number = ?4, pr_url = ?5, response_json = ?6, \
                 updated_at = ?7 WHERE id = ?8",
                params![
                    decision.as_str(),
                    policy_code,
                    policy_message,
                    pr_number,
                    pr_url.map(|s| s.to_string()),
                    response_json.map(|s| s.to_string()),
                    fmt_datetime(Utc::now()),
                    audit_id
                ],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    // ── Artifacts ───────────────────────────────────────────────────

    async fn insert_artifact(
        &self,
        user_id: i64,
        subtask_id: i64,
        filename: &str,
        data: &[u8],
    ) -> Result<i64, DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO artifacts (user_id, subtask_id, filename, size, data, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    user_id,
                    subtask_id,
                    filename,
                    data.len() as i64,
                    data.to_vec(),
                    fmt_datetime(Utc::now())
                ],
            )
            .await
            .map_err(query_err)?;
        Ok(self.conn().last_insert_rowid())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{SubtaskRole, TaskStatus};

    async fn memory_store() -> LibSqlStore {
        LibSqlStore::new_memory().await.unwrap()
    }

    fn pending_doc() -> TaskStatusDoc {
        TaskStatusDoc::pending(Utc::now())
    }

    #[tokio::test]
    async fn schema_is_idempotent() {
        let store = memory_store().await;
        store.init_schema().await.unwrap();
    }

    #[tokio::test]
    async fn task_round_trip() {
        let store = memory_store().await;
        let labels = TaskLabels {
            local_runner_id: Some("r1".into()),
            local_workspace_id: Some("ws".into()),
            task_type: "local".into(),
            model: None,
        };
        let task = store
            .insert_task(1, "demo", &labels, &pending_doc())
            .await
            .unwrap();

        let loaded = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(loaded.title, "demo");
        assert_eq!(loaded.labels.local_runner_id.as_deref(), Some("r1"));
        assert_eq!(loaded.status.status, TaskStatus::Pending);
        assert!(loaded.is_assigned_to_runner("r1"));
    }

    #[tokio::test]
    async fn subtask_message_ids_and_user_lookup() {
        let store = memory_store().await;
        let task = store
            .insert_task(1, "t", &TaskLabels::default(), &pending_doc())
            .await
            .unwrap();

        assert_eq!(store.max_message_id(task.id).await.unwrap(), 0);

        store
            .insert_subtask(NewSubtask {
                user_id: 1,
                task_id: task.id,
                title: "user".into(),
                role: SubtaskRole::User,
                status: SubtaskStatus::Completed,
                progress: 100,
                message_id: 1,
                parent_id: 0,
                prompt: "hello".into(),
                result: ResultDoc::new(),
            })
            .await
            .unwrap();

        assert_eq!(store.max_message_id(task.id).await.unwrap(), 1);

        let found = store.find_user_subtask(task.id, 1).await.unwrap().unwrap();
        assert_eq!(found.prompt, "hello");
        assert!(store.find_user_subtask(task.id, 2).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_audit_insert_is_a_constraint_error() {
        let store = memory_store().await;
        let new = NewAudit {
            user_id: 1,
            idempotency_key: "k1".into(),
            action: "create_pr".into(),
            provider: "github".into(),
            git_domain: "github.com".into(),
            repo_full_name: "octo/repo".into(),
            base_branch: "main".into(),
            head_branch: "feature".into(),
            request_json: "{}".into(),
        };
        store.insert_audit(new.clone()).await.unwrap();

        match store.insert_audit(new).await {
            Err(DatabaseError::Constraint(_)) => {}
            other => panic!("expected constraint violation, got {other:?}"),
        }
    }
}
