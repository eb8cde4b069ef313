//! Backend-agnostic `Store` trait — single async interface for all
//! persistence. Row-level uniqueness constraints (subtask id,
//! `(user, idempotency_key)`) are the only cross-request coordination
//! primitive in the system.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::DatabaseError;
use crate::model::{
    AuditDecision, LocalRunner, PrActionAudit, ResultDoc, Subtask, SubtaskRole, SubtaskStatus,
    Task, TaskLabels, TaskStatusDoc, User,
};

/// Fields for inserting a new subtask row.
#[derive(Debug, Clone)]
pub struct NewSubtask {
    pub user_id: i64,
    pub task_id: i64,
    pub title: String,
    pub role: SubtaskRole,
    pub status: SubtaskStatus,
    pub progress: u8,
    pub message_id: i64,
    pub parent_id: i64,
    pub prompt: String,
    pub result: ResultDoc,
}

/// Mutation applied to a subtask by a callback update.
#[derive(Debug, Clone)]
pub struct SubtaskExecutionUpdate {
    pub subtask_id: i64,
    pub status: SubtaskStatus,
    pub progress: u8,
    pub result: ResultDoc,
    pub error_message: String,
    pub executor_name: Option<String>,
    pub executor_namespace: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// Fields for inserting a new PR action audit placeholder row.
#[derive(Debug, Clone)]
pub struct NewAudit {
    pub user_id: i64,
    pub idempotency_key: String,
    pub action: String,
    pub provider: String,
    pub git_domain: String,
    pub repo_full_name: String,
    pub base_branch: String,
    pub head_branch: String,
    /// Already masked by the caller.
    pub request_json: String,
}

/// Unified persistence interface.
#[async_trait]
pub trait Store: Send + Sync {
    // ── Users ───────────────────────────────────────────────────────

    /// Insert a user, or return the existing row for the username.
    async fn upsert_user(&self, username: &str, api_key: &str) -> Result<User, DatabaseError>;

    async fn find_user_by_api_key(&self, api_key: &str) -> Result<Option<User>, DatabaseError>;

    // ── Tasks ───────────────────────────────────────────────────────

    async fn insert_task(
        &self,
        user_id: i64,
        title: &str,
        labels: &TaskLabels,
        status: &TaskStatusDoc,
    ) -> Result<Task, DatabaseError>;

    async fn get_task(&self, task_id: i64) -> Result<Option<Task>, DatabaseError>;

    /// Persist a task's status document (and the denormalized status
    /// column used by dispatch filtering).
    async fn update_task_status(
        &self,
        task_id: i64,
        status: &TaskStatusDoc,
    ) -> Result<(), DatabaseError>;

    // ── Subtasks ────────────────────────────────────────────────────

    async fn insert_subtask(&self, new: NewSubtask) -> Result<Subtask, DatabaseError>;

    async fn get_subtask(&self, subtask_id: i64) -> Result<Option<Subtask>, DatabaseError>;

    /// Highest message id assigned so far in the task (0 when empty).
    async fn max_message_id(&self, task_id: i64) -> Result<i64, DatabaseError>;

    async fn list_task_subtasks(&self, task_id: i64) -> Result<Vec<Subtask>, DatabaseError>;

    /// Resolve a USER subtask through the `(task_id, message_id)` secondary
    /// index. This is the message-id indirection: `parent_id` stores a
    /// message id, not a row id.
    async fn find_user_subtask(
        &self,
        task_id: i64,
        message_id: i64,
    ) -> Result<Option<Subtask>, DatabaseError>;

    /// Most recent USER subtask strictly before `message_id` — fallback for
    /// conversation shapes where sibling rows share their parent id.
    async fn latest_user_subtask_before(
        &self,
        task_id: i64,
        message_id: i64,
    ) -> Result<Option<Subtask>, DatabaseError>;

    /// Claimable ASSISTANT subtasks for a runner: the owning task must be
    /// active, labeled `type=local`, pinned to this runner, and itself in a
    /// dispatchable status (PENDING/RUNNING — a FAILED task hides its
    /// subtasks until a retry resets it).
    async fn claimable_subtasks(
        &self,
        user_id: i64,
        runner_id: &str,
        status: SubtaskStatus,
        limit: u32,
    ) -> Result<Vec<Subtask>, DatabaseError>;

    /// Persist one callback: the subtask mutation and the recomputed task
    /// status document commit together or not at all.
    async fn persist_callback(
        &self,
        update: &SubtaskExecutionUpdate,
        task_id: i64,
        task_status: &TaskStatusDoc,
    ) -> Result<(), DatabaseError>;

    /// Reset a subtask for retry: PENDING, progress 0, cleared error and
    /// executor assignment, replacement result document.
    async fn reset_subtask(
        &self,
        subtask_id: i64,
        result: &ResultDoc,
        now: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    /// Retry reset: the subtask reset and the task's return to PENDING
    /// commit together or not at all.
    async fn reset_for_retry(
        &self,
        subtask_id: i64,
        result: &ResultDoc,
        task_id: i64,
        task_status: &TaskStatusDoc,
        now: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    // ── Local runners ───────────────────────────────────────────────

    async fn get_runner(
        &self,
        user_id: i64,
        runner_id: &str,
    ) -> Result<Option<LocalRunner>, DatabaseError>;

    async fn insert_runner(&self, runner: &LocalRunner) -> Result<(), DatabaseError>;

    async fn update_runner_heartbeat(
        &self,
        user_id: i64,
        runner_id: &str,
        name: Option<&str>,
        capabilities: &Value,
        workspaces: &Value,
        now: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    async fn list_runners(&self, user_id: i64) -> Result<Vec<LocalRunner>, DatabaseError>;

    /// Flip a runner's disabled flag. Runners are disabled, never deleted.
    async fn set_runner_disabled(
        &self,
        user_id: i64,
        runner_id: &str,
        disabled: bool,
    ) -> Result<(), DatabaseError>;

    // ── PR action audits ────────────────────────────────────────────

    /// Insert a placeholder audit row (decision=error). Returns
    /// `DatabaseError::Constraint` when another request already holds the
    /// `(user, idempotency_key)` slot — callers re-read and replay.
    async fn insert_audit(&self, new: NewAudit) -> Result<PrActionAudit, DatabaseError>;

    async fn get_audit(
        &self,
        user_id: i64,
        idempotency_key: &str,
    ) -> Result<Option<PrActionAudit>, DatabaseError>;

    /// Move an audit row to its terminal decision. Called exactly once per
    /// row on the success/denial path.
    #[allow(clippy::too_many_arguments)]
    async fn update_audit_decision(
        &self,
        audit_id: i64,
        decision: AuditDecision,
        policy_code: &str,
        policy_message: &str,
        pr_number: Option<i64>,
        pr_url: Option<&str>,
        response_json: Option<&str>,
    ) -> Result<(), DatabaseError>;

    // ── Artifacts ───────────────────────────────────────────────────

    /// Store an uploaded artifact, returning its id.
    async fn insert_artifact(
        &self,
        user_id: i64,
        subtask_id: i64,
        filename: &str,
        data: &[u8],
    ) -> Result<i64, DatabaseError>;
}
