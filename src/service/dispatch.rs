//! Dispatch service — hands pending work to executors and ingests their
//! callback updates.
//!
//! Claiming does NOT mark a subtask RUNNING; the runner's first callback
//! does. A runner that crashes before calling back leaves the subtask
//! visibly PENDING and it will be redispatched (at-least-once delivery).

use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::DispatchError;
use crate::model::{
    ResultDoc, RetryMode, ShellKind, Subtask, SubtaskStatus, Task, TaskStatus,
};
use crate::progress::calculate_task_progress;
use crate::service::merge::merge_result;
use crate::store::{Store, SubtaskExecutionUpdate};

/// Status reported by an executor callback.
///
/// `CANCELLED` exists on the wire but not in the subtask state machine: it
/// persists as a COMPLETED subtask (cancellation is success-shaped for end
/// users) while the owning task is marked CANCELLED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CallbackStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl CallbackStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    fn subtask_status(self) -> SubtaskStatus {
        match self {
            Self::Pending => SubtaskStatus::Pending,
            Self::Running => SubtaskStatus::Running,
            Self::Completed | Self::Cancelled => SubtaskStatus::Completed,
            Self::Failed => SubtaskStatus::Failed,
        }
    }
}

/// Callback update body (`PUT /dispatch/tasks`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubtaskExecutorUpdate {
    pub subtask_id: i64,
    pub status: CallbackStatus,
    pub progress: u8,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub executor_name: Option<String>,
    #[serde(default)]
    pub executor_namespace: Option<String>,
}

/// One claimable unit of work handed to a polling runner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimedTask {
    pub subtask_id: i64,
    pub task_id: i64,
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_workspace_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resume_session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_mode: Option<RetryMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchResponse {
    pub tasks: Vec<ClaimedTask>,
}

/// Subtask view returned after a callback update.
#[derive(Debug, Clone, Serialize)]
pub struct SubtaskView {
    pub id: i64,
    pub task_id: i64,
    pub role: String,
    pub status: SubtaskStatus,
    pub progress: u8,
    pub message_id: i64,
    pub result: Value,
    pub error_message: String,
    pub executor_name: Option<String>,
    pub executor_namespace: Option<String>,
}

impl SubtaskView {
    pub fn from_subtask(subtask: Subtask) -> Self {
        Self {
            id: subtask.id,
            task_id: subtask.task_id,
            role: subtask.role.as_str().to_string(),
            status: subtask.status,
            progress: subtask.progress,
            message_id: subtask.message_id,
            result: subtask.result.into_value(),
            error_message: subtask.error_message,
            executor_name: subtask.executor_name,
            executor_namespace: subtask.executor_namespace,
        }
    }
}

/// Dispatch + callback ingestion service.
pub struct DispatchService {
    store: Arc<dyn Store>,
    resume_enabled: bool,
}

impl DispatchService {
    pub fn new(store: Arc<dyn Store>, resume_enabled: bool) -> Self {
        Self {
            store,
            resume_enabled,
        }
    }

    /// Claim up to `limit` subtasks for a registered, non-disabled runner.
    pub async fn dispatch_tasks(
        &self,
        user_id: i64,
        runner_id: &str,
        status: SubtaskStatus,
        limit: u32,
    ) -> Result<DispatchResponse, DispatchError> {
        let runner = self
            .store
            .get_runner(user_id, runner_id)
            .await?
            .ok_or_else(|| DispatchError::RunnerNotFound(runner_id.to_string()))?;
        if runner.disabled {
            return Err(DispatchError::RunnerDisabled(runner_id.to_string()));
        }

        let subtasks = self
            .store
            .claimable_subtasks(user_id, runner_id, status, limit)
            .await?;

        let claims = join_all(subtasks.iter().map(|subtask| async move {
            let Some(task) = self.store.get_task(subtask.task_id).await? else {
                return Ok(None);
            };
            self.format_claim(&task, subtask).await.map(Some)
        }))
        .await;

        let mut tasks = Vec::with_capacity(subtasks.len());
        for claim in claims {
            if let Some(claim) = claim? {
                tasks.push(claim);
            }
        }

        Ok(DispatchResponse { tasks })
    }

    /// Build the claim payload for one subtask, resolving the prompt via
    /// the message-id indirection and sanitizing session fields per the
    /// resume kill-switch.
    async fn format_claim(
        &self,
        task: &Task,
        subtask: &Subtask,
    ) -> Result<ClaimedTask, DispatchError> {
        let user_subtask = match self
            .store
            .find_user_subtask(task.id, subtask.parent_id)
            .await?
        {
            Some(found) => Some(found),
            None => {
                self.store
                    .latest_user_subtask_before(task.id, subtask.message_id)
                    .await?
            }
        };
        let prompt = user_subtask.map(|s| s.prompt).unwrap_or_default();

        let result = &subtask.result;
        let shell = result.shell_type();
        let mut retry_mode = result.retry_mode();
        let mut resume_session_id = result
            .session_token(ShellKind::Codex)
            .map(|s| s.to_string());
        let mut session_id = result
            .session_token(ShellKind::ClaudeCode)
            .map(|s| s.to_string());

        // The kill-switch wins over whatever the stored result says: force
        // a cold start and never leak a stale token to the executor.
        if !self.resume_enabled {
            retry_mode = Some(RetryMode::NewSession);
            resume_session_id = None;
            session_id = match shell {
                Some(ShellKind::ClaudeCode) => Some(Uuid::new_v4().to_string()),
                _ => None,
            };
        }

        Ok(ClaimedTask {
            subtask_id: subtask.id,
            task_id: task.id,
            prompt,
            local_workspace_id: task.labels.local_workspace_id.clone(),
            resume_session_id,
            session_id,
            retry_mode,
            model: task.labels.model.clone(),
        })
    }

    /// Apply an executor callback: authorize, merge, recompute, persist.
    ///
    /// Authorization fails closed — a disabled or unassigned runner is
    /// rejected before any row is mutated.
    pub async fn update_subtask(
        &self,
        user_id: i64,
        runner_id: &str,
        update: SubtaskExecutorUpdate,
    ) -> Result<SubtaskView, DispatchError> {
        let runner = self
            .store
            .get_runner(user_id, runner_id)
            .await?
            .ok_or_else(|| DispatchError::RunnerNotFound(runner_id.to_string()))?;
        if runner.disabled {
            return Err(DispatchError::RunnerDisabled(runner_id.to_string()));
        }

        let subtask = self
            .store
            .get_subtask(update.subtask_id)
            .await?
            .ok_or(DispatchError::SubtaskNotFound(update.subtask_id))?;
        let task = self
            .store
            .get_task(subtask.task_id)
            .await?
            .ok_or(DispatchError::TaskNotFound(subtask.task_id))?;

        if task.user_id != user_id || !task.is_assigned_to_runner(runner_id) {
            return Err(DispatchError::NotAssigned {
                subtask_id: update.subtask_id,
                runner_id: runner_id.to_string(),
            });
        }

        self.apply_update(task, subtask, runner_id, update).await
    }

    /// Verify the runner's claim on an artifact target without mutating
    /// anything. Shares the dispatch authorization gate.
    pub async fn authorize_artifact_upload(
        &self,
        user_id: i64,
        runner_id: &str,
        subtask_id: i64,
    ) -> Result<Subtask, DispatchError> {
        let runner = self
            .store
            .get_runner(user_id, runner_id)
            .await?
            .ok_or_else(|| DispatchError::RunnerNotFound(runner_id.to_string()))?;
        if runner.disabled {
            return Err(DispatchError::RunnerDisabled(runner_id.to_string()));
        }

        let subtask = self
            .store
            .get_subtask(subtask_id)
            .await?
            .ok_or(DispatchError::SubtaskNotFound(subtask_id))?;
        let task = self
            .store
            .get_task(subtask.task_id)
            .await?
            .ok_or(DispatchError::TaskNotFound(subtask.task_id))?;
        if task.user_id != user_id || !task.is_assigned_to_runner(runner_id) {
            return Err(DispatchError::NotAssigned {
                subtask_id,
                runner_id: runner_id.to_string(),
            });
        }
        Ok(subtask)
    }

    async fn apply_update(
        &self,
        mut task: Task,
        subtask: Subtask,
        runner_id: &str,
        update: SubtaskExecutorUpdate,
    ) -> Result<SubtaskView, DispatchError> {
        let now = Utc::now();
        let incoming = ResultDoc::from_value(update.result.clone().unwrap_or(Value::Null));
        let merged = merge_result(&subtask.result, &incoming);

        let terminal = update.status.is_terminal();
        let new_status = update.status.subtask_status();
        let progress = if terminal {
            100
        } else {
            update.progress.min(99)
        };
        let error_message = if update.status == CallbackStatus::Failed {
            merged.error().unwrap_or("execution failed").to_string()
        } else {
            subtask.error_message.clone()
        };

        let execution_update = SubtaskExecutionUpdate {
            subtask_id: subtask.id,
            status: new_status,
            progress,
            result: merged.clone(),
            error_message,
            executor_name: update
                .executor_name
                .clone()
                .or_else(|| Some(runner_id.to_string())),
            executor_namespace: update
                .executor_namespace
                .clone()
                .or_else(|| Some("local-runner".to_string())),
            completed_at: if terminal {
                Some(now)
            } else {
                subtask.completed_at
            },
            updated_at: now,
        };

        self.recompute_task_status(&mut task, subtask.id, new_status, update.status, progress, &merged)
            .await?;

        // One transaction: the subtask mutation and the task's recomputed
        // status document land together.
        self.store
            .persist_callback(&execution_update, task.id, &task.status)
            .await?;

        info!(
            subtask_id = subtask.id,
            task_id = task.id,
            status = ?update.status,
            progress,
            "Subtask callback applied"
        );

        let updated = self
            .store
            .get_subtask(subtask.id)
            .await?
            .ok_or(DispatchError::SubtaskNotFound(subtask.id))?;
        Ok(SubtaskView::from_subtask(updated))
    }

    /// Recompute the task's aggregate status document from its assistant
    /// subtasks, with the in-flight callback substituted for the stored
    /// row it is about to replace.
    async fn recompute_task_status(
        &self,
        task: &mut Task,
        updated_subtask_id: i64,
        new_subtask_status: SubtaskStatus,
        callback_status: CallbackStatus,
        subtask_progress: u8,
        merged: &ResultDoc,
    ) -> Result<(), DispatchError> {
        let subtasks = self.store.list_task_subtasks(task.id).await?;
        let statuses: Vec<SubtaskStatus> = subtasks
            .iter()
            .filter(|s| s.role == crate::model::SubtaskRole::Assistant)
            .map(|s| {
                if s.id == updated_subtask_id {
                    new_subtask_status
                } else {
                    s.status
                }
            })
            .collect();
        let total = statuses.len() as u32;
        let completed = statuses.iter().filter(|s| s.is_terminal()).count() as u32;
        let all_terminal = total > 0 && completed == total;

        let now = Utc::now();
        let previous = task.status.progress;

        let next_status = if callback_status == CallbackStatus::Cancelled {
            TaskStatus::Cancelled
        } else if callback_status == CallbackStatus::Failed {
            TaskStatus::Failed
        } else if all_terminal {
            TaskStatus::Completed
        } else {
            TaskStatus::Running
        };

        let running_progress = if callback_status.is_terminal() {
            0
        } else {
            subtask_progress
        };

        task.status.status = next_status;
        task.status.progress =
            calculate_task_progress(total, completed, running_progress, previous, next_status);
        task.status.updated_at = now;

        match next_status {
            TaskStatus::Failed => {
                task.status.status_phase = Some("failed".into());
                task.status.error_message =
                    Some(merged.error().unwrap_or("execution failed").to_string());
                task.status.completed_at = Some(now);
            }
            TaskStatus::Completed | TaskStatus::Cancelled => {
                task.status.status_phase = Some("completed".into());
                task.status.error_message = None;
                task.status.result = merged
                    .value()
                    .map(|v| Value::String(v.to_string()));
                task.status.completed_at = Some(now);
            }
            _ => {
                task.status.status_phase = Some("executing".into());
            }
        }

        if task.status.status.is_terminal() && !all_terminal {
            // A failure/cancel terminates the task even while sibling
            // subtasks are still open; note it for diagnosis.
            warn!(
                task_id = task.id,
                subtask_id = updated_subtask_id,
                "Task reached terminal status with non-terminal siblings"
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{TaskLabels, User};
    use crate::service::tasks::{CreateTaskRequest, TaskService};
    use crate::store::LibSqlStore;
    use serde_json::json;

    struct Fixture {
        store: Arc<dyn Store>,
        user: User,
        task_id: i64,
        subtask_id: i64,
    }

    async fn setup(resume_enabled: bool) -> (DispatchService, Fixture) {
        let store: Arc<dyn Store> = Arc::new(LibSqlStore::new_memory().await.unwrap());
        let user = store.upsert_user("tester", "key-1").await.unwrap();

        // Register runner r1 via the heartbeat path.
        let runners = crate::service::runners::RunnerService::new(Arc::clone(&store));
        runners
            .heartbeat(
                user.id,
                crate::service::runners::HeartbeatRequest {
                    runner_id: "r1".into(),
                    name: None,
                    version: None,
                    capabilities: Default::default(),
                    workspaces: vec![],
                },
            )
            .await
            .unwrap();

        let tasks = TaskService::new(Arc::clone(&store));
        let (task, _, asst) = tasks
            .create_or_append(
                &user,
                CreateTaskRequest {
                    task_id: None,
                    title: Some("demo".into()),
                    prompt: "do the thing".into(),
                    labels: Some(TaskLabels {
                        model: None,
                        local_runner_id: Some("r1".into()),
                        local_workspace_id: Some("ws-1".into()),
                        task_type: "local".into(),
                    }),
                },
            )
            .await
            .unwrap();

        let svc = DispatchService::new(Arc::clone(&store), resume_enabled);
        (
            svc,
            Fixture {
                store,
                user,
                task_id: task.id,
                subtask_id: asst.id,
            },
        )
    }

    #[tokio::test]
    async fn dispatch_returns_pending_subtask_with_prompt() {
        let (svc, fx) = setup(true).await;

        let resp = svc
            .dispatch_tasks(fx.user.id, "r1", SubtaskStatus::Pending, 10)
            .await
            .unwrap();

        assert_eq!(resp.tasks.len(), 1);
        let claim = &resp.tasks[0];
        assert_eq!(claim.subtask_id, fx.subtask_id);
        assert_eq!(claim.task_id, fx.task_id);
        assert_eq!(claim.prompt, "do the thing");
        assert_eq!(claim.local_workspace_id.as_deref(), Some("ws-1"));

        // Claiming does not mark RUNNING.
        let st = fx.store.get_subtask(fx.subtask_id).await.unwrap().unwrap();
        assert_eq!(st.status, SubtaskStatus::Pending);
    }

    #[tokio::test]
    async fn dispatch_for_unknown_runner_is_rejected() {
        let (svc, fx) = setup(true).await;
        let err = svc
            .dispatch_tasks(fx.user.id, "ghost", SubtaskStatus::Pending, 1)
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::RunnerNotFound(_)));
    }

    #[tokio::test]
    async fn resume_flag_disabled_sanitizes_codex_claim() {
        let (svc, fx) = setup(false).await;
        fx.store
            .reset_subtask(
                fx.subtask_id,
                &ResultDoc::from_value(json!({
                    "shell_type": "Codex",
                    "retry_mode": "resume",
                    "resume_session_id": "thread_123",
                })),
                Utc::now(),
            )
            .await
            .unwrap();

        let resp = svc
            .dispatch_tasks(fx.user.id, "r1", SubtaskStatus::Pending, 1)
            .await
            .unwrap();
        let claim = &resp.tasks[0];

        assert_eq!(claim.retry_mode, Some(RetryMode::NewSession));
        assert!(claim.resume_session_id.is_none());
    }

    #[tokio::test]
    async fn resume_flag_disabled_mints_claude_session() {
        let (svc, fx) = setup(false).await;
        fx.store
            .reset_subtask(
                fx.subtask_id,
                &ResultDoc::from_value(json!({
                    "shell_type": "ClaudeCode",
                    "retry_mode": "resume",
                    "session_id": "session_old",
                })),
                Utc::now(),
            )
            .await
            .unwrap();

        let resp = svc
            .dispatch_tasks(fx.user.id, "r1", SubtaskStatus::Pending, 1)
            .await
            .unwrap();
        let claim = &resp.tasks[0];

        assert_eq!(claim.retry_mode, Some(RetryMode::NewSession));
        let session_id = claim.session_id.as_deref().unwrap();
        assert_ne!(session_id, "session_old");
        Uuid::parse_str(session_id).unwrap();
    }

    #[tokio::test]
    async fn update_merges_events_and_recomputes_progress() {
        let (svc, fx) = setup(true).await;
        fx.store
            .reset_subtask(
                fx.subtask_id,
                &ResultDoc::from_value(json!({
                    "shell_type": "Codex",
                    "value": "",
                    "codex_events": [{"type": "init"}],
                })),
                Utc::now(),
            )
            .await
            .unwrap();

        let view = svc
            .update_subtask(
                fx.user.id,
                "r1",
                SubtaskExecutorUpdate {
                    subtask_id: fx.subtask_id,
                    status: CallbackStatus::Running,
                    progress: 10,
                    result: Some(json!({"value": "hello", "codex_event": {"type": "tick"}})),
                    executor_name: None,
                    executor_namespace: None,
                },
            )
            .await
            .unwrap();

        assert_eq!(view.status, SubtaskStatus::Running);
        assert_eq!(view.result["shell_type"], "Codex");
        let types: Vec<_> = view.result["codex_events"]
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["type"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(types, ["init", "tick"]);
        assert_eq!(view.executor_name.as_deref(), Some("r1"));

        let task = fx.store.get_task(fx.task_id).await.unwrap().unwrap();
        assert_eq!(task.status.status, TaskStatus::Running);
        assert!(task.status.progress > 0);
        assert!(task.status.progress < 100);
    }

    #[tokio::test]
    async fn terminal_update_completes_task_and_forces_100() {
        let (svc, fx) = setup(true).await;

        let view = svc
            .update_subtask(
                fx.user.id,
                "r1",
                SubtaskExecutorUpdate {
                    subtask_id: fx.subtask_id,
                    status: CallbackStatus::Completed,
                    progress: 42, // terminal forcing ignores this
                    result: Some(json!({"value": "final answer"})),
                    executor_name: None,
                    executor_namespace: None,
                },
            )
            .await
            .unwrap();

        assert_eq!(view.status, SubtaskStatus::Completed);
        assert_eq!(view.progress, 100);

        let task = fx.store.get_task(fx.task_id).await.unwrap().unwrap();
        assert_eq!(task.status.status, TaskStatus::Completed);
        assert_eq!(task.status.progress, 100);
        assert!(task.status.completed_at.is_some());
    }

    #[tokio::test]
    async fn failed_update_attaches_error_to_task() {
        let (svc, fx) = setup(true).await;

        svc.update_subtask(
            fx.user.id,
            "r1",
            SubtaskExecutorUpdate {
                subtask_id: fx.subtask_id,
                status: CallbackStatus::Failed,
                progress: 100,
                result: Some(json!({"error": "codex exited with code 1"})),
                executor_name: None,
                executor_namespace: None,
            },
        )
        .await
        .unwrap();

        let task = fx.store.get_task(fx.task_id).await.unwrap().unwrap();
        assert_eq!(task.status.status, TaskStatus::Failed);
        assert_eq!(task.status.progress, 100);
        assert_eq!(
            task.status.error_message.as_deref(),
            Some("codex exited with code 1")
        );
    }

    #[tokio::test]
    async fn cancelled_callback_is_success_shaped() {
        let (svc, fx) = setup(true).await;

        let view = svc
            .update_subtask(
                fx.user.id,
                "r1",
                SubtaskExecutorUpdate {
                    subtask_id: fx.subtask_id,
                    status: CallbackStatus::Cancelled,
                    progress: 100,
                    result: None,
                    executor_name: None,
                    executor_namespace: None,
                },
            )
            .await
            .unwrap();

        assert_eq!(view.status, SubtaskStatus::Completed);

        let task = fx.store.get_task(fx.task_id).await.unwrap().unwrap();
        assert_eq!(task.status.status, TaskStatus::Cancelled);
        assert_eq!(task.status.progress, 100);
    }

    #[tokio::test]
    async fn unassigned_runner_cannot_update() {
        let (svc, fx) = setup(true).await;

        // Register a second runner not assigned to the task.
        let runners = crate::service::runners::RunnerService::new(Arc::clone(&fx.store));
        runners
            .heartbeat(
                fx.user.id,
                crate::service::runners::HeartbeatRequest {
                    runner_id: "r2".into(),
                    name: None,
                    version: None,
                    capabilities: Default::default(),
                    workspaces: vec![],
                },
            )
            .await
            .unwrap();

        let err = svc
            .update_subtask(
                fx.user.id,
                "r2",
                SubtaskExecutorUpdate {
                    subtask_id: fx.subtask_id,
                    status: CallbackStatus::Running,
                    progress: 10,
                    result: None,
                    executor_name: None,
                    executor_namespace: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::NotAssigned { .. }));

        // Nothing was mutated.
        let st = fx.store.get_subtask(fx.subtask_id).await.unwrap().unwrap();
        assert_eq!(st.status, SubtaskStatus::Pending);
        let task = fx.store.get_task(fx.task_id).await.unwrap().unwrap();
        assert_eq!(task.status.status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn failed_task_hides_subtasks_until_retry_resets_it() {
        let (svc, fx) = setup(true).await;

        // Fail the run.
        svc.update_subtask(
            fx.user.id,
            "r1",
            SubtaskExecutorUpdate {
                subtask_id: fx.subtask_id,
                status: CallbackStatus::Failed,
                progress: 100,
                result: Some(json!({"error": "boom"})),
                executor_name: None,
                executor_namespace: None,
            },
        )
        .await
        .unwrap();

        let resp = svc
            .dispatch_tasks(fx.user.id, "r1", SubtaskStatus::Pending, 10)
            .await
            .unwrap();
        assert!(resp.tasks.is_empty());

        // Retry resets subtask + task; the work becomes claimable again.
        let retry = crate::service::retry::RetryService::new(Arc::clone(&fx.store), true);
        retry
            .retry_subtask(fx.user.id, fx.task_id, fx.subtask_id, RetryMode::Resume)
            .await
            .unwrap();

        let resp = svc
            .dispatch_tasks(fx.user.id, "r1", SubtaskStatus::Pending, 10)
            .await
            .unwrap();
        assert_eq!(resp.tasks.len(), 1);
        assert_eq!(resp.tasks[0].prompt, "do the thing");
    }

    #[tokio::test]
    async fn pending_task_invariant_progress_zero() {
        let (_, fx) = setup(true).await;
        let task = fx.store.get_task(fx.task_id).await.unwrap().unwrap();
        assert_eq!(task.status.status, TaskStatus::Pending);
        assert_eq!(task.status.progress, 0);
        assert!(task.status.completed_at.is_none());
    }
}
