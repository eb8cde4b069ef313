//! Task creation and conversation append — fan-out into subtask pairs.

use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;
use tracing::info;

use crate::error::TaskError;
use crate::model::{
    ResultDoc, Subtask, SubtaskRole, SubtaskStatus, Task, TaskLabels, TaskStatusDoc, User,
};
use crate::store::{NewSubtask, Store};

/// Request to create a task or append a message to an existing one.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateTaskRequest {
    /// When set, append to this task instead of creating a new one.
    pub task_id: Option<i64>,
    pub title: Option<String>,
    pub prompt: String,
    #[serde(default)]
    pub labels: Option<TaskLabels>,
}

/// Task lifecycle service.
pub struct TaskService {
    store: Arc<dyn Store>,
}

impl TaskService {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Create a task on the first message, or append a new USER/ASSISTANT
    /// subtask pair on a follow-up.
    ///
    /// Appending resets the task status document to PENDING and clears
    /// error/result/completedAt even if the task had previously failed —
    /// execution pollers only fetch dispatchable tasks, so a stale FAILED
    /// status would strand the new message.
    pub async fn create_or_append(
        &self,
        user: &User,
        req: CreateTaskRequest,
    ) -> Result<(Task, Subtask, Subtask), TaskError> {
        let now = Utc::now();

        let task = match req.task_id {
            Some(task_id) => {
                let mut task = self
                    .store
                    .get_task(task_id)
                    .await?
                    .ok_or(TaskError::NotFound(task_id))?;
                if task.user_id != user.id {
                    return Err(TaskError::NotFound(task_id));
                }
                task.status.reset_to_pending(now);
                self.store.update_task_status(task.id, &task.status).await?;
                task
            }
            None => {
                let title = req
                    .title
                    .clone()
                    .unwrap_or_else(|| truncate_title(&req.prompt));
                let labels = req.labels.clone().unwrap_or_default();
                self.store
                    .insert_task(user.id, &title, &labels, &TaskStatusDoc::pending(now))
                    .await?
            }
        };

        // Message ids are monotonic per task; both rows of a turn reference
        // the triggering message through parent_id (a message id, not a
        // row id).
        let prev_max = self.store.max_message_id(task.id).await?;
        let user_message_id = prev_max + 1;

        let user_subtask = self
            .store
            .insert_subtask(NewSubtask {
                user_id: user.id,
                task_id: task.id,
                title: truncate_title(&req.prompt),
                role: SubtaskRole::User,
                status: SubtaskStatus::Completed,
                progress: 100,
                message_id: user_message_id,
                parent_id: prev_max,
                prompt: req.prompt.clone(),
                result: ResultDoc::new(),
            })
            .await?;

        let assistant_subtask = self
            .store
            .insert_subtask(NewSubtask {
                user_id: user.id,
                task_id: task.id,
                title: format!("reply to #{user_message_id}"),
                role: SubtaskRole::Assistant,
                status: SubtaskStatus::Pending,
                progress: 0,
                message_id: user_message_id + 1,
                parent_id: user_message_id,
                prompt: String::new(),
                result: ResultDoc::new(),
            })
            .await?;

        info!(
            task_id = task.id,
            user_message_id,
            appended = req.task_id.is_some(),
            "Task message fan-out"
        );

        Ok((task, user_subtask, assistant_subtask))
    }
}

fn truncate_title(prompt: &str) -> String {
    let trimmed = prompt.trim();
    if trimmed.chars().count() <= 64 {
        trimmed.to_string()
    } else {
        trimmed.chars().take(64).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TaskStatus;
    use crate::store::LibSqlStore;

    async fn setup() -> (Arc<dyn Store>, User) {
        let store: Arc<dyn Store> = Arc::new(LibSqlStore::new_memory().await.unwrap());
        let user = store.upsert_user("tester", "key-1").await.unwrap();
        (store, user)
    }

    #[tokio::test]
    async fn create_fans_out_user_assistant_pair() {
        let (store, user) = setup().await;
        let svc = TaskService::new(Arc::clone(&store));

        let (task, user_st, asst_st) = svc
            .create_or_append(
                &user,
                CreateTaskRequest {
                    task_id: None,
                    title: Some("demo".into()),
                    prompt: "hello".into(),
                    labels: None,
                },
            )
            .await
            .unwrap();

        assert_eq!(user_st.message_id, 1);
        assert_eq!(user_st.parent_id, 0);
        assert_eq!(user_st.status, SubtaskStatus::Completed);
        assert_eq!(asst_st.message_id, 2);
        assert_eq!(asst_st.parent_id, 1);
        assert_eq!(asst_st.status, SubtaskStatus::Pending);
        assert_eq!(task.status.status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn append_resets_failed_task_to_pending() {
        let (store, user) = setup().await;
        let svc = TaskService::new(Arc::clone(&store));

        let (task, _, _) = svc
            .create_or_append(
                &user,
                CreateTaskRequest {
                    task_id: None,
                    title: None,
                    prompt: "first".into(),
                    labels: None,
                },
            )
            .await
            .unwrap();

        // Simulate a failed run.
        let mut doc = task.status.clone();
        doc.status = TaskStatus::Failed;
        doc.progress = 100;
        doc.error_message = Some("previous error".into());
        doc.result = Some(serde_json::json!({"foo": "bar"}));
        doc.completed_at = Some(Utc::now());
        store.update_task_status(task.id, &doc).await.unwrap();

        let (_, user_st, asst_st) = svc
            .create_or_append(
                &user,
                CreateTaskRequest {
                    task_id: Some(task.id),
                    title: None,
                    prompt: "new message".into(),
                    labels: None,
                },
            )
            .await
            .unwrap();

        let reloaded = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(reloaded.status.status, TaskStatus::Pending);
        assert_eq!(reloaded.status.progress, 0);
        assert!(reloaded.status.error_message.is_none());
        assert!(reloaded.status.result.is_none());
        assert!(reloaded.status.completed_at.is_none());

        // Message ids keep climbing across turns.
        assert_eq!(user_st.message_id, 3);
        assert_eq!(user_st.parent_id, 2);
        assert_eq!(asst_st.message_id, 4);
        assert_eq!(asst_st.parent_id, 3);
    }

    #[tokio::test]
    async fn append_to_foreign_task_is_rejected() {
        let (store, user) = setup().await;
        let other = store.upsert_user("other", "key-2").await.unwrap();
        let svc = TaskService::new(Arc::clone(&store));

        let (task, _, _) = svc
            .create_or_append(
                &user,
                CreateTaskRequest {
                    task_id: None,
                    title: None,
                    prompt: "mine".into(),
                    labels: None,
                },
            )
            .await
            .unwrap();

        let err = svc
            .create_or_append(
                &other,
                CreateTaskRequest {
                    task_id: Some(task.id),
                    title: None,
                    prompt: "theirs".into(),
                    labels: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::NotFound(_)));
    }
}
