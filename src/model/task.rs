//! Task — one user-visible unit of conversational work.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Task lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Terminal states force progress to 100 and stop dispatch.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "RUNNING" => Ok(Self::Running),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            "CANCELLED" => Ok(Self::Cancelled),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

/// The structured status document carried by every task.
///
/// Invariants: `PENDING` ⇒ `progress = 0, completed_at = None`; terminal
/// states ⇒ `progress = 100`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStatusDoc {
    pub status: TaskStatus,
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_phase: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl TaskStatusDoc {
    /// Fresh PENDING status document.
    pub fn pending(now: DateTime<Utc>) -> Self {
        Self {
            status: TaskStatus::Pending,
            progress: 0,
            status_phase: None,
            error_message: None,
            result: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// Reset back to PENDING so pollers pick the task up again.
    ///
    /// Clears error/result/completed_at even from a terminal state — a
    /// follow-up message or a retry must always re-enter the dispatch path.
    pub fn reset_to_pending(&mut self, now: DateTime<Utc>) {
        self.status = TaskStatus::Pending;
        self.progress = 0;
        self.status_phase = None;
        self.error_message = None;
        self.result = None;
        self.updated_at = now;
        self.completed_at = None;
    }
}

/// Task labels — routing and model-selection metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskLabels {
    /// Model override passed through to the agent CLI.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Which local runner this task is pinned to (`task_type = "local"`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_runner_id: Option<String>,
    /// Runner-local workspace the work executes in.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_workspace_id: Option<String>,
    /// Delivery model: "local" (polled by a runner) or "online" (container).
    #[serde(default = "default_task_type")]
    pub task_type: String,
}

fn default_task_type() -> String {
    "online".to_string()
}

/// One user-visible unit of work, owning an ordered subtask conversation.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: i64,
    pub user_id: i64,
    pub title: String,
    pub labels: TaskLabels,
    pub status: TaskStatusDoc,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// True when this task is routed to the given local runner.
    pub fn is_assigned_to_runner(&self, runner_id: &str) -> bool {
        self.labels.task_type == "local"
            && self.labels.local_runner_id.as_deref() == Some(runner_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_str() {
        for s in [
            TaskStatus::Pending,
            TaskStatus::Running,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Cancelled,
        ] {
            assert_eq!(s.as_str().parse::<TaskStatus>().unwrap(), s);
        }
    }

    #[test]
    fn reset_clears_terminal_fields() {
        let now = Utc::now();
        let mut doc = TaskStatusDoc::pending(now);
        doc.status = TaskStatus::Failed;
        doc.progress = 100;
        doc.error_message = Some("boom".into());
        doc.result = Some(serde_json::json!({"foo": "bar"}));
        doc.completed_at = Some(now);

        doc.reset_to_pending(now);

        assert_eq!(doc.status, TaskStatus::Pending);
        assert_eq!(doc.progress, 0);
        assert!(doc.error_message.is_none());
        assert!(doc.result.is_none());
        assert!(doc.completed_at.is_none());
    }
}
