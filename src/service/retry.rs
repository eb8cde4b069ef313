//! Retry / resume policy and the transactional subtask reset.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::TaskError;
use crate::model::{ResultDoc, RetryMode, ShellKind, Subtask, SubtaskRole};
use crate::store::Store;

/// Compute the sanitized result document for a subtask being reset.
///
/// Always preserves `shell_type` and records the effective `retry_mode`;
/// always discards `value`, `error` and `codex_events` so stale streamed
/// output cannot bleed into the next attempt.
///
/// The global `resume_enabled` kill-switch wins over caller intent: a
/// `resume` request with the flag off is forced to `new_session`. A new
/// session for a `ClaudeCode` shell mints a fresh UUID `session_id` so the
/// subprocess starts cold.
pub fn reset_result_for_retry(
    existing: &ResultDoc,
    retry_mode: RetryMode,
    shell_type: Option<ShellKind>,
    resume_enabled: bool,
) -> ResultDoc {
    let resolved_shell = shell_type.or_else(|| existing.shell_type());

    let effective_mode = if retry_mode == RetryMode::Resume && !resume_enabled {
        RetryMode::NewSession
    } else {
        retry_mode
    };

    let mut out = ResultDoc::new();
    if let Some(shell) = resolved_shell {
        out.set("shell_type", Value::String(shell.as_str().to_string()));
    }
    out.set(
        "retry_mode",
        Value::String(effective_mode.as_str().to_string()),
    );

    match effective_mode {
        RetryMode::Resume => {
            for key in ["resume_session_id", "session_id"] {
                if let Some(token) = existing.0.get(key).and_then(Value::as_str) {
                    if !token.is_empty() {
                        out.set(key, Value::String(token.to_string()));
                    }
                }
            }
        }
        RetryMode::NewSession => {
            if resolved_shell == Some(ShellKind::ClaudeCode) {
                out.set(
                    "session_id",
                    Value::String(Uuid::new_v4().to_string()),
                );
            }
        }
    }

    out
}

/// Service wrapping the retry decision with its store mutations.
pub struct RetryService {
    store: Arc<dyn Store>,
    resume_enabled: bool,
}

impl RetryService {
    pub fn new(store: Arc<dyn Store>, resume_enabled: bool) -> Self {
        Self {
            store,
            resume_enabled,
        }
    }

    /// Reset a failed ASSISTANT subtask (and its task) back to PENDING so
    /// the dispatch path picks it up again.
    ///
    /// Fails closed: a non-ASSISTANT subtask, a mismatched task id or a
    /// missing task rejects the request before any mutation.
    pub async fn retry_subtask(
        &self,
        user_id: i64,
        task_id: i64,
        subtask_id: i64,
        retry_mode: RetryMode,
    ) -> Result<Subtask, TaskError> {
        let subtask = self
            .store
            .get_subtask(subtask_id)
            .await?
            .ok_or(TaskError::SubtaskNotFound(subtask_id))?;

        if subtask.task_id != task_id {
            return Err(TaskError::SubtaskNotFound(subtask_id));
        }
        if subtask.role != SubtaskRole::Assistant {
            return Err(TaskError::NotRetryable(
                subtask_id,
                "only ASSISTANT subtasks can be retried".into(),
            ));
        }

        let mut task = self
            .store
            .get_task(task_id)
            .await?
            .ok_or(TaskError::NotFound(task_id))?;
        if task.user_id != user_id {
            return Err(TaskError::NotFound(task_id));
        }

        // parent_id stores the triggering message's id, not a row id. The
        // prompt context lookup goes through the (task_id, message_id)
        // index; legacy turns where siblings share a parent fall back to
        // the closest earlier USER message.
        let user_subtask = match self
            .store
            .find_user_subtask(task_id, subtask.parent_id)
            .await?
        {
            Some(found) => Some(found),
            None => {
                self.store
                    .latest_user_subtask_before(task_id, subtask.message_id)
                    .await?
            }
        };
        if user_subtask.is_none() {
            warn!(
                task_id,
                subtask_id,
                parent_id = subtask.parent_id,
                "No triggering USER subtask found for retry"
            );
        }

        let new_result = reset_result_for_retry(
            &subtask.result,
            retry_mode,
            subtask.result.shell_type(),
            self.resume_enabled,
        );

        // The task itself must go back to PENDING — pollers only fetch
        // dispatchable tasks, so a FAILED task would make retries appear
        // to do nothing. Subtask and task reset commit as one transaction.
        let now = Utc::now();
        task.status.reset_to_pending(now);
        self.store
            .reset_for_retry(subtask_id, &new_result, task_id, &task.status, now)
            .await?;

        info!(task_id, subtask_id, mode = retry_mode.as_str(), "Subtask reset for retry");

        self.store
            .get_subtask(subtask_id)
            .await?
            .ok_or(TaskError::SubtaskNotFound(subtask_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(v: serde_json::Value) -> ResultDoc {
        ResultDoc::from_value(v)
    }

    #[test]
    fn resume_preserves_codex_session_and_drops_stream_state() {
        let existing = doc(json!({
            "shell_type": "Codex",
            "value": "previous output",
            "error": "boom",
            "resume_session_id": "thread_123",
            "codex_events": [{"type": "init"}],
        }));

        let out = reset_result_for_retry(&existing, RetryMode::Resume, Some(ShellKind::Codex), true);

        assert_eq!(out.0["shell_type"], "Codex");
        assert_eq!(out.0["retry_mode"], "resume");
        assert_eq!(out.0["resume_session_id"], "thread_123");
        assert!(!out.0.contains_key("value"));
        assert!(!out.0.contains_key("error"));
        assert!(!out.0.contains_key("codex_events"));
    }

    #[test]
    fn new_session_clears_codex_session() {
        let existing = doc(json!({"shell_type": "Codex", "resume_session_id": "thread_123"}));

        let out =
            reset_result_for_retry(&existing, RetryMode::NewSession, Some(ShellKind::Codex), true);

        assert_eq!(out.0["retry_mode"], "new_session");
        assert!(!out.0.contains_key("resume_session_id"));
    }

    #[test]
    fn resume_forced_to_new_session_when_flag_disabled() {
        let existing = doc(json!({"shell_type": "Codex", "resume_session_id": "thread_123"}));

        let out = reset_result_for_retry(&existing, RetryMode::Resume, Some(ShellKind::Codex), false);

        assert_eq!(out.0["retry_mode"], "new_session");
        assert!(!out.0.contains_key("resume_session_id"));
    }

    #[test]
    fn new_session_mints_claude_session() {
        let existing = doc(json!({"shell_type": "ClaudeCode", "session_id": "old"}));

        let out = reset_result_for_retry(
            &existing,
            RetryMode::NewSession,
            Some(ShellKind::ClaudeCode),
            true,
        );

        assert_eq!(out.0["shell_type"], "ClaudeCode");
        assert_eq!(out.0["retry_mode"], "new_session");
        let session_id = out.0["session_id"].as_str().unwrap();
        assert_ne!(session_id, "old");
        Uuid::parse_str(session_id).unwrap();
    }

    #[test]
    fn flag_disabled_forces_claude_to_fresh_session() {
        let existing = doc(json!({"shell_type": "ClaudeCode", "session_id": "old"}));

        let out = reset_result_for_retry(
            &existing,
            RetryMode::Resume,
            Some(ShellKind::ClaudeCode),
            false,
        );

        assert_eq!(out.0["retry_mode"], "new_session");
        let session_id = out.0["session_id"].as_str().unwrap();
        assert_ne!(session_id, "old");
        Uuid::parse_str(session_id).unwrap();
    }

    #[test]
    fn shell_type_falls_back_to_existing_result() {
        let existing = doc(json!({"shell_type": "Codex", "resume_session_id": "t1"}));

        let out = reset_result_for_retry(&existing, RetryMode::Resume, None, true);

        assert_eq!(out.0["shell_type"], "Codex");
        assert_eq!(out.0["resume_session_id"], "t1");
    }

    #[test]
    fn empty_session_token_is_not_copied() {
        let existing = doc(json!({"shell_type": "Codex", "resume_session_id": ""}));

        let out = reset_result_for_retry(&existing, RetryMode::Resume, None, true);

        assert!(!out.0.contains_key("resume_session_id"));
    }
}
