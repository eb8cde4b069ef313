//! Subtask — one USER or ASSISTANT turn in a task's conversation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Who produced this turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubtaskRole {
    User,
    Assistant,
}

impl SubtaskRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "USER",
            Self::Assistant => "ASSISTANT",
        }
    }
}

impl std::str::FromStr for SubtaskRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "USER" => Ok(Self::User),
            "ASSISTANT" => Ok(Self::Assistant),
            other => Err(format!("unknown subtask role: {other}")),
        }
    }
}

/// Subtask execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubtaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl SubtaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }
}

impl std::str::FromStr for SubtaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "RUNNING" => Ok(Self::Running),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            other => Err(format!("unknown subtask status: {other}")),
        }
    }
}

/// Which agent CLI a subtask runs under.
///
/// The kind determines which key carries the resumable session token:
/// `Codex` threads resume via `resume_session_id`, `ClaudeCode` sessions
/// via `session_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellKind {
    Codex,
    ClaudeCode,
}

impl ShellKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Codex => "Codex",
            Self::ClaudeCode => "ClaudeCode",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Codex" => Some(Self::Codex),
            "ClaudeCode" => Some(Self::ClaudeCode),
            _ => None,
        }
    }

    /// The result-document key holding this shell's resume token.
    pub fn session_key(self) -> &'static str {
        match self {
            Self::Codex => "resume_session_id",
            Self::ClaudeCode => "session_id",
        }
    }
}

/// Whether a retried subtask reuses the prior agent session or starts cold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryMode {
    Resume,
    NewSession,
}

impl RetryMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Resume => "resume",
            Self::NewSession => "new_session",
        }
    }
}

/// Free-form subtask result document.
///
/// Recognized keys: `shell_type`, `value`, `error`, `resume_session_id`,
/// `session_id`, `retry_mode`, `codex_events`. Unknown keys are carried
/// through untouched — executors are free to attach extra diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResultDoc(pub Map<String, Value>);

impl ResultDoc {
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Wrap an arbitrary JSON value; non-objects degrade to empty.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(map) => Self(map),
            _ => Self(Map::new()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn str_key(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str).filter(|s| !s.is_empty())
    }

    pub fn shell_type(&self) -> Option<ShellKind> {
        self.str_key("shell_type").and_then(ShellKind::parse)
    }

    pub fn value(&self) -> Option<&str> {
        self.0.get("value").and_then(Value::as_str)
    }

    pub fn error(&self) -> Option<&str> {
        self.str_key("error")
    }

    pub fn retry_mode(&self) -> Option<RetryMode> {
        match self.str_key("retry_mode")? {
            "resume" => Some(RetryMode::Resume),
            "new_session" => Some(RetryMode::NewSession),
            _ => None,
        }
    }

    /// Resume token for the given shell kind, if present and non-empty.
    pub fn session_token(&self, shell: ShellKind) -> Option<&str> {
        self.str_key(shell.session_key())
    }

    pub fn codex_events(&self) -> Option<&Vec<Value>> {
        self.0.get("codex_events").and_then(Value::as_array)
    }

    pub fn set(&mut self, key: &str, value: Value) {
        self.0.insert(key.to_string(), value);
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}

/// One atomic execution step within a task's ordered conversation.
///
/// `parent_id` references the triggering message's `message_id`, not the
/// row id — see the retry-context lookup in `service::retry`.
#[derive(Debug, Clone)]
pub struct Subtask {
    pub id: i64,
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
    pub error_message: String,
    pub executor_name: Option<String>,
    pub executor_namespace: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}
