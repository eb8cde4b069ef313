//! Error types for taskforge.

use serde_json::Value;

/// Top-level error type for the service.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Task error: {0}")]
    Task(#[from] TaskError),

    #[error("Agent error: {0}")]
    Agent(#[from] AgentError),

    #[error("PR action error: {0}")]
    PrAction(#[from] PrActionError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Dispatch / callback pipeline errors.
///
/// These map 1:1 onto HTTP statuses at the API layer: `NotFound` → 404,
/// `NotAssigned` / `RunnerDisabled` → 403 (fail closed, before mutation).
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Runner {0} not found")]
    RunnerNotFound(String),

    #[error("Runner {0} is disabled")]
    RunnerDisabled(String),

    #[error("Subtask {0} not found")]
    SubtaskNotFound(i64),

    #[error("Task {0} not found")]
    TaskNotFound(i64),

    #[error("Subtask {subtask_id} is not assigned to runner {runner_id}")]
    NotAssigned { subtask_id: i64, runner_id: String },

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Task lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("Task {0} not found")]
    NotFound(i64),

    #[error("Subtask {0} not found")]
    SubtaskNotFound(i64),

    #[error("Subtask {0} is not retryable: {1}")]
    NotRetryable(i64, String),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Execution agent errors (subprocess orchestration and callbacks).
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("Failed to spawn agent CLI {cmd}: {source}")]
    Spawn {
        cmd: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Callback request failed: {0}")]
    Callback(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// PR action gateway errors.
///
/// `Denied` and `ReplayUnavailable` are first-class outcomes, not faults:
/// both carry the audit id so callers can point at the persisted decision.
#[derive(Debug, thiserror::Error)]
pub enum PrActionError {
    #[error("Denied by policy: {code}: {message}")]
    Denied {
        code: String,
        message: String,
        audit_id: i64,
    },

    #[error("Previous attempt did not complete successfully (audit {audit_id})")]
    ReplayUnavailable { audit_id: i64 },

    #[error("Upstream provider error: {message}")]
    Upstream {
        message: String,
        audit_id: i64,
        detail: Option<Value>,
    },

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Result type alias for the service.
pub type Result<T> = std::result::Result<T, Error>;
