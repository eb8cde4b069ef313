//! Runner poll loop — heartbeat, claim, execute, call back.
//!
//! Crash-safety comes from the dispatch contract, not from this loop: a
//! claim does not mark the subtask RUNNING, so dying before the first
//! callback just means the work is redispatched (at-least-once).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::agent::client::ApiClient;
use crate::agent::process::{RunStatus, build_codex_command, run_agent_cli};
use crate::config::RunnerConfig;
use crate::error::AgentError;
use crate::model::ShellKind;
use crate::service::dispatch::{CallbackStatus, ClaimedTask, SubtaskExecutorUpdate};
use crate::service::runners::HeartbeatRequest;

/// Cancellation tokens for in-flight task executions, keyed by task id.
///
/// The token is handed into the subprocess-management task and checked at
/// each read — cancellation is cooperative, never preemptive.
#[derive(Clone, Default)]
pub struct CancelRegistry {
    tokens: Arc<Mutex<HashMap<i64, CancellationToken>>>,
}

impl CancelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create (or fetch) the token for a task.
    pub fn token_for(&self, task_id: i64) -> CancellationToken {
        let mut tokens = self.tokens.lock().expect("cancel registry poisoned");
        tokens.entry(task_id).or_default().clone()
    }

    /// Signal cancellation. Returns false when the task is not running.
    pub fn cancel(&self, task_id: i64) -> bool {
        let tokens = self.tokens.lock().expect("cancel registry poisoned");
        match tokens.get(&task_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    fn remove(&self, task_id: i64) {
        self.tokens
            .lock()
            .expect("cancel registry poisoned")
            .remove(&task_id);
    }
}

/// Posts streaming callbacks for one claimed subtask.
struct CallbackSink {
    client: ApiClient,
    subtask_id: i64,
}

impl CallbackSink {
    fn running_result(resume: Option<&str>) -> Map<String, Value> {
        let mut result = Map::new();
        result.insert("shell_type".into(), json!(ShellKind::Codex.as_str()));
        if let Some(resume) = resume {
            result.insert("resume_session_id".into(), json!(resume));
        }
        result
    }

    async fn post(&self, result: Map<String, Value>) {
        let update = SubtaskExecutorUpdate {
            subtask_id: self.subtask_id,
            status: CallbackStatus::Running,
            progress: 70,
            result: Some(Value::Object(result)),
            executor_name: None,
            executor_namespace: None,
        };
        if let Err(e) = self.client.update_subtask(&update).await {
            // Transient callback failures are diagnostic; the stream and a
            // later callback recover.
            warn!(subtask_id = self.subtask_id, error = %e, "Progress callback failed");
        }
    }
}

#[async_trait]
impl crate::agent::process::ProgressSink for CallbackSink {
    async fn on_event_batch(&self, events: Vec<Value>, resume_session_id: Option<&str>) {
        if events.is_empty() && resume_session_id.is_none() {
            return;
        }
        let mut result = Self::running_result(resume_session_id);
        result.insert("codex_event".into(), Value::Array(events));
        self.post(result).await;
    }

    async fn on_value_chunk(&self, accumulated: &str, resume_session_id: Option<&str>) {
        let mut result = Self::running_result(resume_session_id);
        result.insert("value".into(), json!(accumulated));
        self.post(result).await;
    }
}

/// The local-runner agent loop.
pub struct RunnerPoller {
    config: RunnerConfig,
    client: ApiClient,
    cancellations: CancelRegistry,
}

impl RunnerPoller {
    pub fn new(config: RunnerConfig) -> Self {
        let client = ApiClient::new(
            &config.server_url,
            config.api_key.clone(),
            &config.runner_id,
        );
        Self {
            config,
            client,
            cancellations: CancelRegistry::new(),
        }
    }

    pub fn cancellations(&self) -> CancelRegistry {
        self.cancellations.clone()
    }

    fn heartbeat_request(&self) -> HeartbeatRequest {
        let mut capabilities = Map::new();
        capabilities.insert("codex".into(), Value::Bool(true));
        HeartbeatRequest {
            runner_id: self.config.runner_id.clone(),
            name: Some(self.config.name.clone()),
            version: Some(env!("CARGO_PKG_VERSION").to_string()),
            capabilities,
            // Workspace ids and names only — local paths never leave the
            // runner.
            workspaces: self
                .config
                .workspaces
                .keys()
                .map(|id| json!({"id": id, "name": id, "capabilities": {}}))
                .collect(),
        }
    }

    /// One heartbeat + dispatch + execute round. Returns how many claims
    /// were executed.
    pub async fn poll_once(&self) -> Result<usize, AgentError> {
        self.client.heartbeat(&self.heartbeat_request()).await?;

        let response = self.client.dispatch("PENDING", 1).await?;
        let count = response.tasks.len();
        for claim in response.tasks {
            self.execute_claim(claim).await;
        }
        Ok(count)
    }

    /// Run until shutdown is requested.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            runner_id = %self.config.runner_id,
            server = %self.config.server_url,
            workspaces = self.config.workspaces.len(),
            "Runner poll loop starting"
        );

        loop {
            match self.poll_once().await {
                Ok(0) => {
                    // Idle: wait out the poll interval (or shutdown).
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "Poll round failed; backing off");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                    }
                }
            }
            if shutdown.is_cancelled() {
                break;
            }
        }

        info!(runner_id = %self.config.runner_id, "Runner poll loop stopped");
    }

    /// Report a terminal status for a subtask.
    async fn finish(
        &self,
        subtask_id: i64,
        status: CallbackStatus,
        result: Map<String, Value>,
    ) {
        let update = SubtaskExecutorUpdate {
            subtask_id,
            status,
            progress: 100,
            result: Some(Value::Object(result)),
            executor_name: None,
            executor_namespace: None,
        };
        if let Err(e) = self.client.update_subtask(&update).await {
            warn!(subtask_id, error = %e, "Terminal callback failed");
        }
    }

    async fn fail(&self, subtask_id: i64, error: String) {
        let mut result = Map::new();
        result.insert("shell_type".into(), json!(ShellKind::Codex.as_str()));
        result.insert("value".into(), json!(""));
        result.insert("error".into(), json!(error));
        self.finish(subtask_id, CallbackStatus::Failed, result).await;
    }

    /// Execute one claimed subtask end to end.
    async fn execute_claim(&self, claim: ClaimedTask) {
        let subtask_id = claim.subtask_id;
        info!(
            task_id = claim.task_id,
            subtask_id,
            workspace = claim.local_workspace_id.as_deref().unwrap_or("-"),
            "Executing claimed subtask"
        );

        let Some(workspace_id) = claim.local_workspace_id.clone() else {
            self.fail(subtask_id, "Missing local_workspace_id in task payload".into())
                .await;
            return;
        };
        let Some(cwd) = self.config.workspaces.get(&workspace_id).cloned() else {
            self.fail(
                subtask_id,
                format!("Workspace '{workspace_id}' not configured on this runner"),
            )
            .await;
            return;
        };

        // First callback marks the subtask RUNNING.
        let mut initial = CallbackSink::running_result(claim.resume_session_id.as_deref());
        initial.insert("value".into(), json!(""));
        let update = SubtaskExecutorUpdate {
            subtask_id,
            status: CallbackStatus::Running,
            progress: 60,
            result: Some(Value::Object(initial)),
            executor_name: None,
            executor_namespace: None,
        };
        if let Err(e) = self.client.update_subtask(&update).await {
            warn!(subtask_id, error = %e, "Initial RUNNING callback failed");
        }

        // Per-task run home keeps the CLI's own state isolated per task.
        let run_home = self
            .config
            .data_dir
            .join(claim.task_id.to_string())
            .join(".home");
        if let Err(e) = std::fs::create_dir_all(&run_home) {
            self.fail(subtask_id, format!("Failed to create run home: {e}"))
                .await;
            return;
        }

        // Explicit, scoped child environment: PATH to find the CLI, an
        // isolated HOME, and the configured credentials. The parent
        // process environment is never mutated.
        let mut env: HashMap<String, String> = HashMap::new();
        if let Ok(path) = std::env::var("PATH") {
            env.insert("PATH".into(), path);
        }
        env.insert("HOME".into(), run_home.to_string_lossy().into_owned());
        env.extend(self.config.agent_env.clone());

        let cmd = build_codex_command(
            &self.config.codex_cmd,
            &cwd,
            claim.model.as_deref(),
            claim.resume_session_id.as_deref(),
            claim.retry_mode,
            &env,
        );

        let token = self.cancellations.token_for(claim.task_id);
        let sink = CallbackSink {
            client: self.client.clone(),
            subtask_id,
        };

        let outcome = run_agent_cli(
            cmd,
            &claim.prompt,
            token,
            self.config.graceful_shutdown_timeout,
            &sink,
        )
        .await;
        self.cancellations.remove(claim.task_id);

        match outcome {
            Ok(outcome) => {
                let mut result = CallbackSink::running_result(outcome.resume_session_id.as_deref());
                result.insert("value".into(), json!(outcome.value));
                let status = match outcome.status {
                    RunStatus::Completed => CallbackStatus::Completed,
                    RunStatus::Cancelled => CallbackStatus::Cancelled,
                    RunStatus::Failed => {
                        result.insert(
                            "error".into(),
                            json!(outcome.error.unwrap_or_else(|| "execution failed".into())),
                        );
                        CallbackStatus::Failed
                    }
                };
                self.finish(subtask_id, status, result).await;
            }
            Err(AgentError::Spawn { cmd, .. }) => {
                self.fail(subtask_id, format!("agent executable not found: {cmd}"))
                    .await;
            }
            Err(e) => {
                self.fail(subtask_id, format!("agent execution failed: {e}"))
                    .await;
            }
        }
    }
}
