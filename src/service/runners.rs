//! Local runner registration — heartbeat upsert and derived online state.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::info;

use crate::error::DispatchError;
use crate::model::LocalRunner;
use crate::store::Store;

/// Keys that may leak local filesystem paths. Runners are expected not to
/// send paths at all; these are stripped server-side regardless.
const PATH_KEYS: &[&str] = &["path", "cwd", "workdir", "workspace_path"];

/// Recursively remove path-like keys from a runner-reported payload.
pub fn sanitize_runner_payload(value: &Value) -> Value {
    match value {
        Value::Array(items) => Value::Array(items.iter().map(sanitize_runner_payload).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(k, _)| !PATH_KEYS.contains(&k.to_ascii_lowercase().as_str()))
                .map(|(k, v)| (k.clone(), sanitize_runner_payload(v)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Heartbeat request body sent by a runner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub runner_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub capabilities: Map<String, Value>,
    #[serde(default)]
    pub workspaces: Vec<Value>,
}

/// Runner record as returned to clients. The `online` flag is injected
/// into `capabilities` transiently — it is derived, never persisted.
#[derive(Debug, Clone, Serialize)]
pub struct RunnerView {
    pub id: String,
    pub name: String,
    pub disabled: bool,
    pub capabilities: Value,
    pub workspaces: Value,
    pub last_seen_at: chrono::DateTime<Utc>,
}

impl RunnerView {
    fn from_runner(runner: LocalRunner) -> Self {
        let online = runner.is_online(Utc::now());
        let mut capabilities = match runner.capabilities {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        capabilities.insert(
            "online".into(),
            Value::Bool(online),
        );
        Self {
            id: runner.id,
            name: runner.name,
            disabled: runner.disabled,
            capabilities: Value::Object(capabilities),
            workspaces: runner.workspaces,
            last_seen_at: runner.last_seen_at,
        }
    }
}

/// Heartbeat + listing service for local runners.
pub struct RunnerService {
    store: Arc<dyn Store>,
}

impl RunnerService {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Register on first heartbeat, refresh on every subsequent one.
    ///
    /// A disabled runner is never updated and the heartbeat is rejected —
    /// operators disable instead of deleting.
    pub async fn heartbeat(
        &self,
        user_id: i64,
        req: HeartbeatRequest,
    ) -> Result<RunnerView, DispatchError> {
        let mut capabilities = req.capabilities.clone();
        if let Some(version) = &req.version {
            capabilities.insert("version".into(), Value::String(version.clone()));
        }
        let capabilities = sanitize_runner_payload(&Value::Object(capabilities));
        let workspaces = sanitize_runner_payload(&Value::Array(req.workspaces.clone()));
        let now = Utc::now();

        let existing = self.store.get_runner(user_id, &req.runner_id).await?;
        match existing {
            None => {
                let runner = LocalRunner {
                    id: req.runner_id.clone(),
                    user_id,
                    name: req.name.clone().unwrap_or_else(|| req.runner_id.clone()),
                    disabled: false,
                    capabilities,
                    workspaces,
                    last_seen_at: now,
                    created_at: now,
                    updated_at: now,
                };
                self.store.insert_runner(&runner).await?;
                info!(runner_id = %req.runner_id, user_id, "Registered local runner");
            }
            Some(runner) if runner.disabled => {
                return Err(DispatchError::RunnerDisabled(req.runner_id));
            }
            Some(_) => {
                self.store
                    .update_runner_heartbeat(
                        user_id,
                        &req.runner_id,
                        req.name.as_deref(),
                        &capabilities,
                        &workspaces,
                        now,
                    )
                    .await?;
            }
        }

        let runner = self
            .store
            .get_runner(user_id, &req.runner_id)
            .await?
            .ok_or_else(|| DispatchError::RunnerNotFound(req.runner_id.clone()))?;
        Ok(RunnerView::from_runner(runner))
    }

    pub async fn list(&self, user_id: i64) -> Result<Vec<RunnerView>, DispatchError> {
        let runners = self.store.list_runners(user_id).await?;
        Ok(runners.into_iter().map(RunnerView::from_runner).collect())
    }

    /// Disable (or re-enable) a runner. Disabled runners are rejected by
    /// every dispatch-path endpoint but keep their registration row.
    pub async fn set_disabled(
        &self,
        user_id: i64,
        runner_id: &str,
        disabled: bool,
    ) -> Result<RunnerView, DispatchError> {
        self.store
            .get_runner(user_id, runner_id)
            .await?
            .ok_or_else(|| DispatchError::RunnerNotFound(runner_id.to_string()))?;
        self.store
            .set_runner_disabled(user_id, runner_id, disabled)
            .await?;
        info!(runner_id, disabled, "Runner disabled flag updated");

        let runner = self
            .store
            .get_runner(user_id, runner_id)
            .await?
            .ok_or_else(|| DispatchError::RunnerNotFound(runner_id.to_string()))?;
        Ok(RunnerView::from_runner(runner))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sanitize_strips_path_keys_recursively() {
        let payload = json!({
            "codex": true,
            "path": "/home/user/secret",
            "nested": {"cwd": "/tmp", "ok": 1},
            "list": [{"workspace_path": "/srv", "name": "ws"}],
        });

        let sanitized = sanitize_runner_payload(&payload);

        assert_eq!(sanitized["codex"], true);
        assert!(sanitized.get("path").is_none());
        assert!(sanitized["nested"].get("cwd").is_none());
        assert_eq!(sanitized["nested"]["ok"], 1);
        assert!(sanitized["list"][0].get("workspace_path").is_none());
        assert_eq!(sanitized["list"][0]["name"], "ws");
    }

    #[test]
    fn sanitize_is_case_insensitive() {
        let sanitized = sanitize_runner_payload(&json!({"Path": "/x", "WORKDIR": "/y"}));
        assert_eq!(sanitized, json!({}));
    }
}
