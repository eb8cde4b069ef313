//! HTTP callback client — the runner's view of the dispatch service.

use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;

use crate::error::AgentError;
use crate::mask::mask_string;
use crate::service::dispatch::{DispatchResponse, SubtaskExecutorUpdate};
use crate::service::runners::HeartbeatRequest;

/// Client for the dispatch/heartbeat/artifact endpoints.
#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    api_key: SecretString,
    runner_id: String,
}

impl ApiClient {
    pub fn new(server_url: &str, api_key: SecretString, runner_id: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: server_url.trim_end_matches('/').to_string(),
            api_key,
            runner_id: runner_id.to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, AgentError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(AgentError::Callback(format!(
            "server returned {status}: {}",
            mask_string(&body)
        )))
    }

    /// Register/refresh this runner. Returns the server's runner view.
    pub async fn heartbeat(&self, request: &HeartbeatRequest) -> Result<Value, AgentError> {
        let response = self
            .http
            .post(self.url("/runners/heartbeat"))
            .header("X-Api-Key", self.api_key.expose_secret())
            .json(request)
            .send()
            .await
            .map_err(|e| AgentError::Callback(e.to_string()))?;
        Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| AgentError::Callback(e.to_string()))
    }

    /// Claim pending work.
    pub async fn dispatch(&self, status: &str, limit: u32) -> Result<DispatchResponse, AgentError> {
        let response = self
            .http
            .post(self.url("/dispatch/tasks"))
            .query(&[
                ("runner_id", self.runner_id.as_str()),
                ("status", status),
                ("limit", &limit.to_string()),
            ])
            .header("X-Api-Key", self.api_key.expose_secret())
            .send()
            .await
            .map_err(|e| AgentError::Callback(e.to_string()))?;
        Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| AgentError::Callback(e.to_string()))
    }

    /// Push a progress or terminal update for a claimed subtask.
    pub async fn update_subtask(&self, update: &SubtaskExecutorUpdate) -> Result<(), AgentError> {
        let response = self
            .http
            .put(self.url("/dispatch/tasks"))
            .query(&[("runner_id", self.runner_id.as_str())])
            .header("X-Api-Key", self.api_key.expose_secret())
            .json(update)
            .send()
            .await
            .map_err(|e| AgentError::Callback(e.to_string()))?;
        Self::check(response).await?;
        Ok(())
    }

    /// Upload a produced artifact (raw bytes body).
    pub async fn upload_artifact(
        &self,
        subtask_id: i64,
        filename: &str,
        data: Vec<u8>,
    ) -> Result<Value, AgentError> {
        let response = self
            .http
            .post(self.url("/runners/artifacts/upload"))
            .query(&[
                ("runner_id", self.runner_id.as_str()),
                ("subtask_id", &subtask_id.to_string()),
                ("filename", filename),
            ])
            .header("X-Api-Key", self.api_key.expose_secret())
            .body(data)
            .send()
            .await
            .map_err(|e| AgentError::Callback(e.to_string()))?;
        Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| AgentError::Callback(e.to_string()))
    }
}
