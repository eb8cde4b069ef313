//! GitHub provider — the single external write behind the gateway.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{Value, json};

/// Provider-level failure. The gateway maps this onto the audit row
/// without retrying — replay ambiguity is surfaced, never guessed away.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("Provider request failed: {0}")]
    Request(String),

    #[error("Provider returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Invalid provider response: {0}")]
    InvalidResponse(String),
}

/// Result of a successful PR creation.
#[derive(Debug, Clone)]
pub struct PrCreated {
    pub number: i64,
    pub url: String,
    /// Full provider response, masked before persistence.
    pub raw: Value,
}

/// The one external write the gateway performs.
#[async_trait]
pub trait PrProvider: Send + Sync {
    async fn create_pull_request(
        &self,
        git_domain: &str,
        repo_full_name: &str,
        base_branch: &str,
        head_branch: &str,
        title: &str,
        body: Option<&str>,
    ) -> Result<PrCreated, ProviderError>;
}

/// GitHub REST implementation.
pub struct GitHubProvider {
    http: reqwest::Client,
    token: Option<SecretString>,
}

impl GitHubProvider {
    pub fn new(token: Option<SecretString>) -> Self {
        Self {
            http: reqwest::Client::new(),
            token,
        }
    }

    fn api_base(git_domain: &str) -> String {
        if git_domain == "github.com" {
            "https://api.github.com".to_string()
        } else {
            // GitHub Enterprise serves the REST API under /api/v3.
            format!("https://{git_domain}/api/v3")
        }
    }
}

#[async_trait]
impl PrProvider for GitHubProvider {
    async fn create_pull_request(
        &self,
        git_domain: &str,
        repo_full_name: &str,
        base_branch: &str,
        head_branch: &str,
        title: &str,
        body: Option<&str>,
    ) -> Result<PrCreated, ProviderError> {
        let url = format!("{}/repos/{repo_full_name}/pulls", Self::api_base(git_domain));

        let mut request = self
            .http
            .post(&url)
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", "taskforge")
            .json(&json!({
                "title": title,
                "body": body.unwrap_or(""),
                "base": base_branch,
                "head": head_branch,
            }));
        if let Some(token) = &self.token {
            request = request.bearer_auth(token.expose_secret());
        }

        let response = request
            .send()
            .await
            .map_err(|e| ProviderError::Request(e.to_string()))?;

        let status = response.status();
        let payload: Value = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;

        if !status.is_success() {
            return Err(ProviderError::Status {
                status: status.as_u16(),
                body: payload.to_string(),
            });
        }

        let number = payload
            .get("number")
            .and_then(Value::as_i64)
            .ok_or_else(|| ProviderError::InvalidResponse("missing pr number".into()))?;
        let url = payload
            .get("html_url")
            .and_then(Value::as_str)
            .ok_or_else(|| ProviderError::InvalidResponse("missing html_url".into()))?
            .to_string();

        Ok(PrCreated {
            number,
            url,
            raw: payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_base_for_dotcom_and_enterprise() {
        assert_eq!(GitHubProvider::api_base("github.com"), "https://api.github.com");
        assert_eq!(
            GitHubProvider::api_base("git.corp.example"),
            "https://git.corp.example/api/v3"
        );
    }
}
