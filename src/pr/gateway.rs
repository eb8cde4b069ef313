//! Idempotent PR action gateway.
//!
//! One audit row per `(user, idempotency_key)`: inserted as a placeholder
//! (`decision = error`) before the external write, updated exactly once to
//! its terminal decision. Replaying a completed action returns the stored
//! result without repeating the external call; replaying an indeterminate
//! one is rejected rather than guessed.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::PrPolicyConfig;
use crate::error::{DatabaseError, PrActionError};
use crate::mask::{mask_json, mask_string};
use crate::model::{AuditDecision, PrActionAudit};
use crate::pr::github::{PrProvider, ProviderError};
use crate::pr::policy::{PolicyRequest, evaluate_create_pr_policy};
use crate::store::{NewAudit, Store};

fn default_provider() -> String {
    "github".to_string()
}

fn default_git_domain() -> String {
    "github.com".to_string()
}

/// Request body for the create-PR action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatePullRequestAction {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_git_domain")]
    pub git_domain: String,
    pub repo_full_name: String,
    pub base_branch: String,
    pub head_branch: String,
    pub title: String,
    #[serde(default)]
    pub body: Option<String>,
}

/// Result returned for an allowed (or replayed-allowed) action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullRequestActionResult {
    pub audit_id: i64,
    pub idempotency_key: String,
    pub provider: String,
    pub git_domain: String,
    pub repo_full_name: String,
    pub base_branch: String,
    pub head_branch: String,
    pub pr_number: i64,
    pub pr_url: String,
}

impl PullRequestActionResult {
    fn from_audit(audit: &PrActionAudit, pr_number: i64, pr_url: String) -> Self {
        Self {
            audit_id: audit.id,
            idempotency_key: audit.idempotency_key.clone(),
            provider: audit.provider.clone(),
            git_domain: audit.git_domain.clone(),
            repo_full_name: audit.repo_full_name.clone(),
            base_branch: audit.base_branch.clone(),
            head_branch: audit.head_branch.clone(),
            pr_number,
            pr_url,
        }
    }
}

/// The gateway service.
pub struct PrActionGateway {
    store: Arc<dyn Store>,
    provider: Arc<dyn PrProvider>,
    policy: PrPolicyConfig,
}

impl PrActionGateway {
    pub fn new(
        store: Arc<dyn Store>,
        provider: Arc<dyn PrProvider>,
        policy: PrPolicyConfig,
    ) -> Self {
        Self {
            store,
            provider,
            policy,
        }
    }

    /// Execute (or replay) a create-PR action for the given idempotency key.
    pub async fn create_pull_request(
        &self,
        user_id: i64,
        idempotency_key: &str,
        action: CreatePullRequestAction,
    ) -> Result<PullRequestActionResult, PrActionError> {
        let (audit, created) = self.find_or_create_audit(user_id, idempotency_key, &action).await?;

        if !created {
            return self.replay(audit);
        }

        let decision = evaluate_create_pr_policy(
            &self.policy,
            &PolicyRequest {
                repo_full_name: &action.repo_full_name,
                base_branch: &action.base_branch,
                head_branch: &action.head_branch,
                ..Default::default()
            },
        );

        if !decision.allowed {
            self.store
                .update_audit_decision(
                    audit.id,
                    AuditDecision::Denied,
                    &decision.code,
                    &decision.message,
                    None,
                    None,
                    None,
                )
                .await?;
            info!(
                audit_id = audit.id,
                code = %decision.code,
                "PR action denied by policy"
            );
            return Err(PrActionError::Denied {
                code: decision.code,
                message: decision.message,
                audit_id: audit.id,
            });
        }

        // Policy passed: exactly one external write.
        let created_pr = match self
            .provider
            .create_pull_request(
                &action.git_domain,
                &action.repo_full_name,
                &action.base_branch,
                &action.head_branch,
                &action.title,
                action.body.as_deref(),
            )
            .await
        {
            Ok(pr) => pr,
            Err(e) => {
                let (code, message) = match &e {
                    ProviderError::Status { status, body } => (
                        "UPSTREAM_ERROR",
                        format!("provider returned {status}: {}", mask_string(body)),
                    ),
                    other => ("INTERNAL_ERROR", mask_string(&other.to_string())),
                };
                // The row stays in the error state — a later replay gets a
                // conflict instead of a blind re-attempt.
                self.store
                    .update_audit_decision(
                        audit.id,
                        AuditDecision::Error,
                        code,
                        &message,
                        None,
                        None,
                        None,
                    )
                    .await?;
                warn!(audit_id = audit.id, code, "PR action upstream failure");
                return Err(PrActionError::Upstream {
                    message,
                    audit_id: audit.id,
                    detail: None,
                });
            }
        };

        let response_json = mask_json(&created_pr.raw).to_string();
        self.store
            .update_audit_decision(
                audit.id,
                AuditDecision::Allowed,
                "ALLOWED",
                "Allowed by policy",
                Some(created_pr.number),
                Some(&created_pr.url),
                Some(&response_json),
            )
            .await?;

        info!(
            audit_id = audit.id,
            pr_number = created_pr.number,
            "PR action completed"
        );
        Ok(PullRequestActionResult::from_audit(
            &audit,
            created_pr.number,
            created_pr.url,
        ))
    }

    /// Insert the placeholder audit row, racing safely: a unique-constraint
    /// violation means another request won — re-read and replay its row.
    async fn find_or_create_audit(
        &self,
        user_id: i64,
        idempotency_key: &str,
        action: &CreatePullRequestAction,
    ) -> Result<(PrActionAudit, bool), PrActionError> {
        if let Some(existing) = self.store.get_audit(user_id, idempotency_key).await? {
            return Ok((existing, false));
        }

        let request_json = mask_json(
            &serde_json::to_value(action).unwrap_or(serde_json::Value::Null),
        )
        .to_string();

        match self
            .store
            .insert_audit(NewAudit {
                user_id,
                idempotency_key: idempotency_key.to_string(),
                action: "create_pr".to_string(),
                provider: action.provider.clone(),
                git_domain: action.git_domain.clone(),
                repo_full_name: action.repo_full_name.clone(),
                base_branch: action.base_branch.clone(),
                head_branch: action.head_branch.clone(),
                request_json,
            })
            .await
        {
            Ok(audit) => Ok((audit, true)),
            Err(DatabaseError::Constraint(_)) => {
                let existing = self
                    .store
                    .get_audit(user_id, idempotency_key)
                    .await?
                    .ok_or_else(|| {
                        PrActionError::Database(DatabaseError::NotFound {
                            entity: "pr_action_audit".into(),
                            id: idempotency_key.to_string(),
                        })
                    })?;
                Ok((existing, false))
            }
            Err(other) => Err(other.into()),
        }
    }

    /// Handle a replayed key per the stored row's state.
    fn replay(&self, audit: PrActionAudit) -> Result<PullRequestActionResult, PrActionError> {
        match audit.decision {
            AuditDecision::Allowed => {
                if let (Some(number), Some(url)) = (audit.pr_number, audit.pr_url.clone()) {
                    return Ok(PullRequestActionResult::from_audit(&audit, number, url));
                }
                // Allowed but incomplete row — treat as indeterminate.
                Err(PrActionError::ReplayUnavailable { audit_id: audit.id })
            }
            AuditDecision::Denied => Err(PrActionError::Denied {
                code: audit
                    .policy_code
                    .unwrap_or_else(|| "POLICY_DENIED".to_string()),
                message: audit
                    .policy_message
                    .unwrap_or_else(|| "Denied by policy".to_string()),
                audit_id: audit.id,
            }),
            AuditDecision::Error => Err(PrActionError::ReplayUnavailable { audit_id: audit.id }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pr::github::PrCreated;
    use crate::store::LibSqlStore;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Stub provider counting external writes.
    struct StubProvider {
        calls: AtomicUsize,
        fail: bool,
    }

    impl StubProvider {
        fn new(fail: bool) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail,
            }
        }
    }

    #[async_trait]
    impl PrProvider for StubProvider {
        async fn create_pull_request(
            &self,
            _git_domain: &str,
            _repo: &str,
            _base: &str,
            _head: &str,
            _title: &str,
            _body: Option<&str>,
        ) -> Result<PrCreated, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ProviderError::Status {
                    status: 502,
                    body: "bad gateway".into(),
                });
            }
            Ok(PrCreated {
                number: 42,
                url: "https://github.com/octo/repo/pull/42".into(),
                raw: json!({"number": 42, "html_url": "https://github.com/octo/repo/pull/42"}),
            })
        }
    }

    fn action() -> CreatePullRequestAction {
        CreatePullRequestAction {
            provider: "github".into(),
            git_domain: "github.com".into(),
            repo_full_name: "octo/repo".into(),
            base_branch: "main".into(),
            head_branch: "forge-1".into(),
            title: "Add feature".into(),
            body: None,
        }
    }

    fn open_policy() -> PrPolicyConfig {
        PrPolicyConfig {
            write_enabled: true,
            ..Default::default()
        }
    }

    async fn gateway(
        policy: PrPolicyConfig,
        fail: bool,
    ) -> (PrActionGateway, Arc<dyn Store>, Arc<StubProvider>) {
        let store: Arc<dyn Store> = Arc::new(LibSqlStore::new_memory().await.unwrap());
        let provider = Arc::new(StubProvider::new(fail));
        let gw = PrActionGateway::new(
            Arc::clone(&store),
            Arc::clone(&provider) as Arc<dyn PrProvider>,
            policy,
        );
        (gw, store, provider)
    }

    #[tokio::test]
    async fn idempotent_replay_performs_one_external_write() {
        let (gw, _store, provider) = gateway(open_policy(), false).await;

        let first = gw.create_pull_request(1, "key-1", action()).await.unwrap();
        let second = gw.create_pull_request(1, "key-1", action()).await.unwrap();

        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
        assert_eq!(first.audit_id, second.audit_id);
        assert_eq!(first.pr_number, second.pr_number);
        assert_eq!(second.pr_number, 42);
    }

    #[tokio::test]
    async fn distinct_keys_are_independent() {
        let (gw, _store, provider) = gateway(open_policy(), false).await;

        gw.create_pull_request(1, "key-1", action()).await.unwrap();
        gw.create_pull_request(1, "key-2", action()).await.unwrap();

        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn denial_is_persisted_and_replayed() {
        let (gw, store, provider) = gateway(PrPolicyConfig::default(), false).await;

        let err = gw.create_pull_request(1, "key-1", action()).await.unwrap_err();
        let audit_id = match err {
            PrActionError::Denied { code, audit_id, .. } => {
                assert_eq!(code, "PR_WRITE_DISABLED");
                audit_id
            }
            other => panic!("expected denial, got {other:?}"),
        };
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);

        // Replay re-raises the original denial from the stored row.
        let err = gw.create_pull_request(1, "key-1", action()).await.unwrap_err();
        match err {
            PrActionError::Denied { code, audit_id: replay_id, .. } => {
                assert_eq!(code, "PR_WRITE_DISABLED");
                assert_eq!(replay_id, audit_id);
            }
            other => panic!("expected denial, got {other:?}"),
        }

        let audit = store.get_audit(1, "key-1").await.unwrap().unwrap();
        assert_eq!(audit.decision, AuditDecision::Denied);
    }

    #[tokio::test]
    async fn upstream_failure_leaves_indeterminate_row() {
        let (gw, store, _provider) = gateway(open_policy(), true).await;

        let err = gw.create_pull_request(1, "key-1", action()).await.unwrap_err();
        assert!(matches!(err, PrActionError::Upstream { .. }));

        let audit = store.get_audit(1, "key-1").await.unwrap().unwrap();
        assert_eq!(audit.decision, AuditDecision::Error);
        assert_eq!(audit.policy_code.as_deref(), Some("UPSTREAM_ERROR"));

        // A replay must not blindly re-attempt the external side effect.
        let err = gw.create_pull_request(1, "key-1", action()).await.unwrap_err();
        assert!(matches!(err, PrActionError::ReplayUnavailable { .. }));
    }

    #[tokio::test]
    async fn request_payload_is_masked_before_storage() {
        let (gw, store, _provider) = gateway(open_policy(), false).await;

        let mut act = action();
        act.body = Some("token ghp_abcdefghijklmnopqrstuv1234 inside".into());
        gw.create_pull_request(1, "key-1", act).await.unwrap();

        let audit = store.get_audit(1, "key-1").await.unwrap().unwrap();
        assert!(!audit.request_json.contains("ghp_"));
    }
}
