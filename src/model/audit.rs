//! Durable audit trail for externally-visible PR actions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Terminal (or placeholder) decision recorded for a PR action.
///
/// New rows start as `Error` — the placeholder written before the external
/// call — and are updated exactly once to their terminal decision. A row
/// that reaches `Allowed` is never mutated again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditDecision {
    Allowed,
    Denied,
    Error,
}

impl AuditDecision {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Allowed => "allowed",
            Self::Denied => "denied",
            Self::Error => "error",
        }
    }
}

impl std::str::FromStr for AuditDecision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "allowed" => Ok(Self::Allowed),
            "denied" => Ok(Self::Denied),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown audit decision: {other}")),
        }
    }
}

/// One row per `(user, idempotency_key)` pair — uniqueness enforced at the
/// store level, which is the only cross-request coordination primitive.
#[derive(Debug, Clone)]
pub struct PrActionAudit {
    pub id: i64,
    pub user_id: i64,
    pub idempotency_key: String,
    pub action: String,
    pub provider: String,
    pub git_domain: String,
    pub repo_full_name: String,
    pub base_branch: String,
    pub head_branch: String,
    pub decision: AuditDecision,
    pub policy_code: Option<String>,
    pub policy_message: Option<String>,
    /// Masked request payload (secrets redacted before storage).
    pub request_json: String,
    /// Masked response payload, present once the external write succeeded.
    pub response_json: Option<String>,
    pub pr_number: Option<i64>,
    pub pr_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
