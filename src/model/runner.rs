//! Local runner registration — created and refreshed by heartbeats.

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;

/// How long after the last heartbeat a runner still counts as online.
pub const ONLINE_TTL_SECONDS: i64 = 90;

/// A locally-registered executor runner.
///
/// Never hard-deleted through the core; operators disable instead. The
/// online flag is derived from `last_seen_at`, never stored.
#[derive(Debug, Clone)]
pub struct LocalRunner {
    pub id: String,
    pub user_id: i64,
    pub name: String,
    pub disabled: bool,
    pub capabilities: Value,
    pub workspaces: Value,
    pub last_seen_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LocalRunner {
    /// Online-ness is derived: `now - last_seen_at <= 90s`.
    pub fn is_online(&self, now: DateTime<Utc>) -> bool {
        now - self.last_seen_at <= Duration::seconds(ONLINE_TTL_SECONDS)
    }
}
