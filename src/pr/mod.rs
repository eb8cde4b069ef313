//! Policy-gated, idempotency-key-scoped pull-request action gateway.

pub mod gateway;
pub mod github;
pub mod policy;

pub use gateway::{CreatePullRequestAction, PrActionGateway, PullRequestActionResult};
pub use github::{GitHubProvider, PrCreated, PrProvider, ProviderError};
pub use policy::{PolicyDecision, PolicyRequest, evaluate_create_pr_policy};
