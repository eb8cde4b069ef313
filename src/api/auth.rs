//! Request authentication — `X-Api-Key` header resolved to a user.
//!
//! User management itself lives outside this service; the store only holds
//! the key → user mapping.

use axum::http::HeaderMap;

use crate::api::error::ApiError;
use crate::model::User;
use crate::store::Store;

/// Resolve the calling user or reject with 401.
pub async fn require_user(store: &dyn Store, headers: &HeaderMap) -> Result<User, ApiError> {
    let api_key = headers
        .get("x-api-key")
        .and_then(|value| value.to_str().ok())
        .filter(|key| !key.is_empty())
        .ok_or_else(ApiError::unauthorized)?;

    store
        .find_user_by_api_key(api_key)
        .await?
        .ok_or_else(ApiError::unauthorized)
}
