//! Error → HTTP status mapping.
//!
//! Every externally visible error payload is already masked by the layer
//! that produced it; this module only shapes the response body.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::{Value, json};
use tracing::error;

use crate::error::{DatabaseError, DispatchError, PrActionError, TaskError};
use crate::mask::mask_string;

/// API error with a status code and a JSON `detail` payload.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    detail: Value,
}

impl ApiError {
    pub fn unauthorized() -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            detail: json!("Missing or invalid API key"),
        }
    }

    pub fn forbidden(detail: impl Into<Value>) -> Self {
        Self {
            status: StatusCode::FORBIDDEN,
            detail: detail.into(),
        }
    }

    pub fn not_found(detail: impl Into<Value>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            detail: detail.into(),
        }
    }

    pub fn bad_request(detail: impl Into<Value>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            detail: detail.into(),
        }
    }

    pub fn conflict(detail: impl Into<Value>) -> Self {
        Self {
            status: StatusCode::CONFLICT,
            detail: detail.into(),
        }
    }

    pub fn internal(message: impl std::fmt::Display) -> Self {
        let message = message.to_string();
        error!(error = %message, "Internal error");
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            detail: json!(mask_string(&message)),
        }
    }

    pub fn bad_gateway(detail: impl Into<Value>) -> Self {
        Self {
            status: StatusCode::BAD_GATEWAY,
            detail: detail.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "detail": self.detail }))).into_response()
    }
}

impl From<DatabaseError> for ApiError {
    fn from(e: DatabaseError) -> Self {
        Self::internal(e)
    }
}

impl From<DispatchError> for ApiError {
    fn from(e: DispatchError) -> Self {
        match e {
            DispatchError::RunnerNotFound(_)
            | DispatchError::SubtaskNotFound(_)
            | DispatchError::TaskNotFound(_) => Self::not_found(e.to_string()),
            DispatchError::RunnerDisabled(_) | DispatchError::NotAssigned { .. } => {
                Self::forbidden(e.to_string())
            }
            DispatchError::Database(db) => Self::internal(db),
        }
    }
}

impl From<TaskError> for ApiError {
    fn from(e: TaskError) -> Self {
        match e {
            TaskError::NotFound(_) | TaskError::SubtaskNotFound(_) => {
                Self::not_found(e.to_string())
            }
            TaskError::NotRetryable(_, _) => Self::bad_request(e.to_string()),
            TaskError::Database(db) => Self::internal(db),
        }
    }
}

impl From<PrActionError> for ApiError {
    fn from(e: PrActionError) -> Self {
        match e {
            PrActionError::Denied {
                code,
                message,
                audit_id,
            } => Self::forbidden(json!({
                "code": code,
                "message": message,
                "audit_id": audit_id,
            })),
            PrActionError::ReplayUnavailable { audit_id } => Self::conflict(json!({
                "code": "IDEMPOTENCY_REPLAY_NOT_AVAILABLE",
                "message": "Previous attempt did not complete successfully",
                "audit_id": audit_id,
            })),
            PrActionError::Upstream {
                message, audit_id, ..
            } => Self::bad_gateway(json!({
                "code": "UPSTREAM_ERROR",
                "message": message,
                "audit_id": audit_id,
            })),
            PrActionError::Database(db) => Self::internal(db),
        }
    }
}
