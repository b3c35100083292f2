use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use genq_core::TaskError;
use genq_persistence::PersistenceError;
use serde_json::json;

/// Error half of the `{success, data | error}` envelope.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    InsufficientBalance,
    Forbidden(String),
    NotFound(String),
    Conflict(String),
    TooManyRequests,
    Unavailable(String),
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::InsufficientBalance => StatusCode::PAYMENT_REQUIRED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::TooManyRequests => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Label for the rejection counter
    pub fn reason(&self) -> &'static str {
        match self {
            ApiError::BadRequest(_) => "invalid_request",
            ApiError::InsufficientBalance => "insufficient_balance",
            ApiError::Forbidden(_) => "forbidden",
            ApiError::NotFound(_) => "not_found",
            ApiError::Conflict(_) => "conflict",
            ApiError::TooManyRequests => "rate_limited",
            ApiError::Unavailable(_) => "unavailable",
            ApiError::Internal(_) => "internal",
        }
    }

    fn message(self) -> String {
        match self {
            ApiError::InsufficientBalance => "Insufficient balance".to_string(),
            ApiError::TooManyRequests => "Too many requests, please try again later".to_string(),
            ApiError::BadRequest(msg)
            | ApiError::Forbidden(msg)
            | ApiError::NotFound(msg)
            | ApiError::Conflict(msg)
            | ApiError::Unavailable(msg)
            | ApiError::Internal(msg) => msg,
        }
    }
}

impl From<PersistenceError> for ApiError {
    fn from(err: PersistenceError) -> Self {
        match err.as_task_error() {
            Some(TaskError::TaskNotFound(_)) => ApiError::NotFound(err.to_string()),
            Some(TaskError::TaskAlreadyExists(_)) | Some(TaskError::InvalidTransition { .. }) => {
                ApiError::Conflict(err.to_string())
            }
            Some(TaskError::InvalidParams { .. }) => ApiError::BadRequest(err.to_string()),
            _ => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<TaskError> for ApiError {
    fn from(err: TaskError) -> Self {
        PersistenceError::from(err).into()
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(json!({
            "success": false,
            "error": self.message(),
        }));
        (status, body).into_response()
    }
}
