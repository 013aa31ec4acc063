use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use shared::DomainError;
use uuid::Uuid;

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    error: String,
    message: String,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    success: bool,
    error: String,
    message: String,
    code: u16,
    timestamp: String,
    correlation_id: String,
}

impl ApiError {
    pub fn new(status: StatusCode, error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            error: error.into(),
            message: message.into(),
        }
    }

    pub fn bad_request(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, error, message)
    }

    pub fn not_found(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, error, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "InternalServerError", message)
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn error(&self) -> &str {
        &self.error
    }
}

impl From<DomainError> for ApiError {
    fn from(err: DomainError) -> Self {
        match &err {
            DomainError::NotFound { .. } => Self::not_found("NotFound", err.to_string()),
            DomainError::InvalidInput(_) => Self::bad_request("InvalidInput", err.to_string()),
            DomainError::Unauthorized(_) => {
                Self::new(StatusCode::UNAUTHORIZED, "Unauthorized", err.to_string())
            }
            DomainError::Forbidden(_) => {
                Self::new(StatusCode::FORBIDDEN, "Forbidden", err.to_string())
            }
            DomainError::Conflict(_) => Self::new(StatusCode::CONFLICT, "Conflict", err.to_string()),
            DomainError::InvalidState(_) => Self::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "InvalidState",
                err.to_string(),
            ),
            DomainError::ExternalService { .. } => Self::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "ExternalServiceError",
                err.to_string(),
            ),
            DomainError::Timeout { .. } => {
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "Timeout", err.to_string())
            }
            DomainError::Store(detail) => {
                tracing::error!(error = %detail, "store operation failed");
                Self::internal("An unexpected database error occurred")
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let correlation_id = Uuid::new_v4().to_string();
        let payload = ErrorResponse {
            success: false,
            error: self.error,
            message: self.message,
            code: self.status.as_u16(),
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            correlation_id: correlation_id.clone(),
        };

        let mut response = (self.status, Json(payload)).into_response();
        if let Ok(value) = HeaderValue::from_str(&correlation_id) {
            response.headers_mut().insert(header::HeaderName::from_static("x-correlation-id"), value);
        }
        response
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;
