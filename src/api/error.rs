// src/api/error.rs
// HTTP error envelope: {error, error_code, details}

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::{Value, json};
use tracing::warn;

use crate::error::MemoryError;

/// Standard API error carrying a status code and machine-readable code.
#[derive(Debug)]
pub struct ApiError {
    pub message: String,
    pub status_code: StatusCode,
    pub error_code: String,
    pub details: Option<Value>,
}

impl ApiError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status_code: StatusCode::BAD_REQUEST,
            error_code: "VALIDATION".to_string(),
            details: None,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status_code: StatusCode::INTERNAL_SERVER_ERROR,
            error_code: "INTERNAL".to_string(),
            details: None,
        }
    }
}

impl From<MemoryError> for ApiError {
    fn from(err: MemoryError) -> Self {
        let status_code = match &err {
            MemoryError::Validation(_) => StatusCode::BAD_REQUEST,
            MemoryError::NotFound(_) => StatusCode::NOT_FOUND,
            MemoryError::Security(_) => StatusCode::FORBIDDEN,
            MemoryError::ResourceExhausted(_) => StatusCode::TOO_MANY_REQUESTS,
            MemoryError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            MemoryError::ExternalService(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            message: err.to_string(),
            status_code,
            error_code: err.error_code().to_string(),
            details: None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status_code.is_server_error() {
            warn!(
                status = %self.status_code,
                code = %self.error_code,
                error = %self.message,
                "API request failed"
            );
        }
        let body = json!({
            "error": self.message,
            "error_code": self.error_code,
            "details": self.details,
        });
        (self.status_code, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_error_mapping() {
        let e: ApiError = MemoryError::Validation("bad".into()).into();
        assert_eq!(e.status_code, StatusCode::BAD_REQUEST);
        assert_eq!(e.error_code, "VALIDATION");

        let e: ApiError = MemoryError::NotFound("gone".into()).into();
        assert_eq!(e.status_code, StatusCode::NOT_FOUND);

        let e: ApiError = MemoryError::ExternalService("503".into()).into();
        assert_eq!(e.status_code, StatusCode::BAD_GATEWAY);

        let e: ApiError = MemoryError::ResourceExhausted("rate".into()).into();
        assert_eq!(e.status_code, StatusCode::TOO_MANY_REQUESTS);

        let e: ApiError = MemoryError::Other("boom".into()).into();
        assert_eq!(e.status_code, StatusCode::INTERNAL_SERVER_ERROR);
    }
}
