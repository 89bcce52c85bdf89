use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use common::error::AppError;
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug, Serialize, Clone)]
pub enum ApiError {
    #[error("Internal server error")]
    InternalError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Too many requests")]
    TooManyRequests,

    #[error("Upstream error: {0}")]
    Upstream(String),
}

impl From<AppError> for ApiError {
    fn from(err: AppError) -> Self {
        match err {
            AppError::NotFound(msg) => Self::NotFound(msg),
            AppError::Validation(msg) => Self::ValidationError(msg),
            AppError::TextTooLong { length, limit } => Self::ValidationError(format!(
                "text too long: {length} chars exceeds limit of {limit}"
            )),
            AppError::Auth(msg) => Self::Unauthorized(msg),
            AppError::Overloaded | AppError::RateLimited { .. } => Self::TooManyRequests,
            AppError::Api { status, message } if status >= 500 => {
                tracing::error!(status, %message, "upstream API error");
                Self::Upstream("embedding provider unavailable".to_string())
            }
            AppError::TransientApi(msg) => {
                tracing::error!(%msg, "transient upstream error");
                Self::Upstream("embedding provider unavailable".to_string())
            }
            err => {
                tracing::error!("Internal error: {:?}", err);
                Self::InternalError("Internal server error".to_string())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::InternalError(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
            ),
            Self::ValidationError(message) => (StatusCode::BAD_REQUEST, message),
            Self::NotFound(message) => (StatusCode::NOT_FOUND, message),
            Self::Unauthorized(message) => (StatusCode::UNAUTHORIZED, message),
            Self::TooManyRequests => (
                StatusCode::TOO_MANY_REQUESTS,
                "Too many requests".to_string(),
            ),
            Self::Upstream(message) => (StatusCode::BAD_GATEWAY, message),
        };
        (
            status,
            Json(ErrorResponse {
                error: message,
                status: "error".to_string(),
            }),
        )
            .into_response()
    }
}

#[derive(Serialize, Debug)]
struct ErrorResponse {
    error: String,
    status: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fmt::Debug;

    fn assert_status_code<T: IntoResponse + Debug>(response: T, expected_status: StatusCode) {
        let response = response.into_response();
        assert_eq!(response.status(), expected_status);
    }

    #[test]
    fn app_error_conversions() {
        let not_found = AppError::NotFound("resource not found".to_string());
        assert!(matches!(
            ApiError::from(not_found),
            ApiError::NotFound(msg) if msg == "resource not found"
        ));

        let auth = AppError::Auth("bad key".to_string());
        assert!(matches!(ApiError::from(auth), ApiError::Unauthorized(_)));

        let overloaded = AppError::Overloaded;
        assert!(matches!(ApiError::from(overloaded), ApiError::TooManyRequests));

        let too_long = AppError::TextTooLong {
            length: 100,
            limit: 10,
        };
        assert!(matches!(ApiError::from(too_long), ApiError::ValidationError(_)));

        let upstream = AppError::Api {
            status: 503,
            message: "bad upstream".to_string(),
        };
        assert!(matches!(ApiError::from(upstream), ApiError::Upstream(_)));

        let internal = AppError::Io(std::io::Error::other("io error"));
        assert!(matches!(ApiError::from(internal), ApiError::InternalError(_)));
    }

    #[test]
    fn response_status_codes() {
        assert_status_code(
            ApiError::InternalError("x".into()),
            StatusCode::INTERNAL_SERVER_ERROR,
        );
        assert_status_code(ApiError::ValidationError("x".into()), StatusCode::BAD_REQUEST);
        assert_status_code(ApiError::NotFound("x".into()), StatusCode::NOT_FOUND);
        assert_status_code(ApiError::Unauthorized("x".into()), StatusCode::UNAUTHORIZED);
        assert_status_code(ApiError::TooManyRequests, StatusCode::TOO_MANY_REQUESTS);
        assert_status_code(ApiError::Upstream("x".into()), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn internal_errors_are_sanitized() {
        let api_error = ApiError::InternalError("db password incorrect".to_string());
        assert_eq!(api_error.to_string(), "Internal server error");
        assert_status_code(api_error, StatusCode::INTERNAL_SERVER_ERROR);
    }
}
