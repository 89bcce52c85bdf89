use axum::{http::StatusCode, response::IntoResponse};

/// Process is up.
pub async fn live() -> impl IntoResponse {
    StatusCode::OK
}
