use async_openai::error::OpenAIError;
use thiserror::Error;
use tokio::task::JoinError;

// Core internal errors
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] surrealdb::Error),
    #[error("OpenAI error: {0}")]
    OpenAI(#[from] OpenAIError),
    #[error("Authorization error: {0}")]
    Auth(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },
    #[error("Transient API error: {0}")]
    TransientApi(String),
    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },
    #[error("Cancelled")]
    Cancelled,
    #[error("Storage error: {0}")]
    Storage(#[from] object_store::Error),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Text too long: {length} chars exceeds limit of {limit}")]
    TextTooLong { length: usize, limit: usize },
    #[error("Missing embedding in batch output for document {0}")]
    MissingEmbedding(String),
    #[error("Embedding queue overloaded")]
    Overloaded,
    #[error("Task join error: {0}")]
    Join(#[from] JoinError),
    #[error("IoError: {0}")]
    Io(#[from] std::io::Error),
    #[error("Reqwest error: {0}")]
    Reqwest(#[from] reqwest::Error),
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("Internal service error: {0}")]
    InternalError(String),
}

impl AppError {
    /// Whether a failed embedding task may be retried by the work queue.
    ///
    /// Auth failures, missing resources and invalid input will fail the same
    /// way on every attempt; everything else is worth another pass. An `Api`
    /// error is retryable only when the upstream was at fault (5xx after the
    /// provider exhausted its own retries).
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Auth(_)
            | Self::NotFound(_)
            | Self::Validation(_)
            | Self::TextTooLong { .. }
            | Self::Cancelled => false,
            Self::Api { status, .. } => *status >= 500,
            _ => true,
        }
    }
}
