pub mod batch;
pub mod cohere;
pub mod jina;
pub mod openai;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::{
    error::AppError,
    utils::config::{AppConfig, EmbeddingBackend},
};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::chunker::{ChunkingMode, Tokenize};

/// What the embedding is for; providers map this onto their own task names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingTask {
    Query,
    #[default]
    Passage,
}

/// One chunk of one input text: where it sits and its vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddedChunk {
    pub char_start: usize,
    pub char_end: usize,
    pub embedding: Vec<f32>,
}

/// Remote embedding API behind a uniform chunk-aware contract.
///
/// Implementations chunk each text themselves (so late-chunking providers can
/// do it in one forward pass), split oversized batches transparently, and
/// absorb rate limits per the shared retry envelope. The returned spans come
/// from the chunker either way, so callers see one contract regardless of
/// whether chunks were embedded independently or in a single pass.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(
        &self,
        texts: &[String],
        task: EmbeddingTask,
        chunk_size: usize,
        mode: ChunkingMode,
    ) -> Result<Vec<Vec<EmbeddedChunk>>, AppError>;

    fn model_name(&self) -> &str;

    fn dimensions(&self) -> usize;
}

pub(crate) const MAX_API_RETRIES: u32 = 3;
pub(crate) const RETRY_BASE_DELAY_MS: u64 = 1000;
pub(crate) const DEFAULT_RETRY_AFTER_SECS: u64 = 10;

/// Send a provider HTTP request under the shared retry policy:
///
/// - 401 and 404 are surfaced immediately;
/// - 429 waits out `Retry-After` (default 10 s) without burning budget;
/// - 5xx and network errors get up to three attempts with exponential
///   backoff, then surface as an API error;
/// - other 4xx are surfaced immediately with their status.
pub(crate) async fn send_with_retry<F>(
    provider: &str,
    build_request: F,
) -> Result<serde_json::Value, AppError>
where
    F: Fn() -> reqwest::RequestBuilder + Send + Sync,
{
    let mut attempt: u32 = 0;
    loop {
        let response = match build_request().send().await {
            Ok(response) => response,
            Err(err) => {
                attempt += 1;
                if attempt >= MAX_API_RETRIES {
                    return Err(AppError::TransientApi(format!(
                        "{provider}: request failed after {MAX_API_RETRIES} attempts: {err}"
                    )));
                }
                warn!(provider, error = %err, attempt, "request error, retrying");
                tokio::time::sleep(backoff_delay(attempt)).await;
                continue;
            }
        };

        let status = response.status();
        if status.is_success() {
            return Ok(response.json().await?);
        }

        match status.as_u16() {
            401 => {
                return Err(AppError::Auth(format!(
                    "{provider}: invalid or expired credentials"
                )))
            }
            404 => {
                return Err(AppError::NotFound(format!(
                    "{provider}: endpoint or model not found"
                )))
            }
            429 => {
                let retry_after = response
                    .headers()
                    .get(reqwest::header::RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok())
                    .unwrap_or(DEFAULT_RETRY_AFTER_SECS);
                warn!(provider, retry_after, "rate limited, waiting");
                tokio::time::sleep(Duration::from_secs(retry_after)).await;
            }
            code if code >= 500 => {
                attempt += 1;
                let body = response.text().await.unwrap_or_default();
                if attempt >= MAX_API_RETRIES {
                    return Err(AppError::Api {
                        status: code,
                        message: format!("{provider}: {body}"),
                    });
                }
                warn!(provider, status = code, attempt, "server error, retrying");
                tokio::time::sleep(backoff_delay(attempt)).await;
            }
            code => {
                let body = response.text().await.unwrap_or_default();
                return Err(AppError::Api {
                    status: code,
                    message: format!("{provider}: {body}"),
                });
            }
        }
    }
}

/// Char spans to embed for one text, per the requested mode.
///
/// Falls back to one full-text span when chunking produces nothing for
/// non-empty text (e.g. sentence mode over pure whitespace), matching the
/// contract that a non-empty document always gets at least one vector.
pub(crate) async fn chunk_char_spans(
    chunker: &crate::chunker::Chunker,
    tokenizer: &Arc<dyn Tokenize>,
    text: &str,
    chunk_size: usize,
    mode: ChunkingMode,
) -> Result<Vec<(usize, usize)>, AppError> {
    let spans = chunker
        .chunk_async(text.to_string(), chunk_size, mode, Arc::clone(tokenizer))
        .await?;
    let mut char_spans: Vec<(usize, usize)> = spans.iter().map(|s| s.char_span).collect();
    if char_spans.is_empty() && !text.is_empty() {
        char_spans.push((0, text.len()));
    }
    Ok(char_spans)
}

fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_millis(RETRY_BASE_DELAY_MS.saturating_mul(1 << (attempt.saturating_sub(1))))
}

/// Shared HTTP client shape for provider adapters: generous call timeout,
/// bounded keepalive pool.
pub(crate) fn provider_http_client() -> Result<reqwest::Client, AppError> {
    Ok(reqwest::Client::builder()
        .timeout(Duration::from_secs(60))
        .connect_timeout(Duration::from_secs(5))
        .pool_max_idle_per_host(10)
        .build()?)
}

/// Build the configured embedding provider.
///
/// `bedrock` routes bulk indexing through the cloud batch pipeline; its
/// interactive traffic targets the OpenAI-compatible gateway configured via
/// `openai_base_url`, which is how deployments front local inference.
pub fn provider_from_config(
    cfg: &AppConfig,
    tokenizer: Arc<dyn Tokenize>,
) -> Result<Arc<dyn EmbeddingProvider>, AppError> {
    match cfg.embedding_provider {
        EmbeddingBackend::Jina => Ok(Arc::new(jina::JinaProvider::new(cfg, tokenizer)?)),
        EmbeddingBackend::Cohere => Ok(Arc::new(cohere::CohereProvider::new(cfg, tokenizer)?)),
        EmbeddingBackend::Openai => Ok(Arc::new(openai::OpenAiProvider::new(
            cfg, tokenizer, true,
        ))),
        EmbeddingBackend::Local | EmbeddingBackend::Bedrock => Ok(Arc::new(
            openai::OpenAiProvider::new(cfg, tokenizer, false),
        )),
    }
}

#[cfg(any(test, feature = "test-utils"))]
pub mod testing {
    use super::*;
    use tokio::sync::Mutex;

    /// Deterministic in-process provider for tests: fixed latency, one chunk
    /// per text, vectors derived from the text bytes.
    pub struct StubProvider {
        latency: Duration,
        dimensions: usize,
        seen: Mutex<Vec<String>>,
    }

    impl StubProvider {
        pub fn new() -> Self {
            Self::with_latency(Duration::from_millis(0))
        }

        pub fn with_latency(latency: Duration) -> Self {
            Self {
                latency,
                dimensions: 8,
                seen: Mutex::new(Vec::new()),
            }
        }

        /// Texts embedded so far, in processing order.
        pub async fn seen_texts(&self) -> Vec<String> {
            self.seen.lock().await.clone()
        }

        pub fn vector_for(text: &str, dimensions: usize) -> Vec<f32> {
            let seed = text
                .bytes()
                .fold(0u32, |acc, b| acc.wrapping_mul(31).wrapping_add(u32::from(b)));
            (0..dimensions)
                .map(|i| ((seed.wrapping_add(i as u32) % 1000) as f32) / 1000.0)
                .collect()
        }
    }

    impl Default for StubProvider {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl EmbeddingProvider for StubProvider {
        async fn embed(
            &self,
            texts: &[String],
            _task: EmbeddingTask,
            _chunk_size: usize,
            _mode: ChunkingMode,
        ) -> Result<Vec<Vec<EmbeddedChunk>>, AppError> {
            if self.latency > Duration::from_millis(0) {
                tokio::time::sleep(self.latency).await;
            }
            let mut seen = self.seen.lock().await;
            seen.extend(texts.iter().cloned());
            Ok(texts
                .iter()
                .map(|text| {
                    if text.is_empty() {
                        Vec::new()
                    } else {
                        vec![EmbeddedChunk {
                            char_start: 0,
                            char_end: text.len(),
                            embedding: Self::vector_for(text, self.dimensions),
                        }]
                    }
                })
                .collect())
        }

        fn model_name(&self) -> &str {
            "stub-embedder"
        }

        fn dimensions(&self) -> usize {
            self.dimensions
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_exponential_from_base() {
        assert_eq!(backoff_delay(1), Duration::from_millis(1000));
        assert_eq!(backoff_delay(2), Duration::from_millis(2000));
        assert_eq!(backoff_delay(3), Duration::from_millis(4000));
    }

    #[test]
    fn task_names_serialize_lowercase() {
        assert_eq!(
            serde_json::to_string(&EmbeddingTask::Query).expect("serialize"),
            "\"query\""
        );
        assert_eq!(
            serde_json::to_string(&EmbeddingTask::Passage).expect("serialize"),
            "\"passage\""
        );
    }
}
