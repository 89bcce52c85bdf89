use std::sync::Arc;

use common::{error::AppError, utils::config::AppConfig};
use serde_json::json;
use tracing::debug;

use crate::chunker::{Chunker, ChunkingMode, Tokenize};

use super::{
    chunk_char_spans, provider_http_client, send_with_retry, EmbeddedChunk, EmbeddingProvider,
    EmbeddingTask,
};

const JINA_MAX_BATCH_SIZE: usize = 2048;

/// Jina AI embeddings API adapter. Requests late chunking so all chunks of a
/// text share one forward pass.
pub struct JinaProvider {
    client: reqwest::Client,
    api_key: String,
    api_url: String,
    model: String,
    dimensions: usize,
    max_model_len: usize,
    chunker: Chunker,
    tokenizer: Arc<dyn Tokenize>,
}

impl JinaProvider {
    pub fn new(cfg: &AppConfig, tokenizer: Arc<dyn Tokenize>) -> Result<Self, AppError> {
        if cfg.jina_api_key.is_empty() {
            return Err(AppError::Validation(
                "JINA_API_KEY is required for the jina embedding provider".into(),
            ));
        }
        Ok(Self {
            client: provider_http_client()?,
            api_key: cfg.jina_api_key.clone(),
            api_url: cfg.jina_api_url.clone(),
            model: cfg.embedding_model.clone(),
            dimensions: cfg.embedding_dimensions as usize,
            max_model_len: cfg.embedding_max_model_len,
            chunker: Chunker::new(cfg.embedding_max_model_len),
            tokenizer,
        })
    }

    fn task_name(task: EmbeddingTask) -> &'static str {
        match task {
            EmbeddingTask::Query => "retrieval.query",
            EmbeddingTask::Passage => "retrieval.passage",
        }
    }

    async fn request_embeddings(
        &self,
        texts: &[String],
        task: EmbeddingTask,
    ) -> Result<Vec<Vec<f32>>, AppError> {
        let mut all_embeddings = Vec::with_capacity(texts.len());
        for batch in texts.chunks(JINA_MAX_BATCH_SIZE) {
            debug!(batch_len = batch.len(), "requesting jina embeddings");
            let payload = json!({
                "model": self.model,
                "task": Self::task_name(task),
                "input": batch,
                "late_chunking": true,
                "dimensions": self.dimensions,
            });
            let response = send_with_retry("jina", || {
                self.client
                    .post(&self.api_url)
                    .bearer_auth(&self.api_key)
                    .json(&payload)
            })
            .await?;

            let data = response
                .get("data")
                .and_then(|d| d.as_array())
                .ok_or_else(|| AppError::InternalError("jina: malformed response".into()))?;
            for item in data {
                let embedding: Vec<f32> = serde_json::from_value(
                    item.get("embedding")
                        .cloned()
                        .ok_or_else(|| AppError::InternalError("jina: missing embedding".into()))?,
                )?;
                all_embeddings.push(embedding);
            }
        }

        if all_embeddings.len() != texts.len() {
            return Err(AppError::InternalError(format!(
                "jina: expected {} embeddings, got {}",
                texts.len(),
                all_embeddings.len()
            )));
        }
        Ok(all_embeddings)
    }

    async fn embed_one(
        &self,
        text: &str,
        task: EmbeddingTask,
        chunk_size: usize,
        mode: ChunkingMode,
    ) -> Result<Vec<EmbeddedChunk>, AppError> {
        let effective_chunk_size = chunk_size.min(self.max_model_len);
        let spans = chunk_char_spans(
            &self.chunker,
            &self.tokenizer,
            text,
            effective_chunk_size,
            mode,
        )
        .await?;
        if spans.is_empty() {
            return Ok(Vec::new());
        }

        let chunk_texts: Vec<String> = spans
            .iter()
            .filter_map(|&(start, end)| text.get(start..end).map(str::to_string))
            .collect();
        let vectors = self.request_embeddings(&chunk_texts, task).await?;

        Ok(spans
            .into_iter()
            .zip(vectors)
            .map(|((char_start, char_end), embedding)| EmbeddedChunk {
                char_start,
                char_end,
                embedding,
            })
            .collect())
    }
}

#[async_trait::async_trait]
impl EmbeddingProvider for JinaProvider {
    async fn embed(
        &self,
        texts: &[String],
        task: EmbeddingTask,
        chunk_size: usize,
        mode: ChunkingMode,
    ) -> Result<Vec<Vec<EmbeddedChunk>>, AppError> {
        let mut results = Vec::with_capacity(texts.len());
        for text in texts {
            results.push(self.embed_one(text, task, chunk_size, mode).await?);
        }
        Ok(results)
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_api_key_is_rejected() {
        let cfg = AppConfig {
            embedding_model: "jina-embeddings-v3".into(),
            ..Default::default()
        };
        let err = JinaProvider::new(&cfg, Arc::new(crate::chunker::WhitespaceTokenizer))
            .map(|_| ())
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[test]
    fn task_mapping_matches_the_api() {
        assert_eq!(JinaProvider::task_name(EmbeddingTask::Query), "retrieval.query");
        assert_eq!(
            JinaProvider::task_name(EmbeddingTask::Passage),
            "retrieval.passage"
        );
    }
}
