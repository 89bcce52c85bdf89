use std::sync::Arc;

use common::{error::AppError, utils::config::AppConfig};
use serde_json::json;
use tracing::debug;

use crate::chunker::{Chunker, ChunkingMode, Tokenize};

use super::{
    chunk_char_spans, provider_http_client, send_with_retry, EmbeddedChunk, EmbeddingProvider,
    EmbeddingTask,
};

const COHERE_MAX_BATCH_SIZE: usize = 96;

/// Cohere v2 embed API adapter. Chunks are embedded independently.
pub struct CohereProvider {
    client: reqwest::Client,
    api_key: String,
    api_url: String,
    model: String,
    dimensions: usize,
    max_model_len: usize,
    chunker: Chunker,
    tokenizer: Arc<dyn Tokenize>,
}

impl CohereProvider {
    pub fn new(cfg: &AppConfig, tokenizer: Arc<dyn Tokenize>) -> Result<Self, AppError> {
        if cfg.cohere_api_key.is_empty() {
            return Err(AppError::Validation(
                "COHERE_API_KEY is required for the cohere embedding provider".into(),
            ));
        }
        Ok(Self {
            client: provider_http_client()?,
            api_key: cfg.cohere_api_key.clone(),
            api_url: cfg.cohere_api_url.clone(),
            model: cfg.embedding_model.clone(),
            dimensions: cfg.embedding_dimensions as usize,
            max_model_len: cfg.embedding_max_model_len,
            chunker: Chunker::new(cfg.embedding_max_model_len),
            tokenizer,
        })
    }

    fn input_type(task: EmbeddingTask) -> &'static str {
        match task {
            EmbeddingTask::Query => "search_query",
            EmbeddingTask::Passage => "search_document",
        }
    }

    async fn request_embeddings(
        &self,
        texts: &[String],
        task: EmbeddingTask,
    ) -> Result<Vec<Vec<f32>>, AppError> {
        let mut all_embeddings = Vec::with_capacity(texts.len());
        for batch in texts.chunks(COHERE_MAX_BATCH_SIZE) {
            debug!(batch_len = batch.len(), "requesting cohere embeddings");
            let mut payload = json!({
                "model": self.model,
                "texts": batch,
                "input_type": Self::input_type(task),
                "embedding_types": ["float"],
            });
            if self.dimensions > 0 {
                payload["output_dimension"] = json!(self.dimensions);
            }
            let response = send_with_retry("cohere", || {
                self.client
                    .post(&self.api_url)
                    .bearer_auth(&self.api_key)
                    .json(&payload)
            })
            .await?;

            let floats = response
                .get("embeddings")
                .and_then(|e| e.get("float"))
                .cloned()
                .ok_or_else(|| AppError::InternalError("cohere: malformed response".into()))?;
            let vectors: Vec<Vec<f32>> = serde_json::from_value(floats)?;
            all_embeddings.extend(vectors);
        }

        if all_embeddings.len() != texts.len() {
            return Err(AppError::InternalError(format!(
                "cohere: expected {} embeddings, got {}",
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
impl EmbeddingProvider for CohereProvider {
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
