use std::sync::Arc;

use async_openai::{config::OpenAIConfig, types::CreateEmbeddingRequestArgs, Client};
use common::{error::AppError, utils::config::AppConfig};
use tokio_retry::{
    strategy::{jitter, ExponentialBackoff},
    RetryIf,
};
use tracing::debug;

use crate::chunker::{Chunker, ChunkingMode, Tokenize};

use super::{
    chunk_char_spans, EmbeddedChunk, EmbeddingProvider, EmbeddingTask, MAX_API_RETRIES,
    RETRY_BASE_DELAY_MS,
};

const OPENAI_MAX_BATCH_SIZE: usize = 2048;

/// OpenAI-compatible embeddings adapter. Also fronts local vLLM-style
/// endpoints via the base-url override; those reject the `dimensions`
/// parameter, so it is only sent when `send_dimensions` is set.
///
/// OpenAI has no task parameter; `query` and `passage` embed identically.
pub struct OpenAiProvider {
    client: Client<OpenAIConfig>,
    model: String,
    dimensions: usize,
    send_dimensions: bool,
    max_model_len: usize,
    chunker: Chunker,
    tokenizer: Arc<dyn Tokenize>,
}

impl OpenAiProvider {
    pub fn new(cfg: &AppConfig, tokenizer: Arc<dyn Tokenize>, send_dimensions: bool) -> Self {
        let client = Client::with_config(
            OpenAIConfig::new()
                .with_api_key(&cfg.openai_api_key)
                .with_api_base(&cfg.openai_base_url),
        );
        Self {
            client,
            model: cfg.embedding_model.clone(),
            dimensions: cfg.embedding_dimensions as usize,
            send_dimensions,
            max_model_len: cfg.embedding_max_model_len,
            chunker: Chunker::new(cfg.embedding_max_model_len),
            tokenizer,
        }
    }

    async fn request_embeddings(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, AppError> {
        let mut all_embeddings = Vec::with_capacity(texts.len());
        for batch in texts.chunks(OPENAI_MAX_BATCH_SIZE) {
            debug!(batch_len = batch.len(), "requesting openai embeddings");
            let mut args = CreateEmbeddingRequestArgs::default();
            args.model(&self.model).input(batch.to_vec());
            if self.send_dimensions && self.dimensions > 0 {
                args.dimensions(self.dimensions as u32);
            }
            let request = args.build()?;

            let strategy = ExponentialBackoff::from_millis(RETRY_BASE_DELAY_MS)
                .map(jitter)
                .take(MAX_API_RETRIES as usize);
            let response = RetryIf::spawn(
                strategy,
                || {
                    let request = request.clone();
                    async move { self.client.embeddings().create(request).await }
                },
                |err: &async_openai::error::OpenAIError| {
                    matches!(err, async_openai::error::OpenAIError::Reqwest(_))
                },
            )
            .await?;

            for item in response.data {
                all_embeddings.push(item.embedding);
            }
        }

        if all_embeddings.len() != texts.len() {
            return Err(AppError::InternalError(format!(
                "openai: expected {} embeddings, got {}",
                texts.len(),
                all_embeddings.len()
            )));
        }
        Ok(all_embeddings)
    }

    async fn embed_one(
        &self,
        text: &str,
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
        let vectors = self.request_embeddings(&chunk_texts).await?;

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
impl EmbeddingProvider for OpenAiProvider {
    async fn embed(
        &self,
        texts: &[String],
        _task: EmbeddingTask,
        chunk_size: usize,
        mode: ChunkingMode,
    ) -> Result<Vec<Vec<EmbeddedChunk>>, AppError> {
        let mut results = Vec::with_capacity(texts.len());
        for text in texts {
            results.push(self.embed_one(text, chunk_size, mode).await?);
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
    use crate::chunker::WhitespaceTokenizer;

    #[test]
    fn reports_configured_model_and_dimensions() {
        let cfg = AppConfig {
            embedding_model: "text-embedding-3-small".into(),
            embedding_dimensions: 256,
            ..Default::default()
        };
        let provider = OpenAiProvider::new(&cfg, Arc::new(WhitespaceTokenizer), true);
        assert_eq!(provider.model_name(), "text-embedding-3-small");
        assert_eq!(provider.dimensions(), 256);
    }
}
