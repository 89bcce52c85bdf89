use axum::{extract::State, response::IntoResponse, Json};
use embedding_pipeline::chunker::ChunkingMode;
use embedding_pipeline::dispatcher::{EmbeddingRequest, Priority};
use embedding_pipeline::provider::EmbeddingTask;
use serde::{Deserialize, Serialize};

use crate::{api_state::ApiState, error::ApiError};

fn default_chunk_size() -> usize {
    512
}

#[derive(Debug, Deserialize)]
pub struct EmbeddingsParams {
    pub texts: Vec<String>,
    #[serde(default)]
    pub task: EmbeddingTask,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default)]
    pub chunking_mode: ChunkingMode,
    #[serde(default)]
    pub priority: Priority,
}

#[derive(Debug, Serialize)]
pub struct EmbeddingsResponse {
    /// `embeddings[i][j]` is the vector for span `chunks[i][j]` of text `i`.
    pub embeddings: Vec<Vec<Vec<f32>>>,
    pub chunks_count: Vec<usize>,
    pub chunks: Vec<Vec<(usize, usize)>>,
    pub model_name: String,
}

/// Embed texts through the priority dispatcher. Interactive callers submit
/// at `high`; bulk traffic inside the service never goes through this route.
pub async fn create_embeddings(
    State(state): State<ApiState>,
    Json(params): Json<EmbeddingsParams>,
) -> Result<impl IntoResponse, ApiError> {
    if params.texts.is_empty() {
        return Err(ApiError::ValidationError("texts must not be empty".into()));
    }

    let response = state
        .dispatcher
        .submit(
            EmbeddingRequest {
                texts: params.texts,
                task: params.task,
                chunk_size: params.chunk_size,
                mode: params.chunking_mode,
            },
            params.priority,
        )
        .await?;

    let chunks_count: Vec<usize> = response.chunks.iter().map(Vec::len).collect();
    let chunks: Vec<Vec<(usize, usize)>> = response
        .chunks
        .iter()
        .map(|text_chunks| {
            text_chunks
                .iter()
                .map(|chunk| (chunk.char_start, chunk.char_end))
                .collect()
        })
        .collect();
    let embeddings: Vec<Vec<Vec<f32>>> = response
        .chunks
        .into_iter()
        .map(|text_chunks| {
            text_chunks
                .into_iter()
                .map(|chunk| chunk.embedding)
                .collect()
        })
        .collect();

    Ok(Json(EmbeddingsResponse {
        embeddings,
        chunks_count,
        chunks,
        model_name: response.model_name,
    }))
}
