#![allow(clippy::missing_docs_in_private_items)]

//! Indexing and embedding pipeline: chunking, provider adapters, the
//! priority dispatcher, the connector-event consumer and the two batch
//! processing modes over the embedding work queue.

pub mod chunker;
pub mod consumer;
pub mod dispatcher;
pub mod processor;
pub mod provider;

use std::sync::Arc;

use common::{error::AppError, utils::config::AppConfig};

use chunker::{HfTokenizer, Tokenize, WhitespaceTokenizer};

/// Tokenizer for chunking, from config. Without a tokenizer file the
/// whitespace fallback applies (a word approximates a token), which keeps
/// span arithmetic exact even if token budgets run coarse.
pub fn tokenizer_from_config(cfg: &AppConfig) -> Result<Arc<dyn Tokenize>, AppError> {
    match cfg.embedding_tokenizer_path.as_deref() {
        Some(path) => Ok(Arc::new(HfTokenizer::from_file(path)?)),
        None => Ok(Arc::new(WhitespaceTokenizer)),
    }
}
