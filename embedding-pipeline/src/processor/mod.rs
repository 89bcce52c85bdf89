pub mod cloud;

use std::sync::Arc;

use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        store::StorageManager,
        types::{
            content_blob::ContentBlob,
            document::{Document, EmbeddingStatus},
            embedding::{ChunkVector, Embedding},
            embedding_queue::{EmbeddingQueueItem, DEFAULT_LEASE_SECS, MAX_RETRIES},
            sync_run::SyncRun,
        },
    },
};
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::chunker::ChunkingMode;
use crate::dispatcher::{EmbeddingDispatcher, EmbeddingRequest, Priority};
use crate::provider::EmbeddingTask;

pub const ONLINE_BATCH_SIZE: usize = 10;
pub const ONLINE_POLL_INTERVAL: Duration = Duration::from_secs(5);
/// Yield between batches so interactive traffic gets a look in.
pub const ONLINE_BATCH_DELAY: Duration = Duration::from_millis(100);
/// Token budget per indexed chunk; capped by the model's sequence limit.
pub const DOCUMENT_CHUNK_SIZE: usize = 512;

const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);

/// Online batch processor: claims embedding work, pushes document content
/// through the dispatcher at bulk priority, persists the chunk vectors.
pub struct OnlineProcessor {
    db: Arc<SurrealDbClient>,
    storage: StorageManager,
    dispatcher: EmbeddingDispatcher,
    worker_id: String,
    chunk_size: usize,
}

impl OnlineProcessor {
    pub fn new(
        db: Arc<SurrealDbClient>,
        storage: StorageManager,
        dispatcher: EmbeddingDispatcher,
        max_model_len: usize,
    ) -> Self {
        Self {
            db,
            storage,
            dispatcher,
            worker_id: format!("embedding-worker-{}", Uuid::new_v4()),
            chunk_size: DOCUMENT_CHUNK_SIZE.min(max_model_len),
        }
    }

    pub async fn run(&self, shutdown: CancellationToken) {
        info!(worker_id = %self.worker_id, "online embedding processor started");
        let lease = chrono::Duration::seconds(DEFAULT_LEASE_SECS);
        loop {
            if shutdown.is_cancelled() {
                break;
            }
            match EmbeddingQueueItem::claim_pending(
                &self.db,
                &self.worker_id,
                ONLINE_BATCH_SIZE,
                lease,
            )
            .await
            {
                Ok(items) if items.is_empty() => {
                    tokio::select! {
                        () = shutdown.cancelled() => break,
                        () = sleep(ONLINE_POLL_INTERVAL) => {}
                    }
                }
                Ok(items) => {
                    debug!(claimed = items.len(), "claimed embedding work");
                    for item in &items {
                        if shutdown.is_cancelled() {
                            // Give unprocessed claims straight back
                            if let Err(err) = EmbeddingQueueItem::release_for_retry(
                                &self.db,
                                &item.id,
                                "worker shutting down",
                            )
                            .await
                            {
                                warn!(error = %err, item_id = %item.id, "failed to release claim on shutdown");
                            }
                            continue;
                        }
                        self.process_item(item).await;
                    }
                    tokio::select! {
                        () = shutdown.cancelled() => break,
                        () = sleep(ONLINE_BATCH_DELAY) => {}
                    }
                }
                Err(err) => {
                    error!(error = %err, "failed to claim embedding work, backing off");
                    tokio::select! {
                        () = shutdown.cancelled() => break,
                        () = sleep(Duration::from_secs(1)) => {}
                    }
                }
            }
        }
        info!(worker_id = %self.worker_id, "online embedding processor stopped");
    }

    /// Drive one claimed item to a terminal or retryable state.
    pub async fn process_item(&self, item: &EmbeddingQueueItem) {
        match self.embed_document(item).await {
            Ok(chunk_count) => {
                let completed = async {
                    EmbeddingQueueItem::mark_completed(&self.db, &[item.id.clone()]).await?;
                    Document::set_embedding_status(
                        &self.db,
                        &item.document_id,
                        EmbeddingStatus::Completed,
                    )
                    .await
                };
                if let Err(err) = completed.await {
                    error!(error = %err, item_id = %item.id, "failed to record completion");
                    return;
                }
                info!(
                    item_id = %item.id,
                    document_id = %item.document_id,
                    chunk_count,
                    "document embedded"
                );
            }
            Err(err) => {
                let retryable = err.is_retryable() && item.retry_count + 1 < MAX_RETRIES;
                warn!(
                    error = %err,
                    item_id = %item.id,
                    document_id = %item.document_id,
                    retry_count = item.retry_count,
                    retryable,
                    "embedding attempt failed"
                );
                let outcome = async {
                    if retryable {
                        EmbeddingQueueItem::release_for_retry(&self.db, &item.id, &err.to_string())
                            .await?;
                        Document::set_embedding_status(
                            &self.db,
                            &item.document_id,
                            EmbeddingStatus::Pending,
                        )
                        .await
                    } else {
                        EmbeddingQueueItem::mark_failed(
                            &self.db,
                            &[item.id.clone()],
                            &err.to_string(),
                        )
                        .await?;
                        Document::set_embedding_status(
                            &self.db,
                            &item.document_id,
                            EmbeddingStatus::Failed,
                        )
                        .await
                    }
                };
                if let Err(err) = outcome.await {
                    error!(error = %err, item_id = %item.id, "failed to record embedding failure");
                }
            }
        }
    }

    async fn embed_document(&self, item: &EmbeddingQueueItem) -> Result<usize, AppError> {
        let document: Document = self
            .db
            .get_item(&item.document_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("document {}", item.document_id)))?;

        Document::set_embedding_status(&self.db, &document.id, EmbeddingStatus::Processing)
            .await?;

        let content_id = document
            .content_id
            .as_deref()
            .ok_or_else(|| AppError::Validation(format!("document {} has no content", document.id)))?;
        let (_, bytes) = ContentBlob::load(&self.db, &self.storage, content_id).await?;
        let text = String::from_utf8_lossy(&bytes).into_owned();

        if text.is_empty() {
            // Nothing to index; completed with an empty vector set
            Embedding::store_for_document(&self.db, &document.id, Vec::new(), "").await?;
            return Ok(0);
        }

        let response = self
            .dispatcher
            .submit(
                EmbeddingRequest {
                    texts: vec![text],
                    task: EmbeddingTask::Passage,
                    chunk_size: self.chunk_size,
                    mode: ChunkingMode::Sentence,
                },
                Priority::Low,
            )
            .await?;

        let chunks: Vec<ChunkVector> = response
            .chunks
            .into_iter()
            .next()
            .unwrap_or_default()
            .into_iter()
            .map(|chunk| ChunkVector {
                char_start: chunk.char_start,
                char_end: chunk.char_end,
                embedding: chunk.embedding,
            })
            .collect();
        if chunks.is_empty() {
            return Err(AppError::MissingEmbedding(document.id.clone()));
        }

        Embedding::store_for_document(&self.db, &document.id, chunks, &response.model_name).await
    }
}

/// Periodic queue hygiene: expired leases back to pending, dead letters
/// recirculated, stalled syncs failed.
pub async fn run_maintenance_loop(
    db: Arc<SurrealDbClient>,
    stale_sync_timeout_minutes: i64,
    shutdown: CancellationToken,
) {
    info!("queue maintenance loop started");
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            () = sleep(MAINTENANCE_INTERVAL) => {}
        }

        match EmbeddingQueueItem::requeue_expired_leases(&db).await {
            Ok(requeued) if !requeued.is_empty() => {
                warn!(count = requeued.len(), "requeued embedding items with expired leases");
            }
            Ok(_) => {}
            Err(err) => error!(error = %err, "lease reaper failed"),
        }

        match EmbeddingQueueItem::reset_dead_letters(&db).await {
            Ok(reset) if !reset.is_empty() => {
                info!(count = reset.len(), "reset dead-lettered embedding items");
            }
            Ok(_) => {}
            Err(err) => error!(error = %err, "dead-letter reset failed"),
        }

        match SyncRun::reap_stale(&db, stale_sync_timeout_minutes).await {
            Ok(reaped) if !reaped.is_empty() => {
                warn!(count = reaped.len(), "reaped stale sync runs");
            }
            Ok(_) => {}
            Err(err) => error!(error = %err, "stale sync reaper failed"),
        }
    }
    info!("queue maintenance loop stopped");
}
