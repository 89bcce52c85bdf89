use std::sync::Arc;

use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        types::{
            connector_event::{ConnectorEvent, EventType},
            document::{Document, DocumentFields},
            embedding::Embedding,
            embedding_queue::EmbeddingQueueItem,
        },
    },
};
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

const CONSUME_BATCH_SIZE: usize = 50;
const IDLE_BACKOFF: Duration = Duration::from_millis(500);

/// Drains the durable connector-event queue into documents and embedding
/// work.
///
/// A create/update event upserts the document (idempotent on
/// `(source_id, external_id)`) and ensures exactly one pending queue item for
/// it; a delete tombstone removes the document together with its chunk
/// vectors and queue row. Events are consumed in commit order.
pub struct EventConsumer {
    db: Arc<SurrealDbClient>,
}

impl EventConsumer {
    pub fn new(db: Arc<SurrealDbClient>) -> Self {
        Self { db }
    }

    pub async fn run(&self, shutdown: CancellationToken) {
        info!("connector event consumer started");
        loop {
            if shutdown.is_cancelled() {
                break;
            }
            match self.drain_once().await {
                Ok(0) => {
                    tokio::select! {
                        () = shutdown.cancelled() => break,
                        () = sleep(IDLE_BACKOFF) => {}
                    }
                }
                Ok(count) => {
                    debug!(count, "consumed connector events");
                }
                Err(err) => {
                    error!(error = %err, "event consumption failed, backing off");
                    tokio::select! {
                        () = shutdown.cancelled() => break,
                        () = sleep(Duration::from_secs(1)) => {}
                    }
                }
            }
        }
        info!("connector event consumer stopped");
    }

    /// Consume one batch; returns how many events were processed.
    pub async fn drain_once(&self) -> Result<usize, AppError> {
        let events = ConnectorEvent::next_unconsumed(&self.db, CONSUME_BATCH_SIZE).await?;
        let count = events.len();
        for event in events {
            self.apply(&event).await?;
            ConnectorEvent::mark_consumed(&self.db, &event.id).await?;
        }
        Ok(count)
    }

    async fn apply(&self, event: &ConnectorEvent) -> Result<(), AppError> {
        match event.event_type {
            EventType::DocumentCreated | EventType::DocumentUpdated => {
                let metadata = event.metadata.clone().unwrap_or_default();
                let fields = DocumentFields {
                    title: metadata
                        .title
                        .unwrap_or_else(|| event.document_id.clone()),
                    url: metadata.url,
                    content_id: event.content_id.clone(),
                    content_type: metadata.mime_type,
                    attributes: event.attributes.clone(),
                    permissions: event.permissions.clone().unwrap_or_default(),
                    source_created_at: metadata.created_at,
                    source_updated_at: metadata.updated_at,
                };
                let document = Document::upsert_from_event(
                    &self.db,
                    &event.source_id,
                    &event.document_id,
                    fields,
                )
                .await?;
                EmbeddingQueueItem::enqueue_for_document(&self.db, &document.id).await?;
                debug!(
                    document_id = %document.id,
                    external_id = %event.document_id,
                    "document upserted and queued for embedding"
                );
            }
            EventType::DocumentDeleted => {
                match Document::delete_by_external(&self.db, &event.source_id, &event.document_id)
                    .await?
                {
                    Some(document) => {
                        Embedding::delete_for_document(&self.db, &document.id).await?;
                        EmbeddingQueueItem::delete_for_document(&self.db, &document.id).await?;
                        info!(
                            document_id = %document.id,
                            external_id = %event.document_id,
                            "document removed after tombstone"
                        );
                    }
                    None => {
                        debug!(
                            external_id = %event.document_id,
                            "tombstone for unknown document, ignoring"
                        );
                    }
                }
            }
        }
        Ok(())
    }
}
