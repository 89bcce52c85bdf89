use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        store::StorageManager,
        types::{
            content_blob::ContentBlob,
            document::{Document, EmbeddingStatus},
            embedding::{ChunkVector, Embedding},
            embedding_batch_job::{BatchJobStatus, EmbeddingBatchJob},
            embedding_queue::EmbeddingQueueItem,
        },
    },
    utils::config::AppConfig,
};
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::provider::batch::{
    parse_output_jsonl, to_jsonl, BatchInferenceBackend, BatchInputRecord, BatchModelInput,
};

#[derive(Debug, Clone)]
pub struct CloudBatchConfig {
    pub min_documents: usize,
    pub max_documents: usize,
    pub accumulation_timeout: Duration,
    pub accumulation_poll_interval: Duration,
    pub monitor_poll_interval: Duration,
}

impl From<&AppConfig> for CloudBatchConfig {
    fn from(cfg: &AppConfig) -> Self {
        Self {
            min_documents: cfg.embedding_batch_min_documents,
            max_documents: cfg.embedding_batch_max_documents,
            accumulation_timeout: Duration::from_secs(
                cfg.embedding_batch_accumulation_timeout_seconds,
            ),
            accumulation_poll_interval: Duration::from_secs(
                cfg.embedding_batch_accumulation_poll_interval,
            ),
            monitor_poll_interval: Duration::from_secs(cfg.embedding_batch_monitor_poll_interval),
        }
    }
}

/// Cloud batch processor: accumulates pending queue items into large
/// provider-side inference jobs instead of calling the API per document.
///
/// Items assigned to a job carry its id and are untouchable by any other
/// path until the job reaches a terminal state. A crash between submission
/// and ingestion is recovered by `reconcile` on the next boot.
pub struct CloudBatchProcessor {
    db: Arc<SurrealDbClient>,
    storage: StorageManager,
    backend: Arc<dyn BatchInferenceBackend>,
    config: CloudBatchConfig,
    model_name: String,
}

impl CloudBatchProcessor {
    pub fn new(
        db: Arc<SurrealDbClient>,
        storage: StorageManager,
        backend: Arc<dyn BatchInferenceBackend>,
        config: CloudBatchConfig,
        model_name: String,
    ) -> Self {
        Self {
            db,
            storage,
            backend,
            config,
            model_name,
        }
    }

    pub async fn run(&self, shutdown: CancellationToken) {
        info!("cloud batch processor started");

        if let Err(err) = self.reconcile().await {
            error!(error = %err, "batch reconciliation failed");
        }

        // Resume monitoring anything reconcile left in flight
        match EmbeddingBatchJob::get_unfinished(&self.db).await {
            Ok(jobs) => {
                for job in jobs {
                    if shutdown.is_cancelled() {
                        break;
                    }
                    self.monitor_and_resolve(&job, &shutdown).await;
                }
            }
            Err(err) => error!(error = %err, "failed to list unfinished batch jobs"),
        }

        loop {
            if shutdown.is_cancelled() {
                break;
            }
            match self.accumulate_once().await {
                Ok(Some(job)) => {
                    self.monitor_and_resolve(&job, &shutdown).await;
                }
                Ok(None) => {
                    tokio::select! {
                        () = shutdown.cancelled() => break,
                        () = sleep(self.config.accumulation_poll_interval) => {}
                    }
                }
                Err(err) => {
                    error!(error = %err, "batch accumulation failed, backing off");
                    tokio::select! {
                        () = shutdown.cancelled() => break,
                        () = sleep(Duration::from_secs(1)) => {}
                    }
                }
            }
        }
        info!("cloud batch processor stopped");
    }

    /// Check accumulation thresholds; submit a job when enough documents are
    /// waiting or the oldest has waited out the accumulation timeout.
    pub async fn accumulate_once(&self) -> Result<Option<EmbeddingBatchJob>, AppError> {
        let items = EmbeddingQueueItem::peek_pending(&self.db, self.config.max_documents).await?;
        let Some(oldest) = items.first() else {
            return Ok(None);
        };

        let oldest_age = (Utc::now() - oldest.created_at)
            .to_std()
            .unwrap_or_default();
        if items.len() < self.config.min_documents && oldest_age < self.config.accumulation_timeout
        {
            return Ok(None);
        }

        self.submit_batch(items).await
    }

    /// Serialize the items' content as JSONL, hand the job to the backend and
    /// bind the items to it.
    pub async fn submit_batch(
        &self,
        items: Vec<EmbeddingQueueItem>,
    ) -> Result<Option<EmbeddingBatchJob>, AppError> {
        let mut records = Vec::with_capacity(items.len());
        let mut included_ids = Vec::with_capacity(items.len());

        for item in &items {
            match self.input_record_for(item).await {
                Ok(record) => {
                    records.push(record);
                    included_ids.push(item.id.clone());
                }
                Err(err) => {
                    warn!(error = %err, item_id = %item.id, "excluding item from batch");
                    EmbeddingQueueItem::mark_failed(&self.db, &[item.id.clone()], &err.to_string())
                        .await?;
                    Document::set_embedding_status(
                        &self.db,
                        &item.document_id,
                        EmbeddingStatus::Failed,
                    )
                    .await?;
                }
            }
        }
        if records.is_empty() {
            return Ok(None);
        }

        let job = EmbeddingBatchJob::new(self.model_name.clone());
        let jsonl = to_jsonl(&records)?;
        self.storage
            .put(&job.input_key, Bytes::from(jsonl.into_bytes()))
            .await?;

        self.db.store_item(job.clone()).await?;
        EmbeddingQueueItem::assign_to_batch(&self.db, &included_ids, &job.id).await?;

        match self
            .backend
            .submit(&job.input_key, &job.output_key, &self.model_name)
            .await
        {
            Ok(arn) => {
                EmbeddingBatchJob::mark_submitted(&self.db, &job.id, &arn).await?;
                info!(
                    job_id = %job.id,
                    documents = included_ids.len(),
                    provider_job_arn = %arn,
                    "batch job submitted"
                );
                let job = self
                    .db
                    .get_item(&job.id)
                    .await?
                    .unwrap_or(job);
                Ok(Some(job))
            }
            Err(err) => {
                error!(error = %err, job_id = %job.id, "batch submission failed");
                EmbeddingBatchJob::set_status(
                    &self.db,
                    &job.id,
                    BatchJobStatus::Failed,
                    Some(&err.to_string()),
                )
                .await?;
                EmbeddingQueueItem::fail_batch(&self.db, &job.id, &err.to_string()).await?;
                Err(err)
            }
        }
    }

    /// One JSONL input line for a queue item: its document's content body,
    /// keyed by the item id so output rows can be correlated.
    async fn input_record_for(
        &self,
        item: &EmbeddingQueueItem,
    ) -> Result<BatchInputRecord, AppError> {
        let document: Document = self
            .db
            .get_item(&item.document_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("document {}", item.document_id)))?;
        let content_id = document
            .content_id
            .as_deref()
            .ok_or_else(|| AppError::Validation(format!("document {} has no content", document.id)))?;
        let (_, bytes) = ContentBlob::load(&self.db, &self.storage, content_id).await?;
        Document::set_embedding_status(&self.db, &document.id, EmbeddingStatus::Processing)
            .await?;
        Ok(BatchInputRecord {
            record_id: item.id.clone(),
            model_input: BatchModelInput {
                input_text: String::from_utf8_lossy(&bytes).into_owned(),
            },
        })
    }

    /// Poll the backend until the job settles, then ingest or fail its items.
    async fn monitor_and_resolve(&self, job: &EmbeddingBatchJob, shutdown: &CancellationToken) {
        let Some(arn) = job.provider_job_arn.clone() else {
            warn!(job_id = %job.id, "job without provider handle, failing its items");
            self.fail_job(job, "batch job lost before submission").await;
            return;
        };

        loop {
            if shutdown.is_cancelled() {
                return;
            }
            match self.backend.job_status(&arn).await {
                Ok(status) => {
                    if let Err(err) =
                        EmbeddingBatchJob::set_status(&self.db, &job.id, status, None).await
                    {
                        error!(error = %err, job_id = %job.id, "failed to record job status");
                    }
                    match status {
                        BatchJobStatus::Completed => {
                            if let Err(err) = self.ingest_job(job).await {
                                error!(error = %err, job_id = %job.id, "batch ingestion failed");
                                self.fail_job(job, &err.to_string()).await;
                            }
                            return;
                        }
                        status if status.is_terminal() => {
                            warn!(job_id = %job.id, ?status, "batch job ended without output");
                            self.fail_job(job, &format!("batch job {status:?}")).await;
                            return;
                        }
                        _ => {}
                    }
                }
                Err(err) => {
                    warn!(error = %err, job_id = %job.id, "job status poll failed");
                }
            }
            tokio::select! {
                () = shutdown.cancelled() => return,
                () = sleep(self.config.monitor_poll_interval) => {}
            }
        }
    }

    /// Stream the output artifact and persist one vector per document.
    /// Items without an output row are failed with a missing-embedding error.
    pub async fn ingest_job(&self, job: &EmbeddingBatchJob) -> Result<(), AppError> {
        let raw = self.storage.get(&job.output_key).await?;
        let outputs = parse_output_jsonl(&String::from_utf8_lossy(&raw))?;
        let by_record: HashMap<String, Vec<f32>> = outputs
            .into_iter()
            .filter_map(|record| {
                record
                    .model_output
                    .map(|output| (record.record_id, output.embedding))
            })
            .collect();

        let items = EmbeddingQueueItem::get_for_batch(&self.db, &job.id).await?;
        let mut completed = Vec::new();
        for item in items {
            match by_record.get(&item.id) {
                Some(vector) => match self.persist_item_vector(&item, vector, job).await {
                    Ok(()) => completed.push(item.id),
                    Err(err) => {
                        warn!(error = %err, item_id = %item.id, "failed to persist batch vector");
                        EmbeddingQueueItem::mark_failed(&self.db, &[item.id], &err.to_string())
                            .await?;
                        Document::set_embedding_status(
                            &self.db,
                            &item.document_id,
                            EmbeddingStatus::Failed,
                        )
                        .await?;
                    }
                },
                None => {
                    let err = AppError::MissingEmbedding(item.document_id.clone());
                    EmbeddingQueueItem::mark_failed(&self.db, &[item.id], &err.to_string())
                        .await?;
                    Document::set_embedding_status(
                        &self.db,
                        &item.document_id,
                        EmbeddingStatus::Failed,
                    )
                    .await?;
                }
            }
        }

        info!(job_id = %job.id, completed = completed.len(), "batch job ingested");
        EmbeddingQueueItem::mark_completed(&self.db, &completed).await?;
        Ok(())
    }

    async fn persist_item_vector(
        &self,
        item: &EmbeddingQueueItem,
        vector: &[f32],
        job: &EmbeddingBatchJob,
    ) -> Result<(), AppError> {
        let document: Document = self
            .db
            .get_item(&item.document_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("document {}", item.document_id)))?;
        let content_id = document
            .content_id
            .as_deref()
            .ok_or_else(|| AppError::Validation(format!("document {} has no content", document.id)))?;
        let (_, bytes) = ContentBlob::load(&self.db, &self.storage, content_id).await?;

        // Batch inference embeds the whole document as one chunk
        Embedding::store_for_document(
            &self.db,
            &document.id,
            vec![ChunkVector {
                char_start: 0,
                char_end: bytes.len(),
                embedding: vector.to_vec(),
            }],
            &job.model_name,
        )
        .await?;
        Document::set_embedding_status(&self.db, &document.id, EmbeddingStatus::Completed).await?;
        Ok(())
    }

    async fn fail_job(&self, job: &EmbeddingBatchJob, reason: &str) {
        let result = async {
            EmbeddingBatchJob::set_status(&self.db, &job.id, BatchJobStatus::Failed, Some(reason))
                .await?;
            EmbeddingQueueItem::fail_batch(&self.db, &job.id, reason).await
        };
        if let Err(err) = result.await {
            error!(error = %err, job_id = %job.id, "failed to record batch job failure");
        }
    }

    /// Startup sweep: every item stuck in `processing` with a batch job
    /// attached gets its job's fate re-checked, so a crash between submission
    /// and ingestion cannot strand work.
    pub async fn reconcile(&self) -> Result<(), AppError> {
        let stranded = EmbeddingQueueItem::stranded_batch_items(&self.db).await?;
        if stranded.is_empty() {
            return Ok(());
        }

        let mut job_ids: Vec<String> = stranded
            .into_iter()
            .filter_map(|item| item.batch_job_id)
            .collect();
        job_ids.sort();
        job_ids.dedup();
        info!(jobs = job_ids.len(), "reconciling batch jobs after restart");

        for job_id in job_ids {
            let job: Option<EmbeddingBatchJob> = self.db.get_item(&job_id).await?;
            let Some(job) = job else {
                warn!(job_id = %job_id, "stranded items reference unknown batch job");
                EmbeddingQueueItem::fail_batch(&self.db, &job_id, "batch job record missing")
                    .await?;
                continue;
            };

            match job.provider_job_arn.as_deref() {
                None => {
                    // Crashed before the submission call went out
                    self.fail_job(&job, "restart before batch submission completed")
                        .await;
                }
                Some(arn) => match self.backend.job_status(arn).await {
                    Ok(BatchJobStatus::Completed) => {
                        EmbeddingBatchJob::set_status(
                            &self.db,
                            &job.id,
                            BatchJobStatus::Completed,
                            None,
                        )
                        .await?;
                        if let Err(err) = self.ingest_job(&job).await {
                            error!(error = %err, job_id = %job.id, "reconcile ingestion failed");
                            self.fail_job(&job, &err.to_string()).await;
                        }
                    }
                    Ok(status) if status.is_terminal() => {
                        EmbeddingBatchJob::set_status(&self.db, &job.id, status, None).await?;
                        self.fail_job(&job, &format!("batch job {status:?}")).await;
                    }
                    Ok(status) => {
                        // Still running; the monitor pass will pick it up
                        EmbeddingBatchJob::set_status(&self.db, &job.id, status, None).await?;
                    }
                    Err(err) => {
                        warn!(error = %err, job_id = %job.id, "reconcile status poll failed");
                    }
                },
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use common::storage::store::testing::memory_storage;
    use common::storage::types::{
        connector_event::DocumentPermissions, document::DocumentFields,
        embedding_queue::QueueStatus,
    };
    use std::sync::Mutex;
    use uuid::Uuid;

    struct StubBackend {
        status: Mutex<BatchJobStatus>,
        submitted: Mutex<Vec<String>>,
        fail_submission: bool,
    }

    impl StubBackend {
        fn new(status: BatchJobStatus) -> Self {
            Self {
                status: Mutex::new(status),
                submitted: Mutex::new(Vec::new()),
                fail_submission: false,
            }
        }

        fn failing() -> Self {
            Self {
                status: Mutex::new(BatchJobStatus::Submitted),
                submitted: Mutex::new(Vec::new()),
                fail_submission: true,
            }
        }
    }

    #[async_trait]
    impl BatchInferenceBackend for StubBackend {
        async fn submit(
            &self,
            input_key: &str,
            _output_key: &str,
            _model_name: &str,
        ) -> Result<String, AppError> {
            if self.fail_submission {
                return Err(AppError::TransientApi("submission refused".into()));
            }
            match self.submitted.lock() {
                Ok(mut submitted) => submitted.push(input_key.to_string()),
                Err(_) => {}
            }
            Ok(format!("arn:test:{input_key}"))
        }

        async fn job_status(&self, _arn: &str) -> Result<BatchJobStatus, AppError> {
            Ok(match self.status.lock() {
                Ok(status) => *status,
                Err(poisoned) => *poisoned.into_inner(),
            })
        }
    }

    fn test_config() -> CloudBatchConfig {
        CloudBatchConfig {
            min_documents: 2,
            max_documents: 100,
            accumulation_timeout: Duration::from_secs(300),
            accumulation_poll_interval: Duration::from_millis(10),
            monitor_poll_interval: Duration::from_millis(10),
        }
    }

    async fn test_db() -> Arc<SurrealDbClient> {
        let db = SurrealDbClient::memory("test_ns", &Uuid::new_v4().to_string())
            .await
            .expect("Failed to start in-memory surrealdb");
        db.ensure_initialized().await.expect("schema");
        Arc::new(db)
    }

    async fn seed_document(
        db: &SurrealDbClient,
        storage: &StorageManager,
        external_id: &str,
        body: &str,
    ) -> (Document, EmbeddingQueueItem) {
        let content_id =
            ContentBlob::save(db, storage, Bytes::from(body.as_bytes().to_vec()), "text/plain")
                .await
                .expect("save content");
        let document = Document::upsert_from_event(
            db,
            "src-1",
            external_id,
            DocumentFields {
                title: external_id.to_string(),
                content_id: Some(content_id),
                permissions: DocumentPermissions::default(),
                ..Default::default()
            },
        )
        .await
        .expect("upsert");
        let item = EmbeddingQueueItem::enqueue_for_document(db, &document.id)
            .await
            .expect("enqueue");
        (document, item)
    }

    fn processor(
        db: Arc<SurrealDbClient>,
        storage: StorageManager,
        backend: Arc<StubBackend>,
    ) -> CloudBatchProcessor {
        CloudBatchProcessor::new(db, storage, backend, test_config(), "titan-embed".into())
    }

    #[tokio::test]
    async fn accumulation_waits_below_thresholds() {
        let db = test_db().await;
        let storage = memory_storage();
        let backend = Arc::new(StubBackend::new(BatchJobStatus::InProgress));
        let processor = processor(Arc::clone(&db), storage.clone(), Arc::clone(&backend));

        // One young item: below min_documents and below the timeout
        seed_document(&db, &storage, "doc-1", "body one").await;
        let job = processor.accumulate_once().await.expect("accumulate");
        assert!(job.is_none());

        // Second item crosses min_documents
        seed_document(&db, &storage, "doc-2", "body two").await;
        let job = processor
            .accumulate_once()
            .await
            .expect("accumulate")
            .expect("job submitted");
        assert!(job.provider_job_arn.is_some());

        let items = EmbeddingQueueItem::get_for_batch(&db, &job.id)
            .await
            .expect("items");
        assert_eq!(items.len(), 2);
        assert!(items.iter().all(|i| i.status == QueueStatus::Processing));

        // Input artifact exists and holds one JSONL record per item
        let input = storage.get(&job.input_key).await.expect("input artifact");
        assert_eq!(String::from_utf8_lossy(&input).lines().count(), 2);
    }

    #[tokio::test]
    async fn completed_job_ingests_vectors_and_flags_missing_rows() {
        let db = test_db().await;
        let storage = memory_storage();
        let backend = Arc::new(StubBackend::new(BatchJobStatus::Completed));
        let processor = processor(Arc::clone(&db), storage.clone(), Arc::clone(&backend));

        let (doc_a, item_a) = seed_document(&db, &storage, "doc-a", "first body").await;
        let (doc_b, item_b) = seed_document(&db, &storage, "doc-b", "second body").await;

        let job = processor
            .submit_batch(
                EmbeddingQueueItem::peek_pending(&db, 100)
                    .await
                    .expect("peek"),
            )
            .await
            .expect("submit")
            .expect("job");

        // Provider output covers only item_a; item_b's row is missing
        let output = format!(
            "{{\"recordId\":\"{}\",\"modelOutput\":{{\"embedding\":[0.1,0.2,0.3]}}}}\n",
            item_a.id
        );
        storage
            .put(&job.output_key, Bytes::from(output.into_bytes()))
            .await
            .expect("write output");

        processor.ingest_job(&job).await.expect("ingest");

        let vectors = Embedding::get_for_document(&db, &doc_a.id).await.expect("vectors");
        assert_eq!(vectors.len(), 1);
        let vector = vectors.first().expect("vector");
        assert_eq!(vector.char_start, 0);
        assert_eq!(vector.char_end, "first body".len());
        assert_eq!(vector.model_name, "titan-embed");

        let doc_a: Document = db.get_item(&doc_a.id).await.expect("get").expect("row");
        assert_eq!(doc_a.embedding_status, EmbeddingStatus::Completed);
        let item_a: EmbeddingQueueItem = db.get_item(&item_a.id).await.expect("get").expect("row");
        assert_eq!(item_a.status, QueueStatus::Completed);
        assert!(item_a.batch_job_id.is_none());

        let item_b: EmbeddingQueueItem = db.get_item(&item_b.id).await.expect("get").expect("row");
        assert_eq!(item_b.status, QueueStatus::Failed);
        assert!(item_b
            .error_message
            .as_deref()
            .expect("error")
            .contains("Missing embedding"));
        let doc_b: Document = db.get_item(&doc_b.id).await.expect("get").expect("row");
        assert_eq!(doc_b.embedding_status, EmbeddingStatus::Failed);
    }

    #[tokio::test]
    async fn failed_submission_releases_items_for_retry() {
        let db = test_db().await;
        let storage = memory_storage();
        let backend = Arc::new(StubBackend::failing());
        let processor = processor(Arc::clone(&db), storage.clone(), Arc::clone(&backend));

        let (_, item) = seed_document(&db, &storage, "doc-1", "body").await;
        seed_document(&db, &storage, "doc-2", "body").await;

        let err = processor
            .submit_batch(
                EmbeddingQueueItem::peek_pending(&db, 100)
                    .await
                    .expect("peek"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::TransientApi(_)));

        let item: EmbeddingQueueItem = db.get_item(&item.id).await.expect("get").expect("row");
        assert_eq!(item.status, QueueStatus::Failed);
        assert!(item.batch_job_id.is_none());
        assert_eq!(item.retry_count, 1);

        // Dead-letter pass makes them eligible again
        let reset = EmbeddingQueueItem::reset_dead_letters(&db).await.expect("reset");
        assert_eq!(reset.len(), 2);
    }

    #[tokio::test]
    async fn reconcile_resolves_jobs_that_finished_while_down() {
        let db = test_db().await;
        let storage = memory_storage();
        let backend = Arc::new(StubBackend::new(BatchJobStatus::Completed));
        let processor = processor(Arc::clone(&db), storage.clone(), Arc::clone(&backend));

        let (doc, item) = seed_document(&db, &storage, "doc-1", "body text").await;
        let job = processor
            .submit_batch(vec![item.clone()])
            .await
            .expect("submit")
            .expect("job");

        // Simulate the output landing while this process was down
        let output = format!(
            "{{\"recordId\":\"{}\",\"modelOutput\":{{\"embedding\":[0.9,0.8]}}}}\n",
            item.id
        );
        storage
            .put(&job.output_key, Bytes::from(output.into_bytes()))
            .await
            .expect("write output");

        processor.reconcile().await.expect("reconcile");

        let item: EmbeddingQueueItem = db.get_item(&item.id).await.expect("get").expect("row");
        assert_eq!(item.status, QueueStatus::Completed);
        let doc: Document = db.get_item(&doc.id).await.expect("get").expect("row");
        assert_eq!(doc.embedding_status, EmbeddingStatus::Completed);
    }

    #[tokio::test]
    async fn reconcile_fails_items_whose_job_record_is_gone() {
        let db = test_db().await;
        let storage = memory_storage();
        let backend = Arc::new(StubBackend::new(BatchJobStatus::InProgress));
        let processor = processor(Arc::clone(&db), storage.clone(), Arc::clone(&backend));

        let (_, item) = seed_document(&db, &storage, "doc-1", "body").await;
        EmbeddingQueueItem::assign_to_batch(&db, &[item.id.clone()], "job-that-never-existed")
            .await
            .expect("assign");

        processor.reconcile().await.expect("reconcile");

        let item: EmbeddingQueueItem = db.get_item(&item.id).await.expect("get").expect("row");
        assert_eq!(item.status, QueueStatus::Failed);
        assert!(item.batch_job_id.is_none());
    }
}
