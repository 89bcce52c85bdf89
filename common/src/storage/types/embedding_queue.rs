use crate::{error::AppError, storage::db::SurrealDbClient, stored_object, utils::id::new_id};

pub const MAX_RETRIES: u32 = 5;
pub const DEFAULT_LEASE_SECS: i64 = 600;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

stored_object!(EmbeddingQueueItem, "embedding_queue", {
    document_id: String,
    status: QueueStatus,
    batch_job_id: Option<String>,
    retry_count: u32,
    error_message: Option<String>,
    claimed_by: Option<String>,
    /// Lease expiry for a claimed row. SurrealDB has no `FOR UPDATE SKIP
    /// LOCKED`, so claims are modeled as leases: the claim write is a
    /// conditional update that only one claimer can win, and the reaper
    /// returns rows whose lease ran out.
    #[serde(
        serialize_with = "serialize_option_datetime",
        deserialize_with = "deserialize_option_datetime",
        default
    )]
    lease_until: Option<DateTime<Utc>>,
    #[serde(
        serialize_with = "serialize_option_datetime",
        deserialize_with = "deserialize_option_datetime",
        default
    )]
    processed_at: Option<DateTime<Utc>>,
});

impl EmbeddingQueueItem {
    pub fn new(document_id: String) -> Self {
        let now = Utc::now();
        Self {
            id: new_id(),
            created_at: now,
            updated_at: now,
            document_id,
            status: QueueStatus::Pending,
            batch_job_id: None,
            retry_count: 0,
            error_message: None,
            claimed_by: None,
            lease_until: None,
            processed_at: None,
        }
    }

    /// Ensure exactly one queue row exists for a document.
    ///
    /// An existing row is reset to `pending` with a fresh retry budget; a row
    /// currently owned by a batch job is left alone, since nothing else may
    /// touch it until the job resolves.
    pub async fn enqueue_for_document(
        db: &SurrealDbClient,
        document_id: &str,
    ) -> Result<Self, AppError> {
        let mut result = db
            .query(format!(
                "UPDATE {} SET status = 'pending', retry_count = 0, error_message = NONE, \
                 claimed_by = NONE, lease_until = NONE, processed_at = NONE, updated_at = time::now() \
                 WHERE document_id = $document_id AND batch_job_id = NONE RETURN AFTER",
                Self::table_name()
            ))
            .bind(("document_id", document_id.to_string()))
            .await?;
        let reset: Vec<Self> = result.take(0)?;
        if let Some(item) = reset.into_iter().next() {
            return Ok(item);
        }

        if let Some(existing) = Self::get_for_document(db, document_id).await? {
            return Ok(existing);
        }

        let item = Self::new(document_id.to_string());
        match db.store_item(item.clone()).await {
            Ok(_) => Ok(item),
            // Unique index on document_id: someone else enqueued concurrently.
            Err(err) => match Self::get_for_document(db, document_id).await? {
                Some(existing) => Ok(existing),
                None => Err(AppError::Database(err)),
            },
        }
    }

    /// Drop the queue row for a deleted document.
    pub async fn delete_for_document(
        db: &SurrealDbClient,
        document_id: &str,
    ) -> Result<(), AppError> {
        db.query(format!(
            "DELETE {} WHERE document_id = $document_id",
            Self::table_name()
        ))
        .bind(("document_id", document_id.to_string()))
        .await?;
        Ok(())
    }

    pub async fn get_for_document(
        db: &SurrealDbClient,
        document_id: &str,
    ) -> Result<Option<Self>, AppError> {
        let mut result = db
            .query(format!(
                "SELECT * FROM {} WHERE document_id = $document_id LIMIT 1",
                Self::table_name()
            ))
            .bind(("document_id", document_id.to_string()))
            .await?;
        let items: Vec<Self> = result.take(0)?;
        Ok(items.into_iter().next())
    }

    /// Claim up to `limit` pending items for `worker_id`.
    ///
    /// Two statements: pick candidates oldest-first, then a conditional
    /// update that re-checks eligibility per row. A row raced away by another
    /// claimer fails the re-check and is simply skipped, so each transition
    /// `pending -> processing` has exactly one winner.
    pub async fn claim_pending(
        db: &SurrealDbClient,
        worker_id: &str,
        limit: usize,
        lease: chrono::Duration,
    ) -> Result<Vec<Self>, AppError> {
        let mut result = db
            .query(format!(
                "SELECT VALUE record::id(id) FROM (SELECT id, created_at FROM {} \
                 WHERE status = 'pending' AND batch_job_id = NONE AND retry_count < $max_retries \
                 ORDER BY created_at ASC LIMIT $limit)",
                Self::table_name()
            ))
            .bind(("max_retries", MAX_RETRIES))
            .bind(("limit", limit))
            .await?;
        let candidates: Vec<String> = result.take(0)?;
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let lease_until = Utc::now() + lease;
        let mut result = db
            .query(format!(
                "UPDATE {} SET status = 'processing', claimed_by = $worker_id, \
                 lease_until = $lease_until, updated_at = time::now() \
                 WHERE record::id(id) IN $candidates AND status = 'pending' AND batch_job_id = NONE \
                 RETURN AFTER",
                Self::table_name()
            ))
            .bind(("worker_id", worker_id.to_string()))
            .bind(("lease_until", surrealdb::sql::Datetime::from(lease_until)))
            .bind(("candidates", candidates))
            .await?;
        let mut claimed: Vec<Self> = result.take(0)?;
        claimed.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(claimed)
    }

    pub async fn mark_completed(db: &SurrealDbClient, ids: &[String]) -> Result<(), AppError> {
        if ids.is_empty() {
            return Ok(());
        }
        db.query(format!(
            "UPDATE {} SET status = 'completed', processed_at = time::now(), \
             claimed_by = NONE, lease_until = NONE, batch_job_id = NONE, updated_at = time::now() \
             WHERE record::id(id) IN $ids",
            Self::table_name()
        ))
        .bind(("ids", ids.to_vec()))
        .await?;
        Ok(())
    }

    pub async fn mark_failed(
        db: &SurrealDbClient,
        ids: &[String],
        error: &str,
    ) -> Result<(), AppError> {
        if ids.is_empty() {
            return Ok(());
        }
        db.query(format!(
            "UPDATE {} SET status = 'failed', error_message = $error, retry_count += 1, \
             processed_at = time::now(), claimed_by = NONE, lease_until = NONE, \
             batch_job_id = NONE, updated_at = time::now() \
             WHERE record::id(id) IN $ids",
            Self::table_name()
        ))
        .bind(("ids", ids.to_vec()))
        .bind(("error", error.to_string()))
        .await?;
        Ok(())
    }

    /// Put a claimed item back for another attempt after a transient failure.
    pub async fn release_for_retry(
        db: &SurrealDbClient,
        id: &str,
        error: &str,
    ) -> Result<(), AppError> {
        db.query(format!(
            "UPDATE type::thing('{}', $id) SET status = 'pending', retry_count += 1, \
             error_message = $error, claimed_by = NONE, lease_until = NONE, updated_at = time::now()",
            Self::table_name()
        ))
        .bind(("id", id.to_string()))
        .bind(("error", error.to_string()))
        .await?;
        Ok(())
    }

    /// Hand a set of items to a cloud batch job. From here on only the batch
    /// monitor may resolve them.
    pub async fn assign_to_batch(
        db: &SurrealDbClient,
        ids: &[String],
        batch_job_id: &str,
    ) -> Result<(), AppError> {
        if ids.is_empty() {
            return Ok(());
        }
        db.query(format!(
            "UPDATE {} SET batch_job_id = $batch_job_id, status = 'processing', \
             claimed_by = NONE, lease_until = NONE, updated_at = time::now() \
             WHERE record::id(id) IN $ids",
            Self::table_name()
        ))
        .bind(("ids", ids.to_vec()))
        .bind(("batch_job_id", batch_job_id.to_string()))
        .await?;
        Ok(())
    }

    pub async fn get_for_batch(
        db: &SurrealDbClient,
        batch_job_id: &str,
    ) -> Result<Vec<Self>, AppError> {
        let mut result = db
            .query(format!(
                "SELECT * FROM {} WHERE batch_job_id = $batch_job_id ORDER BY created_at ASC",
                Self::table_name()
            ))
            .bind(("batch_job_id", batch_job_id.to_string()))
            .await?;
        let items: Vec<Self> = result.take(0)?;
        Ok(items)
    }

    /// Resolve a finished batch job's items as completed.
    pub async fn complete_batch(db: &SurrealDbClient, batch_job_id: &str) -> Result<(), AppError> {
        db.query(format!(
            "UPDATE {} SET status = 'completed', batch_job_id = NONE, processed_at = time::now(), \
             updated_at = time::now() WHERE batch_job_id = $batch_job_id",
            Self::table_name()
        ))
        .bind(("batch_job_id", batch_job_id.to_string()))
        .await?;
        Ok(())
    }

    /// Resolve a failed batch job: items become `failed` but keep retry
    /// eligibility, and the batch assignment is released so the dead-letter
    /// poller can recirculate them.
    pub async fn fail_batch(
        db: &SurrealDbClient,
        batch_job_id: &str,
        error: &str,
    ) -> Result<(), AppError> {
        db.query(format!(
            "UPDATE {} SET status = 'failed', batch_job_id = NONE, retry_count += 1, \
             error_message = $error, processed_at = time::now(), updated_at = time::now() \
             WHERE batch_job_id = $batch_job_id",
            Self::table_name()
        ))
        .bind(("batch_job_id", batch_job_id.to_string()))
        .bind(("error", error.to_string()))
        .await?;
        Ok(())
    }

    /// Dead-letter poller: failed rows with retry budget left go back to
    /// `pending`. Rows at the cap stay terminal.
    pub async fn reset_dead_letters(db: &SurrealDbClient) -> Result<Vec<Self>, AppError> {
        let mut result = db
            .query(format!(
                "UPDATE {} SET status = 'pending', claimed_by = NONE, lease_until = NONE, \
                 updated_at = time::now() \
                 WHERE status = 'failed' AND batch_job_id = NONE AND retry_count < $max_retries \
                 RETURN AFTER",
                Self::table_name()
            ))
            .bind(("max_retries", MAX_RETRIES))
            .await?;
        let reset: Vec<Self> = result.take(0)?;
        Ok(reset)
    }

    /// Reaper for died-mid-claim workers: expired leases go back to pending
    /// with a burned retry.
    pub async fn requeue_expired_leases(db: &SurrealDbClient) -> Result<Vec<Self>, AppError> {
        let mut result = db
            .query(format!(
                "UPDATE {} SET status = 'pending', retry_count += 1, claimed_by = NONE, \
                 lease_until = NONE, updated_at = time::now() \
                 WHERE status = 'processing' AND batch_job_id = NONE \
                 AND lease_until != NONE AND lease_until < time::now() \
                 RETURN AFTER",
                Self::table_name()
            ))
            .await?;
        let requeued: Vec<Self> = result.take(0)?;
        Ok(requeued)
    }

    /// Pending items eligible for work, oldest first, without claiming them.
    /// The cloud accumulator uses this to decide when a batch is worth
    /// submitting.
    pub async fn peek_pending(db: &SurrealDbClient, limit: usize) -> Result<Vec<Self>, AppError> {
        let mut result = db
            .query(format!(
                "SELECT * FROM {} \
                 WHERE status = 'pending' AND batch_job_id = NONE AND retry_count < $max_retries \
                 ORDER BY created_at ASC LIMIT $limit",
                Self::table_name()
            ))
            .bind(("max_retries", MAX_RETRIES))
            .bind(("limit", limit))
            .await?;
        let items: Vec<Self> = result.take(0)?;
        Ok(items)
    }

    pub async fn pending_count(db: &SurrealDbClient) -> Result<usize, AppError> {
        let mut result = db
            .query(format!(
                "SELECT count() AS total FROM {} \
                 WHERE status = 'pending' AND batch_job_id = NONE AND retry_count < $max_retries \
                 GROUP ALL",
                Self::table_name()
            ))
            .bind(("max_retries", MAX_RETRIES))
            .await?;
        #[derive(Deserialize)]
        struct Count {
            total: usize,
        }
        let counts: Vec<Count> = result.take(0)?;
        Ok(counts.first().map_or(0, |c| c.total))
    }

    /// Items stranded in `processing` with a batch job attached; checked on
    /// startup so a crash between submission and ingestion is reconciled.
    pub async fn stranded_batch_items(db: &SurrealDbClient) -> Result<Vec<Self>, AppError> {
        let mut result = db
            .query(format!(
                "SELECT * FROM {} WHERE status = 'processing' AND batch_job_id != NONE",
                Self::table_name()
            ))
            .await?;
        let items: Vec<Self> = result.take(0)?;
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use uuid::Uuid;

    async fn test_db() -> SurrealDbClient {
        let db = SurrealDbClient::memory("test_ns", &Uuid::new_v4().to_string())
            .await
            .expect("Failed to start in-memory surrealdb");
        db.ensure_initialized().await.expect("schema");
        db
    }

    async fn seed(db: &SurrealDbClient, n: usize) -> Vec<String> {
        let mut ids = Vec::new();
        for i in 0..n {
            let item = EmbeddingQueueItem::enqueue_for_document(db, &format!("doc-{i}"))
                .await
                .expect("enqueue");
            ids.push(item.id);
        }
        ids
    }

    #[tokio::test]
    async fn enqueue_is_idempotent_per_document() {
        let db = test_db().await;

        let first = EmbeddingQueueItem::enqueue_for_document(&db, "doc-1")
            .await
            .expect("enqueue");
        let second = EmbeddingQueueItem::enqueue_for_document(&db, "doc-1")
            .await
            .expect("enqueue again");

        assert_eq!(first.id, second.id);
        let all: Vec<EmbeddingQueueItem> = db.get_all_stored_items().await.expect("all");
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn re_enqueue_resets_retry_budget() {
        let db = test_db().await;

        let item = EmbeddingQueueItem::enqueue_for_document(&db, "doc-1")
            .await
            .expect("enqueue");
        EmbeddingQueueItem::mark_failed(&db, &[item.id.clone()], "provider exploded")
            .await
            .expect("fail");

        let again = EmbeddingQueueItem::enqueue_for_document(&db, "doc-1")
            .await
            .expect("re-enqueue");
        assert_eq!(again.id, item.id);
        assert_eq!(again.status, QueueStatus::Pending);
        assert_eq!(again.retry_count, 0);
        assert!(again.error_message.is_none());
    }

    #[tokio::test]
    async fn claim_is_oldest_first_and_exclusive() {
        let db = test_db().await;
        seed(&db, 5).await;

        let claimed = EmbeddingQueueItem::claim_pending(&db, "w1", 3, chrono::Duration::minutes(10))
            .await
            .expect("claim");
        assert_eq!(claimed.len(), 3);
        assert!(claimed.iter().all(|i| i.status == QueueStatus::Processing));
        assert!(claimed
            .iter()
            .all(|i| i.claimed_by.as_deref() == Some("w1")));
        assert_eq!(
            claimed.iter().map(|i| i.document_id.clone()).collect::<Vec<_>>(),
            vec!["doc-0", "doc-1", "doc-2"]
        );

        // A second claimer only sees what is left
        let rest = EmbeddingQueueItem::claim_pending(&db, "w2", 10, chrono::Duration::minutes(10))
            .await
            .expect("claim rest");
        assert_eq!(rest.len(), 2);

        let first: HashSet<String> = claimed.into_iter().map(|i| i.id).collect();
        let second: HashSet<String> = rest.into_iter().map(|i| i.id).collect();
        assert!(first.is_disjoint(&second));
    }

    #[tokio::test]
    async fn concurrent_claimers_never_share_a_row() {
        let db = test_db().await;
        seed(&db, 10).await;

        let db_a = db.clone();
        let db_b = db.clone();
        let (a, b) = tokio::join!(
            EmbeddingQueueItem::claim_pending(&db_a, "w-a", 6, chrono::Duration::minutes(10)),
            EmbeddingQueueItem::claim_pending(&db_b, "w-b", 6, chrono::Duration::minutes(10)),
        );
        let a = a.expect("claim a");
        let b = b.expect("claim b");

        let ids_a: HashSet<String> = a.iter().map(|i| i.id.clone()).collect();
        let ids_b: HashSet<String> = b.iter().map(|i| i.id.clone()).collect();
        assert!(
            ids_a.is_disjoint(&ids_b),
            "a queue row must have exactly one claimer"
        );
        assert!(a.len() + b.len() <= 10);
    }

    #[tokio::test]
    async fn exhausted_retries_leave_the_claim_pool() {
        let db = test_db().await;
        let item = EmbeddingQueueItem::enqueue_for_document(&db, "doc-1")
            .await
            .expect("enqueue");

        for attempt in 0..MAX_RETRIES {
            let claimed =
                EmbeddingQueueItem::claim_pending(&db, "w1", 1, chrono::Duration::minutes(10))
                    .await
                    .expect("claim");
            assert_eq!(claimed.len(), 1, "attempt {attempt} should claim");
            EmbeddingQueueItem::release_for_retry(&db, &item.id, "transient")
                .await
                .expect("release");
        }

        // retry_count is now at the cap; the row must not be claimable
        let claimed = EmbeddingQueueItem::claim_pending(&db, "w1", 1, chrono::Duration::minutes(10))
            .await
            .expect("claim");
        assert!(claimed.is_empty());
        assert_eq!(EmbeddingQueueItem::pending_count(&db).await.expect("count"), 0);
    }

    #[tokio::test]
    async fn batch_assignment_blocks_claims_until_resolution() {
        let db = test_db().await;
        let ids = seed(&db, 2).await;

        EmbeddingQueueItem::assign_to_batch(&db, &ids, "job-1")
            .await
            .expect("assign");

        let claimed = EmbeddingQueueItem::claim_pending(&db, "w1", 10, chrono::Duration::minutes(10))
            .await
            .expect("claim");
        assert!(claimed.is_empty(), "batch-owned items must not be claimable");

        let for_batch = EmbeddingQueueItem::get_for_batch(&db, "job-1")
            .await
            .expect("batch items");
        assert_eq!(for_batch.len(), 2);
        assert!(for_batch.iter().all(|i| i.status == QueueStatus::Processing));

        EmbeddingQueueItem::fail_batch(&db, "job-1", "job expired")
            .await
            .expect("fail batch");

        let failed: Vec<EmbeddingQueueItem> = db.get_all_stored_items().await.expect("all");
        assert!(failed
            .iter()
            .all(|i| i.status == QueueStatus::Failed && i.batch_job_id.is_none()));

        // Dead-letter pass recirculates them
        let reset = EmbeddingQueueItem::reset_dead_letters(&db).await.expect("reset");
        assert_eq!(reset.len(), 2);
        let claimed = EmbeddingQueueItem::claim_pending(&db, "w1", 10, chrono::Duration::minutes(10))
            .await
            .expect("claim");
        assert_eq!(claimed.len(), 2);
    }

    #[tokio::test]
    async fn expired_leases_are_requeued() {
        let db = test_db().await;
        seed(&db, 1).await;

        let claimed =
            EmbeddingQueueItem::claim_pending(&db, "w1", 1, chrono::Duration::seconds(-5))
                .await
                .expect("claim with already-expired lease");
        assert_eq!(claimed.len(), 1);

        let requeued = EmbeddingQueueItem::requeue_expired_leases(&db)
            .await
            .expect("requeue");
        assert_eq!(requeued.len(), 1);
        let item = requeued.first().expect("item");
        assert_eq!(item.status, QueueStatus::Pending);
        assert_eq!(item.retry_count, 1);
        assert!(item.claimed_by.is_none());
    }

    #[tokio::test]
    async fn stranded_batch_items_show_up_for_reconciliation() {
        let db = test_db().await;
        let ids = seed(&db, 3).await;
        EmbeddingQueueItem::assign_to_batch(&db, &ids[..2], "job-9")
            .await
            .expect("assign");

        let stranded = EmbeddingQueueItem::stranded_batch_items(&db)
            .await
            .expect("stranded");
        assert_eq!(stranded.len(), 2);
        assert!(stranded
            .iter()
            .all(|i| i.batch_job_id.as_deref() == Some("job-9")));
    }
}
