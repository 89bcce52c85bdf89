use crate::{error::AppError, storage::db::SurrealDbClient, stored_object, utils::id::new_id};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BatchJobStatus {
    Submitted,
    InProgress,
    Completed,
    Failed,
    Cancelled,
    Expired,
}

impl BatchJobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Expired
        )
    }
}

stored_object!(EmbeddingBatchJob, "embedding_batch_job", {
    /// Provider-side job handle (e.g. an invocation job ARN). Set once the
    /// submission call succeeds.
    provider_job_arn: Option<String>,
    status: BatchJobStatus,
    input_key: String,
    output_key: String,
    model_name: String,
    error_message: Option<String>,
    #[serde(
        serialize_with = "serialize_option_datetime",
        deserialize_with = "deserialize_option_datetime",
        default
    )]
    submitted_at: Option<DateTime<Utc>>,
    #[serde(
        serialize_with = "serialize_option_datetime",
        deserialize_with = "deserialize_option_datetime",
        default
    )]
    completed_at: Option<DateTime<Utc>>,
});

impl EmbeddingBatchJob {
    pub fn new(model_name: String) -> Self {
        let now = Utc::now();
        let id = new_id();
        Self {
            input_key: format!("batch/{id}/input.jsonl"),
            output_key: format!("batch/{id}/output.jsonl"),
            id,
            created_at: now,
            updated_at: now,
            provider_job_arn: None,
            status: BatchJobStatus::Submitted,
            model_name,
            error_message: None,
            submitted_at: None,
            completed_at: None,
        }
    }

    pub async fn mark_submitted(
        db: &SurrealDbClient,
        id: &str,
        provider_job_arn: &str,
    ) -> Result<(), AppError> {
        db.query(format!(
            "UPDATE type::thing('{}', $id) SET provider_job_arn = $arn, \
             submitted_at = time::now(), updated_at = time::now()",
            Self::table_name()
        ))
        .bind(("id", id.to_string()))
        .bind(("arn", provider_job_arn.to_string()))
        .await?;
        Ok(())
    }

    pub async fn set_status(
        db: &SurrealDbClient,
        id: &str,
        status: BatchJobStatus,
        error: Option<&str>,
    ) -> Result<(), AppError> {
        let completed = if status.is_terminal() {
            "time::now()"
        } else {
            "completed_at"
        };
        db.query(format!(
            "UPDATE type::thing('{table}', $id) SET status = $status, error_message = $error, \
             completed_at = {completed}, updated_at = time::now()",
            table = Self::table_name(),
        ))
        .bind(("id", id.to_string()))
        .bind(("status", status))
        .bind(("error", error.map(String::from)))
        .await?;
        Ok(())
    }

    /// Jobs that still need monitoring (submitted or running on the provider).
    pub async fn get_unfinished(db: &SurrealDbClient) -> Result<Vec<Self>, AppError> {
        let mut result = db
            .query(format!(
                "SELECT * FROM {} WHERE status IN ['submitted', 'inprogress'] ORDER BY created_at ASC",
                Self::table_name()
            ))
            .await?;
        let jobs: Vec<Self> = result.take(0)?;
        Ok(jobs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn lifecycle_and_monitoring_query() {
        let db = SurrealDbClient::memory("test_ns", &Uuid::new_v4().to_string())
            .await
            .expect("Failed to start in-memory surrealdb");

        let job = EmbeddingBatchJob::new("titan-embed".into());
        assert_eq!(job.input_key, format!("batch/{}/input.jsonl", job.id));
        let id = job.id.clone();
        db.store_item(job).await.expect("store");

        EmbeddingBatchJob::mark_submitted(&db, &id, "arn:aws:bedrock:job/abc")
            .await
            .expect("submit");

        let unfinished = EmbeddingBatchJob::get_unfinished(&db).await.expect("unfinished");
        assert_eq!(unfinished.len(), 1);

        EmbeddingBatchJob::set_status(&db, &id, BatchJobStatus::InProgress, None)
            .await
            .expect("progress");
        let unfinished = EmbeddingBatchJob::get_unfinished(&db).await.expect("unfinished");
        assert_eq!(unfinished.len(), 1);

        EmbeddingBatchJob::set_status(&db, &id, BatchJobStatus::Completed, None)
            .await
            .expect("complete");
        let unfinished = EmbeddingBatchJob::get_unfinished(&db).await.expect("unfinished");
        assert!(unfinished.is_empty());

        let job: EmbeddingBatchJob = db.get_item(&id).await.expect("get").expect("row");
        assert!(job.completed_at.is_some());
        assert_eq!(
            job.provider_job_arn.as_deref(),
            Some("arn:aws:bedrock:job/abc")
        );
    }

    #[test]
    fn terminal_states() {
        assert!(BatchJobStatus::Completed.is_terminal());
        assert!(BatchJobStatus::Failed.is_terminal());
        assert!(BatchJobStatus::Cancelled.is_terminal());
        assert!(BatchJobStatus::Expired.is_terminal());
        assert!(!BatchJobStatus::Submitted.is_terminal());
        assert!(!BatchJobStatus::InProgress.is_terminal());
    }
}
