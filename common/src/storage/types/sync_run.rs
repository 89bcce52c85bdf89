use crate::{error::AppError, storage::db::SurrealDbClient, stored_object, utils::id::new_id};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SyncRunStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl SyncRunStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

stored_object!(SyncRun, "sync_run", {
    source_id: String,
    sync_mode: String,
    status: SyncRunStatus,
    documents_scanned: u64,
    documents_emitted: u64,
    error_message: Option<String>,
    /// Heartbeat watermark; the stale-sync reaper fails runs that stop
    /// advancing this.
    #[serde(
        serialize_with = "serialize_datetime",
        deserialize_with = "deserialize_datetime",
        default
    )]
    last_activity_at: DateTime<Utc>,
    #[serde(
        serialize_with = "serialize_option_datetime",
        deserialize_with = "deserialize_option_datetime",
        default
    )]
    finished_at: Option<DateTime<Utc>>,
});

impl SyncRun {
    pub fn new(source_id: String, sync_mode: String) -> Self {
        let now = Utc::now();
        Self {
            id: new_id(),
            created_at: now,
            updated_at: now,
            source_id,
            sync_mode,
            status: SyncRunStatus::Running,
            documents_scanned: 0,
            documents_emitted: 0,
            error_message: None,
            last_activity_at: now,
            finished_at: None,
        }
    }

    /// Begin a sync run for a source, refusing overlap.
    ///
    /// Returns `None` when another run for the source is still `running`; the
    /// caller maps that to its 409. The connector runtime additionally gates
    /// triggers through its active-sync registry, so this check is the
    /// durable record of the invariant rather than the only line of defense.
    pub async fn start(
        db: &SurrealDbClient,
        source_id: &str,
        sync_mode: &str,
    ) -> Result<Option<Self>, AppError> {
        if Self::get_running_for_source(db, source_id).await?.is_some() {
            return Ok(None);
        }

        let run = Self::new(source_id.to_string(), sync_mode.to_string());
        db.store_item(run.clone()).await?;
        Ok(Some(run))
    }

    /// Begin a sync run with a caller-chosen id (the scheduler names runs).
    pub async fn start_with_id(
        db: &SurrealDbClient,
        sync_run_id: &str,
        source_id: &str,
        sync_mode: &str,
    ) -> Result<Option<Self>, AppError> {
        if Self::get_running_for_source(db, source_id).await?.is_some() {
            return Ok(None);
        }

        let mut run = Self::new(source_id.to_string(), sync_mode.to_string());
        run.id = sync_run_id.to_string();
        db.store_item(run.clone()).await?;
        Ok(Some(run))
    }

    pub async fn get_running_for_source(
        db: &SurrealDbClient,
        source_id: &str,
    ) -> Result<Option<Self>, AppError> {
        let mut result = db
            .query(format!(
                "SELECT * FROM {} WHERE source_id = $source_id AND status = 'running' LIMIT 1",
                Self::table_name()
            ))
            .bind(("source_id", source_id.to_string()))
            .await?;
        let runs: Vec<Self> = result.take(0)?;
        Ok(runs.into_iter().next())
    }

    pub async fn heartbeat(db: &SurrealDbClient, id: &str) -> Result<(), AppError> {
        db.query(format!(
            "UPDATE type::thing('{}', $id) SET last_activity_at = time::now(), updated_at = time::now()",
            Self::table_name()
        ))
        .bind(("id", id.to_string()))
        .await?;
        Ok(())
    }

    /// Bump the scanned counter; doubles as a heartbeat.
    pub async fn increment_scanned(db: &SurrealDbClient, id: &str) -> Result<(), AppError> {
        db.query(format!(
            "UPDATE type::thing('{}', $id) SET documents_scanned += 1, last_activity_at = time::now(), updated_at = time::now()",
            Self::table_name()
        ))
        .bind(("id", id.to_string()))
        .await?;
        Ok(())
    }

    pub async fn increment_emitted(db: &SurrealDbClient, id: &str) -> Result<(), AppError> {
        db.query(format!(
            "UPDATE type::thing('{}', $id) SET documents_emitted += 1, last_activity_at = time::now(), updated_at = time::now()",
            Self::table_name()
        ))
        .bind(("id", id.to_string()))
        .await?;
        Ok(())
    }

    pub async fn complete(
        db: &SurrealDbClient,
        id: &str,
        documents_scanned: u64,
        documents_emitted: u64,
    ) -> Result<(), AppError> {
        db.query(format!(
            "UPDATE type::thing('{}', $id) SET status = 'completed', documents_scanned = $scanned, documents_emitted = $emitted, finished_at = time::now(), updated_at = time::now()",
            Self::table_name()
        ))
        .bind(("id", id.to_string()))
        .bind(("scanned", documents_scanned))
        .bind(("emitted", documents_emitted))
        .await?;
        Ok(())
    }

    pub async fn fail(db: &SurrealDbClient, id: &str, error: &str) -> Result<(), AppError> {
        Self::finish_with_status(db, id, SyncRunStatus::Failed, Some(error)).await
    }

    pub async fn cancel(db: &SurrealDbClient, id: &str) -> Result<(), AppError> {
        Self::finish_with_status(db, id, SyncRunStatus::Cancelled, None).await
    }

    async fn finish_with_status(
        db: &SurrealDbClient,
        id: &str,
        status: SyncRunStatus,
        error: Option<&str>,
    ) -> Result<(), AppError> {
        let status_str = match status {
            SyncRunStatus::Failed => "failed",
            SyncRunStatus::Cancelled => "cancelled",
            SyncRunStatus::Completed => "completed",
            SyncRunStatus::Running => "running",
        };
        db.query(format!(
            "UPDATE type::thing('{}', $id) SET status = $status, error_message = $error, finished_at = time::now(), updated_at = time::now()",
            Self::table_name()
        ))
        .bind(("id", id.to_string()))
        .bind(("status", status_str))
        .bind(("error", error.map(String::from)))
        .await?;
        Ok(())
    }

    /// Fail every running sync whose heartbeat is older than the timeout.
    /// Returns the runs that were reaped.
    pub async fn reap_stale(
        db: &SurrealDbClient,
        timeout_minutes: i64,
    ) -> Result<Vec<Self>, AppError> {
        let cutoff = Utc::now() - chrono::Duration::minutes(timeout_minutes);
        let mut result = db
            .query(format!(
                "UPDATE {} SET status = 'failed', error_message = $error, finished_at = time::now(), updated_at = time::now() WHERE status = 'running' AND last_activity_at < $cutoff RETURN AFTER",
                Self::table_name()
            ))
            .bind((
                "error",
                format!("Sync stalled: no heartbeat for {timeout_minutes} minutes"),
            ))
            .bind(("cutoff", surrealdb::sql::Datetime::from(cutoff)))
            .await?;
        let reaped: Vec<Self> = result.take(0)?;
        Ok(reaped)
    }
}
