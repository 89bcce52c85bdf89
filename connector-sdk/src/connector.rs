use std::sync::Arc;

use async_trait::async_trait;
use common::error::AppError;
use serde_json::Value;

use crate::context::SyncContext;
use crate::models::{ActionDefinition, Manifest, SyncMode};

/// One connector implementation: everything the runtime needs to sync a
/// source and serve declared actions.
///
/// `sync` owns the happy path end to end, including the final
/// `ctx.complete(..)`. Returning an error hands cleanup to the runtime,
/// which fails the run with the error message; cooperative cancellation is
/// surfaced by returning `AppError::Cancelled` after persisting state.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn version(&self) -> &str;

    fn sync_modes(&self) -> Vec<SyncMode> {
        vec![SyncMode::Full, SyncMode::Incremental]
    }

    fn actions(&self) -> Vec<ActionDefinition> {
        Vec::new()
    }

    fn manifest(&self) -> Manifest {
        Manifest {
            name: self.name().to_string(),
            version: self.version().to_string(),
            sync_modes: self.sync_modes(),
            actions: self.actions(),
        }
    }

    async fn sync(
        &self,
        source_config: Value,
        credentials: Value,
        state: Option<Value>,
        ctx: Arc<SyncContext>,
    ) -> Result<(), AppError>;

    /// Invoke a declared action. The default knows none.
    async fn action(
        &self,
        action: &str,
        _params: Value,
        _credentials: Value,
    ) -> Result<Value, AppError> {
        Err(AppError::Validation(format!("unknown action: {action}")))
    }
}
