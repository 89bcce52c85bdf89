#![allow(clippy::missing_docs_in_private_items)]

//! Microsoft 365 connector: OneDrive files, Outlook mail and calendar via
//! Microsoft Graph delta queries. The first walk with no delta token is a
//! full snapshot; later walks replay only changes, with deletes arriving as
//! `@removed` tombstones.

pub mod auth;
pub mod client;
pub mod mappers;
pub mod syncers;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use common::error::AppError;
use connector_sdk::{Connector, SyncContext};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info};

use auth::MsGraphAuth;
use client::GraphClient;
use syncers::{calendar::CalendarSyncer, drive::DriveSyncer, mail::MailSyncer, Syncer, SyncerState};

const ALL_SERVICES: &[&str] = &["onedrive", "mail", "calendar"];

/// Per-syncer, per-user delta tokens.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct MsGraphState {
    #[serde(flatten)]
    services: HashMap<String, SyncerState>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct SourceConfig {
    #[serde(default)]
    services: Option<Vec<String>>,
    #[serde(default)]
    graph_base_url: Option<String>,
}

pub struct MsGraphConnector;

#[async_trait]
impl Connector for MsGraphConnector {
    fn name(&self) -> &str {
        "microsoft"
    }

    fn version(&self) -> &str {
        "1.0.0"
    }

    async fn sync(
        &self,
        source_config: Value,
        credentials: Value,
        state: Option<Value>,
        ctx: Arc<SyncContext>,
    ) -> Result<(), AppError> {
        let config: SourceConfig = serde_json::from_value(source_config).unwrap_or_default();

        let auth = match MsGraphAuth::from_credentials(&credentials) {
            Ok(auth) => auth,
            Err(err) => {
                ctx.fail(&err.to_string()).await?;
                return Ok(());
            }
        };

        let client = match GraphClient::new(auth, config.graph_base_url.as_deref()).await {
            Ok(client) => client,
            Err(err) => {
                ctx.fail(&format!("Authentication failed: {err}")).await?;
                return Ok(());
            }
        };
        if let Err(err) = client.test_connection().await {
            let message = match err {
                AppError::Auth(err) => format!("Authentication failed: {err}"),
                err => format!("Connection test failed: {err}"),
            };
            ctx.fail(&message).await?;
            return Ok(());
        }

        let enabled: Vec<String> = config
            .services
            .unwrap_or_else(|| ALL_SERVICES.iter().map(|s| (*s).to_string()).collect());
        info!(services = ?enabled, "starting Microsoft sync");

        let prev_state: MsGraphState = state
            .and_then(|value| serde_json::from_value(value).ok())
            .unwrap_or_default();
        let mut merged = prev_state.clone();

        for (name, syncer) in build_syncers(&enabled) {
            if ctx.is_cancelled() {
                ctx.save_state(&serde_json::to_value(&merged)?).await?;
                return Err(AppError::Cancelled);
            }

            info!(syncer = name, "running syncer");
            let previous = prev_state.services.get(name).cloned().unwrap_or_default();
            match syncer.sync(&client, &ctx, &previous).await {
                Ok(new_state) => {
                    merged.services.insert(name.to_string(), new_state);
                }
                Err(err) => {
                    error!(syncer = name, error = %err, "syncer failed");
                    ctx.emit_error(&format!("{name}:*"), &err.to_string());
                }
            }
        }

        if ctx.is_cancelled() {
            ctx.save_state(&serde_json::to_value(&merged)?).await?;
            return Err(AppError::Cancelled);
        }

        ctx.complete(Some(&serde_json::to_value(&merged)?)).await?;
        info!(
            scanned = ctx.documents_scanned(),
            emitted = ctx.documents_emitted(),
            "Microsoft sync completed"
        );
        Ok(())
    }
}

fn build_syncers(enabled: &[String]) -> Vec<(&'static str, Box<dyn Syncer>)> {
    let mut syncers: Vec<(&'static str, Box<dyn Syncer>)> = Vec::new();
    if enabled.iter().any(|s| s == "onedrive") {
        syncers.push(("onedrive", Box::new(DriveSyncer)));
    }
    if enabled.iter().any(|s| s == "mail") {
        syncers.push(("mail", Box::new(MailSyncer)));
    }
    if enabled.iter().any(|s| s == "calendar") {
        syncers.push(("calendar", Box::new(CalendarSyncer)));
    }
    syncers
}
