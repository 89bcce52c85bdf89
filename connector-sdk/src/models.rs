use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use common::storage::types::connector_event::{
    DocumentMetadata, DocumentPermissions, EventPayload,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    Full,
    Incremental,
}

/// A discovered external entity, ready to be emitted as a document event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub external_id: String,
    pub title: String,
    pub content_id: String,
    #[serde(default)]
    pub metadata: Option<DocumentMetadata>,
    #[serde(default)]
    pub permissions: Option<DocumentPermissions>,
    #[serde(default)]
    pub attributes: Option<Value>,
}

impl Document {
    pub(crate) fn into_payload(mut self, updated: bool) -> EventPayload {
        // The document title rides in the metadata block on the wire
        let metadata = {
            let mut metadata = self.metadata.take().unwrap_or_default();
            if metadata.title.is_none() {
                metadata.title = Some(self.title.clone());
            }
            Some(metadata)
        };
        if updated {
            EventPayload::DocumentUpdated {
                document_id: self.external_id,
                content_id: self.content_id,
                metadata,
                permissions: self.permissions,
                attributes: self.attributes,
            }
        } else {
            EventPayload::DocumentCreated {
                document_id: self.external_id,
                content_id: self.content_id,
                metadata,
                permissions: self.permissions,
                attributes: self.attributes,
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRequest {
    pub sync_run_id: String,
    pub source_id: String,
    pub sync_mode: SyncMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncResponse {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SyncResponse {
    pub fn started() -> Self {
        Self {
            status: "started".into(),
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: "error".into(),
            error: Some(message.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelRequest {
    pub sync_run_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelResponse {
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionRequest {
    pub action: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub credentials: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionResponse {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ActionResponse {
    pub fn success(result: Value) -> Self {
        Self {
            status: "success".into(),
            result: Some(result),
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: "error".into(),
            result: None,
            error: Some(message.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionMode {
    Read,
    Write,
}

/// A declared connector action: name, human description, JSON schema of its
/// parameters and whether it mutates the external system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
    pub mode: ActionMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub name: String,
    pub version: String,
    pub sync_modes: Vec<SyncMode>,
    pub actions: Vec<ActionDefinition>,
}

/// Everything a sync run needs, fetched from the manager before the
/// connector starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    pub config: Value,
    pub credentials: Value,
    #[serde(default)]
    pub connector_state: Option<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn document_title_lands_in_metadata() {
        let doc = Document {
            external_id: "gh:issue:octo/hello#1".into(),
            title: "Issue #1".into(),
            content_id: "c1".into(),
            metadata: None,
            permissions: None,
            attributes: Some(json!({"content_type": "issue"})),
        };
        let payload = doc.into_payload(false);
        let value = serde_json::to_value(&payload).expect("serialize");
        assert_eq!(value["type"], "document_created");
        assert_eq!(value["metadata"]["title"], "Issue #1");
    }

    #[test]
    fn explicit_metadata_title_is_kept() {
        let doc = Document {
            external_id: "x".into(),
            title: "fallback".into(),
            content_id: "c1".into(),
            metadata: Some(DocumentMetadata {
                title: Some("explicit".into()),
                ..Default::default()
            }),
            permissions: None,
            attributes: None,
        };
        let payload = doc.into_payload(true);
        let value = serde_json::to_value(&payload).expect("serialize");
        assert_eq!(value["type"], "document_updated");
        assert_eq!(value["metadata"]["title"], "explicit");
    }

    #[test]
    fn sync_mode_wire_names() {
        assert_eq!(
            serde_json::to_string(&SyncMode::Full).expect("serialize"),
            "\"full\""
        );
        let parsed: SyncMode = serde_json::from_str("\"incremental\"").expect("parse");
        assert_eq!(parsed, SyncMode::Incremental);
    }
}
