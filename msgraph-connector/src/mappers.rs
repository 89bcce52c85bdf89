//! Microsoft Graph objects to document mapping.

use chrono::{DateTime, Utc};
use connector_sdk::models::{Document, DocumentMetadata, DocumentPermissions};
use serde_json::{json, Value};

pub fn map_message_to_document(
    message: &Value,
    user_id: &str,
    user_email: Option<&str>,
    content_id: String,
) -> Document {
    let id = message["id"].as_str().unwrap_or_default();
    let subject = message["subject"].as_str().unwrap_or("(no subject)");
    let from = message["from"]["emailAddress"]["address"].as_str();

    Document {
        external_id: format!("mail:{user_id}:{id}"),
        title: subject.to_string(),
        content_id,
        metadata: Some(DocumentMetadata {
            author: from.map(str::to_string),
            created_at: parse_iso(message["sentDateTime"].as_str()),
            updated_at: parse_iso(message["receivedDateTime"].as_str()),
            url: message["webLink"].as_str().map(str::to_string),
            mime_type: Some("text/plain".into()),
            ..Default::default()
        }),
        permissions: Some(private_to(user_email)),
        attributes: Some(json!({
            "source_type": "microsoft",
            "content_type": "mail",
            "has_attachments": message["hasAttachments"].as_bool().unwrap_or(false).to_string(),
        })),
    }
}

pub fn map_event_to_document(
    event: &Value,
    user_id: &str,
    user_email: Option<&str>,
    content_id: String,
) -> Document {
    let id = event["id"].as_str().unwrap_or_default();
    let subject = event["subject"].as_str().unwrap_or("(no subject)");

    Document {
        external_id: format!("calendar:{user_id}:{id}"),
        title: subject.to_string(),
        content_id,
        metadata: Some(DocumentMetadata {
            author: event["organizer"]["emailAddress"]["address"]
                .as_str()
                .map(str::to_string),
            created_at: parse_iso(event["createdDateTime"].as_str()),
            updated_at: parse_iso(event["lastModifiedDateTime"].as_str()),
            url: event["webLink"].as_str().map(str::to_string),
            mime_type: Some("text/plain".into()),
            ..Default::default()
        }),
        permissions: Some(private_to(user_email)),
        attributes: Some(json!({
            "source_type": "microsoft",
            "content_type": "calendar_event",
        })),
    }
}

pub fn map_drive_item_to_document(
    item: &Value,
    content_id: String,
    owner_email: Option<&str>,
) -> Document {
    let drive_id = item["parentReference"]["driveId"].as_str().unwrap_or("unknown");
    let item_id = item["id"].as_str().unwrap_or_default();
    let mime_type = item["file"]["mimeType"].as_str();
    let size = item["size"].as_u64();

    Document {
        external_id: format!("onedrive:{drive_id}:{item_id}"),
        title: item["name"].as_str().unwrap_or("Untitled").to_string(),
        content_id,
        metadata: Some(DocumentMetadata {
            created_at: parse_iso(item["createdDateTime"].as_str()),
            updated_at: parse_iso(item["lastModifiedDateTime"].as_str()),
            url: item["webUrl"].as_str().map(str::to_string),
            mime_type: mime_type.map(str::to_string),
            size: size.map(|s| s.to_string()),
            path: item["parentReference"]["path"].as_str().map(str::to_string),
            extra: Some(json!({"drive_id": drive_id, "item_id": item_id})),
            ..Default::default()
        }),
        permissions: Some(private_to(owner_email)),
        attributes: Some(json!({
            "source_type": "microsoft",
            "content_type": "file",
        })),
    }
}

pub fn generate_message_content(message: &Value, body_text: &str) -> String {
    let mut lines: Vec<String> = Vec::new();
    lines.push(format!(
        "Subject: {}",
        message["subject"].as_str().unwrap_or("(no subject)")
    ));
    if let Some(from) = message["from"]["emailAddress"]["address"].as_str() {
        lines.push(format!("From: {from}"));
    }
    let recipients: Vec<&str> = message["toRecipients"]
        .as_array()
        .map(|list| {
            list.iter()
                .filter_map(|r| r["emailAddress"]["address"].as_str())
                .collect()
        })
        .unwrap_or_default();
    if !recipients.is_empty() {
        lines.push(format!("To: {}", recipients.join(", ")));
    }
    lines.push(String::new());
    lines.push(body_text.to_string());
    lines.join("\n")
}

pub fn generate_event_content(event: &Value) -> String {
    let mut lines: Vec<String> = Vec::new();
    lines.push(format!(
        "Event: {}",
        event["subject"].as_str().unwrap_or("(no subject)")
    ));
    if let Some(organizer) = event["organizer"]["emailAddress"]["address"].as_str() {
        lines.push(format!("Organizer: {organizer}"));
    }
    if let Some(start) = event["start"]["dateTime"].as_str() {
        lines.push(format!("Start: {start}"));
    }
    if let Some(end) = event["end"]["dateTime"].as_str() {
        lines.push(format!("End: {end}"));
    }
    let attendees: Vec<&str> = event["attendees"]
        .as_array()
        .map(|list| {
            list.iter()
                .filter_map(|a| a["emailAddress"]["address"].as_str())
                .collect()
        })
        .unwrap_or_default();
    if !attendees.is_empty() {
        lines.push(format!("Attendees: {}", attendees.join(", ")));
    }
    lines.push(String::new());
    if let Some(body) = event["body"]["content"].as_str() {
        lines.push(strip_html(body));
    }
    lines.join("\n")
}

pub fn generate_drive_item_content(item: &Value) -> String {
    let mut lines: Vec<String> = Vec::new();
    lines.push(format!(
        "File: {}",
        item["name"].as_str().unwrap_or("Untitled")
    ));
    if let Some(path) = item["parentReference"]["path"].as_str() {
        lines.push(format!("Path: {path}"));
    }
    if let Some(size) = item["size"].as_u64() {
        lines.push(format!("Size: {size} bytes"));
    }
    if let Some(url) = item["webUrl"].as_str() {
        lines.push(format!("URL: {url}"));
    }
    lines.join("\n")
}

/// Tag stripping for HTML email and event bodies; collapses the leftover
/// whitespace.
pub fn strip_html(html: &str) -> String {
    let mut text = String::with_capacity(html.len());
    let mut in_tag = false;
    for c in html.chars() {
        match c {
            '<' => in_tag = true,
            '>' => {
                in_tag = false;
                text.push(' ');
            }
            c if !in_tag => text.push(c),
            _ => {}
        }
    }
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn private_to(email: Option<&str>) -> DocumentPermissions {
    DocumentPermissions {
        public: false,
        users: email.map(|e| vec![e.to_string()]).unwrap_or_default(),
        groups: Vec::new(),
    }
}

fn parse_iso(value: Option<&str>) -> Option<DateTime<Utc>> {
    let value = value?;
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
