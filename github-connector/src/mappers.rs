//! GitHub objects to document mapping.

use chrono::{DateTime, Utc};
use connector_sdk::models::{Document, DocumentMetadata, DocumentPermissions};
use serde_json::{json, Value};

use crate::client::{Comment, Issue, Pull, Repo};
use crate::config::MAX_CONTENT_LENGTH;

pub fn map_repo_to_document(repo: &Repo, content_id: String) -> Document {
    Document {
        external_id: format!("github:repo:{}", repo.full_name),
        title: repo.full_name.clone(),
        content_id,
        metadata: Some(DocumentMetadata {
            author: repo.owner.as_ref().map(|owner| owner.login.clone()),
            created_at: parse_iso(repo.created_at.as_deref()),
            updated_at: parse_iso(repo.updated_at.as_deref()),
            url: repo.html_url.clone(),
            mime_type: Some("text/plain".into()),
            ..Default::default()
        }),
        permissions: Some(build_permissions(repo.private, &repo.full_name)),
        attributes: Some(json!({
            "source_type": "github",
            "content_type": "repository",
            "language": repo.language.clone().unwrap_or_default(),
            "visibility": if repo.private { "private" } else { "public" },
            "archived": repo.archived.to_string(),
            "topics": repo.topics.join(","),
        })),
    }
}

pub fn map_issue_to_document(
    issue: &Issue,
    content_id: String,
    repo_full_name: &str,
    is_private: bool,
) -> Document {
    let labels: Vec<String> = issue.labels.iter().map(|l| l.name.clone()).collect();

    Document {
        external_id: format!("github:issue:{repo_full_name}#{}", issue.number),
        title: format!("[{repo_full_name}] Issue #{}: {}", issue.number, issue.title),
        content_id,
        metadata: Some(DocumentMetadata {
            author: issue.user.as_ref().map(|user| user.login.clone()),
            created_at: parse_iso(issue.created_at.as_deref()),
            updated_at: parse_iso(issue.updated_at.as_deref()),
            url: issue.html_url.clone(),
            mime_type: Some("text/plain".into()),
            ..Default::default()
        }),
        permissions: Some(build_permissions(is_private, repo_full_name)),
        attributes: Some(json!({
            "source_type": "github",
            "content_type": "issue",
            "state": issue.state.clone().unwrap_or_default(),
            "labels": labels.join(","),
            "assignee": issue.assignee.as_ref().map(|a| a.login.clone()).unwrap_or_default(),
            "milestone": issue.milestone.as_ref().map(|m| m.title.clone()).unwrap_or_default(),
        })),
    }
}

pub fn map_pr_to_document(
    pr: &Pull,
    content_id: String,
    repo_full_name: &str,
    is_private: bool,
) -> Document {
    let labels: Vec<String> = pr.labels.iter().map(|l| l.name.clone()).collect();

    Document {
        external_id: format!("github:pr:{repo_full_name}#{}", pr.number),
        title: format!("[{repo_full_name}] PR #{}: {}", pr.number, pr.title),
        content_id,
        metadata: Some(DocumentMetadata {
            author: pr.user.as_ref().map(|user| user.login.clone()),
            created_at: parse_iso(pr.created_at.as_deref()),
            updated_at: parse_iso(pr.updated_at.as_deref()),
            url: pr.html_url.clone(),
            mime_type: Some("text/plain".into()),
            ..Default::default()
        }),
        permissions: Some(build_permissions(is_private, repo_full_name)),
        attributes: Some(json!({
            "source_type": "github",
            "content_type": "pull_request",
            "state": pr.state.clone().unwrap_or_default(),
            "draft": pr.draft.unwrap_or(false).to_string(),
            "labels": labels.join(","),
            "merged": pr.merged_at.is_some().to_string(),
        })),
    }
}

pub fn map_discussion_to_document(
    discussion: &Value,
    content_id: String,
    repo_full_name: &str,
    is_private: bool,
) -> Document {
    let number = discussion["number"].as_u64().unwrap_or(0);
    let title = discussion["title"].as_str().unwrap_or("Untitled Discussion");
    let author = discussion["author"]["login"].as_str();
    let category = discussion["category"]["name"].as_str().unwrap_or_default();
    let is_answered = !discussion["answerChosenAt"].is_null();

    Document {
        external_id: format!("github:discussion:{repo_full_name}#{number}"),
        title: format!("[{repo_full_name}] Discussion #{number}: {title}"),
        content_id,
        metadata: Some(DocumentMetadata {
            author: author.map(str::to_string),
            created_at: parse_iso(discussion["createdAt"].as_str()),
            updated_at: parse_iso(discussion["updatedAt"].as_str()),
            url: discussion["url"].as_str().map(str::to_string),
            mime_type: Some("text/plain".into()),
            ..Default::default()
        }),
        permissions: Some(build_permissions(is_private, repo_full_name)),
        attributes: Some(json!({
            "source_type": "github",
            "content_type": "discussion",
            "category": category,
            "answered": is_answered.to_string(),
        })),
    }
}

pub fn generate_repo_content(repo: &Repo, readme: Option<&str>) -> String {
    let mut lines: Vec<String> = Vec::new();
    lines.push(format!("Repository: {}", repo.full_name));
    if let Some(description) = &repo.description {
        lines.push(format!("Description: {description}"));
    }
    if let Some(language) = &repo.language {
        lines.push(format!("Language: {language}"));
    }
    if !repo.topics.is_empty() {
        lines.push(format!("Topics: {}", repo.topics.join(", ")));
    }
    lines.push(String::new());
    if let Some(readme) = readme {
        lines.push("README:".to_string());
        lines.push(readme.to_string());
    }
    truncate(lines.join("\n"))
}

pub fn generate_issue_content(issue: &Issue, comments: &[Comment]) -> String {
    let mut lines: Vec<String> = Vec::new();
    lines.push(format!("Issue #{}: {}", issue.number, issue.title));
    lines.push(format!("State: {}", issue.state.clone().unwrap_or_default()));
    if let Some(user) = &issue.user {
        lines.push(format!("Author: {}", user.login));
    }
    lines.push(String::new());
    if let Some(body) = &issue.body {
        lines.push(body.clone());
    }
    append_comments(&mut lines, "--- Comments ---", comments);
    truncate(lines.join("\n"))
}

pub fn generate_pr_content(
    pr: &Pull,
    issue_comments: &[Comment],
    review_comments: &[Comment],
) -> String {
    let mut lines: Vec<String> = Vec::new();
    lines.push(format!("Pull Request #{}: {}", pr.number, pr.title));
    lines.push(format!("State: {}", pr.state.clone().unwrap_or_default()));
    if let Some(user) = &pr.user {
        lines.push(format!("Author: {}", user.login));
    }
    if pr.merged_at.is_some() {
        lines.push("Merged: yes".to_string());
    }
    lines.push(String::new());
    if let Some(body) = &pr.body {
        lines.push(body.clone());
    }
    append_comments(&mut lines, "--- Comments ---", issue_comments);
    if !review_comments.is_empty() {
        lines.push(String::new());
        lines.push("--- Review Comments ---".to_string());
        for comment in review_comments {
            let author = comment
                .user
                .as_ref()
                .map_or("unknown", |user| user.login.as_str());
            let path = comment.path.clone().unwrap_or_default();
            lines.push(format!("\n{author} on {path}:"));
            if let Some(body) = &comment.body {
                lines.push(body.clone());
            }
        }
    }
    truncate(lines.join("\n"))
}

pub fn generate_discussion_content(discussion: &Value) -> String {
    let mut lines: Vec<String> = Vec::new();
    lines.push(format!(
        "Discussion #{}: {}",
        discussion["number"].as_u64().unwrap_or(0),
        discussion["title"].as_str().unwrap_or_default()
    ));
    if let Some(author) = discussion["author"]["login"].as_str() {
        lines.push(format!("Author: {author}"));
    }
    if let Some(category) = discussion["category"]["name"].as_str() {
        if !category.is_empty() {
            lines.push(format!("Category: {category}"));
        }
    }
    lines.push(String::new());
    if let Some(body) = discussion["body"].as_str() {
        if !body.is_empty() {
            lines.push(body.to_string());
        }
    }
    if let Some(nodes) = discussion["comments"]["nodes"].as_array() {
        if !nodes.is_empty() {
            lines.push(String::new());
            lines.push("--- Comments ---".to_string());
            for comment in nodes {
                let author = comment["author"]["login"].as_str().unwrap_or("unknown");
                lines.push(format!("\n{author}:"));
                if let Some(body) = comment["body"].as_str() {
                    lines.push(body.to_string());
                }
            }
        }
    }
    truncate(lines.join("\n"))
}

fn append_comments(lines: &mut Vec<String>, header: &str, comments: &[Comment]) {
    if comments.is_empty() {
        return;
    }
    lines.push(String::new());
    lines.push(header.to_string());
    for comment in comments {
        let author = comment
            .user
            .as_ref()
            .map_or("unknown", |user| user.login.as_str());
        lines.push(format!("\n{author}:"));
        if let Some(body) = &comment.body {
            lines.push(body.clone());
        }
    }
}

fn build_permissions(is_private: bool, repo_full_name: &str) -> DocumentPermissions {
    if is_private {
        DocumentPermissions {
            public: false,
            users: Vec::new(),
            groups: vec![format!("github:repo:{repo_full_name}")],
        }
    } else {
        DocumentPermissions {
            public: true,
            ..Default::default()
        }
    }
}

fn parse_iso(value: Option<&str>) -> Option<DateTime<Utc>> {
    let value = value?;
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Cap content on a char boundary.
fn truncate(mut content: String) -> String {
    if content.len() > MAX_CONTENT_LENGTH {
        let mut cut = MAX_CONTENT_LENGTH;
        while !content.is_char_boundary(cut) {
            cut -= 1;
        }
        content.truncate(cut);
    }
    content
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Actor;

    fn sample_repo() -> Repo {
        Repo {
            full_name: "octocat/Hello-World".into(),
            private: false,
            fork: false,
            archived: false,
            description: Some("My first repository".into()),
            language: Some("Rust".into()),
            topics: vec!["example".into(), "demo".into()],
            html_url: Some("https://github.com/octocat/Hello-World".into()),
            owner: Some(Actor {
                login: "octocat".into(),
            }),
            created_at: Some("2024-01-01T00:00:00Z".into()),
            updated_at: Some("2024-06-01T12:00:00Z".into()),
        }
    }

    #[test]
    fn repo_document_carries_identity_and_attributes() {
        let doc = map_repo_to_document(&sample_repo(), "content-1".into());
        assert_eq!(doc.external_id, "github:repo:octocat/Hello-World");
        assert_eq!(doc.title, "octocat/Hello-World");
        let attributes = doc.attributes.expect("attributes");
        assert_eq!(attributes["content_type"], "repository");
        assert_eq!(attributes["language"], "Rust");
        assert_eq!(attributes["topics"], "example,demo");
        let metadata = doc.metadata.expect("metadata");
        assert!(metadata.updated_at.is_some());
        assert!(doc.permissions.expect("permissions").public);
    }

    #[test]
    fn private_repos_get_group_scoped_permissions() {
        let mut repo = sample_repo();
        repo.private = true;
        let doc = map_repo_to_document(&repo, "content-1".into());
        let permissions = doc.permissions.expect("permissions");
        assert!(!permissions.public);
        assert_eq!(permissions.groups, vec!["github:repo:octocat/Hello-World"]);
    }

    #[test]
    fn issue_content_includes_body_and_comments() {
        let issue = Issue {
            number: 1,
            title: "Found a bug".into(),
            state: Some("open".into()),
            body: Some("Something is wrong.".into()),
            user: Some(Actor {
                login: "octocat".into(),
            }),
            labels: Vec::new(),
            assignee: None,
            milestone: None,
            html_url: None,
            created_at: None,
            updated_at: Some("2024-06-02T00:00:00Z".into()),
            pull_request: None,
        };
        let comments = vec![Comment {
            user: Some(Actor {
                login: "hubber".into(),
            }),
            body: Some("Confirmed, reproduces for me.".into()),
            path: None,
        }];

        let content = generate_issue_content(&issue, &comments);
        assert!(content.starts_with("Issue #1: Found a bug"));
        assert!(content.contains("Something is wrong."));
        assert!(content.contains("--- Comments ---"));
        assert!(content.contains("hubber:"));

        let doc = map_issue_to_document(&issue, "c1".into(), "octocat/Hello-World", false);
        assert_eq!(doc.external_id, "github:issue:octocat/Hello-World#1");
        assert_eq!(
            doc.attributes.expect("attributes")["content_type"],
            "issue"
        );
    }

    #[test]
    fn oversized_content_is_truncated_on_char_boundary() {
        let mut repo = sample_repo();
        repo.description = None;
        let readme = "é".repeat(MAX_CONTENT_LENGTH);
        let content = generate_repo_content(&repo, Some(&readme));
        assert!(content.len() <= MAX_CONTENT_LENGTH);
        assert!(content.is_char_boundary(content.len()));
    }
}
