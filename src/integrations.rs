//! # Integrations Module
//!
//! REST clients for Google Drive, Slack incoming webhooks and Notion.
//! Credentials are pre-issued tokens taken from [`IntegrationConfig`].

use regex::Regex;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::LazyLock;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::IntegrationConfig;
use crate::errors::RelayError;

const DRIVE_UPLOAD_URL: &str =
    "https://www.googleapis.com/upload/drive/v3/files?uploadType=multipart&fields=id,name,webViewLink";
const NOTION_PAGES_URL: &str = "https://api.notion.com/v1/pages";
const NOTION_VERSION: &str = "2022-06-28";
const NOTION_BLOCK_LIMIT: usize = 2000;
const HTTP_TIMEOUT_SECS: u64 = 60;

static UNSAFE_FILE_CHARS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"[\\/:*?"<>|\x00-\x1f]+"#).expect("File name pattern should be valid")
});

/// Replace characters Drive and most file systems reject
pub fn sanitize_file_name(name: &str) -> String {
    let cleaned = UNSAFE_FILE_CHARS.replace_all(name.trim(), "_");
    let cleaned: String = cleaned.chars().take(200).collect();
    if cleaned.trim_matches(['_', '.', ' ']).is_empty() {
        "upload".to_string()
    } else {
        cleaned
    }
}

fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}

async fn check_status(response: reqwest::Response, service: &str) -> Result<reqwest::Response, RelayError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let excerpt: String = body.chars().take(200).collect();
    Err(RelayError::Integration(format!("{service} returned {status}: {excerpt}")))
}

/// Metadata of an uploaded Drive file
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DriveFile {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub web_view_link: Option<String>,
}

/// Drive v3 uploads
#[derive(Clone)]
pub struct DriveClient {
    http: reqwest::Client,
    access_token: String,
    folder_id: Option<String>,
    upload_url: String,
}

impl DriveClient {
    pub fn new(access_token: impl Into<String>, folder_id: Option<String>) -> Self {
        Self {
            http: http_client(),
            access_token: access_token.into(),
            folder_id,
            upload_url: DRIVE_UPLOAD_URL.to_string(),
        }
    }

    pub fn from_config(config: &IntegrationConfig) -> Option<Self> {
        let token = config.drive_access_token.clone()?;
        Some(Self::new(token, config.drive_folder_id.clone()))
    }

    /// Metadata part of the multipart upload
    pub fn metadata(&self, file_name: &str) -> Value {
        let mut metadata = json!({ "name": sanitize_file_name(file_name) });
        if let Some(folder) = &self.folder_id {
            metadata["parents"] = json!([folder]);
        }
        metadata
    }

    pub async fn upload(
        &self,
        file_name: &str,
        mime_type: &str,
        content: &[u8],
    ) -> Result<DriveFile, RelayError> {
        let boundary = format!("relay-{}", uuid::Uuid::new_v4().simple());
        let body = build_multipart_related(&boundary, &self.metadata(file_name), mime_type, content);

        debug!(file_name, bytes = content.len(), "Uploading file to Drive");
        let response = self
            .http
            .post(&self.upload_url)
            .bearer_auth(&self.access_token)
            .header(
                reqwest::header::CONTENT_TYPE,
                format!("multipart/related; boundary={boundary}"),
            )
            .body(body)
            .send()
            .await?;

        let file: DriveFile = check_status(response, "Drive").await?.json().await?;
        info!(drive_file_id = %file.id, name = %file.name, "Uploaded file to Drive");
        Ok(file)
    }
}

/// `multipart/related` body with a JSON metadata part and a media part
pub fn build_multipart_related(
    boundary: &str,
    metadata: &Value,
    mime_type: &str,
    content: &[u8],
) -> Vec<u8> {
    let mut body = Vec::with_capacity(content.len() + 512);
    body.extend_from_slice(
        format!("--{boundary}\r\nContent-Type: application/json; charset=UTF-8\r\n\r\n{metadata}\r\n")
            .as_bytes(),
    );
    body.extend_from_slice(format!("--{boundary}\r\nContent-Type: {mime_type}\r\n\r\n").as_bytes());
    body.extend_from_slice(content);
    body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
    body
}

/// Slack incoming webhook
#[derive(Clone)]
pub struct SlackNotifier {
    http: reqwest::Client,
    webhook_url: String,
}

impl SlackNotifier {
    pub fn new(webhook_url: impl Into<String>) -> Self {
        Self {
            http: http_client(),
            webhook_url: webhook_url.into(),
        }
    }

    pub fn from_config(config: &IntegrationConfig) -> Option<Self> {
        config.slack_webhook_url.clone().map(Self::new)
    }

    pub async fn notify(&self, text: &str) -> Result<(), RelayError> {
        let response = self
            .http
            .post(&self.webhook_url)
            .json(&json!({ "text": text }))
            .send()
            .await?;
        check_status(response, "Slack").await?;
        debug!("Posted Slack notification");
        Ok(())
    }
}

/// Notion page creation in one database
#[derive(Clone)]
pub struct NotionRecorder {
    http: reqwest::Client,
    token: String,
    database_id: String,
}

impl NotionRecorder {
    pub fn new(token: impl Into<String>, database_id: impl Into<String>) -> Self {
        Self {
            http: http_client(),
            token: token.into(),
            database_id: database_id.into(),
        }
    }

    pub fn from_config(config: &IntegrationConfig) -> Option<Self> {
        Some(Self::new(
            config.notion_token.clone()?,
            config.notion_database_id.clone()?,
        ))
    }

    /// Request body for a page with `content` split into paragraph blocks
    pub fn page_payload(&self, title: &str, content: &str) -> Value {
        let title: String = title.chars().take(NOTION_BLOCK_LIMIT).collect();
        let title = if title.trim().is_empty() {
            "Task result".to_string()
        } else {
            title
        };
        let children: Vec<Value> = split_into_blocks(content, NOTION_BLOCK_LIMIT)
            .into_iter()
            .map(|chunk| paragraph_block(&chunk))
            .collect();

        json!({
            "parent": { "database_id": self.database_id },
            "properties": {
                "Name": { "title": [ { "text": { "content": title } } ] }
            },
            "children": children,
        })
    }

    pub async fn record(&self, title: &str, content: &str) -> Result<(), RelayError> {
        let response = self
            .http
            .post(NOTION_PAGES_URL)
            .bearer_auth(&self.token)
            .header("Notion-Version", NOTION_VERSION)
            .json(&self.page_payload(title, content))
            .send()
            .await?;
        check_status(response, "Notion").await?;
        info!(title, "Created Notion page");
        Ok(())
    }
}

fn paragraph_block(text: &str) -> Value {
    json!({
        "object": "block",
        "type": "paragraph",
        "paragraph": {
            "rich_text": [ { "type": "text", "text": { "content": text } } ]
        }
    })
}

/// Split text into chunks of at most `limit` characters, preferring line breaks
pub fn split_into_blocks(text: &str, limit: usize) -> Vec<String> {
    let mut blocks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0;

    for line in text.lines() {
        let mut line: Vec<char> = line.chars().collect();
        // Hard-split lines longer than a block
        while line.len() > limit {
            if current_len > 0 {
                blocks.push(std::mem::take(&mut current));
                current_len = 0;
            }
            let rest = line.split_off(limit);
            blocks.push(line.into_iter().collect());
            line = rest;
        }

        let extra = line.len() + usize::from(current_len > 0);
        if current_len + extra > limit {
            blocks.push(std::mem::take(&mut current));
            current_len = 0;
        }
        if current_len > 0 {
            current.push('\n');
            current_len += 1;
        }
        current.extend(line.iter());
        current_len += line.len();
    }

    if !current.trim().is_empty() {
        blocks.push(current);
    }
    blocks
}
