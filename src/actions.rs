//! # Follow-up Actions Module
//!
//! Runs the follow-up action chosen for a delivered result: saving the
//! original upload and/or the result text to Google Drive. Also forwards
//! results to Slack and Notion when a chat has those integrations on.

use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use teloxide::prelude::*;
use teloxide::types::FileId;
use tracing::{info, warn};

use crate::config::IntegrationConfig;
use crate::errors::RelayError;
use crate::followup::FollowupRecord;
use crate::integrations::{DriveClient, DriveFile, NotionRecorder, SlackNotifier};
use crate::localization::{t_args_lang, t_lang};
use crate::preferences::{ActionCode, Integrations};
use crate::task::{audio_extension_for_mime, guess_mime_type, TaskKind};

/// Source of the bytes of an earlier upload
#[async_trait]
pub trait FileSource: Send + Sync {
    async fn fetch(&self, file_id: &str) -> Result<Vec<u8>, RelayError>;
}

/// Fetch uploads again through the Bot API file endpoint
pub struct TelegramFileSource {
    bot: Bot,
    http: reqwest::Client,
}

impl TelegramFileSource {
    pub fn new(bot: Bot) -> Self {
        Self {
            bot,
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl FileSource for TelegramFileSource {
    async fn fetch(&self, file_id: &str) -> Result<Vec<u8>, RelayError> {
        let file = self
            .bot
            .get_file(FileId(file_id.to_string()))
            .await
            .map_err(|e| RelayError::Upstream(format!("Telegram getFile failed: {e}")))?;
        let url = format!(
            "https://api.telegram.org/file/bot{}/{}",
            self.bot.token(),
            file.path
        );
        let response = self.http.get(&url).send().await?.error_for_status()?;
        Ok(response.bytes().await?.to_vec())
    }
}

/// Name of the original upload when saved again
pub fn original_file_name(record: &FollowupRecord) -> String {
    if let Some(name) = record.meta.file_name.as_deref().filter(|n| !n.trim().is_empty()) {
        return name.to_string();
    }
    let extension = match record.kind {
        TaskKind::Audio => audio_extension_for_mime(record.meta.mime_type.as_deref()),
        TaskKind::Image => ".jpg",
        TaskKind::Document => "",
    };
    format!("{}_{}{}", record.kind.code(), record.task_id, extension)
}

/// Name of the text file holding the result
pub fn summary_file_name(record: &FollowupRecord) -> String {
    let original = original_file_name(record);
    let stem = Path::new(&original)
        .file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .unwrap_or("result");
    format!("{stem}_summary.txt")
}

pub struct ActionExecutor {
    drive: Option<DriveClient>,
    slack: Option<SlackNotifier>,
    notion: Option<NotionRecorder>,
    files: Arc<dyn FileSource>,
}

impl ActionExecutor {
    pub fn new(config: &IntegrationConfig, files: Arc<dyn FileSource>) -> Self {
        Self {
            drive: DriveClient::from_config(config),
            slack: SlackNotifier::from_config(config),
            notion: NotionRecorder::from_config(config),
            files,
        }
    }

    pub fn drive_configured(&self) -> bool {
        self.drive.is_some()
    }

    /// Run `action` and return the confirmation shown to the user
    pub async fn execute_followup_action(
        &self,
        action: ActionCode,
        record: &FollowupRecord,
    ) -> Result<String, RelayError> {
        let lang = record.language_code.as_deref();
        if action == ActionCode::None {
            return Ok(t_lang("action-done-none", lang));
        }

        let Some(drive) = &self.drive else {
            warn!(user_id = %record.chat_id, action = %action.code(), "Drive is not configured, skipping action");
            return Ok(t_lang("drive-not-configured", lang));
        };

        let mut saved: Vec<DriveFile> = Vec::new();

        if action.saves_original() {
            let file_id = record.meta.file_id.as_deref().ok_or_else(|| {
                RelayError::Integration("The original upload is no longer available".to_string())
            })?;
            let bytes = self.files.fetch(file_id).await?;
            let file_name = original_file_name(record);
            let mime_type = record
                .meta
                .mime_type
                .clone()
                .unwrap_or_else(|| guess_mime_type(&file_name).to_string());
            saved.push(drive.upload(&file_name, &mime_type, &bytes).await?);
        }

        if action.saves_summary() {
            let text = record.result.as_plain_text();
            if text.is_empty() {
                warn!(task_id = %record.task_id, "Result has no text to save");
            } else {
                let file_name = summary_file_name(record);
                saved.push(
                    drive
                        .upload(&file_name, "text/plain; charset=UTF-8", text.as_bytes())
                        .await?,
                );
            }
        }

        info!(user_id = %record.chat_id, task_id = %record.task_id, action = %action.code(), files = saved.len(), "Follow-up action completed");

        let files = saved
            .iter()
            .map(|file| match &file.web_view_link {
                Some(link) => format!("• {} ({link})", file.name),
                None => format!("• {}", file.name),
            })
            .collect::<Vec<_>>()
            .join("\n");
        Ok(t_args_lang("action-done-drive", &[("files", &files)], lang))
    }

    /// Forward a delivered result to the chat's enabled integrations
    pub async fn publish_result(&self, integrations: &Integrations, record: &FollowupRecord) {
        let title = format!(
            "{} {}",
            record.kind.emoji(),
            record
                .meta
                .file_name
                .clone()
                .unwrap_or_else(|| record.kind.code().to_string())
        );
        let headline = record.result.headline().unwrap_or_default();

        if integrations.slack {
            match &self.slack {
                Some(slack) => {
                    let excerpt: String = headline.chars().take(500).collect();
                    if let Err(e) = slack.notify(&format!("{title}\n{excerpt}")).await {
                        warn!(user_id = %record.chat_id, error = %e, "Slack notification failed");
                    }
                }
                None => warn!(user_id = %record.chat_id, "Slack is enabled but SLACK_WEBHOOK_URL is not set"),
            }
        }

        if integrations.notion {
            match &self.notion {
                Some(notion) => {
                    if let Err(e) = notion.record(&title, &record.result.as_plain_text()).await {
                        warn!(user_id = %record.chat_id, error = %e, "Notion recording failed");
                    }
                }
                None => warn!(user_id = %record.chat_id, "Notion is enabled but not configured"),
            }
        }
    }
}
