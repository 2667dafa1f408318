//! Upload dispatch: fan uploads out to the worker bots and deliver their results

use anyhow::{Context, Result};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use teloxide::prelude::*;
use teloxide::types::{FileId, MessageId};
use tracing::{debug, error, info, warn};

use crate::correlation::{PendingTicket, TaskInfo, TaskStatus};
use crate::db;
use crate::followup::{FollowupMeta, FollowupRecord};
use crate::localization::{t_args_lang, t_lang};
use crate::task::{
    estimate_processing_time, format_file_size, get_file_extension, is_audio_file,
    is_document_file, is_image_file, is_text_file, new_task_id, FileRef, TaskId, TaskKind,
    TaskRequestData, TaskResult,
};

use super::state::AppState;
use super::ui_builder::{format_progress, format_result, kind_label, split_message, MESSAGE_LIMIT};

/// An upload extracted from a Telegram message
#[derive(Debug, Clone, PartialEq)]
pub struct Upload {
    pub kind: TaskKind,
    pub file_id: String,
    pub file_name: String,
    pub file_size: u64,
    pub mime_type: Option<String>,
    pub duration: Option<u32>,
}

/// Why an upload was refused before dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadRejection {
    TooLarge,
    Unsupported,
}

/// Pick the worker for a document upload; audio and image documents go to their own workers
pub fn classify_document(file_name: &str, mime_type: Option<&str>) -> Option<TaskKind> {
    let mime_type = mime_type.unwrap_or_default();
    if mime_type.starts_with("audio/") || is_audio_file(file_name) {
        Some(TaskKind::Audio)
    } else if mime_type.starts_with("image/") || is_image_file(file_name) {
        Some(TaskKind::Image)
    } else if is_text_file(file_name)
        || is_document_file(file_name)
        || mime_type.starts_with("text/")
        || mime_type == "application/pdf"
    {
        Some(TaskKind::Document)
    } else {
        None
    }
}

pub fn validate_upload(upload: &Upload, max_size: u64) -> Result<(), UploadRejection> {
    if upload.file_size > max_size {
        return Err(UploadRejection::TooLarge);
    }
    if upload.kind == TaskKind::Document
        && classify_document(&upload.file_name, upload.mime_type.as_deref()).is_none()
    {
        return Err(UploadRejection::Unsupported);
    }
    Ok(())
}

/// Download a Telegram file into `dir`, keeping it for the worker to read
pub async fn download_file(bot: &Bot, file_id: &str, dir: &Path, prefix: &str, file_name: &str) -> Result<PathBuf> {
    let file = bot.get_file(FileId(file_id.to_string())).await?;
    let url = format!(
        "https://api.telegram.org/file/bot{}/{}",
        bot.token(),
        file.path
    );

    let response = reqwest::get(&url).await?.error_for_status()?;
    let bytes = response.bytes().await?;

    let mut temp_file = tempfile::Builder::new()
        .prefix(prefix)
        .suffix(&get_file_extension(file_name))
        .tempfile_in(dir)
        .with_context(|| format!("Failed to create a temporary file in {}", dir.display()))?;
    temp_file.as_file_mut().write_all(&bytes)?;

    // The worker owns the file from here; the job deletes it when done
    let (_, path) = temp_file.keep()?;
    Ok(path)
}

async fn remove_temp_file(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(temp_path = %path.display(), "Temporary file cleaned up successfully"),
        Err(e) => error!(temp_path = %path.display(), error = %e, "Failed to clean up temporary file"),
    }
}

/// Validate, download and publish an upload, then run its job in the background
pub async fn dispatch_upload(
    bot: &Bot,
    chat_id: ChatId,
    user_id: Option<i64>,
    language_code: Option<&str>,
    upload: Upload,
    state: &Arc<AppState>,
) -> Result<()> {
    let Some(messenger) = state.messenger.as_ref() else {
        bot.send_message(chat_id, t_lang("dispatch-disabled", language_code))
            .await?;
        return Ok(());
    };

    if let Err(rejection) = validate_upload(&upload, state.config.max_upload_size) {
        warn!(user_id = %chat_id, file_name = %upload.file_name, ?rejection, "Upload rejected");
        let message = match rejection {
            UploadRejection::TooLarge => t_args_lang(
                "upload-too-large",
                &[("max", &format_file_size(state.config.max_upload_size))],
                language_code,
            ),
            UploadRejection::Unsupported => t_lang("error-unsupported-format", language_code),
        };
        bot.send_message(chat_id, message).await?;
        return Ok(());
    }

    bot.send_message(
        chat_id,
        t_args_lang(
            "upload-received",
            &[
                ("kind", &kind_label(upload.kind, language_code)),
                ("name", &upload.file_name),
                ("size", &format_file_size(upload.file_size)),
            ],
            language_code,
        ),
    )
    .await?;

    let task_id = new_task_id();
    state.active.insert(
        chat_id.0,
        &task_id,
        TaskInfo {
            kind: upload.kind,
            status: TaskStatus::Dispatched,
            file_name: upload.file_name.clone(),
            file_id: Some(upload.file_id.clone()),
            mime_type: upload.mime_type.clone(),
            language_code: language_code.map(str::to_string),
            started_at: chrono::Utc::now(),
        },
    );

    let prefix = format!("{}_{}_", upload.kind.code(), chat_id.0);
    let file_path = match download_file(
        bot,
        &upload.file_id,
        &state.config.temp_dir,
        &prefix,
        &upload.file_name,
    )
    .await
    {
        Ok(path) => {
            debug!(user_id = %chat_id, temp_path = %path.display(), "Upload downloaded successfully");
            path
        }
        Err(e) => {
            error!(user_id = %chat_id, error = %e, "Failed to download upload");
            state.active.remove(chat_id.0, &task_id);
            bot.send_message(chat_id, t_lang("error-download-failed", language_code))
                .await?;
            return Ok(());
        }
    };

    let file = FileRef {
        file_path: file_path.to_string_lossy().to_string(),
        file_name: upload.file_name.clone(),
        file_size: upload.file_size,
        mime_type: upload.mime_type.clone(),
        duration: upload.duration,
    };
    let estimate_secs = estimate_processing_time(upload.kind, &file);

    // Register before publishing so a fast worker cannot beat the waiter
    let ticket = state.pending.register(&task_id);
    let data = TaskRequestData {
        task_id: task_id.clone(),
        chat_id: chat_id.0,
        user_id,
        file,
    };
    if let Err(e) = messenger.publish_task(upload.kind, data).await {
        error!(user_id = %chat_id, task_id = %task_id, error = %e, "Failed to publish task");
        state.pending.cancel(ticket);
        state.active.remove(chat_id.0, &task_id);
        remove_temp_file(&file_path).await;
        bot.send_message(chat_id, t_lang(e.message_key(), language_code))
            .await?;
        return Ok(());
    }
    state.active.set_status(chat_id.0, &task_id, TaskStatus::Processing);
    info!(user_id = %chat_id, task_id = %task_id, kind = %upload.kind, estimate_secs, "Task dispatched");

    if let Some(pool) = &state.pool {
        if let Err(e) = db::log_task_started(
            pool,
            &task_id,
            chat_id.0,
            upload.kind.code(),
            Some(&upload.file_name),
        )
        .await
        {
            warn!(task_id = %task_id, error = %e, "Failed to log task start");
        }
    }

    let job = TaskJob {
        task_id,
        chat_id,
        kind: upload.kind,
        file_name: upload.file_name,
        file_path,
        estimate_secs,
        language_code: language_code.map(str::to_string),
        ticket,
    };
    tokio::spawn(run_task_job(bot.clone(), Arc::clone(state), job));

    Ok(())
}

struct TaskJob {
    task_id: TaskId,
    chat_id: ChatId,
    kind: TaskKind,
    file_name: String,
    file_path: PathBuf,
    estimate_secs: u64,
    language_code: Option<String>,
    ticket: PendingTicket,
}

async fn run_task_job(bot: Bot, state: Arc<AppState>, job: TaskJob) {
    let TaskJob {
        task_id,
        chat_id,
        kind,
        file_name,
        file_path,
        estimate_secs,
        language_code,
        ticket,
    } = job;
    let lang = language_code.as_deref();

    let progress_message: Option<MessageId> = match bot
        .send_message(chat_id, format_progress(kind, &file_name, 0, estimate_secs, lang))
        .await
    {
        Ok(message) => Some(message.id),
        Err(e) => {
            warn!(user_id = %chat_id, error = %e, "Failed to send progress message");
            None
        }
    };

    let started = Instant::now();
    let timeout = Duration::from_secs(state.config.result_timeout_secs);
    let wait = state.pending.wait(ticket, timeout);
    tokio::pin!(wait);

    let mut ticker = tokio::time::interval(Duration::from_secs(state.config.progress_interval_secs));
    // The first tick completes immediately
    ticker.tick().await;

    let outcome = loop {
        tokio::select! {
            result = &mut wait => break result,
            _ = ticker.tick() => {
                if let Some(message_id) = progress_message {
                    let text = format_progress(kind, &file_name, started.elapsed().as_secs(), estimate_secs, lang);
                    if let Err(e) = bot.edit_message_text(chat_id, message_id, text).await {
                        debug!(user_id = %chat_id, error = %e, "Failed to update progress message");
                    }
                }
            }
        }
    };

    if let Some(message_id) = progress_message {
        if let Err(e) = bot.delete_message(chat_id, message_id).await {
            debug!(user_id = %chat_id, error = %e, "Failed to delete progress message");
        }
    }

    match outcome {
        Some(result) => {
            state.active.set_status(chat_id.0, &task_id, TaskStatus::Delivering);
            if let Err(e) = deliver_result(&bot, &state, result).await {
                error!(user_id = %chat_id, task_id = %task_id, error = %e, "Failed to deliver result");
            }
        }
        None => {
            let minutes = (state.config.result_timeout_secs / 60).to_string();
            if let Err(e) = bot
                .send_message(
                    chat_id,
                    t_args_lang(
                        "task-timeout",
                        &[("kind", &kind_label(kind, lang)), ("minutes", &minutes)],
                        lang,
                    ),
                )
                .await
            {
                error!(user_id = %chat_id, error = %e, "Failed to send timeout notice");
            }
            if let Some(pool) = &state.pool {
                if let Err(e) = db::log_task_finished(pool, &task_id, "timeout", None).await {
                    warn!(task_id = %task_id, error = %e, "Failed to log task timeout");
                }
            }
        }
    }

    remove_temp_file(&file_path).await;
    state.active.remove(chat_id.0, &task_id);
    debug!(user_id = %chat_id, task_id = %task_id, "Task job finished");
}

/// Show a result in its chat, then hand it to the follow-up engine
pub async fn deliver_result(bot: &Bot, state: &AppState, result: TaskResult) -> Result<()> {
    let chat_id = result.chat_id;
    let task_id = result.task_id.clone().unwrap_or_default();
    let info = state.active.get(chat_id, &task_id);

    let Some(kind) = result.kind().or_else(|| info.as_ref().map(|i| i.kind)) else {
        warn!(user_id = %chat_id, bot = %result.bot_name, "Result from an unknown worker");
        return Ok(());
    };
    let language_code = info.as_ref().and_then(|i| i.language_code.clone());
    let lang = language_code.as_deref();

    let text = format_result(kind, &result.result, lang);
    for chunk in split_message(&text, MESSAGE_LIMIT) {
        bot.send_message(ChatId(chat_id), chunk).await?;
    }

    let failed = result.result.is_error();
    if let Some(pool) = &state.pool {
        let status = if failed { "failed" } else { "completed" };
        if let Err(e) =
            db::log_task_finished(pool, &task_id, status, result.result.headline()).await
        {
            warn!(task_id = %task_id, error = %e, "Failed to log task completion");
        }
    }
    if failed {
        info!(user_id = %chat_id, task_id = %task_id, "Delivered failed result");
        return Ok(());
    }

    let meta = info
        .map(|i| FollowupMeta {
            file_id: i.file_id,
            file_name: Some(i.file_name),
            mime_type: i.mime_type,
        })
        .unwrap_or_default();
    let record = FollowupRecord {
        task_id: task_id.clone(),
        chat_id,
        kind,
        result: result.result,
        meta,
        language_code,
    };

    let prefs = state.followups.store().get(chat_id).await;
    state.actions.publish_result(&prefs.integrations, &record).await;

    if state.followups.register(record) {
        state.followups.apply(chat_id, &task_id).await;
    }
    info!(user_id = %chat_id, task_id = %task_id, kind = %kind, "Result delivered");
    Ok(())
}

/// Deliver a result that arrived after its waiter was gone
pub async fn process_unclaimed(bot: Bot, state: Arc<AppState>, result: TaskResult) {
    let chat_id = result.chat_id;
    let task_id = result.task_id.clone().unwrap_or_default();
    info!(user_id = %chat_id, task_id = %task_id, "Processing unclaimed result");

    if let Err(e) = deliver_result(&bot, &state, result).await {
        error!(user_id = %chat_id, task_id = %task_id, error = %e, "Failed to deliver unclaimed result");
    }
    state.active.remove(chat_id, &task_id);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upload(kind: TaskKind, file_name: &str, file_size: u64) -> Upload {
        Upload {
            kind,
            file_id: "f".to_string(),
            file_name: file_name.to_string(),
            file_size,
            mime_type: None,
            duration: None,
        }
    }

    #[test]
    fn test_classify_document() {
        assert_eq!(classify_document("song.mp3", None), Some(TaskKind::Audio));
        assert_eq!(classify_document("clip", Some("audio/mpeg")), Some(TaskKind::Audio));
        assert_eq!(classify_document("scan.png", None), Some(TaskKind::Image));
        assert_eq!(classify_document("notes.md", None), Some(TaskKind::Document));
        assert_eq!(classify_document("report.pdf", None), Some(TaskKind::Document));
        assert_eq!(classify_document("archive.zip", Some("application/zip")), None);
    }

    #[test]
    fn test_validate_upload() {
        let max = 50 * 1024 * 1024;
        assert!(validate_upload(&upload(TaskKind::Document, "a.txt", 10), max).is_ok());
        assert_eq!(
            validate_upload(&upload(TaskKind::Document, "a.txt", max + 1), max),
            Err(UploadRejection::TooLarge)
        );
        assert_eq!(
            validate_upload(&upload(TaskKind::Document, "a.exe", 10), max),
            Err(UploadRejection::Unsupported)
        );
        // Voice notes have no file name to check
        assert!(validate_upload(&upload(TaskKind::Audio, "voice", 10), max).is_ok());
    }
}
