//! Message Handler module for processing incoming Telegram messages

use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use teloxide::prelude::*;
use teloxide::types::ChatAction;
use tracing::{debug, error, info, warn};

use crate::circuit_breaker::BreakerState;
use crate::config::CONVERSATION_MEMORY_LIMIT;
use crate::db;
use crate::gemini::Exchange;
use crate::localization::{t_args_lang, t_lang};
use crate::reminder::{self, ReminderError, MAX_REMINDER_DELAY};
use crate::task::{audio_extension_for_mime, format_duration, TaskKind};

use super::dispatch::{classify_document, dispatch_upload, Upload};
use super::state::AppState;
use super::ui_builder::{
    create_settings_keyboard, format_settings, kind_label, split_message, MESSAGE_LIMIT,
};

fn message_language(msg: &Message) -> Option<&str> {
    msg.from
        .as_ref()
        .and_then(|user| user.language_code.as_ref())
        .map(|s| s.as_str())
}

/// `/start@my_bot args` → `/start`
fn command_name(text: &str) -> Option<&str> {
    let first = text.split_whitespace().next()?;
    if !first.starts_with('/') {
        return None;
    }
    first.split('@').next()
}

/// Extract the upload carried by a message, if any
pub fn upload_from_message(msg: &Message) -> Option<Upload> {
    if let Some(doc) = msg.document() {
        let mime_type = doc.mime_type.as_ref().map(|m| m.to_string());
        let file_name = doc
            .file_name
            .clone()
            .unwrap_or_else(|| format!("document_{}", msg.id.0));
        // Unknown documents still go through validation, which refuses them
        let kind = classify_document(&file_name, mime_type.as_deref()).unwrap_or(TaskKind::Document);
        return Some(Upload {
            kind,
            file_id: doc.file.id.0.clone(),
            file_name,
            file_size: u64::from(doc.file.size),
            mime_type,
            duration: None,
        });
    }

    if let Some(largest_photo) = msg.photo().and_then(|photos| photos.last()) {
        return Some(Upload {
            kind: TaskKind::Image,
            file_id: largest_photo.file.id.0.clone(),
            file_name: format!("photo_{}.jpg", msg.id.0),
            file_size: u64::from(largest_photo.file.size),
            mime_type: Some("image/jpeg".to_string()),
            duration: None,
        });
    }

    if let Some(voice) = msg.voice() {
        let mime_type = voice.mime_type.as_ref().map(|m| m.to_string());
        let extension = audio_extension_for_mime(mime_type.as_deref());
        return Some(Upload {
            kind: TaskKind::Audio,
            file_id: voice.file.id.0.clone(),
            file_name: format!("voice_{}{}", msg.id.0, extension),
            file_size: u64::from(voice.file.size),
            mime_type: mime_type.or_else(|| Some("audio/ogg".to_string())),
            duration: Some(voice.duration.seconds()),
        });
    }

    if let Some(audio) = msg.audio() {
        let mime_type = audio.mime_type.as_ref().map(|m| m.to_string());
        let file_name = audio.file_name.clone().unwrap_or_else(|| {
            format!("audio_{}{}", msg.id.0, audio_extension_for_mime(mime_type.as_deref()))
        });
        return Some(Upload {
            kind: TaskKind::Audio,
            file_id: audio.file.id.0.clone(),
            file_name,
            file_size: u64::from(audio.file.size),
            mime_type,
            duration: Some(audio.duration.seconds()),
        });
    }

    None
}

async fn send_settings(bot: &Bot, chat_id: ChatId, state: &AppState, language_code: Option<&str>) -> Result<()> {
    let prefs = state.followups.store().get(chat_id.0).await;
    bot.send_message(chat_id, format_settings(&prefs, language_code))
        .reply_markup(create_settings_keyboard(&prefs, language_code))
        .await?;
    Ok(())
}

fn format_status(chat_id: ChatId, state: &AppState, redis_healthy: Option<bool>, language_code: Option<&str>) -> String {
    let redis_state = match redis_healthy {
        None => t_lang("state-disabled", language_code),
        Some(true) => t_lang("state-connected", language_code),
        Some(false) => t_lang("state-disconnected", language_code),
    };
    let gemini_state = if !state.gemini.is_configured() {
        t_lang("state-not-configured", language_code)
    } else if state.gemini.breaker_state() == BreakerState::Open {
        t_lang("state-paused", language_code)
    } else {
        t_lang("state-ready", language_code)
    };

    let mut lines = vec![
        format!("📊 **{}**", t_lang("status-title", language_code)),
        String::new(),
        t_args_lang(
            "status-active-tasks",
            &[("count", &state.active.total().to_string())],
            language_code,
        ),
        t_args_lang(
            "status-pending-results",
            &[("count", &state.pending.len().to_string())],
            language_code,
        ),
        t_args_lang("status-redis", &[("state", &redis_state)], language_code),
        t_args_lang(
            "status-gemini",
            &[("state", &gemini_state), ("model", state.gemini.model())],
            language_code,
        ),
        String::new(),
    ];

    let tasks = state.active.tasks_for(chat_id.0);
    if tasks.is_empty() {
        lines.push(t_lang("status-no-tasks", language_code));
    } else {
        lines.push(format!("**{}**", t_lang("status-your-tasks", language_code)));
        let now = Utc::now();
        for (_, info) in tasks {
            let elapsed = (now - info.started_at).num_seconds().max(0) as u64;
            lines.push(format!(
                "• {} {} ({}, {})",
                info.kind.emoji(),
                info.file_name,
                t_lang(&format!("task-status-{}", info.status.code()), language_code),
                format_duration(elapsed)
            ));
        }
    }

    lines.join("\n")
}

fn format_bots(state: &AppState, language_code: Option<&str>) -> String {
    let mut lines = vec![format!("🤖 **{}**", t_lang("bots-title", language_code)), String::new()];
    for kind in TaskKind::ALL {
        let seen = match (state.workers.get(kind.worker_name()), state.workers.last_seen(kind.worker_name())) {
            (Some(status), Some(at)) => t_args_lang(
                "bots-last-seen",
                &[
                    ("status", &status.status),
                    ("time", &at.format("%Y-%m-%d %H:%M:%S UTC").to_string()),
                ],
                language_code,
            ),
            _ => t_lang("bots-never-seen", language_code),
        };
        lines.push(format!(
            "{} **{}** ({}): {}",
            kind.emoji(),
            kind_label(kind, language_code),
            kind.worker_name(),
            seen
        ));
    }
    if !state.dispatch_enabled() {
        lines.push(String::new());
        lines.push(t_lang("dispatch-disabled", language_code));
    }
    lines.join("\n")
}

async fn handle_chat_message(
    bot: &Bot,
    msg: &Message,
    text: &str,
    state: &AppState,
    language_code: Option<&str>,
) -> Result<()> {
    let chat_id = msg.chat.id;
    if !state.gemini.is_configured() {
        bot.send_message(chat_id, t_lang("chat-unavailable", language_code))
            .await?;
        return Ok(());
    }

    if let Err(e) = bot.send_chat_action(chat_id, ChatAction::Typing).await {
        debug!(user_id = %chat_id, error = %e, "Failed to send typing action");
    }

    let history: Vec<Exchange> = match &state.pool {
        Some(pool) => match db::recent_exchanges(pool, chat_id.0, CONVERSATION_MEMORY_LIMIT).await {
            Ok(entries) => entries.into_iter().map(Exchange::from).collect(),
            Err(e) => {
                warn!(user_id = %chat_id, error = %e, "Failed to load conversation memory");
                Vec::new()
            }
        },
        None => Vec::new(),
    };

    match state.gemini.chat(text, &history).await {
        Ok(reply) => {
            for chunk in split_message(&reply, MESSAGE_LIMIT) {
                bot.send_message(chat_id, chunk).await?;
            }
            info!(user_id = %chat_id, history = history.len(), reply_chars = reply.chars().count(), "Chat reply sent");

            if let Some(pool) = &state.pool {
                let username = msg.from.as_ref().and_then(|user| user.username.as_deref());
                if let Err(e) = db::save_exchange(pool, chat_id.0, username, text, &reply).await {
                    warn!(user_id = %chat_id, error = %e, "Failed to save conversation");
                }
            }
        }
        Err(e) => {
            error!(user_id = %chat_id, error = %e, "Chat reply failed");
            bot.send_message(chat_id, format!("❌ {}", t_lang(e.message_key(), language_code)))
                .await?;
        }
    }
    Ok(())
}

/// Text after the command word
fn command_args(text: &str) -> &str {
    text.trim_start()
        .split_once(char::is_whitespace)
        .map_or("", |(_, rest)| rest.trim())
}

async fn handle_remind_command(
    bot: &Bot,
    chat_id: ChatId,
    args: &str,
    language_code: Option<&str>,
) -> Result<()> {
    let request = match reminder::parse_command(args) {
        Ok(request) => request,
        Err(ReminderError::Usage) => {
            bot.send_message(chat_id, t_lang("remind-usage", language_code)).await?;
            return Ok(());
        }
        Err(ReminderError::InvalidTime) => {
            let max = reminder::describe_delay(MAX_REMINDER_DELAY);
            bot.send_message(chat_id, t_args_lang("remind-invalid", &[("max", &max)], language_code))
                .await?;
            return Ok(());
        }
    };

    let message = request
        .message
        .unwrap_or_else(|| t_lang("remind-default-message", language_code));
    let delay = reminder::describe_delay(request.delay);
    let due = Utc::now() + chrono::Duration::seconds(request.delay.as_secs() as i64);
    let due = due.format("%Y-%m-%d %H:%M:%S UTC").to_string();
    info!(user_id = %chat_id, delay = %delay, "Reminder scheduled");

    bot.send_message(
        chat_id,
        t_args_lang(
            "remind-scheduled",
            &[("time", &due), ("delay", &delay), ("message", &message)],
            language_code,
        ),
    )
    .await?;

    let fired_text = t_args_lang("remind-fired", &[("message", &message)], language_code);
    let bot = bot.clone();
    reminder::spawn_reminder(request.delay, move || async move {
        if let Err(e) = bot.send_message(chat_id, fired_text).await {
            error!(user_id = %chat_id, error = %e, "Failed to send reminder");
        }
    });
    Ok(())
}

async fn handle_text_message(bot: &Bot, msg: &Message, text: &str, state: &AppState) -> Result<()> {
    let chat_id = msg.chat.id;
    let language_code = message_language(msg);
    debug!(user_id = %chat_id, message_length = text.len(), "Received text message from user");

    match command_name(text) {
        Some("/start") => {
            let welcome_message = format!(
                "👋 **{}**\n\n{}\n\n{}\n\n{}",
                t_lang("welcome-title", language_code),
                t_lang("welcome-description", language_code),
                t_lang("welcome-features", language_code),
                t_lang("welcome-hint", language_code)
            );
            bot.send_message(chat_id, welcome_message).await?;
        }
        Some("/help") => {
            let help_message = [
                t_lang("help-title", language_code),
                t_lang("help-uploads", language_code),
                t_lang("help-followups", language_code),
                t_lang("help-commands", language_code),
            ]
            .join("\n\n");
            bot.send_message(chat_id, help_message).await?;
        }
        Some("/status") => {
            let redis_healthy = match &state.messenger {
                Some(messenger) => Some(messenger.is_healthy().await),
                None => None,
            };
            bot.send_message(chat_id, format_status(chat_id, state, redis_healthy, language_code))
                .await?;
        }
        Some("/bots") => {
            bot.send_message(chat_id, format_bots(state, language_code)).await?;
        }
        Some("/settings") => {
            send_settings(bot, chat_id, state, language_code).await?;
        }
        Some("/undo") => match state.followups.undo(chat_id.0).await {
            Some(_) => {
                bot.send_message(chat_id, t_lang("undo-done", language_code)).await?;
                send_settings(bot, chat_id, state, language_code).await?;
            }
            None => {
                bot.send_message(chat_id, t_lang("undo-empty", language_code)).await?;
            }
        },
        Some("/reset") => {
            state.followups.reset(chat_id.0).await;
            info!(user_id = %chat_id, "Preferences reset");
            bot.send_message(chat_id, t_lang("settings-reset", language_code)).await?;
            send_settings(bot, chat_id, state, language_code).await?;
        }
        Some("/remind") => {
            handle_remind_command(bot, chat_id, command_args(text), language_code).await?;
        }
        Some(_) => {
            bot.send_message(chat_id, t_lang("unknown-command", language_code)).await?;
        }
        None => handle_chat_message(bot, msg, text, state, language_code).await?,
    }
    Ok(())
}

async fn handle_unsupported_message(bot: &Bot, msg: &Message) -> Result<()> {
    let language_code = message_language(msg);
    debug!(user_id = %msg.chat.id, "Received unsupported message type from user");
    bot.send_message(msg.chat.id, t_lang("unsupported-message", language_code))
        .await?;
    Ok(())
}

pub async fn message_handler(bot: Bot, msg: Message, state: Arc<AppState>) -> Result<()> {
    if let Some(text) = msg.text() {
        handle_text_message(&bot, &msg, text, &state).await?;
    } else if let Some(upload) = upload_from_message(&msg) {
        debug!(user_id = %msg.chat.id, kind = %upload.kind, file_name = %upload.file_name, "Received upload from user");
        let user_id = msg.from.as_ref().map(|user| user.id.0 as i64);
        dispatch_upload(&bot, msg.chat.id, user_id, message_language(&msg), upload, &state).await?;
    } else {
        handle_unsupported_message(&bot, &msg).await?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_name() {
        assert_eq!(command_name("/start"), Some("/start"));
        assert_eq!(command_name("/status@relay_bot now"), Some("/status"));
        assert_eq!(command_name("hello /start"), None);
        assert_eq!(command_name("/remind@relay_bot 10m tea"), Some("/remind"));
        assert_eq!(command_name("   "), None);
    }

    #[test]
    fn test_command_args() {
        assert_eq!(command_args("/remind 1h30m call back"), "1h30m call back");
        assert_eq!(command_args("/remind"), "");
        assert_eq!(command_args("/remind   10m  "), "10m");
    }
}
