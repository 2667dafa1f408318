//! Callback Handler module for processing inline keyboard callback queries

use anyhow::Result;
use std::sync::Arc;
use teloxide::prelude::*;
use teloxide::types::{CallbackQuery, InlineKeyboardMarkup};
use tracing::{debug, error, info};

use crate::followup::{
    CallbackCommand, FollowChoice, FollowOutcome, PreferenceCommand, PreferenceOutcome,
};
use crate::localization::{t_args_lang, t_lang};
use crate::preferences::{ActionCode, Preferences};

use super::state::AppState;
use super::ui_builder::{action_label, create_settings_keyboard, format_settings, kind_label};

fn follow_confirmation(outcome: &FollowOutcome, language_code: Option<&str>) -> String {
    match outcome {
        FollowOutcome::NotFound => t_lang("followup-not-found", language_code),
        FollowOutcome::Ignored => t_lang("followup-ignored", language_code),
        FollowOutcome::Completed { kind, choice, action } => {
            let kind = kind_label(*kind, language_code);
            let action = action_label(*action, language_code);
            match choice {
                FollowChoice::Once => t_args_lang("followup-done-once", &[("action", &action)], language_code),
                FollowChoice::Auto => t_args_lang(
                    "followup-done-auto",
                    &[("kind", &kind), ("action", &action)],
                    language_code,
                ),
                FollowChoice::Skip => t_lang("followup-done-skip", language_code),
            }
        }
    }
}

/// Whether the prompt is finished after this outcome
///
/// An ignored choice leaves the record waiting, so its keyboard stays usable.
fn closes_prompt(outcome: &FollowOutcome) -> bool {
    !matches!(outcome, FollowOutcome::Ignored)
}

/// Settings panel text with a line describing what just changed
fn preference_view(outcome: &PreferenceOutcome, language_code: Option<&str>) -> Option<(String, Preferences)> {
    let (notice, prefs) = match outcome {
        PreferenceOutcome::Updated(prefs) => (t_lang("settings-saved", language_code), prefs),
        PreferenceOutcome::PipelineApplied(preset, prefs) => (
            t_args_lang(
                "pipeline-applied",
                &[("pipeline", &t_lang(&format!("pipeline-{}", preset.code()), language_code))],
                language_code,
            ),
            prefs,
        ),
        PreferenceOutcome::Restored(prefs) => (t_lang("undo-done", language_code), prefs),
        PreferenceOutcome::Show(prefs) => (String::new(), prefs),
        PreferenceOutcome::NothingToUndo => return None,
    };

    let text = if notice.is_empty() {
        format_settings(prefs, language_code)
    } else {
        format!("{}\n\n{}", format_settings(prefs, language_code), notice)
    };
    Some((text, *prefs))
}

/// Handle callback queries from inline keyboards
pub async fn callback_handler(bot: Bot, q: CallbackQuery, state: Arc<AppState>) -> Result<()> {
    let language_code = q.from.language_code.as_deref();
    let data = q.data.as_deref().unwrap_or("");
    debug!(user_id = %q.from.id, data = %data, "Received callback query from user");

    let Some(command) = CallbackCommand::parse(data) else {
        debug!(user_id = %q.from.id, data = %data, "Ignoring malformed callback data");
        bot.answer_callback_query(q.id.clone()).await?;
        return Ok(());
    };

    if let Some(msg) = &q.message {
        let chat_id = msg.chat().id;

        match command {
            CallbackCommand::Follow {
                task_id,
                choice,
                action,
            } => {
                let outcome = state
                    .followups
                    .handle_follow(chat_id.0, &task_id, choice, action)
                    .await;
                info!(user_id = %chat_id, task_id = %task_id, ?outcome, "Follow-up callback handled");

                let text = follow_confirmation(&outcome, language_code);
                if !closes_prompt(&outcome) {
                    bot.answer_callback_query(q.id.clone()).text(text).await?;
                    return Ok(());
                }

                // Remove the keyboard so the prompt cannot be answered twice
                if let Err(e) = bot
                    .edit_message_text(chat_id, msg.id(), text)
                    .reply_markup(InlineKeyboardMarkup::default())
                    .await
                {
                    error!(user_id = %chat_id, error = %e, "Failed to edit follow-up prompt");
                }

                let defaults_changed = match &outcome {
                    FollowOutcome::Completed {
                        choice: FollowChoice::Auto,
                        action,
                        ..
                    } => *action != ActionCode::None,
                    FollowOutcome::Completed {
                        choice: FollowChoice::Skip,
                        ..
                    } => true,
                    _ => false,
                };
                if defaults_changed {
                    bot.send_message(chat_id, t_lang("settings-change-hint", language_code))
                        .await?;
                }
            }
            CallbackCommand::Preference(command) => {
                let outcome = state.followups.handle_preference(chat_id.0, &command).await;
                debug!(user_id = %chat_id, ?command, "Preference callback handled");

                match preference_view(&outcome, language_code) {
                    Some((text, prefs)) => {
                        let keyboard = create_settings_keyboard(&prefs, language_code);
                        if command == PreferenceCommand::Open {
                            bot.send_message(chat_id, text).reply_markup(keyboard).await?;
                        } else if let Err(e) = bot
                            .edit_message_text(chat_id, msg.id(), text)
                            .reply_markup(keyboard)
                            .await
                        {
                            // Telegram rejects edits that change nothing
                            debug!(user_id = %chat_id, error = %e, "Failed to edit settings panel");
                        }
                    }
                    None => {
                        bot.send_message(chat_id, t_lang("undo-empty", language_code))
                            .await?;
                    }
                }
            }
        }
    }

    // Answer the callback query to remove the loading state
    bot.answer_callback_query(q.id.clone()).await?;

    Ok(())
}
