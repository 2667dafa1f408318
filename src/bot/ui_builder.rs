//! UI Builder module for creating keyboards and formatting messages

use teloxide::types::{InlineKeyboardButton, InlineKeyboardMarkup};

use crate::followup::{CallbackCommand, FollowChoice, FollowupRecord};
use crate::localization::{t_args_lang, t_lang};
use crate::preferences::{ActionCode, Integration, Mode, PipelinePreset, Preferences};
use crate::task::{format_duration, progress_bar, progress_snapshot, ResultBody, TaskKind};
use crate::worker::truncate_chars;

/// Longest section of a delivered result, in characters
pub const SECTION_LIMIT: usize = 1500;
/// Longest chunk sent in a single Telegram message, in characters
pub const MESSAGE_LIMIT: usize = 4000;

pub fn kind_label(kind: TaskKind, language_code: Option<&str>) -> String {
    t_lang(&format!("kind-{}", kind.code()), language_code)
}

pub fn action_label(action: ActionCode, language_code: Option<&str>) -> String {
    t_lang(&action.label_key(), language_code)
}

pub fn mode_label(mode: Mode, language_code: Option<&str>) -> String {
    t_lang(mode.label_key(), language_code)
}

fn pipeline_label(preset: PipelinePreset, language_code: Option<&str>) -> String {
    t_lang(&format!("pipeline-{}", preset.code()), language_code)
}

fn switch_label(enabled: bool, language_code: Option<&str>) -> String {
    if enabled {
        t_lang("switch-on", language_code)
    } else {
        t_lang("switch-off", language_code)
    }
}

fn selected(label: String, is_selected: bool) -> String {
    if is_selected {
        format!("✅ {label}")
    } else {
        label
    }
}

/// Cut a result section to [`SECTION_LIMIT`] characters
pub fn truncate_section(text: &str) -> String {
    let (text, truncated) = truncate_chars(text.trim(), SECTION_LIMIT);
    if truncated {
        format!("{text}...")
    } else {
        text
    }
}

/// Split a long message into chunks of at most `limit` characters, on line breaks when possible
pub fn split_message(text: &str, limit: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut rest = text;

    while !rest.is_empty() {
        let Some((boundary, _)) = rest.char_indices().nth(limit) else {
            chunks.push(rest.to_string());
            break;
        };
        let cut = rest[..boundary]
            .rfind('\n')
            .filter(|&newline| newline > 0)
            .map(|newline| newline + 1)
            .unwrap_or(boundary);
        chunks.push(rest[..cut].to_string());
        rest = &rest[cut..];
    }

    chunks
}

fn section(title: String, body: Option<&str>) -> Option<String> {
    body.filter(|b| !b.trim().is_empty())
        .map(|b| format!("**{title}**\n{}", truncate_section(b)))
}

/// Format a worker result for the chat
pub fn format_result(kind: TaskKind, result: &ResultBody, language_code: Option<&str>) -> String {
    if let Some(error) = &result.error {
        return format!(
            "❌ {}\n\n{}",
            t_lang("result-failed", language_code),
            t_args_lang("result-error-detail", &[("error", error)], language_code)
        );
    }

    let mut parts = vec![format!(
        "{} **{}**",
        kind.emoji(),
        t_lang(&format!("result-title-{}", kind.code()), language_code)
    )];

    match kind {
        TaskKind::Document => {
            if let Some(name) = &result.file_name {
                parts.push(t_args_lang("result-file", &[("name", name)], language_code));
            }
            parts.extend(section(t_lang("result-summary", language_code), result.summary.as_deref()));
            parts.extend(section(t_lang("result-excerpt", language_code), result.text.as_deref()));
        }
        TaskKind::Audio => {
            if let Some(duration) = result.duration.filter(|d| *d > 0) {
                let duration = format_duration(u64::from(duration));
                parts.push(t_args_lang("result-duration", &[("duration", &duration)], language_code));
            }
            parts.extend(section(
                t_lang("result-transcription", language_code),
                result.transcription.as_deref(),
            ));
            parts.extend(section(t_lang("result-summary", language_code), result.summary.as_deref()));
        }
        TaskKind::Image => {
            parts.extend(section(
                t_lang("result-description", language_code),
                result.description.as_deref(),
            ));
            parts.extend(section(t_lang("result-analysis", language_code), result.analysis.as_deref()));
        }
    }

    parts.join("\n\n")
}

/// Progress message shown while a task is running
pub fn format_progress(
    kind: TaskKind,
    file_name: &str,
    elapsed_secs: u64,
    estimate_secs: u64,
    language_code: Option<&str>,
) -> String {
    let snapshot = progress_snapshot(elapsed_secs, estimate_secs);
    let percent = snapshot.percent.to_string();
    let elapsed = format_duration(elapsed_secs);
    let remaining = format_duration(snapshot.remaining_secs);

    format!(
        "{} **{}**\n{}\n\n{} {}%\n{}",
        kind.emoji(),
        t_args_lang("progress-title", &[("kind", &kind_label(kind, language_code))], language_code),
        file_name,
        progress_bar(snapshot.percent),
        percent,
        t_args_lang(
            "progress-times",
            &[("elapsed", &elapsed), ("remaining", &remaining)],
            language_code
        )
    )
}

/// Text sent above the follow-up keyboard
pub fn format_followup_prompt(record: &FollowupRecord, prefs: &Preferences) -> String {
    let lang = record.language_code.as_deref();
    let name = record
        .meta
        .file_name
        .clone()
        .unwrap_or_else(|| kind_label(record.kind, lang));
    format!(
        "{} **{}**\n{}\n\n{}",
        record.kind.emoji(),
        t_lang("followup-title", lang),
        name,
        t_args_lang("followup-current-mode", &[("mode", &mode_label(prefs.mode, lang))], lang)
    )
}

/// Keyboard offered after a delivered result
pub fn create_followup_keyboard(record: &FollowupRecord) -> InlineKeyboardMarkup {
    let lang = record.language_code.as_deref();
    let options = ActionCode::options_for(record.kind);
    let button = |action: ActionCode, choice: FollowChoice, key: String| {
        InlineKeyboardButton::callback(
            t_lang(&key, lang),
            CallbackCommand::follow(&record.task_id, choice, action),
        )
    };

    let once_row = options
        .iter()
        .map(|action| button(*action, FollowChoice::Once, action.once_label_key()))
        .collect();
    let always_row = options
        .iter()
        .map(|action| button(*action, FollowChoice::Auto, action.always_label_key()))
        .collect();
    let preset_row = PipelinePreset::ALL
        .iter()
        .map(|preset| {
            InlineKeyboardButton::callback(
                pipeline_label(*preset, lang),
                format!("pref_pipeline|{}", preset.code()),
            )
        })
        .collect();

    InlineKeyboardMarkup::new(vec![
        once_row,
        always_row,
        preset_row,
        vec![
            button(ActionCode::None, FollowChoice::Once, ActionCode::None.once_label_key()),
            button(ActionCode::None, FollowChoice::Skip, ActionCode::None.always_label_key()),
            InlineKeyboardButton::callback(t_lang("settings-open", lang), "pref_open|global"),
        ],
    ])
}

/// Settings panel text
pub fn format_settings(prefs: &Preferences, language_code: Option<&str>) -> String {
    let mut lines = vec![
        format!("⚙️ **{}**", t_lang("settings-title", language_code)),
        String::new(),
        t_args_lang(
            "settings-mode",
            &[("mode", &mode_label(prefs.mode, language_code))],
            language_code,
        ),
        String::new(),
        t_lang("settings-defaults", language_code),
    ];

    for kind in TaskKind::ALL {
        lines.push(format!(
            "{} {}: {}",
            kind.emoji(),
            kind_label(kind, language_code),
            action_label(prefs.default_actions.get(kind), language_code)
        ));
    }

    lines.push(String::new());
    lines.push(t_lang("settings-integrations", language_code));
    for integration in [Integration::Slack, Integration::Notion] {
        lines.push(format!(
            "{}: {}",
            t_lang(&format!("integration-{}", integration.code()), language_code),
            switch_label(prefs.integrations.get(integration), language_code)
        ));
    }

    lines.join("\n")
}

/// Settings panel keyboard
pub fn create_settings_keyboard(prefs: &Preferences, language_code: Option<&str>) -> InlineKeyboardMarkup {
    let mut rows = Vec::new();

    rows.push(
        Mode::ALL
            .iter()
            .map(|mode| {
                InlineKeyboardButton::callback(
                    selected(mode_label(*mode, language_code), prefs.mode == *mode),
                    format!("pref_mode|{}", mode.code()),
                )
            })
            .collect(),
    );

    for kind in TaskKind::ALL {
        let current = prefs.default_actions.get(kind);
        let mut row: Vec<InlineKeyboardButton> = ActionCode::options_for(kind)
            .iter()
            .map(|action| {
                InlineKeyboardButton::callback(
                    selected(
                        format!("{} {}", kind.emoji(), action_label(*action, language_code)),
                        current == *action,
                    ),
                    format!("pref_action|{}|{}", kind.code(), action.code()),
                )
            })
            .collect();
        row.push(InlineKeyboardButton::callback(
            selected(action_label(ActionCode::None, language_code), current == ActionCode::None),
            format!("pref_action|{}|{}", kind.code(), ActionCode::None.code()),
        ));
        rows.push(row);
    }

    rows.push(
        PipelinePreset::ALL
            .iter()
            .map(|preset| {
                InlineKeyboardButton::callback(
                    pipeline_label(*preset, language_code),
                    format!("pref_pipeline|{}", preset.code()),
                )
            })
            .collect(),
    );

    rows.push(
        [Integration::Slack, Integration::Notion]
            .iter()
            .map(|integration| {
                InlineKeyboardButton::callback(
                    format!(
                        "{}: {}",
                        t_lang(&format!("integration-{}", integration.code()), language_code),
                        switch_label(prefs.integrations.get(*integration), language_code)
                    ),
                    format!("pref_integration|{}|toggle", integration.code()),
                )
            })
            .collect(),
    );

    rows.push(vec![InlineKeyboardButton::callback(
        format!("↩️ {}", t_lang("settings-undo", language_code)),
        "pref_undo|",
    )]);

    InlineKeyboardMarkup::new(rows)
}
