//! Telegram side effects of follow-up decisions

use async_trait::async_trait;
use std::sync::Arc;
use teloxide::prelude::*;
use tracing::{error, info};

use crate::actions::ActionExecutor;
use crate::followup::{FollowupRecord, FollowupSink, Trigger};
use crate::localization::{t_args_lang, t_lang};
use crate::preferences::{ActionCode, Preferences};

use super::ui_builder::{action_label, create_followup_keyboard, format_followup_prompt};

pub struct TelegramFollowupSink {
    bot: Bot,
    actions: Arc<ActionExecutor>,
}

impl TelegramFollowupSink {
    pub fn new(bot: Bot, actions: Arc<ActionExecutor>) -> Self {
        Self { bot, actions }
    }
}

#[async_trait]
impl FollowupSink for TelegramFollowupSink {
    async fn prompt(&self, record: &FollowupRecord, prefs: &Preferences) -> anyhow::Result<()> {
        self.bot
            .send_message(ChatId(record.chat_id), format_followup_prompt(record, prefs))
            .reply_markup(create_followup_keyboard(record))
            .await?;
        Ok(())
    }

    async fn execute(
        &self,
        action: ActionCode,
        record: &FollowupRecord,
        trigger: Trigger,
    ) -> anyhow::Result<()> {
        let lang = record.language_code.as_deref();
        let chat_id = ChatId(record.chat_id);

        if trigger == Trigger::Auto {
            let label = action_label(action, lang);
            self.bot
                .send_message(chat_id, t_args_lang("followup-auto-applied", &[("action", &label)], lang))
                .await?;
        }

        match self.actions.execute_followup_action(action, record).await {
            Ok(confirmation) => {
                self.bot.send_message(chat_id, confirmation).await?;
                info!(user_id = %record.chat_id, task_id = %record.task_id, action = %action.code(), "Follow-up action delivered");
                Ok(())
            }
            Err(e) => {
                error!(user_id = %record.chat_id, task_id = %record.task_id, error = %e, "Follow-up action failed");
                self.bot
                    .send_message(chat_id, format!("❌ {}", t_lang(e.message_key(), lang)))
                    .await?;
                Err(e.into())
            }
        }
    }

    async fn announce_skip(&self, record: &FollowupRecord) -> anyhow::Result<()> {
        self.bot
            .send_message(
                ChatId(record.chat_id),
                t_lang("followup-skipped", record.language_code.as_deref()),
            )
            .await?;
        Ok(())
    }
}
