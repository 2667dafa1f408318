//! # Follow-up Module
//!
//! Decides what happens after a successful result has been delivered:
//! prompt the user, run the chat's default action, or skip. Records wait
//! here until a decision consumes them, and inline keyboard callbacks are
//! parsed into [`CallbackCommand`]s and applied by [`FollowupEngine`].

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use crate::preferences::{
    ActionCode, Integration, Mode, PipelinePreset, PreferenceHistory, PreferenceStore,
    PreferenceUpdate, Preferences,
};
use crate::task::{ResultBody, TaskId, TaskKind};

/// Where the original upload can be fetched again
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FollowupMeta {
    pub file_id: Option<String>,
    pub file_name: Option<String>,
    pub mime_type: Option<String>,
}

/// A delivered result waiting for its follow-up
#[derive(Debug, Clone, PartialEq)]
pub struct FollowupRecord {
    pub task_id: TaskId,
    pub chat_id: i64,
    pub kind: TaskKind,
    pub result: ResultBody,
    pub meta: FollowupMeta,
    pub language_code: Option<String>,
}

/// Last decision applied in a chat
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LastPreferenceState {
    pub mode: Mode,
    pub action: Option<ActionCode>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Prompt,
    AutoApply(ActionCode),
    /// `announce` is false while the chat is already in a run of skips
    Skip { announce: bool },
}

pub fn decide(prefs: &Preferences, kind: TaskKind, last: Option<&LastPreferenceState>) -> Decision {
    let action = prefs.default_actions.get(kind);
    match prefs.mode {
        Mode::Auto if action != ActionCode::None => Decision::AutoApply(action),
        Mode::Skip => Decision::Skip {
            announce: !last.is_some_and(|state| state.mode == Mode::Skip),
        },
        _ => Decision::Prompt,
    }
}

/// How an action was triggered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Chosen from the prompt keyboard
    Manual,
    /// Applied from the chat's preferences
    Auto,
}

/// Side effects of follow-up decisions
#[async_trait]
pub trait FollowupSink: Send + Sync {
    /// Ask the user which action to run
    async fn prompt(&self, record: &FollowupRecord, prefs: &Preferences) -> anyhow::Result<()>;

    /// Run `action` for `record` and confirm it in the chat
    async fn execute(
        &self,
        action: ActionCode,
        record: &FollowupRecord,
        trigger: Trigger,
    ) -> anyhow::Result<()>;

    /// Tell the user that follow-ups are skipped
    async fn announce_skip(&self, record: &FollowupRecord) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowChoice {
    Once,
    Auto,
    Skip,
}

impl FollowChoice {
    fn parse(code: &str) -> Option<Self> {
        match code {
            "once" => Some(FollowChoice::Once),
            "auto" => Some(FollowChoice::Auto),
            "skip" => Some(FollowChoice::Skip),
            _ => None,
        }
    }

    pub fn code(self) -> &'static str {
        match self {
            FollowChoice::Once => "once",
            FollowChoice::Auto => "auto",
            FollowChoice::Skip => "skip",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegrationChange {
    Toggle,
    On,
    Off,
}

/// Settings panel callbacks
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreferenceCommand {
    Mode(Mode),
    Action {
        kind: TaskKind,
        action: ActionCode,
    },
    Pipeline(PipelinePreset),
    Integration {
        integration: Integration,
        change: IntegrationChange,
    },
    Undo,
    Open,
}

/// Parsed inline keyboard callback data
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackCommand {
    Follow {
        task_id: TaskId,
        choice: FollowChoice,
        action: ActionCode,
    },
    Preference(PreferenceCommand),
}

impl CallbackCommand {
    /// Parse `|`-separated callback data, `None` when malformed
    pub fn parse(data: &str) -> Option<Self> {
        let parts: Vec<&str> = data.split('|').collect();
        match parts.as_slice() {
            ["follow", task_id, choice, action] if !task_id.is_empty() => {
                Some(CallbackCommand::Follow {
                    task_id: task_id.to_string(),
                    choice: FollowChoice::parse(choice)?,
                    action: ActionCode::parse(action)?,
                })
            }
            ["pref_mode", mode] => Some(PreferenceCommand::Mode(Mode::parse(mode)).into()),
            ["pref_action", kind, action] => {
                let kind = TaskKind::parse(kind)?;
                let action = ActionCode::parse(action)?;
                if action.kind().is_some_and(|k| k != kind) {
                    return None;
                }
                Some(PreferenceCommand::Action { kind, action }.into())
            }
            ["pref_pipeline", preset] => {
                PipelinePreset::parse(preset).map(|p| PreferenceCommand::Pipeline(p).into())
            }
            ["pref_integration", name, change] => {
                let change = match *change {
                    "toggle" => IntegrationChange::Toggle,
                    "on" => IntegrationChange::On,
                    "off" => IntegrationChange::Off,
                    _ => return None,
                };
                let integration = Integration::parse(name)?;
                Some(PreferenceCommand::Integration { integration, change }.into())
            }
            ["pref_undo", ..] => Some(PreferenceCommand::Undo.into()),
            ["pref_open", ..] => Some(PreferenceCommand::Open.into()),
            _ => None,
        }
    }

    pub fn follow(task_id: &str, choice: FollowChoice, action: ActionCode) -> String {
        format!("follow|{task_id}|{}|{}", choice.code(), action.code())
    }
}

impl From<PreferenceCommand> for CallbackCommand {
    fn from(command: PreferenceCommand) -> Self {
        CallbackCommand::Preference(command)
    }
}

/// Result of a `follow|` callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FollowOutcome {
    /// No record for this task in this chat
    NotFound,
    /// The action does not belong to the record's kind
    Ignored,
    Completed {
        kind: TaskKind,
        choice: FollowChoice,
        action: ActionCode,
    },
}

/// Result of a `pref_*` callback or command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreferenceOutcome {
    Updated(Preferences),
    PipelineApplied(PipelinePreset, Preferences),
    Restored(Preferences),
    NothingToUndo,
    Show(Preferences),
}

struct PendingRecord {
    sequence: u64,
    record: FollowupRecord,
}

/// Follow-up records and the state machine that consumes them
pub struct FollowupEngine {
    records: Mutex<HashMap<TaskId, PendingRecord>>,
    last_states: Mutex<HashMap<i64, LastPreferenceState>>,
    sequence: AtomicU64,
    store: Arc<PreferenceStore>,
    history: PreferenceHistory,
    sink: Arc<dyn FollowupSink>,
}

impl FollowupEngine {
    pub fn new(store: Arc<PreferenceStore>, sink: Arc<dyn FollowupSink>) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            last_states: Mutex::new(HashMap::new()),
            sequence: AtomicU64::new(0),
            store,
            history: PreferenceHistory::new(),
            sink,
        }
    }

    pub fn store(&self) -> &PreferenceStore {
        &self.store
    }

    fn records(&self) -> std::sync::MutexGuard<'_, HashMap<TaskId, PendingRecord>> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn last_states(&self) -> std::sync::MutexGuard<'_, HashMap<i64, LastPreferenceState>> {
        self.last_states.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a delivered result; failed results are never registered
    pub fn register(&self, record: FollowupRecord) -> bool {
        if record.result.is_error() {
            debug!(task_id = %record.task_id, "Not registering follow-up for failed result");
            return false;
        }
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        self.records()
            .insert(record.task_id.clone(), PendingRecord { sequence, record });
        true
    }

    pub fn record(&self, task_id: &str) -> Option<FollowupRecord> {
        self.records().get(task_id).map(|p| p.record.clone())
    }

    pub fn pending_count(&self, chat_id: i64) -> usize {
        self.records()
            .values()
            .filter(|p| p.record.chat_id == chat_id)
            .count()
    }

    pub fn last_state(&self, chat_id: i64) -> Option<LastPreferenceState> {
        self.last_states().get(&chat_id).copied()
    }

    fn set_last_state(&self, chat_id: i64, state: LastPreferenceState) {
        self.last_states().insert(chat_id, state);
    }

    /// Decide for one record and take it out of the pending map unless the
    /// decision is a prompt. Runs under the records lock so that a record is
    /// consumed by exactly one caller.
    fn take_decided(
        &self,
        chat_id: i64,
        task_id: &str,
        prefs: &Preferences,
    ) -> Option<(FollowupRecord, Decision)> {
        let mut records = self.records();
        let kind = records
            .get(task_id)
            .filter(|p| p.record.chat_id == chat_id)?
            .record
            .kind;
        let decision = decide(prefs, kind, self.last_state(chat_id).as_ref());
        let record = match decision {
            Decision::Prompt => records.get(task_id)?.record.clone(),
            _ => records.remove(task_id)?.record,
        };
        Some((record, decision))
    }

    /// Take a record for a keyboard choice; `Err` leaves it pending
    fn take_for_follow(
        &self,
        chat_id: i64,
        task_id: &str,
        action: ActionCode,
    ) -> Result<FollowupRecord, FollowOutcome> {
        let mut records = self.records();
        let pending = records
            .get(task_id)
            .filter(|p| p.record.chat_id == chat_id)
            .ok_or(FollowOutcome::NotFound)?;
        if action.kind().is_some_and(|k| k != pending.record.kind) {
            return Err(FollowOutcome::Ignored);
        }
        records
            .remove(task_id)
            .map(|p| p.record)
            .ok_or(FollowOutcome::NotFound)
    }

    /// Apply the chat's preferences to one waiting record
    pub async fn apply(&self, chat_id: i64, task_id: &str) -> Option<Decision> {
        if !self.record(task_id).is_some_and(|r| r.chat_id == chat_id) {
            return None;
        }
        let prefs = self.store.get(chat_id).await;
        let (record, decision) = self.take_decided(chat_id, task_id, &prefs)?;
        debug!(user_id = %chat_id, task_id = %task_id, ?decision, "Applying follow-up preferences");

        match decision {
            Decision::AutoApply(action) => {
                if let Err(e) = self.sink.execute(action, &record, Trigger::Auto).await {
                    warn!(user_id = %chat_id, task_id = %task_id, error = %e, "Automatic follow-up failed");
                }
                self.set_last_state(
                    chat_id,
                    LastPreferenceState {
                        mode: prefs.mode,
                        action: Some(action),
                    },
                );
            }
            Decision::Skip { announce } => {
                if announce {
                    if let Err(e) = self.sink.announce_skip(&record).await {
                        warn!(user_id = %chat_id, error = %e, "Failed to send skip confirmation");
                    }
                }
                self.set_last_state(
                    chat_id,
                    LastPreferenceState {
                        mode: Mode::Skip,
                        action: None,
                    },
                );
            }
            Decision::Prompt => {
                if let Err(e) = self.sink.prompt(&record, &prefs).await {
                    warn!(user_id = %chat_id, task_id = %task_id, error = %e, "Failed to send follow-up prompt");
                }
                self.set_last_state(
                    chat_id,
                    LastPreferenceState {
                        mode: prefs.mode,
                        action: None,
                    },
                );
            }
        }

        Some(decision)
    }

    /// Re-apply preferences to every waiting record of a chat, oldest first
    pub async fn apply_pending(&self, chat_id: i64, kind: Option<TaskKind>) -> usize {
        let mut waiting: Vec<(u64, TaskId)> = self
            .records()
            .values()
            .filter(|p| p.record.chat_id == chat_id)
            .filter(|p| kind.map_or(true, |k| p.record.kind == k))
            .map(|p| (p.sequence, p.record.task_id.clone()))
            .collect();
        waiting.sort();

        let mut applied = 0;
        for (_, task_id) in waiting {
            if self.apply(chat_id, &task_id).await.is_some() {
                applied += 1;
            }
        }
        applied
    }

    /// Handle a choice made on a prompt keyboard
    pub async fn handle_follow(
        &self,
        chat_id: i64,
        task_id: &str,
        choice: FollowChoice,
        action: ActionCode,
    ) -> FollowOutcome {
        let record = match self.take_for_follow(chat_id, task_id, action) {
            Ok(record) => record,
            Err(outcome) => return outcome,
        };
        let kind = record.kind;

        match choice {
            FollowChoice::Once => {
                if let Err(e) = self.sink.execute(action, &record, Trigger::Manual).await {
                    warn!(user_id = %chat_id, task_id = %task_id, error = %e, "Follow-up action failed");
                }
            }
            FollowChoice::Auto => {
                self.store
                    .set(chat_id, &PreferenceUpdate::mode(Mode::Auto).with_action(kind, action))
                    .await;
                if action != ActionCode::None {
                    if let Err(e) = self.sink.execute(action, &record, Trigger::Manual).await {
                        warn!(user_id = %chat_id, task_id = %task_id, error = %e, "Follow-up action failed");
                    }
                }
                self.apply_pending(chat_id, Some(kind)).await;
            }
            FollowChoice::Skip => {
                self.store
                    .set(
                        chat_id,
                        &PreferenceUpdate::mode(Mode::Skip).with_action(kind, ActionCode::None),
                    )
                    .await;
                self.apply_pending(chat_id, None).await;
            }
        }

        info!(user_id = %chat_id, task_id = %task_id, choice = choice.code(), action = %action.code(), "Follow-up handled");
        FollowOutcome::Completed {
            kind,
            choice,
            action,
        }
    }

    /// Handle a `pref_*` callback
    pub async fn handle_preference(&self, chat_id: i64, command: &PreferenceCommand) -> PreferenceOutcome {
        match command {
            PreferenceCommand::Mode(mode) => {
                let prefs = self.store.set(chat_id, &PreferenceUpdate::mode(*mode)).await;
                self.apply_pending(chat_id, None).await;
                PreferenceOutcome::Updated(prefs)
            }
            PreferenceCommand::Action { kind, action } => {
                let mode = if *action == ActionCode::None {
                    Mode::Ask
                } else {
                    Mode::Auto
                };
                let update = PreferenceUpdate::mode(mode).with_action(*kind, *action);
                let prefs = self.store.set(chat_id, &update).await;
                self.apply_pending(chat_id, Some(*kind)).await;
                PreferenceOutcome::Updated(prefs)
            }
            PreferenceCommand::Pipeline(preset) => {
                let previous = self.store.get(chat_id).await;
                self.history.push(chat_id, previous);

                let actions = preset.actions();
                let mut update = PreferenceUpdate::mode(Mode::Auto);
                for kind in TaskKind::ALL {
                    update = update.with_action(kind, actions.get(kind));
                }
                let prefs = self.store.set(chat_id, &update).await;
                self.apply_pending(chat_id, None).await;
                PreferenceOutcome::PipelineApplied(*preset, prefs)
            }
            PreferenceCommand::Integration {
                integration,
                change,
            } => {
                let previous = self.store.get(chat_id).await;
                self.history.push(chat_id, previous);

                let enabled = match change {
                    IntegrationChange::Toggle => !previous.integrations.get(*integration),
                    IntegrationChange::On => true,
                    IntegrationChange::Off => false,
                };
                let update = PreferenceUpdate::default().with_integration(*integration, enabled);
                PreferenceOutcome::Updated(self.store.set(chat_id, &update).await)
            }
            PreferenceCommand::Undo => match self.undo(chat_id).await {
                Some(prefs) => PreferenceOutcome::Restored(prefs),
                None => PreferenceOutcome::NothingToUndo,
            },
            PreferenceCommand::Open => PreferenceOutcome::Show(self.store.get(chat_id).await),
        }
    }

    /// Restore the record saved before the last pipeline or integration change
    pub async fn undo(&self, chat_id: i64) -> Option<Preferences> {
        let previous = self.history.pop(chat_id)?;
        let prefs = self
            .store
            .set(chat_id, &PreferenceUpdate::replace_with(&previous))
            .await;
        self.apply_pending(chat_id, None).await;
        Some(prefs)
    }

    pub async fn reset(&self, chat_id: i64) -> Preferences {
        let previous = self.store.get(chat_id).await;
        self.history.push(chat_id, previous);
        self.store.reset(chat_id).await
    }
}
