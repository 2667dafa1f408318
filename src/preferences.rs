//! # Preferences Module
//!
//! Per-chat follow-up preferences: the automation mode, the default action
//! for each upload kind and the integration switches. Records are stored as
//! JSON under `user_prefs:<chat_id>` and only fields that differ from the
//! defaults are persisted.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, error, warn};

use crate::config::PREFERENCE_HISTORY_LIMIT;
use crate::errors::RelayError;
use crate::task::TaskKind;

pub const PREFERENCE_KEY_PREFIX: &str = "user_prefs:";

/// How finished tasks are followed up
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Prompt with a keyboard after every result
    #[default]
    Ask,
    /// Run the kind's default action without asking
    Auto,
    /// Deliver results only
    Skip,
}

impl Mode {
    pub const ALL: [Mode; 3] = [Mode::Ask, Mode::Auto, Mode::Skip];

    pub fn code(self) -> &'static str {
        match self {
            Mode::Ask => "ask",
            Mode::Auto => "auto",
            Mode::Skip => "skip",
        }
    }

    /// Unknown values fall back to `Ask`
    pub fn parse(code: &str) -> Self {
        match code.trim().to_lowercase().as_str() {
            "auto" => Mode::Auto,
            "skip" => Mode::Skip,
            _ => Mode::Ask,
        }
    }

    pub fn label_key(self) -> &'static str {
        match self {
            Mode::Ask => "mode-ask",
            Mode::Auto => "mode-auto",
            Mode::Skip => "mode-skip",
        }
    }
}

/// What an action saves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionVariant {
    Original,
    Summary,
    OriginalSummary,
}

impl ActionVariant {
    pub const ALL: [ActionVariant; 3] = [
        ActionVariant::Original,
        ActionVariant::Summary,
        ActionVariant::OriginalSummary,
    ];

    pub fn code(self) -> &'static str {
        match self {
            ActionVariant::Original => "original",
            ActionVariant::Summary => "summary",
            ActionVariant::OriginalSummary => "original-summary",
        }
    }
}

/// Follow-up action codes, each bound to one upload kind except `None`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionCode {
    #[default]
    None,
    DocumentOriginal,
    DocumentSummary,
    DocumentOriginalSummary,
    ImageOriginal,
    ImageSummary,
    ImageOriginalSummary,
    AudioOriginal,
    AudioSummary,
    AudioOriginalSummary,
}

impl ActionCode {
    pub fn for_kind(kind: TaskKind, variant: ActionVariant) -> Self {
        use ActionVariant::*;
        match (kind, variant) {
            (TaskKind::Document, Original) => ActionCode::DocumentOriginal,
            (TaskKind::Document, Summary) => ActionCode::DocumentSummary,
            (TaskKind::Document, OriginalSummary) => ActionCode::DocumentOriginalSummary,
            (TaskKind::Image, Original) => ActionCode::ImageOriginal,
            (TaskKind::Image, Summary) => ActionCode::ImageSummary,
            (TaskKind::Image, OriginalSummary) => ActionCode::ImageOriginalSummary,
            (TaskKind::Audio, Original) => ActionCode::AudioOriginal,
            (TaskKind::Audio, Summary) => ActionCode::AudioSummary,
            (TaskKind::Audio, OriginalSummary) => ActionCode::AudioOriginalSummary,
        }
    }

    /// The three actions offered for a kind
    pub fn options_for(kind: TaskKind) -> [ActionCode; 3] {
        ActionVariant::ALL.map(|variant| ActionCode::for_kind(kind, variant))
    }

    pub fn kind(self) -> Option<TaskKind> {
        match self {
            ActionCode::None => None,
            ActionCode::DocumentOriginal
            | ActionCode::DocumentSummary
            | ActionCode::DocumentOriginalSummary => Some(TaskKind::Document),
            ActionCode::ImageOriginal
            | ActionCode::ImageSummary
            | ActionCode::ImageOriginalSummary => Some(TaskKind::Image),
            ActionCode::AudioOriginal
            | ActionCode::AudioSummary
            | ActionCode::AudioOriginalSummary => Some(TaskKind::Audio),
        }
    }

    pub fn variant(self) -> Option<ActionVariant> {
        match self {
            ActionCode::None => None,
            ActionCode::DocumentOriginal | ActionCode::ImageOriginal | ActionCode::AudioOriginal => {
                Some(ActionVariant::Original)
            }
            ActionCode::DocumentSummary | ActionCode::ImageSummary | ActionCode::AudioSummary => {
                Some(ActionVariant::Summary)
            }
            ActionCode::DocumentOriginalSummary
            | ActionCode::ImageOriginalSummary
            | ActionCode::AudioOriginalSummary => Some(ActionVariant::OriginalSummary),
        }
    }

    pub fn code(self) -> String {
        match (self.kind(), self.variant()) {
            (Some(kind), Some(variant)) => {
                format!("{}_{}", kind.code(), variant.code().replace('-', "_"))
            }
            _ => "none".to_string(),
        }
    }

    pub fn parse(code: &str) -> Option<Self> {
        let code = code.trim().to_lowercase();
        if code == "none" {
            return Some(ActionCode::None);
        }
        TaskKind::ALL
            .into_iter()
            .flat_map(ActionCode::options_for)
            .find(|action| action.code() == code)
    }

    pub fn saves_original(self) -> bool {
        matches!(
            self.variant(),
            Some(ActionVariant::Original | ActionVariant::OriginalSummary)
        )
    }

    pub fn saves_summary(self) -> bool {
        matches!(
            self.variant(),
            Some(ActionVariant::Summary | ActionVariant::OriginalSummary)
        )
    }

    /// Locale keys for the label, the "once" button and the "always" button
    pub fn label_key(self) -> String {
        match self.variant() {
            Some(variant) => format!("action-{}", variant.code()),
            None => "action-none".to_string(),
        }
    }

    pub fn once_label_key(self) -> String {
        format!("{}-once", self.label_key())
    }

    pub fn always_label_key(self) -> String {
        format!("{}-always", self.label_key())
    }
}

/// Default action for each kind
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefaultActions {
    pub document: ActionCode,
    pub image: ActionCode,
    pub audio: ActionCode,
}

impl DefaultActions {
    pub fn get(&self, kind: TaskKind) -> ActionCode {
        match kind {
            TaskKind::Document => self.document,
            TaskKind::Image => self.image,
            TaskKind::Audio => self.audio,
        }
    }

    pub fn set(&mut self, kind: TaskKind, action: ActionCode) {
        match kind {
            TaskKind::Document => self.document = action,
            TaskKind::Image => self.image = action,
            TaskKind::Audio => self.audio = action,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Integration {
    Slack,
    Notion,
}

impl Integration {
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "slack" => Some(Integration::Slack),
            "notion" => Some(Integration::Notion),
            _ => None,
        }
    }

    pub fn code(self) -> &'static str {
        match self {
            Integration::Slack => "slack",
            Integration::Notion => "notion",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Integrations {
    pub slack: bool,
    pub notion: bool,
}

impl Default for Integrations {
    fn default() -> Self {
        Self {
            slack: true,
            notion: false,
        }
    }
}

impl Integrations {
    pub fn get(&self, integration: Integration) -> bool {
        match integration {
            Integration::Slack => self.slack,
            Integration::Notion => self.notion,
        }
    }

    pub fn set(&mut self, integration: Integration, enabled: bool) {
        match integration {
            Integration::Slack => self.slack = enabled,
            Integration::Notion => self.notion = enabled,
        }
    }
}

/// Preset that sets the default action of every kind at once
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelinePreset {
    Full,
    Summary,
    Original,
}

impl PipelinePreset {
    pub const ALL: [PipelinePreset; 3] = [
        PipelinePreset::Full,
        PipelinePreset::Summary,
        PipelinePreset::Original,
    ];

    pub fn parse(code: &str) -> Option<Self> {
        match code.trim().to_lowercase().as_str() {
            "full" => Some(PipelinePreset::Full),
            "summary" => Some(PipelinePreset::Summary),
            "original" => Some(PipelinePreset::Original),
            _ => None,
        }
    }

    pub fn code(self) -> &'static str {
        match self {
            PipelinePreset::Full => "full",
            PipelinePreset::Summary => "summary",
            PipelinePreset::Original => "original",
        }
    }

    pub fn variant(self) -> ActionVariant {
        match self {
            PipelinePreset::Full => ActionVariant::OriginalSummary,
            PipelinePreset::Summary => ActionVariant::Summary,
            PipelinePreset::Original => ActionVariant::Original,
        }
    }

    pub fn actions(self) -> DefaultActions {
        let variant = self.variant();
        DefaultActions {
            document: ActionCode::for_kind(TaskKind::Document, variant),
            image: ActionCode::for_kind(TaskKind::Image, variant),
            audio: ActionCode::for_kind(TaskKind::Audio, variant),
        }
    }
}

/// A chat's full preference record
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preferences {
    pub mode: Mode,
    pub default_actions: DefaultActions,
    pub integrations: Integrations,
}

impl Preferences {
    /// Merge a stored JSON record over the defaults, ignoring invalid fields
    pub fn from_stored(stored: &Value) -> Self {
        let mut prefs = Preferences::default();
        let Some(stored) = stored.as_object() else {
            return prefs;
        };

        if let Some(mode) = stored.get("mode").and_then(Value::as_str) {
            prefs.mode = Mode::parse(mode);
        }

        if let Some(actions) = stored.get("default_actions").and_then(Value::as_object) {
            for kind in TaskKind::ALL {
                if let Some(action) = actions
                    .get(kind.code())
                    .and_then(Value::as_str)
                    .and_then(ActionCode::parse)
                {
                    prefs.default_actions.set(kind, action);
                }
            }
        }

        // Records written before per-kind actions existed
        if let Some(action) = stored
            .get("default_action")
            .and_then(Value::as_str)
            .and_then(ActionCode::parse)
        {
            prefs.default_actions.document = action;
        }

        if let Some(integrations) = stored.get("integrations").and_then(Value::as_object) {
            for integration in [Integration::Slack, Integration::Notion] {
                if let Some(enabled) = integrations.get(integration.code()).and_then(Value::as_bool) {
                    prefs.integrations.set(integration, enabled);
                }
            }
        }

        prefs
    }

    /// JSON record holding only the fields that differ from the defaults
    pub fn to_stored(&self) -> Value {
        let defaults = Preferences::default();
        let mut stored = Map::new();

        if self.mode != defaults.mode {
            stored.insert("mode".to_string(), json!(self.mode.code()));
        }

        let actions: Map<String, Value> = TaskKind::ALL
            .into_iter()
            .filter(|kind| self.default_actions.get(*kind) != defaults.default_actions.get(*kind))
            .map(|kind| (kind.code().to_string(), json!(self.default_actions.get(kind).code())))
            .collect();
        if !actions.is_empty() {
            stored.insert("default_actions".to_string(), Value::Object(actions));
        }

        let integrations: Map<String, Value> = [Integration::Slack, Integration::Notion]
            .into_iter()
            .filter(|i| self.integrations.get(*i) != defaults.integrations.get(*i))
            .map(|i| (i.code().to_string(), json!(self.integrations.get(i))))
            .collect();
        if !integrations.is_empty() {
            stored.insert("integrations".to_string(), Value::Object(integrations));
        }

        Value::Object(stored)
    }

    pub fn apply(&mut self, update: &PreferenceUpdate) {
        if let Some(mode) = update.mode {
            self.mode = mode;
        }
        for (kind, action) in &update.actions {
            self.default_actions.set(*kind, *action);
        }
        for (integration, enabled) in &update.integrations {
            self.integrations.set(*integration, *enabled);
        }
    }
}

/// Partial update merged by [`PreferenceStore::set`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PreferenceUpdate {
    pub mode: Option<Mode>,
    pub actions: Vec<(TaskKind, ActionCode)>,
    pub integrations: Vec<(Integration, bool)>,
}

impl PreferenceUpdate {
    pub fn mode(mode: Mode) -> Self {
        Self {
            mode: Some(mode),
            ..Default::default()
        }
    }

    pub fn with_action(mut self, kind: TaskKind, action: ActionCode) -> Self {
        self.actions.push((kind, action));
        self
    }

    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn with_integration(mut self, integration: Integration, enabled: bool) -> Self {
        self.integrations.push((integration, enabled));
        self
    }

    /// Replace every record field
    pub fn replace_with(prefs: &Preferences) -> Self {
        Self {
            mode: Some(prefs.mode),
            actions: TaskKind::ALL
                .into_iter()
                .map(|kind| (kind, prefs.default_actions.get(kind)))
                .collect(),
            integrations: vec![
                (Integration::Slack, prefs.integrations.slack),
                (Integration::Notion, prefs.integrations.notion),
            ],
        }
    }
}

/// Key-value storage behind [`PreferenceStore`]
#[async_trait]
pub trait PreferenceBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, RelayError>;
    async fn set(&self, key: &str, value: &str) -> Result<(), RelayError>;
    async fn delete(&self, key: &str) -> Result<(), RelayError>;
}

pub struct RedisPreferenceBackend {
    connection: redis::aio::MultiplexedConnection,
}

impl RedisPreferenceBackend {
    pub fn new(connection: redis::aio::MultiplexedConnection) -> Self {
        Self { connection }
    }
}

#[async_trait]
impl PreferenceBackend for RedisPreferenceBackend {
    async fn get(&self, key: &str) -> Result<Option<String>, RelayError> {
        let mut conn = self.connection.clone();
        let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), RelayError> {
        let mut conn = self.connection.clone();
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), RelayError> {
        let mut conn = self.connection.clone();
        redis::cmd("DEL").arg(key).query_async::<()>(&mut conn).await?;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryPreferenceBackend {
    values: Mutex<HashMap<String, String>>,
}

#[async_trait]
impl PreferenceBackend for MemoryPreferenceBackend {
    async fn get(&self, key: &str) -> Result<Option<String>, RelayError> {
        Ok(self
            .values
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), RelayError> {
        self.values
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), RelayError> {
        self.values
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
        Ok(())
    }
}

/// Preference records with an in-memory fallback for backend failures
pub struct PreferenceStore {
    backend: Option<Arc<dyn PreferenceBackend>>,
    fallback: MemoryPreferenceBackend,
}

impl PreferenceStore {
    pub fn new(backend: Arc<dyn PreferenceBackend>) -> Self {
        Self {
            backend: Some(backend),
            fallback: MemoryPreferenceBackend::default(),
        }
    }

    /// Store kept entirely in memory
    pub fn in_memory() -> Self {
        Self {
            backend: None,
            fallback: MemoryPreferenceBackend::default(),
        }
    }

    fn key(chat_id: i64) -> String {
        format!("{PREFERENCE_KEY_PREFIX}{chat_id}")
    }

    async fn read_raw(&self, key: &str) -> Option<String> {
        if let Some(backend) = &self.backend {
            match backend.get(key).await {
                Ok(value) => return value,
                Err(e) => error!(key, error = %e, "Failed to read preferences, using memory"),
            }
        }
        self.fallback.get(key).await.ok().flatten()
    }

    pub async fn get(&self, chat_id: i64) -> Preferences {
        let Some(raw) = self.read_raw(&Self::key(chat_id)).await else {
            return Preferences::default();
        };
        match serde_json::from_str::<Value>(&raw) {
            Ok(stored) => Preferences::from_stored(&stored),
            Err(e) => {
                warn!(user_id = %chat_id, error = %e, "Unreadable preference record, using defaults");
                Preferences::default()
            }
        }
    }

    /// Merge `update` over the current record and persist it
    pub async fn set(&self, chat_id: i64, update: &PreferenceUpdate) -> Preferences {
        let mut prefs = self.get(chat_id).await;
        prefs.apply(update);
        self.write(chat_id, &prefs).await;
        prefs
    }

    async fn write(&self, chat_id: i64, prefs: &Preferences) {
        let key = Self::key(chat_id);
        let payload = prefs.to_stored().to_string();

        if let Some(backend) = &self.backend {
            match backend.set(&key, &payload).await {
                Ok(()) => {
                    debug!(user_id = %chat_id, "Saved preferences");
                    return;
                }
                Err(e) => error!(user_id = %chat_id, error = %e, "Failed to save preferences, using memory"),
            }
        }
        let _ = self.fallback.set(&key, &payload).await;
    }

    pub async fn reset(&self, chat_id: i64) -> Preferences {
        let key = Self::key(chat_id);
        if let Some(backend) = &self.backend {
            if let Err(e) = backend.delete(&key).await {
                error!(user_id = %chat_id, error = %e, "Failed to reset preferences");
            }
        }
        let _ = self.fallback.delete(&key).await;
        Preferences::default()
    }
}

/// Per-chat undo stack of earlier records
#[derive(Debug, Default)]
pub struct PreferenceHistory {
    stacks: Mutex<HashMap<i64, Vec<Preferences>>>,
}

impl PreferenceHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a record, dropping the oldest beyond the limit
    pub fn push(&self, chat_id: i64, prefs: Preferences) {
        let mut stacks = self.stacks.lock().unwrap_or_else(|e| e.into_inner());
        let stack = stacks.entry(chat_id).or_default();
        stack.push(prefs);
        if stack.len() > PREFERENCE_HISTORY_LIMIT {
            let excess = stack.len() - PREFERENCE_HISTORY_LIMIT;
            stack.drain(..excess);
        }
    }

    pub fn pop(&self, chat_id: i64) -> Option<Preferences> {
        let mut stacks = self.stacks.lock().unwrap_or_else(|e| e.into_inner());
        let stack = stacks.get_mut(&chat_id)?;
        let prefs = stack.pop();
        if stack.is_empty() {
            stacks.remove(&chat_id);
        }
        prefs
    }

    pub fn len(&self, chat_id: i64) -> usize {
        self.stacks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&chat_id)
            .map_or(0, Vec::len)
    }
}
