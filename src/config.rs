//! # Configuration Module
//!
//! This module defines configuration structures for the main bot, the worker
//! bots and the outbound integrations, including recovery settings used for
//! calls to upstream AI services.

use anyhow::{anyhow, Result};
use std::path::PathBuf;

use crate::task::TaskKind;

// Constants for relay configuration
pub const DEFAULT_REDIS_HOST: &str = "localhost";
pub const DEFAULT_REDIS_PORT: u16 = 6379;
pub const DEFAULT_GEMINI_MODEL: &str = "gemini-2.5-flash";
pub const DEFAULT_GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_RESULT_TIMEOUT_SECS: u64 = 1800;
pub const DEFAULT_PROGRESS_INTERVAL_SECS: u64 = 20;
pub const MAX_UPLOAD_SIZE: u64 = 50 * 1024 * 1024; // 50MB limit for uploads
pub const MAX_DOCUMENT_CHARS: usize = 30_000;
pub const PREFERENCE_HISTORY_LIMIT: usize = 5;
pub const CONVERSATION_MEMORY_LIMIT: i64 = 8;

/// Recovery configuration for error handling
#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    /// Maximum number of retry attempts
    pub max_retries: u32,
    /// Base delay between retries in milliseconds
    pub base_retry_delay_ms: u64,
    /// Maximum delay between retries in milliseconds
    pub max_retry_delay_ms: u64,
    /// Timeout for a single upstream call in seconds
    pub operation_timeout_secs: u64,
    /// Circuit breaker failure threshold
    pub circuit_breaker_threshold: u32,
    /// Circuit breaker reset timeout in seconds
    pub circuit_breaker_reset_secs: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_retry_delay_ms: 1000,   // 1 second
            max_retry_delay_ms: 10000,   // 10 seconds
            operation_timeout_secs: 120, // multimodal calls on long audio are slow
            circuit_breaker_threshold: 5,
            circuit_breaker_reset_secs: 60, // 1 minute
        }
    }
}

/// Redis connection settings
#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    /// When disabled the main bot runs without dispatching uploads
    pub enabled: bool,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_REDIS_HOST.to_string(),
            port: DEFAULT_REDIS_PORT,
            enabled: true,
        }
    }
}

impl RedisConfig {
    pub fn url(&self) -> String {
        format!("redis://{}:{}/0", self.host, self.port)
    }

    fn from_lookup(lookup: &impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            host: lookup("REDIS_HOST").unwrap_or(defaults.host),
            port: lookup("REDIS_PORT")
                .and_then(|p| p.parse().ok())
                .unwrap_or(defaults.port),
            enabled: lookup("REDIS_ENABLED")
                .map(|v| parse_flag(&v))
                .unwrap_or(defaults.enabled),
        }
    }
}

/// Gemini API settings
#[derive(Debug, Clone)]
pub struct GeminiConfig {
    pub api_key: Option<String>,
    pub model: String,
    pub base_url: String,
    pub recovery: RecoveryConfig,
}

impl Default for GeminiConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model: DEFAULT_GEMINI_MODEL.to_string(),
            base_url: DEFAULT_GEMINI_BASE_URL.to_string(),
            recovery: RecoveryConfig::default(),
        }
    }
}

impl GeminiConfig {
    /// `key_var` is checked first so each bot can carry its own key
    fn from_lookup(lookup: &impl Fn(&str) -> Option<String>, key_var: &str) -> Self {
        let defaults = Self::default();
        Self {
            api_key: lookup(key_var).or_else(|| lookup("GEMINI_API_KEY")),
            model: lookup("GEMINI_MODEL").unwrap_or(defaults.model),
            base_url: lookup("GEMINI_BASE_URL").unwrap_or(defaults.base_url),
            recovery: defaults.recovery,
        }
    }
}

/// Credentials for follow-up actions and notifications
#[derive(Debug, Clone, Default)]
pub struct IntegrationConfig {
    pub drive_access_token: Option<String>,
    pub drive_folder_id: Option<String>,
    pub slack_webhook_url: Option<String>,
    pub notion_token: Option<String>,
    pub notion_database_id: Option<String>,
}

impl IntegrationConfig {
    fn from_lookup(lookup: &impl Fn(&str) -> Option<String>) -> Self {
        Self {
            drive_access_token: lookup("GOOGLE_DRIVE_ACCESS_TOKEN"),
            drive_folder_id: lookup("GOOGLE_DRIVE_FOLDER_ID"),
            slack_webhook_url: lookup("SLACK_WEBHOOK_URL"),
            notion_token: lookup("NOTION_API_TOKEN"),
            notion_database_id: lookup("NOTION_DATABASE_ID"),
        }
    }
}

/// Configuration of the main (dispatching) bot
#[derive(Debug, Clone)]
pub struct BotConfig {
    pub token: String,
    pub redis: RedisConfig,
    pub gemini: GeminiConfig,
    pub integrations: IntegrationConfig,
    pub database_url: Option<String>,
    pub result_timeout_secs: u64,
    pub progress_interval_secs: u64,
    pub max_upload_size: u64,
    /// Directory shared with the workers for downloaded uploads
    pub temp_dir: PathBuf,
}

impl BotConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok().filter(|v| !v.trim().is_empty()))
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let token = lookup("MAIN_BOT_TOKEN")
            .or_else(|| lookup("TELEGRAM_BOT_TOKEN"))
            .ok_or_else(|| anyhow!("MAIN_BOT_TOKEN must be set"))?;

        Ok(Self {
            token,
            redis: RedisConfig::from_lookup(&lookup),
            gemini: GeminiConfig::from_lookup(&lookup, "GEMINI_API_KEY_MAIN"),
            integrations: IntegrationConfig::from_lookup(&lookup),
            database_url: lookup("DATABASE_URL"),
            result_timeout_secs: lookup("RESULT_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_RESULT_TIMEOUT_SECS),
            progress_interval_secs: lookup("PROGRESS_INTERVAL_SECS")
                .and_then(|v| v.parse().ok())
                .filter(|secs| *secs > 0)
                .unwrap_or(DEFAULT_PROGRESS_INTERVAL_SECS),
            max_upload_size: MAX_UPLOAD_SIZE,
            temp_dir: lookup("RELAY_TEMP_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(std::env::temp_dir),
        })
    }
}

/// Configuration of a worker bot
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub kind: TaskKind,
    pub redis: RedisConfig,
    pub gemini: GeminiConfig,
    pub max_document_chars: usize,
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok().filter(|v| !v.trim().is_empty()))
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let kind_code = lookup("WORKER_KIND").ok_or_else(|| anyhow!("WORKER_KIND must be set"))?;
        let kind = TaskKind::parse(&kind_code)
            .ok_or_else(|| anyhow!("Unknown WORKER_KIND: {kind_code}"))?;
        let key_var = format!("GEMINI_API_KEY_{}", kind.code().to_uppercase());

        Ok(Self {
            kind,
            redis: RedisConfig::from_lookup(&lookup),
            gemini: GeminiConfig::from_lookup(&lookup, &key_var),
            max_document_chars: lookup("MAX_DOCUMENT_CHARS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(MAX_DOCUMENT_CHARS),
        })
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
