//! Shared state of the main bot handlers

use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::actions::ActionExecutor;
use crate::config::BotConfig;
use crate::correlation::{ActiveTasks, PendingResults};
use crate::followup::FollowupEngine;
use crate::gemini::GeminiClient;
use crate::messenger::BotMessenger;
use crate::task::BotStatus;

/// Last heartbeat seen from each worker on the status channel
#[derive(Debug, Default)]
pub struct WorkerDirectory {
    statuses: Mutex<HashMap<String, BotStatus>>,
}

impl WorkerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, status: BotStatus) {
        self.statuses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(status.bot_name.clone(), status);
    }

    pub fn get(&self, bot_name: &str) -> Option<BotStatus> {
        self.statuses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(bot_name)
            .cloned()
    }

    /// When `bot_name` was last heard from
    pub fn last_seen(&self, bot_name: &str) -> Option<DateTime<Utc>> {
        self.get(bot_name)
            .and_then(|status| DateTime::from_timestamp(status.timestamp as i64, 0))
    }
}

pub struct AppState {
    pub config: BotConfig,
    /// `None` when Redis is disabled; uploads are then refused
    pub messenger: Option<BotMessenger>,
    pub pending: Arc<PendingResults>,
    pub active: Arc<ActiveTasks>,
    pub followups: Arc<FollowupEngine>,
    pub gemini: Arc<GeminiClient>,
    pub actions: Arc<ActionExecutor>,
    pub workers: Arc<WorkerDirectory>,
    pub pool: Option<PgPool>,
}

impl AppState {
    pub fn dispatch_enabled(&self) -> bool {
        self.messenger.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_directory_keeps_latest_status() {
        let workers = WorkerDirectory::new();
        assert!(workers.last_seen("audio_bot").is_none());

        for (status, timestamp) in [("online", 1_700_000_000.0), ("busy", 1_700_000_060.5)] {
            workers.record(BotStatus {
                bot_name: "audio_bot".to_string(),
                status: status.to_string(),
                timestamp,
            });
        }

        assert_eq!(workers.get("audio_bot").map(|s| s.status), Some("busy".to_string()));
        assert_eq!(
            workers.last_seen("audio_bot").map(|t| t.timestamp()),
            Some(1_700_000_060)
        );
    }
}
