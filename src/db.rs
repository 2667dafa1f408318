//! # Database Module
//!
//! PostgreSQL storage for conversation memory and the task log.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use sqlx::FromRow;
use tracing::{debug, info};

use crate::gemini::Exchange;

/// A stored chat exchange
#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct ConversationEntry {
    pub id: i64,
    pub telegram_id: i64,
    pub username: Option<String>,
    pub message: String,
    pub response: String,
    pub created_at: DateTime<Utc>,
}

impl From<ConversationEntry> for Exchange {
    fn from(entry: ConversationEntry) -> Self {
        Exchange {
            message: entry.message,
            response: entry.response,
        }
    }
}

/// A row of the task log
#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct TaskLogEntry {
    pub task_id: String,
    pub telegram_id: i64,
    pub kind: String,
    pub file_name: Option<String>,
    pub status: String,
    pub summary: Option<String>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Initialize the database schema
pub async fn init_database_schema(pool: &PgPool) -> Result<()> {
    info!("Initializing database schema...");

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS conversations (
            id BIGSERIAL PRIMARY KEY,
            telegram_id BIGINT NOT NULL,
            username VARCHAR(255),
            message TEXT NOT NULL,
            response TEXT NOT NULL,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )",
    )
    .execute(pool)
    .await
    .context("Failed to create conversations table")?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS conversations_telegram_id_idx
         ON conversations (telegram_id, created_at)",
    )
    .execute(pool)
    .await
    .context("Failed to create conversations index")?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS task_log (
            task_id VARCHAR(64) PRIMARY KEY,
            telegram_id BIGINT NOT NULL,
            kind VARCHAR(16) NOT NULL,
            file_name TEXT,
            status VARCHAR(32) NOT NULL,
            summary TEXT,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            finished_at TIMESTAMPTZ
        )",
    )
    .execute(pool)
    .await
    .context("Failed to create task_log table")?;

    info!("Database schema initialized");
    Ok(())
}

pub async fn save_exchange(
    pool: &PgPool,
    telegram_id: i64,
    username: Option<&str>,
    message: &str,
    response: &str,
) -> Result<i64> {
    let (id,): (i64,) = sqlx::query_as(
        "INSERT INTO conversations (telegram_id, username, message, response)
         VALUES ($1, $2, $3, $4) RETURNING id",
    )
    .bind(telegram_id)
    .bind(username)
    .bind(message)
    .bind(response)
    .fetch_one(pool)
    .await
    .context("Failed to save conversation")?;

    debug!(user_id = %telegram_id, conversation_id = id, "Saved conversation exchange");
    Ok(id)
}

/// The latest `limit` exchanges of a user, oldest first
pub async fn recent_exchanges(
    pool: &PgPool,
    telegram_id: i64,
    limit: i64,
) -> Result<Vec<ConversationEntry>> {
    let mut entries = sqlx::query_as::<_, ConversationEntry>(
        "SELECT id, telegram_id, username, message, response, created_at
         FROM conversations
         WHERE telegram_id = $1
         ORDER BY created_at DESC, id DESC
         LIMIT $2",
    )
    .bind(telegram_id)
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("Failed to load conversation history")?;

    entries.reverse();
    Ok(entries)
}

pub async fn log_task_started(
    pool: &PgPool,
    task_id: &str,
    telegram_id: i64,
    kind: &str,
    file_name: Option<&str>,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO task_log (task_id, telegram_id, kind, file_name, status)
         VALUES ($1, $2, $3, $4, 'dispatched')
         ON CONFLICT (task_id) DO UPDATE SET status = 'dispatched', finished_at = NULL",
    )
    .bind(task_id)
    .bind(telegram_id)
    .bind(kind)
    .bind(file_name)
    .execute(pool)
    .await
    .context("Failed to log task start")?;
    Ok(())
}

/// Mark a task finished; returns false when the task was never logged
pub async fn log_task_finished(
    pool: &PgPool,
    task_id: &str,
    status: &str,
    summary: Option<&str>,
) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE task_log SET status = $2, summary = $3, finished_at = NOW()
         WHERE task_id = $1",
    )
    .bind(task_id)
    .bind(status)
    .bind(summary)
    .execute(pool)
    .await
    .context("Failed to log task completion")?;
    Ok(result.rows_affected() > 0)
}

pub async fn get_task_log(pool: &PgPool, task_id: &str) -> Result<Option<TaskLogEntry>> {
    let entry = sqlx::query_as::<_, TaskLogEntry>(
        "SELECT task_id, telegram_id, kind, file_name, status, summary, created_at, finished_at
         FROM task_log WHERE task_id = $1",
    )
    .bind(task_id)
    .fetch_optional(pool)
    .await
    .context("Failed to read task log")?;
    Ok(entry)
}
