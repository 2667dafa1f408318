use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{info, warn};

use taskrelay::config::WorkerConfig;
use taskrelay::gemini::GeminiClient;
use taskrelay::messenger::{BotMessenger, RedisBroker};
use taskrelay::worker::Worker;

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    taskrelay::logging::init();

    let config = WorkerConfig::from_env()?;
    let worker_name = config.kind.worker_name();
    info!(worker = worker_name, "Starting taskrelay worker");

    if !config.redis.enabled {
        anyhow::bail!("Workers need Redis; REDIS_ENABLED must not be false");
    }

    let gemini = GeminiClient::new(&config.gemini);
    if !gemini.is_configured() {
        warn!(worker = worker_name, "No Gemini API key is set, every task will fail");
    }

    let broker = RedisBroker::connect(&config.redis.url())
        .await
        .with_context(|| format!("Failed to connect to Redis at {}", config.redis.url()))?;
    let messenger = BotMessenger::new(worker_name, Arc::new(broker));

    let worker = Arc::new(Worker::new(
        config.kind,
        messenger,
        Arc::new(gemini),
        config.max_document_chars,
    ));

    tokio::select! {
        result = Arc::clone(&worker).run() => result?,
        _ = tokio::signal::ctrl_c() => info!(worker = worker_name, "Shutting down"),
    }

    Ok(())
}
