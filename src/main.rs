use anyhow::{Context, Result};
use futures::StreamExt;
use sqlx::postgres::PgPool;
use std::sync::Arc;
use teloxide::prelude::*;
use tracing::{error, info, warn};

use taskrelay::actions::{ActionExecutor, TelegramFileSource};
use taskrelay::bot::{self, AppState, TelegramFollowupSink, WorkerDirectory};
use taskrelay::config::BotConfig;
use taskrelay::correlation::{run_result_listener, ActiveTasks, PendingResults};
use taskrelay::db;
use taskrelay::followup::FollowupEngine;
use taskrelay::gemini::GeminiClient;
use taskrelay::localization::init_localization;
use taskrelay::messenger::{BotMessenger, RedisBroker};
use taskrelay::preferences::{PreferenceStore, RedisPreferenceBackend};
use taskrelay::task::{BotStatus, TaskResult, MAIN_BOT_NAME, RESULTS_CHANNEL, STATUS_CHANNEL};

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    taskrelay::logging::init();
    info!("Starting taskrelay main bot");

    init_localization()?;
    let config = BotConfig::from_env()?;

    let pool = match &config.database_url {
        Some(url) => {
            info!("Connecting to database");
            let pool = PgPool::connect(url)
                .await
                .context("Failed to connect to PostgreSQL database")?;
            db::init_database_schema(&pool).await?;
            Some(pool)
        }
        None => {
            warn!("DATABASE_URL is not set, running without conversation memory or task log");
            None
        }
    };

    let broker = if config.redis.enabled {
        match RedisBroker::connect(&config.redis.url()).await {
            Ok(broker) => {
                info!(host = %config.redis.host, port = config.redis.port, "Connected to Redis");
                Some(Arc::new(broker))
            }
            Err(e) => {
                error!(error = %e, "Failed to connect to Redis, uploads are disabled");
                None
            }
        }
    } else {
        warn!("Redis is disabled, uploads are disabled");
        None
    };

    let preference_store = match &broker {
        Some(broker) => PreferenceStore::new(Arc::new(RedisPreferenceBackend::new(broker.connection()))),
        None => PreferenceStore::in_memory(),
    };
    let messenger = broker.map(|broker| BotMessenger::new(MAIN_BOT_NAME, broker));

    let bot = Bot::new(&config.token);

    let actions = Arc::new(ActionExecutor::new(
        &config.integrations,
        Arc::new(TelegramFileSource::new(bot.clone())),
    ));
    if !actions.drive_configured() {
        warn!("GOOGLE_DRIVE_ACCESS_TOKEN is not set, follow-up actions will not save files");
    }
    let sink = Arc::new(TelegramFollowupSink::new(bot.clone(), Arc::clone(&actions)));
    let followups = Arc::new(FollowupEngine::new(Arc::new(preference_store), sink));

    let gemini = Arc::new(GeminiClient::new(&config.gemini));
    if !gemini.is_configured() {
        warn!("GEMINI_API_KEY is not set, chat replies are disabled");
    }

    let state = Arc::new(AppState {
        config,
        messenger,
        pending: Arc::new(PendingResults::new()),
        active: Arc::new(ActiveTasks::new()),
        followups,
        gemini,
        actions,
        workers: Arc::new(WorkerDirectory::new()),
        pool,
    });

    if let Some(messenger) = &state.messenger {
        let results = messenger
            .subscribe::<TaskResult>(&[RESULTS_CHANNEL.to_string()])
            .await?;
        let listener_state = Arc::clone(&state);
        let listener_bot = bot.clone();
        tokio::spawn(async move {
            let pending = Arc::clone(&listener_state.pending);
            let active = Arc::clone(&listener_state.active);
            run_result_listener(results, pending, active, move |result| {
                bot::process_unclaimed(listener_bot.clone(), Arc::clone(&listener_state), result)
            })
            .await;
        });

        let mut statuses = messenger
            .subscribe::<BotStatus>(&[STATUS_CHANNEL.to_string()])
            .await?;
        let workers = Arc::clone(&state.workers);
        tokio::spawn(async move {
            while let Some(status) = statuses.next().await {
                info!(bot = %status.bot_name, status = %status.status, "Worker status");
                workers.record(status);
            }
        });

        if let Err(e) = messenger.send_status("online").await {
            warn!(error = %e, "Failed to publish main bot status");
        }
    }

    info!("Bot initialized, starting dispatcher");

    let handler = dptree::entry()
        .branch(Update::filter_message().endpoint({
            let state = Arc::clone(&state);
            move |bot: Bot, msg: Message| {
                let state = Arc::clone(&state);
                async move { bot::message_handler(bot, msg, state).await }
            }
        }))
        .branch(Update::filter_callback_query().endpoint({
            let state = Arc::clone(&state);
            move |bot: Bot, q: CallbackQuery| {
                let state = Arc::clone(&state);
                async move { bot::callback_handler(bot, q, state).await }
            }
        }));

    Dispatcher::builder(bot, handler)
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    Ok(())
}
