//! # Messenger Module
//!
//! Pub/sub plumbing between the main bot and the worker bots. The
//! [`MessageBroker`] trait is the transport seam: [`RedisBroker`] talks to
//! Redis, [`MemoryBroker`] keeps everything in process.

use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::errors::RelayError;
use crate::task::{
    progress_channel, unix_timestamp, BotStatus, ProgressNote, TaskKind, TaskRequest,
    TaskRequestData, TaskResult, RESULTS_CHANNEL, STATUS_CHANNEL,
};

/// A raw message as received from a channel
#[derive(Debug, Clone, PartialEq)]
pub struct RawMessage {
    pub channel: String,
    pub payload: String,
}

/// Transport used by [`BotMessenger`]
#[async_trait]
pub trait MessageBroker: Send + Sync {
    async fn publish(&self, channel: &str, payload: String) -> Result<(), RelayError>;

    async fn subscribe(
        &self,
        channels: &[String],
    ) -> Result<BoxStream<'static, RawMessage>, RelayError>;

    /// Whether the transport is reachable
    async fn is_healthy(&self) -> bool;
}

/// Redis-backed broker
pub struct RedisBroker {
    client: redis::Client,
    connection: redis::aio::MultiplexedConnection,
}

impl RedisBroker {
    pub async fn connect(url: &str) -> Result<Self, RelayError> {
        let client = redis::Client::open(url)?;
        let connection = client.get_multiplexed_async_connection().await?;
        Ok(Self { client, connection })
    }

    /// Connection shared with other Redis users such as the preference store
    pub fn connection(&self) -> redis::aio::MultiplexedConnection {
        self.connection.clone()
    }
}

#[async_trait]
impl MessageBroker for RedisBroker {
    async fn publish(&self, channel: &str, payload: String) -> Result<(), RelayError> {
        let mut conn = self.connection.clone();
        let receivers: i64 = redis::cmd("PUBLISH")
            .arg(channel)
            .arg(payload)
            .query_async(&mut conn)
            .await?;
        debug!(channel, receivers, "Published message");
        Ok(())
    }

    async fn subscribe(
        &self,
        channels: &[String],
    ) -> Result<BoxStream<'static, RawMessage>, RelayError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        for channel in channels {
            pubsub.subscribe(channel.as_str()).await?;
        }

        let messages = pubsub.into_on_message().filter_map(|msg| async move {
            let channel = msg.get_channel_name().to_string();
            match msg.get_payload::<String>() {
                Ok(payload) => Some(RawMessage { channel, payload }),
                Err(e) => {
                    warn!(channel = %channel, error = %e, "Skipping non-text payload");
                    None
                }
            }
        });
        Ok(messages.boxed())
    }

    async fn is_healthy(&self) -> bool {
        let mut conn = self.connection.clone();
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .is_ok()
    }
}

/// In-process broker, used when the bots share one process and in tests
pub struct MemoryBroker {
    sender: broadcast::Sender<RawMessage>,
    published: Mutex<Vec<RawMessage>>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        let (sender, _) = broadcast::channel(256);
        Self {
            sender,
            published: Mutex::new(Vec::new()),
        }
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every message published so far, oldest first
    pub fn published(&self) -> Vec<RawMessage> {
        self.published
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn published_on(&self, channel: &str) -> Vec<String> {
        self.published()
            .into_iter()
            .filter(|m| m.channel == channel)
            .map(|m| m.payload)
            .collect()
    }
}

#[async_trait]
impl MessageBroker for MemoryBroker {
    async fn publish(&self, channel: &str, payload: String) -> Result<(), RelayError> {
        let message = RawMessage {
            channel: channel.to_string(),
            payload,
        };
        self.published
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(message.clone());
        // No subscribers is not an error for pub/sub
        let _ = self.sender.send(message);
        Ok(())
    }

    async fn subscribe(
        &self,
        channels: &[String],
    ) -> Result<BoxStream<'static, RawMessage>, RelayError> {
        let channels = channels.to_vec();
        let receiver = self.sender.subscribe();

        let messages = stream::unfold(receiver, |mut receiver| async move {
            loop {
                match receiver.recv().await {
                    Ok(message) => return Some((message, receiver)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "In-memory subscriber lagged behind");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .filter(move |message| futures::future::ready(channels.contains(&message.channel)));

        Ok(messages.boxed())
    }

    async fn is_healthy(&self) -> bool {
        true
    }
}

/// Typed publishing and subscribing for one bot
#[derive(Clone)]
pub struct BotMessenger {
    bot_name: String,
    broker: Arc<dyn MessageBroker>,
}

impl BotMessenger {
    pub fn new(bot_name: impl Into<String>, broker: Arc<dyn MessageBroker>) -> Self {
        Self {
            bot_name: bot_name.into(),
            broker,
        }
    }

    pub fn bot_name(&self) -> &str {
        &self.bot_name
    }

    async fn publish_json<T: Serialize>(&self, channel: &str, value: &T) -> Result<(), RelayError> {
        let payload = serde_json::to_string(value)?;
        self.broker.publish(channel, payload).await
    }

    /// Publish a task on the request channel of `kind`
    pub async fn publish_task(
        &self,
        kind: TaskKind,
        data: TaskRequestData,
    ) -> Result<TaskRequest, RelayError> {
        let request = TaskRequest::new(kind, data);
        self.publish_json(&kind.request_channel(), &request).await?;
        debug!(
            task_id = %request.data.task_id,
            user_id = %request.data.chat_id,
            kind = %kind,
            "Dispatched task"
        );
        Ok(request)
    }

    pub async fn send_result(&self, result: &TaskResult) -> Result<(), RelayError> {
        self.publish_json(RESULTS_CHANNEL, result).await
    }

    pub async fn notify_progress(&self, chat_id: i64, text: &str) -> Result<(), RelayError> {
        let note = ProgressNote {
            bot_name: self.bot_name.clone(),
            chat_id,
            progress: text.to_string(),
            timestamp: unix_timestamp(),
        };
        self.publish_json(&progress_channel(chat_id), &note).await
    }

    pub async fn send_status(&self, status: &str) -> Result<(), RelayError> {
        let status = BotStatus {
            bot_name: self.bot_name.clone(),
            status: status.to_string(),
            timestamp: unix_timestamp(),
        };
        self.publish_json(STATUS_CHANNEL, &status).await
    }

    /// Subscribe and decode every payload as `T`; undecodable payloads are skipped
    pub async fn subscribe<T>(&self, channels: &[String]) -> Result<BoxStream<'static, T>, RelayError>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let raw = self.broker.subscribe(channels).await?;
        let decoded = raw.filter_map(|message| async move {
            match serde_json::from_str::<T>(&message.payload) {
                Ok(value) => Some(value),
                Err(e) => {
                    warn!(channel = %message.channel, error = %e, "Skipping undecodable payload");
                    None
                }
            }
        });
        Ok(decoded.boxed())
    }

    pub async fn is_healthy(&self) -> bool {
        self.broker.is_healthy().await
    }
}
