//! # Worker Module
//!
//! The specialised worker bots. A worker subscribes to the request channel
//! of its kind, processes each task on its own tokio task and publishes a
//! result carrying the same task id. Failures are published as error results.

use anyhow::Result;
use async_trait::async_trait;
use futures::StreamExt;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::errors::RelayError;
use crate::gemini::{AudioAnalysis, DocumentAnalysis, GeminiClient, ImageAnalysis};
use crate::messenger::BotMessenger;
use crate::task::{
    get_file_extension, guess_mime_type, is_text_file, ResultBody, TaskKind, TaskRequest,
    TaskResult,
};

/// The analysis calls a worker needs
#[async_trait]
pub trait Analyzer: Send + Sync {
    async fn summarize_text(&self, text: &str, file_name: &str) -> Result<String, RelayError>;

    async fn analyze_document_bytes(
        &self,
        bytes: &[u8],
        mime_type: &str,
        file_name: &str,
    ) -> Result<DocumentAnalysis, RelayError>;

    async fn analyze_image(&self, bytes: &[u8], mime_type: &str) -> Result<ImageAnalysis, RelayError>;

    async fn analyze_audio(&self, bytes: &[u8], mime_type: &str) -> Result<AudioAnalysis, RelayError>;
}

#[async_trait]
impl Analyzer for GeminiClient {
    async fn summarize_text(&self, text: &str, file_name: &str) -> Result<String, RelayError> {
        self.analyze_document(text, file_name).await
    }

    async fn analyze_document_bytes(
        &self,
        bytes: &[u8],
        mime_type: &str,
        file_name: &str,
    ) -> Result<DocumentAnalysis, RelayError> {
        GeminiClient::analyze_document_bytes(self, bytes, mime_type, file_name).await
    }

    async fn analyze_image(&self, bytes: &[u8], mime_type: &str) -> Result<ImageAnalysis, RelayError> {
        GeminiClient::analyze_image(self, bytes, mime_type).await
    }

    async fn analyze_audio(&self, bytes: &[u8], mime_type: &str) -> Result<AudioAnalysis, RelayError> {
        GeminiClient::analyze_audio(self, bytes, mime_type).await
    }
}

/// Detect an image format the analyzer accepts from the file header
pub fn detect_image_mime(bytes: &[u8]) -> Result<&'static str, RelayError> {
    if bytes.len() < 8 {
        return Err(RelayError::Unsupported(format!(
            "Image too short to detect its format ({} bytes)",
            bytes.len()
        )));
    }

    let format = image::guess_format(bytes)
        .map_err(|e| RelayError::Unsupported(format!("Unknown image format: {e}")))?;

    match format {
        image::ImageFormat::Png => Ok("image/png"),
        image::ImageFormat::Jpeg => Ok("image/jpeg"),
        image::ImageFormat::WebP => Ok("image/webp"),
        image::ImageFormat::Gif => Ok("image/gif"),
        other => Err(RelayError::Unsupported(format!(
            "Image format {other:?} is not supported"
        ))),
    }
}

/// Cut text to at most `max_chars` characters
pub fn truncate_chars(text: &str, max_chars: usize) -> (String, bool) {
    match text.char_indices().nth(max_chars) {
        Some((index, _)) => (text[..index].to_string(), true),
        None => (text.to_string(), false),
    }
}

pub struct Worker {
    kind: TaskKind,
    messenger: BotMessenger,
    analyzer: Arc<dyn Analyzer>,
    max_document_chars: usize,
}

impl Worker {
    pub fn new(
        kind: TaskKind,
        messenger: BotMessenger,
        analyzer: Arc<dyn Analyzer>,
        max_document_chars: usize,
    ) -> Self {
        Self {
            kind,
            messenger,
            analyzer,
            max_document_chars,
        }
    }

    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    /// Subscribe to the request channel and serve tasks until the stream ends
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let channel = self.kind.request_channel();
        let mut requests = self
            .messenger
            .subscribe::<TaskRequest>(std::slice::from_ref(&channel))
            .await?;

        if let Err(e) = self.messenger.send_status("online").await {
            warn!(error = %e, "Failed to publish worker status");
        }
        info!(worker = self.kind.worker_name(), channel = %channel, "Worker listening for tasks");

        while let Some(request) = requests.next().await {
            if request.task_type != self.kind {
                warn!(task_id = %request.data.task_id, task_type = %request.task_type, "Ignoring task of another kind");
                continue;
            }
            let worker = Arc::clone(&self);
            tokio::spawn(async move {
                worker.handle(request).await;
            });
        }

        warn!(worker = self.kind.worker_name(), "Task stream ended");
        Ok(())
    }

    /// Process one request and publish its result
    pub async fn handle(&self, request: TaskRequest) -> TaskResult {
        let task_id = request.data.task_id.clone();
        let chat_id = request.data.chat_id;
        info!(task_id = %task_id, user_id = %chat_id, file_name = %request.data.file.file_name, "Processing task");

        let body = match self.process(&request).await {
            Ok(body) => body,
            Err(e) => {
                error!(task_id = %task_id, user_id = %chat_id, error = %e, "Task failed");
                ResultBody::failure(e.to_string())
            }
        };

        let result = TaskResult::new(self.kind, task_id.clone(), chat_id, body);
        if let Err(e) = self.messenger.send_result(&result).await {
            error!(task_id = %task_id, error = %e, "Failed to publish result");
        }
        result
    }

    async fn progress(&self, chat_id: i64, text: &str) {
        if let Err(e) = self.messenger.notify_progress(chat_id, text).await {
            debug!(user_id = %chat_id, error = %e, "Failed to publish progress note");
        }
    }

    async fn process(&self, request: &TaskRequest) -> Result<ResultBody, RelayError> {
        let file = &request.data.file;
        let chat_id = request.data.chat_id;

        self.progress(chat_id, "Reading file...").await;
        let bytes = tokio::fs::read(Path::new(&file.file_path)).await?;

        match self.kind {
            TaskKind::Document => {
                self.progress(chat_id, "Analyzing document...").await;
                self.process_document(&file.file_name, &bytes).await
            }
            TaskKind::Image => {
                let mime_type = detect_image_mime(&bytes)?;
                self.progress(chat_id, "Analyzing image...").await;
                let analysis = self.analyzer.analyze_image(&bytes, mime_type).await?;
                Ok(ResultBody::image(analysis.description, analysis.analysis))
            }
            TaskKind::Audio => {
                let mime_type = file
                    .mime_type
                    .clone()
                    .unwrap_or_else(|| guess_mime_type(&file.file_name).to_string());
                self.progress(chat_id, "Transcribing audio...").await;
                let analysis = self.analyzer.analyze_audio(&bytes, &mime_type).await?;
                Ok(ResultBody::audio(
                    analysis.transcription,
                    analysis.summary,
                    file.duration,
                ))
            }
        }
    }

    async fn process_document(&self, file_name: &str, bytes: &[u8]) -> Result<ResultBody, RelayError> {
        if is_text_file(file_name) {
            let text = String::from_utf8_lossy(bytes);
            let (text, truncated) = truncate_chars(&text, self.max_document_chars);
            if truncated {
                debug!(file_name, max_chars = self.max_document_chars, "Document text truncated");
            }
            if text.trim().is_empty() {
                return Err(RelayError::Unsupported(format!("{file_name} contains no text")));
            }
            let summary = self.analyzer.summarize_text(&text, file_name).await?;
            return Ok(ResultBody::document(text, summary, file_name.to_string()));
        }

        if get_file_extension(file_name) == ".pdf" {
            let analysis = self
                .analyzer
                .analyze_document_bytes(bytes, "application/pdf", file_name)
                .await?;
            return Ok(ResultBody::document(
                analysis.text,
                analysis.summary,
                file_name.to_string(),
            ));
        }

        Err(RelayError::Unsupported(format!(
            "Document format of {file_name} is not supported"
        )))
    }
}
