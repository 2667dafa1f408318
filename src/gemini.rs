//! # Gemini Client Module
//!
//! Text and multimodal generation through the Gemini `generateContent` REST
//! endpoint. Every call goes through a circuit breaker and is retried with
//! exponential backoff and random jitter.

use base64::Engine;
use rand::Rng;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::circuit_breaker::{BreakerState, CircuitBreaker};
use crate::config::{GeminiConfig, RecoveryConfig};
use crate::errors::RelayError;

/// One piece of a request
#[derive(Debug, Clone, PartialEq)]
pub enum Part {
    Text(String),
    InlineData { mime_type: String, data: Vec<u8> },
}

impl Part {
    fn to_json(&self) -> Value {
        match self {
            Part::Text(text) => json!({ "text": text }),
            Part::InlineData { mime_type, data } => json!({
                "inline_data": {
                    "mime_type": mime_type,
                    "data": base64::engine::general_purpose::STANDARD.encode(data),
                }
            }),
        }
    }
}

/// A stored chat exchange used as context
#[derive(Debug, Clone, PartialEq)]
pub struct Exchange {
    pub message: String,
    pub response: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImageAnalysis {
    pub description: String,
    pub analysis: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AudioAnalysis {
    pub transcription: String,
    pub summary: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DocumentAnalysis {
    pub text: String,
    pub summary: String,
}

/// Backoff delay before retry number `attempt` (0-based)
pub fn calculate_retry_delay(attempt: u32, config: &RecoveryConfig) -> Duration {
    let exponential = config
        .base_retry_delay_ms
        .saturating_mul(2u64.saturating_pow(attempt));
    let capped = exponential.min(config.max_retry_delay_ms);
    let jitter = if capped >= 4 {
        rand::thread_rng().gen_range(0..=capped / 4)
    } else {
        0
    };
    Duration::from_millis(capped.saturating_add(jitter).min(config.max_retry_delay_ms))
}

pub fn build_request_body(parts: &[Part]) -> Value {
    json!({
        "contents": [
            { "parts": parts.iter().map(Part::to_json).collect::<Vec<_>>() }
        ]
    })
}

/// Classify a non-success HTTP status
///
/// Client errors other than 408 and 429 mean the request itself is wrong and
/// sending it again cannot help.
pub fn status_error(status: reqwest::StatusCode, body: &str) -> RelayError {
    let excerpt: String = body.chars().take(300).collect();
    let message = format!("Gemini returned {status}: {excerpt}");
    let retryable = status == reqwest::StatusCode::REQUEST_TIMEOUT
        || status == reqwest::StatusCode::TOO_MANY_REQUESTS;
    if status.is_client_error() && !retryable {
        RelayError::Rejected(message)
    } else {
        RelayError::Upstream(message)
    }
}

/// Join the text parts of the first candidate
pub fn extract_text(response: &Value) -> Result<String, RelayError> {
    let Some(candidate) = response["candidates"].as_array().and_then(|c| c.first()) else {
        return Err(match response["promptFeedback"]["blockReason"].as_str() {
            Some(reason) => RelayError::Rejected(format!("Gemini blocked the prompt: {reason}")),
            None => RelayError::Upstream("Gemini returned no answer: no candidates".to_string()),
        });
    };

    let text = candidate["content"]["parts"]
        .as_array()
        .map(|parts| {
            parts
                .iter()
                .filter_map(|part| part["text"].as_str())
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default();

    if text.trim().is_empty() {
        if let Some(reason @ ("SAFETY" | "RECITATION" | "BLOCKLIST" | "PROHIBITED_CONTENT")) =
            candidate["finishReason"].as_str()
        {
            return Err(RelayError::Rejected(format!("Gemini blocked the answer: {reason}")));
        }
        return Err(RelayError::Upstream("Gemini returned an empty answer".to_string()));
    }
    Ok(text.trim().to_string())
}

/// Split an answer into labelled sections such as `SUMMARY:`
///
/// Missing labels yield empty sections; an answer without any label is
/// returned whole as the first section.
pub fn split_sections(text: &str, labels: &[&str]) -> Vec<String> {
    let mut sections = vec![String::new(); labels.len()];
    let mut current: Option<usize> = None;
    let mut found_any = false;

    for line in text.lines() {
        let trimmed = line.trim_start_matches(['#', '*', ' ']);
        let header = labels.iter().position(|label| {
            trimmed
                .to_uppercase()
                .starts_with(&format!("{}:", label.to_uppercase()))
        });

        match header {
            Some(index) => {
                found_any = true;
                current = Some(index);
                let rest = trimmed
                    .get(labels[index].len() + 1..)
                    .unwrap_or("")
                    .trim_start_matches('*')
                    .trim();
                if !rest.is_empty() {
                    sections[index].push_str(rest);
                }
            }
            None => {
                if let Some(index) = current {
                    if !sections[index].is_empty() {
                        sections[index].push('\n');
                    }
                    sections[index].push_str(line);
                }
            }
        }
    }

    if !found_any {
        if let Some(first) = sections.first_mut() {
            *first = text.trim().to_string();
        }
    }
    sections.into_iter().map(|s| s.trim().to_string()).collect()
}

pub struct GeminiClient {
    http: reqwest::Client,
    api_key: Option<String>,
    model: String,
    base_url: String,
    recovery: RecoveryConfig,
    breaker: CircuitBreaker,
}

impl GeminiClient {
    pub fn new(config: &GeminiConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.recovery.operation_timeout_secs))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            http,
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            recovery: config.recovery.clone(),
            breaker: CircuitBreaker::new(&config.recovery),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn breaker_state(&self) -> BreakerState {
        self.breaker.state()
    }

    /// Run a request through the breaker with retries
    ///
    /// Rejected requests are returned at once and do not count as breaker
    /// failures, since the service itself is healthy.
    pub async fn generate(&self, parts: &[Part]) -> Result<String, RelayError> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| RelayError::Upstream("Gemini API key is not configured".to_string()))?;
        let body = build_request_body(parts);

        let mut attempt = 0;
        loop {
            if self.breaker.is_open() {
                return Err(RelayError::CircuitOpen(
                    "Gemini calls are paused after repeated failures".to_string(),
                ));
            }

            match self.generate_once(api_key, &body).await {
                Ok(text) => {
                    self.breaker.record_success();
                    return Ok(text);
                }
                Err(e @ RelayError::Rejected(_)) => {
                    warn!(model = %self.model, attempt, error = %e, "Gemini rejected the request");
                    return Err(e);
                }
                Err(e) => {
                    self.breaker.record_failure();
                    if !e.is_transient() || attempt >= self.recovery.max_retries {
                        warn!(model = %self.model, attempt, error = %e, "Gemini call failed");
                        return Err(e);
                    }
                    let delay = calculate_retry_delay(attempt, &self.recovery);
                    warn!(
                        model = %self.model,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Gemini call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn generate_once(&self, api_key: &str, body: &Value) -> Result<String, RelayError> {
        let url = format!("{}/models/{}:generateContent", self.base_url, self.model);
        let response = self
            .http
            .post(&url)
            .query(&[("key", api_key)])
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(status_error(status, &text));
        }

        let value: Value = response.json().await?;
        let text = extract_text(&value)?;
        debug!(model = %self.model, chars = text.len(), "Gemini call succeeded");
        Ok(text)
    }

    pub async fn generate_text(&self, prompt: &str) -> Result<String, RelayError> {
        self.generate(&[Part::Text(prompt.to_string())]).await
    }

    /// Answer a chat message with earlier exchanges as context
    pub async fn chat(&self, message: &str, history: &[Exchange]) -> Result<String, RelayError> {
        let mut prompt = String::from(
            "You are a helpful assistant in a Telegram chat. Answer concisely in the user's language.\n\n",
        );
        if !history.is_empty() {
            prompt.push_str("Previous conversation:\n");
            for exchange in history {
                prompt.push_str(&format!(
                    "User: {}\nAssistant: {}\n",
                    exchange.message, exchange.response
                ));
            }
            prompt.push('\n');
        }
        prompt.push_str(&format!("User: {message}\nAssistant:"));
        self.generate_text(&prompt).await
    }

    pub async fn analyze_document(&self, text: &str, file_name: &str) -> Result<String, RelayError> {
        let prompt = format!(
            "Summarize the document \"{file_name}\" below. List the key points and any \
             action items. Answer in the document's language.\n\n---\n{text}"
        );
        self.generate_text(&prompt).await
    }

    /// Extract and summarize a binary document such as a PDF
    pub async fn analyze_document_bytes(
        &self,
        bytes: &[u8],
        mime_type: &str,
        file_name: &str,
    ) -> Result<DocumentAnalysis, RelayError> {
        let prompt = format!(
            "Read the attached file \"{file_name}\". Respond with two sections:\n\
             TEXT: the main text content (at most 3000 characters)\n\
             SUMMARY: a summary with key points and action items"
        );
        let answer = self
            .generate(&[
                Part::Text(prompt),
                Part::InlineData {
                    mime_type: mime_type.to_string(),
                    data: bytes.to_vec(),
                },
            ])
            .await?;

        let mut sections = split_sections(&answer, &["TEXT", "SUMMARY"]).into_iter();
        let text = sections.next().unwrap_or_default();
        let summary = sections.next().unwrap_or_default();
        info!(file_name, "Analyzed binary document");
        Ok(DocumentAnalysis { text, summary })
    }

    pub async fn analyze_image(&self, bytes: &[u8], mime_type: &str) -> Result<ImageAnalysis, RelayError> {
        let prompt = "Look at the attached image. Respond with two sections:\n\
                      DESCRIPTION: what the image shows, including any visible text\n\
                      ANALYSIS: notable details, context and possible uses";
        let answer = self
            .generate(&[
                Part::Text(prompt.to_string()),
                Part::InlineData {
                    mime_type: mime_type.to_string(),
                    data: bytes.to_vec(),
                },
            ])
            .await?;

        let mut sections = split_sections(&answer, &["DESCRIPTION", "ANALYSIS"]).into_iter();
        Ok(ImageAnalysis {
            description: sections.next().unwrap_or_default(),
            analysis: sections.next().unwrap_or_default(),
        })
    }

    pub async fn analyze_audio(&self, bytes: &[u8], mime_type: &str) -> Result<AudioAnalysis, RelayError> {
        let prompt = "Transcribe the attached audio. Respond with two sections:\n\
                      TRANSCRIPTION: the full transcript in the spoken language\n\
                      SUMMARY: a short summary with key points";
        let answer = self
            .generate(&[
                Part::Text(prompt.to_string()),
                Part::InlineData {
                    mime_type: mime_type.to_string(),
                    data: bytes.to_vec(),
                },
            ])
            .await?;

        let mut sections = split_sections(&answer, &["TRANSCRIPTION", "SUMMARY"]).into_iter();
        Ok(AudioAnalysis {
            transcription: sections.next().unwrap_or_default(),
            summary: sections.next().unwrap_or_default(),
        })
    }
}
