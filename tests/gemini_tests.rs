//! # Gemini Tests
//!
//! The Gemini client and the image and audio workers against a local HTTP
//! server that answers every request with one canned response.

use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use taskrelay::circuit_breaker::BreakerState;
use taskrelay::config::{GeminiConfig, RecoveryConfig};
use taskrelay::errors::RelayError;
use taskrelay::gemini::GeminiClient;
use taskrelay::messenger::{BotMessenger, MemoryBroker};
use taskrelay::task::*;
use taskrelay::worker::Worker;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Local stand-in for the Gemini REST endpoint
struct StubServer {
    base_url: String,
    hits: Arc<AtomicUsize>,
    bodies: Arc<Mutex<Vec<String>>>,
}

impl StubServer {
    async fn start(status: u16, body: &'static str) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind stub server");
        let address = listener.local_addr().expect("stub address");
        let hits = Arc::new(AtomicUsize::new(0));
        let bodies = Arc::new(Mutex::new(Vec::new()));

        let (counter, seen) = (hits.clone(), bodies.clone());
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let (counter, seen) = (counter.clone(), seen.clone());
                tokio::spawn(async move {
                    answer(stream, status, body, |request| {
                        counter.fetch_add(1, Ordering::SeqCst);
                        seen.lock().unwrap().push(request);
                    })
                    .await;
                });
            }
        });

        Self {
            base_url: format!("http://{address}"),
            hits,
            bodies,
        }
    }

    fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    fn client(&self, recovery: RecoveryConfig) -> GeminiClient {
        GeminiClient::new(&GeminiConfig {
            api_key: Some("test-key".to_string()),
            base_url: self.base_url.clone(),
            recovery,
            ..Default::default()
        })
    }
}

/// Read one request, record its body, then send the canned response
async fn answer(
    mut stream: TcpStream,
    status: u16,
    body: &str,
    record: impl FnOnce(String),
) -> Option<()> {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 4096];

    let header_end = loop {
        let read = stream.read(&mut chunk).await.ok()?;
        if read == 0 {
            return None;
        }
        buffer.extend_from_slice(&chunk[..read]);
        if let Some(index) = buffer.windows(4).position(|w| w == b"\r\n\r\n") {
            break index + 4;
        }
    };

    let headers = String::from_utf8_lossy(&buffer[..header_end]).to_lowercase();
    let content_length = headers
        .lines()
        .find_map(|line| line.strip_prefix("content-length:"))
        .and_then(|value| value.trim().parse::<usize>().ok())
        .unwrap_or(0);
    while buffer.len() < header_end + content_length {
        let read = stream.read(&mut chunk).await.ok()?;
        if read == 0 {
            break;
        }
        buffer.extend_from_slice(&chunk[..read]);
    }

    record(String::from_utf8_lossy(&buffer[header_end..]).to_string());

    let response = format!(
        "HTTP/1.1 {status} Stub\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(response.as_bytes()).await.ok()?;
    stream.shutdown().await.ok()
}

fn fast_recovery(max_retries: u32, threshold: u32) -> RecoveryConfig {
    RecoveryConfig {
        max_retries,
        base_retry_delay_ms: 1,
        max_retry_delay_ms: 5,
        operation_timeout_secs: 5,
        circuit_breaker_threshold: threshold,
        circuit_breaker_reset_secs: 60,
    }
}

fn request(
    kind: TaskKind,
    path: &str,
    file_name: &str,
    mime_type: Option<&str>,
    duration: Option<u32>,
) -> TaskRequest {
    TaskRequest::new(
        kind,
        TaskRequestData {
            task_id: new_task_id(),
            chat_id: 21,
            user_id: Some(21),
            file: FileRef {
                file_path: path.to_string(),
                file_name: file_name.to_string(),
                file_size: 0,
                mime_type: mime_type.map(str::to_string),
                duration,
            },
        },
    )
}

fn file_with(suffix: &str, bytes: &[u8]) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(suffix)
        .tempfile()
        .expect("temp file");
    file.write_all(bytes).expect("write temp file");
    file
}

fn png_bytes() -> Vec<u8> {
    let mut bytes = vec![0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
    bytes.extend_from_slice(&[0u8; 32]);
    bytes
}

#[tokio::test]
async fn test_bad_request_is_neither_retried_nor_counted() {
    taskrelay::logging::init_test();
    let server = StubServer::start(400, r#"{"error":{"message":"Invalid argument"}}"#).await;
    let client = server.client(fast_recovery(3, 2));

    for call in 1..=3 {
        let result = client.generate_text("hello").await;
        assert!(matches!(result, Err(RelayError::Rejected(_))), "{result:?}");
        // One request per call, never a retry
        assert_eq!(server.hits(), call);
    }
    // Above the threshold of two, yet the breaker never opened
    assert_eq!(client.breaker_state(), BreakerState::Closed);
}

#[tokio::test]
async fn test_blocked_prompt_is_rejected_without_retry() {
    let server = StubServer::start(200, r#"{"promptFeedback":{"blockReason":"SAFETY"}}"#).await;
    let client = server.client(fast_recovery(3, 1));

    let error = client.generate_text("hello").await.unwrap_err();
    assert_eq!(error.message_key(), "error-rejected");
    assert_eq!(server.hits(), 1);
    assert_eq!(client.breaker_state(), BreakerState::Closed);
}

#[tokio::test]
async fn test_server_errors_are_retried_then_open_the_breaker() {
    let server = StubServer::start(500, r#"{"error":{"message":"Internal"}}"#).await;
    let client = server.client(fast_recovery(2, 3));

    let error = client.generate_text("hello").await.unwrap_err();
    assert!(matches!(error, RelayError::Upstream(_)), "{error:?}");
    assert_eq!(server.hits(), 3);
    assert_eq!(client.breaker_state(), BreakerState::Open);

    // The open breaker stops the next call before it reaches the server
    let error = client.generate_text("hello").await.unwrap_err();
    assert!(matches!(error, RelayError::CircuitOpen(_)));
    assert_eq!(server.hits(), 3);
}

#[tokio::test]
async fn test_image_worker_describes_the_image() {
    let server = StubServer::start(
        200,
        r#"{"candidates":[{"content":{"parts":[{"text":"DESCRIPTION: A cat on a mat\nANALYSIS: Looks relaxed"}]}}]}"#,
    )
    .await;
    let broker = Arc::new(MemoryBroker::new());
    let messenger = BotMessenger::new(TaskKind::Image.worker_name(), broker.clone());
    let worker = Worker::new(
        TaskKind::Image,
        messenger,
        Arc::new(server.client(fast_recovery(0, 5))),
        1_000,
    );

    let file = file_with(".png", &png_bytes());
    let path = file.path().to_string_lossy().to_string();
    let result = worker
        .handle(request(TaskKind::Image, &path, "cat.png", None, None))
        .await;

    assert!(!result.result.is_error(), "{:?}", result.result.error);
    assert_eq!(result.result.description.as_deref(), Some("A cat on a mat"));
    assert_eq!(result.result.analysis.as_deref(), Some("Looks relaxed"));
    assert_eq!(broker.published_on(RESULTS_CHANNEL).len(), 1);

    // The detected format travels with the inline data
    let bodies = server.bodies.lock().unwrap().clone();
    assert_eq!(bodies.len(), 1);
    let sent: serde_json::Value = serde_json::from_str(&bodies[0]).expect("json request body");
    assert_eq!(
        sent["contents"][0]["parts"][1]["inline_data"]["mime_type"],
        "image/png"
    );
}

#[tokio::test]
async fn test_image_worker_refuses_non_images_before_calling_out() {
    let server = StubServer::start(200, "{}").await;
    let worker = Worker::new(
        TaskKind::Image,
        BotMessenger::new(TaskKind::Image.worker_name(), Arc::new(MemoryBroker::new())),
        Arc::new(server.client(fast_recovery(0, 5))),
        1_000,
    );

    let file = file_with(".png", b"plain text pretending to be a picture");
    let path = file.path().to_string_lossy().to_string();
    let result = worker
        .handle(request(TaskKind::Image, &path, "fake.png", None, None))
        .await;

    assert!(result.result.is_error());
    assert_eq!(server.hits(), 0);
}

#[tokio::test]
async fn test_audio_worker_transcribes_and_keeps_duration() {
    let server = StubServer::start(
        200,
        r#"{"candidates":[{"content":{"parts":[{"text":"TRANSCRIPTION: Meeting moved to Friday\nSUMMARY: Schedule change"}]}}]}"#,
    )
    .await;
    let worker = Worker::new(
        TaskKind::Audio,
        BotMessenger::new(TaskKind::Audio.worker_name(), Arc::new(MemoryBroker::new())),
        Arc::new(server.client(fast_recovery(0, 5))),
        1_000,
    );

    let file = file_with(".ogg", b"OggS fake voice payload");
    let path = file.path().to_string_lossy().to_string();
    let result = worker
        .handle(request(TaskKind::Audio, &path, "voice.ogg", Some("audio/ogg"), Some(42)))
        .await;

    assert!(!result.result.is_error(), "{:?}", result.result.error);
    assert_eq!(result.result.transcription.as_deref(), Some("Meeting moved to Friday"));
    assert_eq!(result.result.summary.as_deref(), Some("Schedule change"));
    assert_eq!(result.result.duration, Some(42));
    assert_eq!(result.kind(), Some(TaskKind::Audio));

    let bodies = server.bodies.lock().unwrap().clone();
    let sent: serde_json::Value = serde_json::from_str(&bodies[0]).expect("json request body");
    assert_eq!(
        sent["contents"][0]["parts"][1]["inline_data"]["mime_type"],
        "audio/ogg"
    );
}

#[tokio::test]
async fn test_audio_worker_reports_rejected_upload() {
    let server = StubServer::start(400, r#"{"error":{"message":"Unsupported audio"}}"#).await;
    let worker = Worker::new(
        TaskKind::Audio,
        BotMessenger::new(TaskKind::Audio.worker_name(), Arc::new(MemoryBroker::new())),
        Arc::new(server.client(fast_recovery(3, 5))),
        1_000,
    );

    let file = file_with(".ogg", b"OggS fake voice payload");
    let path = file.path().to_string_lossy().to_string();
    let result = worker
        .handle(request(TaskKind::Audio, &path, "voice.ogg", None, None))
        .await;

    let error = result.result.error.expect("error result");
    assert!(error.starts_with("Rejected request"), "{error}");
    assert_eq!(server.hits(), 1);
}
