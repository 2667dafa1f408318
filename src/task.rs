//! # Task Model Module
//!
//! Task kinds, the JSON messages exchanged between the main bot and the worker
//! bots, and the helpers used to estimate and render task progress.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// Channel every worker publishes its results to
pub const RESULTS_CHANNEL: &str = "main_bot_results";
/// Channel for worker heartbeats
pub const STATUS_CHANNEL: &str = "bot_status";
/// Name the main bot uses when publishing
pub const MAIN_BOT_NAME: &str = "main_bot";

/// Identifier correlating a request with its result
pub type TaskId = String;

/// Length of a task id, short enough for Telegram's 64-byte callback data
pub const TASK_ID_LEN: usize = 12;

/// Generate a fresh task identifier from the hex digits of a v4 UUID
pub fn new_task_id() -> TaskId {
    let mut id = uuid::Uuid::new_v4().simple().to_string();
    id.truncate(TASK_ID_LEN);
    id
}

/// Seconds since the Unix epoch with millisecond precision
pub fn unix_timestamp() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

/// Channel carrying progress notes for a chat
pub fn progress_channel(chat_id: i64) -> String {
    format!("progress_{chat_id}")
}

/// Kind of upload, which also selects the worker bot that handles it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    Document,
    Image,
    Audio,
}

impl TaskKind {
    pub const ALL: [TaskKind; 3] = [TaskKind::Document, TaskKind::Image, TaskKind::Audio];

    pub fn code(self) -> &'static str {
        match self {
            TaskKind::Document => "document",
            TaskKind::Image => "image",
            TaskKind::Audio => "audio",
        }
    }

    pub fn parse(code: &str) -> Option<Self> {
        match code.trim().to_lowercase().as_str() {
            "document" => Some(TaskKind::Document),
            "image" => Some(TaskKind::Image),
            "audio" => Some(TaskKind::Audio),
            _ => None,
        }
    }

    /// Channel the worker for this kind subscribes to
    pub fn request_channel(self) -> String {
        format!("{}_tasks", self.code())
    }

    pub fn worker_name(self) -> &'static str {
        match self {
            TaskKind::Document => "document_bot",
            TaskKind::Image => "image_bot",
            TaskKind::Audio => "audio_bot",
        }
    }

    pub fn from_worker_name(name: &str) -> Option<Self> {
        TaskKind::ALL.into_iter().find(|kind| kind.worker_name() == name)
    }

    pub fn emoji(self) -> &'static str {
        match self {
            TaskKind::Document => "📄",
            TaskKind::Image => "🖼️",
            TaskKind::Audio => "🎤",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Location and metadata of a downloaded upload
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileRef {
    pub file_path: String,
    pub file_name: String,
    #[serde(default)]
    pub file_size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRequestData {
    pub task_id: TaskId,
    pub chat_id: i64,
    #[serde(default)]
    pub user_id: Option<i64>,
    pub file: FileRef,
}

/// Message published by the main bot on `<kind>_tasks`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRequest {
    pub bot_name: String,
    pub task_type: TaskKind,
    pub data: TaskRequestData,
    pub timestamp: f64,
}

impl TaskRequest {
    pub fn new(kind: TaskKind, data: TaskRequestData) -> Self {
        Self {
            bot_name: MAIN_BOT_NAME.to_string(),
            task_type: kind,
            data,
            timestamp: unix_timestamp(),
        }
    }
}

/// Kind-specific result fields; only the fields of the producing worker are set
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transcription: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ResultBody {
    pub fn document(text: String, summary: String, file_name: String) -> Self {
        Self {
            text: Some(text),
            summary: Some(summary),
            file_name: Some(file_name),
            ..Default::default()
        }
    }

    pub fn audio(transcription: String, summary: String, duration: Option<u32>) -> Self {
        Self {
            transcription: Some(transcription),
            summary: Some(summary),
            duration,
            ..Default::default()
        }
    }

    pub fn image(description: String, analysis: String) -> Self {
        Self {
            description: Some(description),
            analysis: Some(analysis),
            ..Default::default()
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Plain-text rendering used when the result is saved as a file
    pub fn as_plain_text(&self) -> String {
        let sections = [
            ("Summary", &self.summary),
            ("Text", &self.text),
            ("Transcription", &self.transcription),
            ("Description", &self.description),
            ("Analysis", &self.analysis),
        ];

        sections
            .iter()
            .filter_map(|(title, value)| {
                value
                    .as_deref()
                    .filter(|v| !v.trim().is_empty())
                    .map(|v| format!("[{title}]\n{}", v.trim()))
            })
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    /// The shortest meaningful description of the result
    pub fn headline(&self) -> Option<&str> {
        self.summary
            .as_deref()
            .or(self.description.as_deref())
            .or(self.transcription.as_deref())
            .or(self.text.as_deref())
    }
}

/// Message published by a worker on [`RESULTS_CHANNEL`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub bot_name: String,
    #[serde(default)]
    pub task_id: Option<TaskId>,
    pub chat_id: i64,
    #[serde(default)]
    pub result: ResultBody,
    #[serde(default)]
    pub timestamp: f64,
}

impl TaskResult {
    pub fn new(kind: TaskKind, task_id: TaskId, chat_id: i64, result: ResultBody) -> Self {
        Self {
            bot_name: kind.worker_name().to_string(),
            task_id: Some(task_id),
            chat_id,
            result,
            timestamp: unix_timestamp(),
        }
    }

    /// Task kind derived from the producing worker
    pub fn kind(&self) -> Option<TaskKind> {
        TaskKind::from_worker_name(&self.bot_name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressNote {
    pub bot_name: String,
    pub chat_id: i64,
    pub progress: String,
    pub timestamp: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BotStatus {
    pub bot_name: String,
    pub status: String,
    pub timestamp: f64,
}

/// Estimate processing time in seconds for an upload
pub fn estimate_processing_time(kind: TaskKind, file: &FileRef) -> u64 {
    match kind {
        TaskKind::Audio => {
            let duration = file.duration.unwrap_or(60) as f64;
            (duration * 2.5) as u64 + 30
        }
        TaskKind::Document => {
            let name = file.file_name.to_lowercase();
            if name.ends_with(".pdf") {
                let estimated_pages = (file.file_size as f64 / 1024.0 / 1024.0) * 20.0;
                (estimated_pages * 1.5) as u64 + 30
            } else if name.ends_with(".docx") {
                60
            } else if name.ends_with(".txt") {
                30
            } else if name.ends_with(".xlsx") || name.ends_with(".csv") {
                90
            } else {
                60
            }
        }
        TaskKind::Image => 30,
    }
}

/// Format seconds as `45s`, `2m` or `2m 5s`
pub fn format_duration(seconds: u64) -> String {
    if seconds < 60 {
        return format!("{seconds}s");
    }
    let minutes = seconds / 60;
    let rest = seconds % 60;
    if rest > 0 {
        format!("{minutes}m {rest}s")
    } else {
        format!("{minutes}m")
    }
}

/// Format a byte count for display
pub fn format_file_size(size: u64) -> String {
    const KB: f64 = 1024.0;
    let size_f = size as f64;
    if size_f < KB {
        format!("{size} B")
    } else if size_f < KB * KB {
        format!("{:.1} KB", size_f / KB)
    } else if size_f < KB * KB * KB {
        format!("{:.1} MB", size_f / (KB * KB))
    } else {
        format!("{:.1} GB", size_f / (KB * KB * KB))
    }
}

/// Progress estimate at a point in time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressSnapshot {
    pub percent: u8,
    pub remaining_secs: u64,
}

pub fn progress_snapshot(elapsed_secs: u64, estimate_secs: u64) -> ProgressSnapshot {
    if estimate_secs == 0 {
        return ProgressSnapshot {
            percent: 50,
            remaining_secs: 0,
        };
    }

    // Never claim completion before the result is in.
    let percent = (elapsed_secs.saturating_mul(100) / estimate_secs).min(99);
    let remaining_secs = if percent > 0 {
        estimate_secs * (100 - percent) / percent
    } else {
        estimate_secs
    };

    ProgressSnapshot {
        percent: percent as u8,
        remaining_secs,
    }
}

/// Ten-cell progress bar
pub fn progress_bar(percent: u8) -> String {
    let filled = (percent.min(100) / 10) as usize;
    format!("{}{}", "█".repeat(filled), "░".repeat(10 - filled))
}

/// Lowercased extension including the dot, or an empty string
pub fn get_file_extension(file_name: &str) -> String {
    Path::new(file_name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| format!(".{}", ext.to_lowercase()))
        .unwrap_or_default()
}

const TEXT_EXTENSIONS: &[&str] = &[
    ".txt", ".md", ".py", ".js", ".ts", ".jsx", ".tsx", ".html", ".htm", ".css", ".scss", ".json",
    ".xml", ".csv", ".tsv", ".yaml", ".yml", ".ini", ".cfg", ".conf", ".log", ".sql", ".sh",
    ".bat", ".ps1", ".env", ".properties", ".toml", ".r", ".cpp", ".c", ".h", ".hpp", ".java",
    ".kt", ".go", ".rs", ".php", ".rb",
];
const DOCUMENT_EXTENSIONS: &[&str] = &[
    ".pdf", ".docx", ".doc", ".pptx", ".ppt", ".xlsx", ".xls", ".odt", ".rtf",
];
const IMAGE_EXTENSIONS: &[&str] = &[
    ".jpg", ".jpeg", ".png", ".gif", ".bmp", ".webp", ".tiff", ".ico",
];
const AUDIO_EXTENSIONS: &[&str] = &[
    ".mp3", ".wav", ".ogg", ".m4a", ".aac", ".flac", ".wma", ".opus",
];

pub fn is_text_file(file_name: &str) -> bool {
    TEXT_EXTENSIONS.contains(&get_file_extension(file_name).as_str())
}

pub fn is_document_file(file_name: &str) -> bool {
    DOCUMENT_EXTENSIONS.contains(&get_file_extension(file_name).as_str())
}

pub fn is_image_file(file_name: &str) -> bool {
    IMAGE_EXTENSIONS.contains(&get_file_extension(file_name).as_str())
}

pub fn is_audio_file(file_name: &str) -> bool {
    AUDIO_EXTENSIONS.contains(&get_file_extension(file_name).as_str())
}

/// File extension for an audio mime type, `.ogg` when unknown
pub fn audio_extension_for_mime(mime_type: Option<&str>) -> &'static str {
    match mime_type {
        Some("audio/mpeg") => ".mp3",
        Some("audio/wav") | Some("audio/x-wav") => ".wav",
        _ => ".ogg",
    }
}

/// Best-effort mime type from a file name
pub fn guess_mime_type(file_name: &str) -> &'static str {
    match get_file_extension(file_name).as_str() {
        ".pdf" => "application/pdf",
        ".mp3" => "audio/mpeg",
        ".wav" => "audio/wav",
        ".ogg" | ".opus" => "audio/ogg",
        ".m4a" | ".aac" => "audio/aac",
        ".flac" => "audio/flac",
        ".jpg" | ".jpeg" => "image/jpeg",
        ".png" => "image/png",
        ".webp" => "image/webp",
        ".gif" => "image/gif",
        ".csv" => "text/csv",
        ".json" => "application/json",
        _ if is_text_file(file_name) => "text/plain",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_task_id_is_short_hex() {
        let id = new_task_id();
        assert_eq!(id.len(), TASK_ID_LEN);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, new_task_id());
    }

    #[test]
    fn test_audio_estimate_uses_duration() {
        let file = FileRef {
            duration: Some(100),
            ..Default::default()
        };
        assert_eq!(estimate_processing_time(TaskKind::Audio, &file), 280);
        assert_eq!(
            estimate_processing_time(TaskKind::Audio, &FileRef::default()),
            180
        );
    }

    #[test]
    fn test_document_estimate_by_extension() {
        let mut file = FileRef {
            file_name: "report.PDF".to_string(),
            file_size: 1024 * 1024,
            ..Default::default()
        };
        assert_eq!(estimate_processing_time(TaskKind::Document, &file), 60);

        file.file_name = "notes.txt".to_string();
        assert_eq!(estimate_processing_time(TaskKind::Document, &file), 30);

        file.file_name = "sheet.csv".to_string();
        assert_eq!(estimate_processing_time(TaskKind::Document, &file), 90);

        file.file_name = "unknown.bin".to_string();
        assert_eq!(estimate_processing_time(TaskKind::Document, &file), 60);
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(45), "45s");
        assert_eq!(format_duration(120), "2m");
        assert_eq!(format_duration(125), "2m 5s");
    }

    #[test]
    fn test_progress_snapshot_caps_at_99() {
        let snap = progress_snapshot(500, 100);
        assert_eq!(snap.percent, 99);

        let snap = progress_snapshot(0, 100);
        assert_eq!(snap.percent, 0);
        assert_eq!(snap.remaining_secs, 100);

        let snap = progress_snapshot(50, 100);
        assert_eq!(snap.percent, 50);
        assert_eq!(snap.remaining_secs, 100);

        let snap = progress_snapshot(10, 0);
        assert_eq!(snap.percent, 50);
        assert_eq!(snap.remaining_secs, 0);
    }

    #[test]
    fn test_progress_bar() {
        assert_eq!(progress_bar(0), "░░░░░░░░░░");
        assert_eq!(progress_bar(47), "████░░░░░░");
        assert_eq!(progress_bar(99), "█████████░");
    }

    #[test]
    fn test_worker_names_round_trip() {
        for kind in TaskKind::ALL {
            assert_eq!(TaskKind::from_worker_name(kind.worker_name()), Some(kind));
        }
        assert_eq!(TaskKind::from_worker_name("unknown"), None);
        assert_eq!(TaskKind::Audio.request_channel(), "audio_tasks");
    }

    #[test]
    fn test_file_classification() {
        assert!(is_text_file("main.RS"));
        assert!(is_document_file("report.pdf"));
        assert!(is_audio_file("voice.opus"));
        assert!(is_image_file("photo.jpeg"));
        assert!(!is_document_file("archive.zip"));
        assert_eq!(get_file_extension("no_extension"), "");
    }

    #[test]
    fn test_plain_text_skips_empty_sections() {
        let body = ResultBody::document("body".into(), "  ".into(), "a.txt".into());
        assert_eq!(body.as_plain_text(), "[Text]\nbody");
    }
}
