use taskrelay::bot::dispatch::{classify_document, validate_upload, Upload, UploadRejection};
use taskrelay::bot::ui_builder::*;
use taskrelay::circuit_breaker::CircuitBreaker;
use taskrelay::config::{RecoveryConfig, MAX_UPLOAD_SIZE};
use taskrelay::errors::RelayError;
use taskrelay::followup::{CallbackCommand, FollowupMeta, FollowupRecord};
use taskrelay::localization::init_localization;
use taskrelay::preferences::{ActionCode, Mode, Preferences};
use taskrelay::task::{new_task_id, ResultBody, TaskKind};
use teloxide::types::{InlineKeyboardButtonKind, InlineKeyboardMarkup};

#[cfg(test)]
mod tests {
    use super::*;

    fn setup_localization() {
        // Initialize localization if not already done
        let _ = init_localization();
    }

    fn all_callback_data(keyboard: &InlineKeyboardMarkup) -> Vec<String> {
        keyboard
            .inline_keyboard
            .iter()
            .flatten()
            .filter_map(|button| match &button.kind {
                InlineKeyboardButtonKind::CallbackData(data) => Some(data.clone()),
                _ => None,
            })
            .collect()
    }

    fn record(kind: TaskKind) -> FollowupRecord {
        FollowupRecord {
            task_id: new_task_id(),
            chat_id: 1,
            kind,
            result: ResultBody::document("text".into(), "summary".into(), "report.pdf".into()),
            meta: FollowupMeta {
                file_id: Some("file-1".to_string()),
                file_name: Some("report.pdf".to_string()),
                mime_type: Some("application/pdf".to_string()),
            },
            language_code: Some("en".to_string()),
        }
    }

    /// Every button the bot sends must round-trip through the callback parser
    #[test]
    fn test_keyboards_produce_parseable_callback_data() {
        setup_localization();

        for kind in TaskKind::ALL {
            for data in all_callback_data(&create_followup_keyboard(&record(kind))) {
                assert!(CallbackCommand::parse(&data).is_some(), "unparseable: {data}");
                // Telegram rejects callback data above 64 bytes
                assert!(data.len() <= 64, "too long: {data}");
            }
        }

        let prefs = Preferences::default();
        for data in all_callback_data(&create_settings_keyboard(&prefs, Some("ko"))) {
            assert!(CallbackCommand::parse(&data).is_some(), "unparseable: {data}");
        }
    }

    #[test]
    fn test_followup_prompt_mentions_file_and_mode() {
        setup_localization();

        let mut prefs = Preferences::default();
        prefs.mode = Mode::Auto;
        let text = format_followup_prompt(&record(TaskKind::Document), &prefs);
        assert!(text.contains("report.pdf"));
        assert!(text.contains("Automatic"));
    }

    #[test]
    fn test_document_result_sections() {
        setup_localization();

        let body = ResultBody::document(
            "x".repeat(SECTION_LIMIT * 2),
            "Short summary".to_string(),
            "notes.txt".to_string(),
        );
        let text = format_result(TaskKind::Document, &body, Some("en"));
        assert!(text.contains("notes.txt"));
        assert!(text.contains("Short summary"));
        // The excerpt is cut to one section
        assert!(text.contains("..."));
        assert!(text.chars().count() < SECTION_LIMIT * 2);
    }

    #[test]
    fn test_audio_result_shows_duration() {
        setup_localization();

        let body = ResultBody::audio("hello".to_string(), "greeting".to_string(), Some(125));
        let text = format_result(TaskKind::Audio, &body, Some("en"));
        assert!(text.contains("2m 5s"));
        assert!(text.contains("hello"));

        let body = ResultBody::audio("hello".to_string(), "greeting".to_string(), Some(0));
        assert!(!format_result(TaskKind::Audio, &body, Some("en")).contains("Duration"));
    }

    #[test]
    fn test_progress_message() {
        setup_localization();

        let text = format_progress(TaskKind::Image, "cat.jpg", 15, 30, Some("en"));
        assert!(text.contains("cat.jpg"));
        assert!(text.contains("50%"));
        assert!(text.contains("█████░░░░░"));
        assert!(text.contains("15s"));
    }

    #[test]
    fn test_settings_text_lists_every_kind() {
        setup_localization();

        let mut prefs = Preferences::default();
        prefs.default_actions.image = ActionCode::ImageOriginalSummary;
        let text = format_settings(&prefs, Some("en"));
        assert!(text.contains("Document: Do nothing"));
        assert!(text.contains("Image: Save original + summary"));
        assert!(text.contains("Slack: ON"));
        assert!(text.contains("Notion: OFF"));
    }

    #[test]
    fn test_classify_document_uploads() {
        assert_eq!(classify_document("report.pdf", None), Some(TaskKind::Document));
        assert_eq!(classify_document("notes.md", None), Some(TaskKind::Document));
        assert_eq!(classify_document("memo", Some("text/plain")), Some(TaskKind::Document));
        assert_eq!(classify_document("song.mp3", None), Some(TaskKind::Audio));
        assert_eq!(classify_document("clip", Some("audio/ogg")), Some(TaskKind::Audio));
        assert_eq!(classify_document("scan.png", None), Some(TaskKind::Image));
        assert_eq!(classify_document("archive.zip", Some("application/zip")), None);
    }

    #[test]
    fn test_upload_validation() {
        let upload = Upload {
            kind: TaskKind::Document,
            file_id: "f".to_string(),
            file_name: "report.pdf".to_string(),
            file_size: 1024,
            mime_type: Some("application/pdf".to_string()),
            duration: None,
        };
        assert_eq!(validate_upload(&upload, MAX_UPLOAD_SIZE), Ok(()));

        let too_large = Upload {
            file_size: MAX_UPLOAD_SIZE + 1,
            ..upload.clone()
        };
        assert_eq!(
            validate_upload(&too_large, MAX_UPLOAD_SIZE),
            Err(UploadRejection::TooLarge)
        );

        let binary = Upload {
            file_name: "setup.exe".to_string(),
            mime_type: None,
            ..upload
        };
        assert_eq!(
            validate_upload(&binary, MAX_UPLOAD_SIZE),
            Err(UploadRejection::Unsupported)
        );
    }

    /// Test circuit breaker initialization
    #[test]
    fn test_circuit_breaker_initialization() {
        let config = RecoveryConfig {
            circuit_breaker_threshold: 2,
            ..Default::default()
        };
        let circuit_breaker = CircuitBreaker::new(&config);

        // Initially should not be open
        assert!(!circuit_breaker.is_open());
        circuit_breaker.record_failure();
        circuit_breaker.record_failure();
        assert!(circuit_breaker.is_open());
    }

    /// Test error message formatting
    #[test]
    fn test_error_message_formatting() {
        let error = RelayError::Unsupported("archive.zip".to_string());
        assert_eq!(format!("{}", error), "Unsupported input: archive.zip");
        assert_eq!(error.message_key(), "error-unsupported-format");
        assert!(!error.is_transient());

        let error = RelayError::Timeout("no answer".to_string());
        assert_eq!(format!("{}", error), "Timeout error: no answer");
        assert!(error.is_transient());

        let error = RelayError::CircuitOpen("gemini".to_string());
        assert_eq!(error.message_key(), "error-circuit-open");

        let error = RelayError::Rejected("Gemini returned 400 Bad Request".to_string());
        assert_eq!(format!("{}", error), "Rejected request: Gemini returned 400 Bad Request");
        assert_eq!(error.message_key(), "error-rejected");
        assert!(!error.is_transient());
    }

    /// File system failures are reported as such, not as a bad upload
    #[test]
    fn test_io_errors_keep_their_own_variant() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "permission denied");
        let error = RelayError::from(io);
        assert!(matches!(error, RelayError::Io(_)));
        assert_eq!(error.message_key(), "error-io");
        assert_eq!(format!("{}", error), "I/O error: permission denied");
        assert!(!error.is_transient());
    }
}
