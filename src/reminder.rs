//! # Reminder Module
//!
//! Parsing for `/remind <time> [message]` and the timer that fires it.
//! Times are a number with a unit, and parts may be chained (`1h30m`).

use regex::Regex;
use std::future::Future;
use std::sync::LazyLock;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

/// Reminders closer than this fire after this delay instead
pub const MIN_REMINDER_DELAY: Duration = Duration::from_secs(5);
pub const MAX_REMINDER_DELAY: Duration = Duration::from_secs(30 * 24 * 60 * 60);

// Longer unit spellings come first so `min` is not read as `m` + `in`
static DURATION_PART: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(\d+)(seconds|second|secs|sec|s|초|minutes|minute|mins|min|m|분|hours|hour|hrs|hr|h|시간|days|day|d|일)")
        .expect("Duration pattern should be valid")
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReminderRequest {
    pub delay: Duration,
    /// `None` when the user gave only a time
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReminderError {
    /// No arguments at all
    Usage,
    /// The time could not be read or is out of range
    InvalidTime,
}

fn unit_seconds(unit: &str) -> Option<u64> {
    match unit.to_lowercase().as_str() {
        "s" | "sec" | "secs" | "second" | "seconds" | "초" => Some(1),
        "m" | "min" | "mins" | "minute" | "minutes" | "분" => Some(60),
        "h" | "hr" | "hrs" | "hour" | "hours" | "시간" => Some(60 * 60),
        "d" | "day" | "days" | "일" => Some(24 * 60 * 60),
        _ => None,
    }
}

/// Parse a time token such as `10m`, `2h` or `1h30m`
pub fn parse_delay(token: &str) -> Option<Duration> {
    let mut total: u64 = 0;
    let mut end = 0;

    for caps in DURATION_PART.captures_iter(token) {
        let whole = caps.get(0)?;
        if whole.start() != end {
            return None;
        }
        end = whole.end();

        let value: u64 = caps[1].parse().ok()?;
        let seconds = value.checked_mul(unit_seconds(&caps[2])?)?;
        total = total.checked_add(seconds)?;
    }

    if end == 0 || end != token.len() {
        return None;
    }
    Some(Duration::from_secs(total))
}

/// Parse the arguments following `/remind`
pub fn parse_command(args: &str) -> Result<ReminderRequest, ReminderError> {
    let args = args.trim();
    let Some(token) = args.split_whitespace().next() else {
        return Err(ReminderError::Usage);
    };

    let delay = parse_delay(token).ok_or(ReminderError::InvalidTime)?;
    if delay > MAX_REMINDER_DELAY {
        return Err(ReminderError::InvalidTime);
    }

    let message = args[token.len()..].trim();
    Ok(ReminderRequest {
        delay: delay.max(MIN_REMINDER_DELAY),
        message: (!message.is_empty()).then(|| message.to_string()),
    })
}

/// `1d 2h 30m`-style text for a delay
pub fn describe_delay(delay: Duration) -> String {
    let total = delay.as_secs();
    let parts = [
        (total / 86_400, "d"),
        (total % 86_400 / 3_600, "h"),
        (total % 3_600 / 60, "m"),
        (total % 60, "s"),
    ];
    let text: Vec<String> = parts
        .iter()
        .filter(|(value, _)| *value > 0)
        .map(|(value, unit)| format!("{value}{unit}"))
        .collect();
    if text.is_empty() {
        "0s".to_string()
    } else {
        text.join(" ")
    }
}

/// Run `fire` once `delay` has passed
pub fn spawn_reminder<F, Fut>(delay: Duration, fire: F) -> JoinHandle<()>
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        debug!(delay_secs = delay.as_secs(), "Reminder due");
        fire().await;
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_parse_delay_units() {
        assert_eq!(parse_delay("10m"), Some(Duration::from_secs(600)));
        assert_eq!(parse_delay("2h"), Some(Duration::from_secs(7200)));
        assert_eq!(parse_delay("1h30m"), Some(Duration::from_secs(5400)));
        assert_eq!(parse_delay("45sec"), Some(Duration::from_secs(45)));
        assert_eq!(parse_delay("3mins"), Some(Duration::from_secs(180)));
        assert_eq!(parse_delay("1D"), Some(Duration::from_secs(86_400)));
        assert_eq!(parse_delay("10분"), Some(Duration::from_secs(600)));
        assert_eq!(parse_delay("1시간30분"), Some(Duration::from_secs(5400)));
    }

    #[test]
    fn test_parse_delay_rejects_garbage() {
        assert_eq!(parse_delay(""), None);
        assert_eq!(parse_delay("10"), None);
        assert_eq!(parse_delay("m10"), None);
        assert_eq!(parse_delay("10x"), None);
        assert_eq!(parse_delay("1h 30m"), None);
        assert_eq!(parse_delay("tomorrow"), None);
        assert_eq!(parse_delay("99999999999999999999d"), None);
    }

    #[test]
    fn test_parse_command() {
        assert_eq!(parse_command("   "), Err(ReminderError::Usage));
        assert_eq!(parse_command("soon call mom"), Err(ReminderError::InvalidTime));
        assert_eq!(parse_command("31d too far"), Err(ReminderError::InvalidTime));

        let request = parse_command("1h30m 점심예약 전화").unwrap();
        assert_eq!(request.delay, Duration::from_secs(5400));
        assert_eq!(request.message.as_deref(), Some("점심예약 전화"));

        let request = parse_command("10m").unwrap();
        assert_eq!(request.message, None);

        // Very short delays are raised to the minimum
        assert_eq!(parse_command("0s ping").unwrap().delay, MIN_REMINDER_DELAY);
    }

    #[test]
    fn test_describe_delay() {
        assert_eq!(describe_delay(Duration::from_secs(5400)), "1h 30m");
        assert_eq!(describe_delay(Duration::from_secs(93_605)), "1d 2h 5s");
        assert_eq!(describe_delay(Duration::ZERO), "0s");
    }

    #[tokio::test]
    async fn test_spawn_reminder_fires_after_delay() {
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        let handle = spawn_reminder(Duration::from_millis(20), move || async move {
            flag.store(true, Ordering::SeqCst);
        });

        assert!(!fired.load(Ordering::SeqCst));
        handle.await.unwrap();
        assert!(fired.load(Ordering::SeqCst));
    }
}
