//! # Circuit Breaker Module
//!
//! Guards calls to upstream AI services. After repeated failures the breaker
//! opens and calls fail fast until the reset timeout has passed.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::config::RecoveryConfig;

/// Observable breaker state, reported by `/status`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Calls pass through
    Closed,
    /// Failure threshold reached, calls are rejected
    Open,
}

#[derive(Debug, Default)]
struct FailureWindow {
    count: u32,
    last_failure: Option<Instant>,
}

/// Circuit breaker shared by all calls to one upstream service
///
/// - `circuit_breaker_threshold`: failures before opening
/// - `circuit_breaker_reset_secs`: time before calls are let through again
#[derive(Debug)]
pub struct CircuitBreaker {
    window: Mutex<FailureWindow>,
    threshold: u32,
    reset_after: Duration,
}

impl CircuitBreaker {
    pub fn new(config: &RecoveryConfig) -> Self {
        Self {
            window: Mutex::new(FailureWindow::default()),
            threshold: config.circuit_breaker_threshold.max(1),
            reset_after: Duration::from_secs(config.circuit_breaker_reset_secs),
        }
    }

    /// Check if the breaker is rejecting calls
    ///
    /// An open breaker whose reset timeout has elapsed closes again here.
    pub fn is_open(&self) -> bool {
        let mut window = self.window.lock().unwrap_or_else(|e| e.into_inner());

        if window.count < self.threshold {
            return false;
        }
        match window.last_failure {
            Some(at) if at.elapsed() < self.reset_after => true,
            _ => {
                *window = FailureWindow::default();
                false
            }
        }
    }

    pub fn state(&self) -> BreakerState {
        if self.is_open() {
            BreakerState::Open
        } else {
            BreakerState::Closed
        }
    }

    pub fn record_failure(&self) {
        let mut window = self.window.lock().unwrap_or_else(|e| e.into_inner());
        window.count = window.count.saturating_add(1);
        window.last_failure = Some(Instant::now());
    }

    pub fn record_success(&self) {
        let mut window = self.window.lock().unwrap_or_else(|e| e.into_inner());
        *window = FailureWindow::default();
    }
}
