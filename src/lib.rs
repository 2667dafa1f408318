//! # taskrelay
//!
//! A family of Telegram bots. The main bot fans uploads out to worker bots
//! over Redis pub/sub, waits for each task's result, delivers it and then
//! applies the chat's follow-up preferences (prompt, auto-apply or skip).

pub mod actions;
pub mod bot;
pub mod circuit_breaker;
pub mod config;
pub mod correlation;
pub mod db;
pub mod errors;
pub mod followup;
pub mod gemini;
pub mod integrations;
pub mod localization;
pub mod logging;
pub mod messenger;
pub mod preferences;
pub mod reminder;
pub mod task;
pub mod worker;
