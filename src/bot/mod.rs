//! Bot module for handling Telegram interactions
//!
//! This module is split into several submodules:
//! - `message_handler`: Handles commands, chat text and uploads
//! - `callback_handler`: Handles inline keyboard callback queries
//! - `dispatch`: Sends uploads to the worker bots and delivers their results
//! - `notifier`: Telegram side of the follow-up engine
//! - `ui_builder`: Creates keyboards and formats messages
//! - `state`: State shared by all handlers

pub mod callback_handler;
pub mod dispatch;
pub mod message_handler;
pub mod notifier;
pub mod state;
pub mod ui_builder;

// Re-export main handler functions for use in main.rs
pub use callback_handler::callback_handler;
pub use message_handler::message_handler;

pub use dispatch::{deliver_result, process_unclaimed};
pub use notifier::TelegramFollowupSink;
pub use state::{AppState, WorkerDirectory};
