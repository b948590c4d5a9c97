/// WhatsChat - direct messaging client core
///
/// Keeps a local view of one-to-one conversations in sync with a hosted
/// backend: optimistic sends, change-feed reconciliation, read receipts and
/// a polling fallback when the realtime feed is down.

pub mod attachments;
pub mod backend;
pub mod cli_app;
pub mod client;
pub mod config;
pub mod conversation_store;
pub mod error;
pub mod fetch;
pub mod listener;
pub mod messenger_types;
pub mod notifications;
pub mod read_state;
pub mod send;
pub mod session;

pub use client::ChatClient;
pub use config::Config;
pub use error::{ChatError, Result};
