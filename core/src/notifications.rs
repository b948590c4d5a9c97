/// Desktop-style notifications for messages outside the open conversation
use crate::attachments::is_image_content;
use async_trait::async_trait;
use colored::*;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

/// Shown instead of an embedded image payload
pub const IMAGE_PLACEHOLDER: &str = "📷 Image";
const MAX_BODY_CHARS: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub title: String,
    pub body: String,
    pub icon: Option<String>,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Ask for permission to display. Returns whether it was granted.
    async fn request_permission(&self) -> bool;

    async fn display(&self, notification: Notification);
}

/// Notification body for a message: images collapse to a placeholder,
/// long text is cut at 100 characters.
pub fn summarize_content(content: &str) -> String {
    if is_image_content(content) {
        return IMAGE_PLACEHOLDER.to_string();
    }
    let mut chars = content.chars();
    let head: String = chars.by_ref().take(MAX_BODY_CHARS).collect();
    if chars.next().is_some() {
        format!("{}…", head)
    } else {
        head
    }
}

/// Prints notifications as highlighted lines in the terminal
#[derive(Debug, Default)]
pub struct TerminalNotifier {
    granted: AtomicBool,
}

impl TerminalNotifier {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Notifier for TerminalNotifier {
    async fn request_permission(&self) -> bool {
        self.granted.store(true, Ordering::SeqCst);
        true
    }

    async fn display(&self, notification: Notification) {
        if !self.granted.load(Ordering::SeqCst) {
            debug!("Notification dropped, permission not granted");
            return;
        }
        println!(
            "\n{} {} {}",
            "🔔".bright_yellow(),
            notification.title.bright_white().bold(),
            notification.body.dimmed()
        );
    }
}

/// Discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullNotifier;

#[async_trait]
impl Notifier for NullNotifier {
    async fn request_permission(&self) -> bool {
        false
    }

    async fn display(&self, _notification: Notification) {}
}
