/// Error types for the chat client
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChatError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Missing or invalid backend connection details
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid credentials, duplicate sign-up, expired session
    #[error("Authentication error: {0}")]
    Auth(String),

    /// Profile row could not be created or upserted
    #[error("Profile sync error: {0}")]
    ProfileSync(String),

    /// A read query failed; the affected view shows "sync failed"
    #[error("Sync failed: {0}")]
    Query(String),

    #[error("Send failed: {0}")]
    Send(String),

    #[error("Image error: {0}")]
    Image(String),

    #[error("Subscription error: {0}")]
    Subscription(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Not signed in")]
    NotSignedIn,
}

impl ChatError {
    /// Only configuration errors stop the app; everything else is shown inline
    pub fn is_fatal(&self) -> bool {
        matches!(self, ChatError::Config(_))
    }
}

impl From<reqwest::Error> for ChatError {
    fn from(e: reqwest::Error) -> Self {
        ChatError::Http(e.to_string())
    }
}

impl From<sled::Error> for ChatError {
    fn from(e: sled::Error) -> Self {
        ChatError::Storage(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ChatError>;
