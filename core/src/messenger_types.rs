/// Shared types for the Messenger layer
use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Backend-assigned message identifier
pub type MessageId = i64;

/// One row of the profiles table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub id: String,
    pub email: String,
    pub username: String,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

impl Profile {
    /// Default profile row for a freshly authenticated account.
    /// Username falls back to the local part of the e-mail.
    pub fn for_user(user: &AuthUser, username: Option<&str>) -> Self {
        let username = username
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| user.email.split('@').next().unwrap_or_default().to_string());
        let avatar_url = Some(format!(
            "https://ui-avatars.com/api/?name={}&background=random",
            urlencoding::encode(&username)
        ));
        Self {
            id: user.id.clone(),
            email: user.email.clone(),
            username,
            avatar_url,
        }
    }
}

/// A direct message row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Absent until the insert is confirmed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<MessageId>,
    pub content: String,
    pub sender_id: String,
    pub recipient_id: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, alias = "is_read")]
    pub read: bool,
}

impl Message {
    /// Provisional message built on the sending client
    pub fn provisional(content: String, sender_id: String, recipient_id: String) -> Self {
        Self {
            id: None,
            content,
            sender_id,
            recipient_id,
            created_at: now_millis(),
            read: false,
        }
    }

    pub fn is_between(&self, a: &str, b: &str) -> bool {
        (self.sender_id == a && self.recipient_id == b)
            || (self.sender_id == b && self.recipient_id == a)
    }

    /// Same logical message as an unconfirmed local copy
    pub fn same_payload(&self, other: &Message) -> bool {
        self.sender_id == other.sender_id
            && self.recipient_id == other.recipient_id
            && self.created_at == other.created_at
            && self.content == other.content
    }

    pub fn to_insert(&self) -> NewMessage {
        NewMessage {
            content: self.content.clone(),
            sender_id: self.sender_id.clone(),
            recipient_id: self.recipient_id.clone(),
            created_at: self.created_at,
            read: self.read,
        }
    }
}

/// Insert payload for the messages table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMessage {
    pub content: String,
    pub sender_id: String,
    pub recipient_id: String,
    pub created_at: DateTime<Utc>,
    pub read: bool,
}

/// Millisecond precision survives every backend round-trip unchanged
pub fn now_millis() -> DateTime<Utc> {
    let now = Utc::now();
    now.duration_trunc(TimeDelta::milliseconds(1)).unwrap_or(now)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthUser {
    pub id: String,
    #[serde(default)]
    pub email: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthSession {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Unix seconds; absent for sessions that never expire
    #[serde(default)]
    pub expires_at: Option<i64>,
    pub user: AuthUser,
}

impl AuthSession {
    pub fn expires_within(&self, now: DateTime<Utc>, margin_secs: i64) -> bool {
        self.expires_at.is_some_and(|at| at - now.timestamp() <= margin_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthEvent {
    SignedIn(AuthSession),
    SignedOut,
    TokenRefreshed(AuthSession),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    Insert,
    Update,
}

/// A row change delivered by the backend change feed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub message: Message,
}

impl ChangeEvent {
    pub fn insert(message: Message) -> Self {
        Self {
            kind: ChangeKind::Insert,
            message,
        }
    }

    pub fn update(message: Message) -> Self {
        Self {
            kind: ChangeKind::Update,
            message,
        }
    }
}

/// Events streamed to the front end
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessengerEvent {
    /// Contact list (re)loaded
    ContactsLoaded { count: usize },
    /// Timeline for a peer replaced by a fresh fetch
    TimelineLoaded { peer_id: String, count: usize },
    /// A message was added to the open timeline
    MessageAppended { message: Message },
    /// A message in the open timeline changed (read flag, confirmed id)
    MessageUpdated { message: Message },
    /// An optimistic send could not be written
    SendFailed { correlation: Uuid, reason: String },
    /// Fetching a conversation failed; nothing partial is shown
    SyncFailed { peer_id: String, reason: String },
    /// Realtime feed went up (live) or down (polling)
    ListenerStatus { live: bool },
    SignedOut,
}
