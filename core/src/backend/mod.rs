/// Backend capability interface
///
/// Authentication, storage and the change feed all live in the hosted
/// backend. The client only ever talks to it through [`Backend`], which has
/// exactly one implementation per concrete backend.
pub mod local;
pub mod supabase;

use crate::error::Result;
use crate::messenger_types::{AuthEvent, AuthSession, AuthUser, ChangeEvent, Message, NewMessage, Profile};
use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, oneshot};

pub use local::LocalBackend;
pub use supabase::SupabaseBackend;

/// Capacity of the per-subscription change channel
pub(crate) const SUBSCRIPTION_BUFFER: usize = 256;

/// Equality filters for reads and read-flag updates.
/// Rows always come back ordered by `created_at` ascending.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageFilter {
    pub sender_id: Option<String>,
    pub recipient_id: Option<String>,
    pub read: Option<bool>,
}

impl MessageFilter {
    /// Messages sent by `sender` to `recipient`
    pub fn direction(sender: &str, recipient: &str) -> Self {
        Self {
            sender_id: Some(sender.to_string()),
            recipient_id: Some(recipient.to_string()),
            read: None,
        }
    }

    /// Unread messages sent by `sender` to `recipient`
    pub fn unread(sender: &str, recipient: &str) -> Self {
        Self {
            read: Some(false),
            ..Self::direction(sender, recipient)
        }
    }

    pub fn matches(&self, msg: &Message) -> bool {
        self.sender_id.as_deref().map_or(true, |s| s == msg.sender_id)
            && self.recipient_id.as_deref().map_or(true, |r| r == msg.recipient_id)
            && self.read.map_or(true, |r| r == msg.read)
    }
}

/// A live change feed.
///
/// Events arrive on the receiver until the feed is torn down or its transport
/// dies; either way the receiver then yields `None`.
pub struct Subscription {
    events: mpsc::Receiver<ChangeEvent>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl Subscription {
    pub fn new(events: mpsc::Receiver<ChangeEvent>, shutdown: oneshot::Sender<()>) -> Self {
        Self {
            events,
            shutdown: Some(shutdown),
        }
    }

    /// Next change, `None` once the feed is gone
    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        self.events.recv().await
    }

    /// Tear down the feed on the backend side
    pub fn close(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        self.events.close();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close();
    }
}

#[async_trait]
pub trait Backend: Send + Sync {
    /// Create an account. Does not sign in.
    async fn sign_up(&self, email: &str, password: &str) -> Result<AuthUser>;

    async fn sign_in(&self, email: &str, password: &str) -> Result<AuthSession>;

    async fn sign_out(&self) -> Result<()>;

    /// Locally known session, if any
    async fn get_session(&self) -> Result<Option<AuthSession>>;

    /// Principal as confirmed by the backend right now
    async fn get_user(&self) -> Result<Option<AuthUser>>;

    fn on_auth_state_change(&self) -> broadcast::Receiver<AuthEvent>;

    /// Insert or replace the profile row keyed by id
    async fn upsert_profile(&self, profile: &Profile) -> Result<()>;

    /// Plain insert; fails if the row already exists
    async fn insert_profile(&self, profile: &Profile) -> Result<()>;

    /// All profiles except `exclude_id`
    async fn list_profiles(&self, exclude_id: &str) -> Result<Vec<Profile>>;

    async fn query_messages(&self, filter: &MessageFilter) -> Result<Vec<Message>>;

    /// Durable insert; returns the row with its assigned id
    async fn insert_message(&self, message: &NewMessage) -> Result<Message>;

    /// Set `read = true` on every row matching `filter`; returns the changed rows
    async fn update_read(&self, filter: &MessageFilter) -> Result<Vec<Message>>;

    /// Insert and update events for the whole messages table
    async fn subscribe(&self) -> Result<Subscription>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messenger_types::now_millis;

    fn msg(sender: &str, recipient: &str, read: bool) -> Message {
        Message {
            id: Some(1),
            content: "hi".to_string(),
            sender_id: sender.to_string(),
            recipient_id: recipient.to_string(),
            created_at: now_millis(),
            read,
        }
    }

    #[test]
    fn test_filter_matching() {
        let f = MessageFilter::direction("a", "b");
        assert!(f.matches(&msg("a", "b", true)));
        assert!(!f.matches(&msg("b", "a", false)));

        let unread = MessageFilter::unread("a", "b");
        assert!(unread.matches(&msg("a", "b", false)));
        assert!(!unread.matches(&msg("a", "b", true)));

        assert!(MessageFilter::default().matches(&msg("x", "y", true)));
    }

    #[tokio::test]
    async fn test_subscription_close_ends_stream() {
        let (tx, rx) = mpsc::channel(4);
        let (stop_tx, stop_rx) = oneshot::channel();
        let mut sub = Subscription::new(rx, stop_tx);

        tx.send(ChangeEvent::insert(msg("a", "b", false))).await.unwrap();
        assert!(sub.recv().await.is_some());

        sub.close();
        assert!(stop_rx.await.is_ok());
        assert!(sub.recv().await.is_none());
    }
}
