/// Local backend: accounts, profiles and messages in an embedded sled DB
/// with an in-process change feed. Used offline and as the test double for
/// the hosted backend.
use super::{Backend, MessageFilter, Subscription, SUBSCRIPTION_BUFFER};
use crate::error::{ChatError, Result};
use crate::messenger_types::{
    AuthEvent, AuthSession, AuthUser, ChangeEvent, Message, MessageId, NewMessage, Profile,
};
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

const MIN_PASSWORD_LEN: usize = 6;
const FEED_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct UserRecord {
    id: String,
    email: String,
    password_sha256: String,
}

/// State shared by every handle opened on the same store
struct Shared {
    users: sled::Tree,
    profiles: sled::Tree,
    messages: sled::Tree,
    db: sled::Db,
    feed: broadcast::Sender<ChangeEvent>,
    realtime: watch::Sender<bool>,
    /// Serializes read-modify-write updates
    write_lock: Mutex<()>,
}

/// One client's view of the local backend (one "tab")
pub struct LocalBackend {
    shared: Arc<Shared>,
    session: RwLock<Option<AuthSession>>,
    auth_tx: broadcast::Sender<AuthEvent>,
}

fn hash_password(email: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(email.as_bytes());
    hasher.update(b":");
    hasher.update(password.as_bytes());
    general_purpose::STANDARD.encode(hasher.finalize())
}

fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

impl LocalBackend {
    /// Open (or create) the store in `data_dir`
    pub fn open(data_dir: &Path) -> Result<Self> {
        let db_path = data_dir.join("local.db");
        let db = sled::open(&db_path)
            .map_err(|e| ChatError::Storage(format!("Failed to open local DB: {}", e)))?;
        info!("Local backend opened at {:?}", db_path);
        Self::from_db(db)
    }

    /// Throwaway store, removed on drop
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(|e| ChatError::Storage(format!("Failed to open temporary DB: {}", e)))?;
        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> Result<Self> {
        let (feed, _) = broadcast::channel(FEED_CAPACITY);
        let (realtime, _) = watch::channel(true);
        let shared = Shared {
            users: db.open_tree("users")?,
            profiles: db.open_tree("profiles")?,
            messages: db.open_tree("messages")?,
            db,
            feed,
            realtime,
            write_lock: Mutex::new(()),
        };
        Ok(Self::with_shared(Arc::new(shared)))
    }

    fn with_shared(shared: Arc<Shared>) -> Self {
        let (auth_tx, _) = broadcast::channel(16);
        Self {
            shared,
            session: RwLock::new(None),
            auth_tx,
        }
    }

    /// Another client on the same store with its own session
    pub fn connect(&self) -> Self {
        Self::with_shared(self.shared.clone())
    }

    /// Switch the change feed on or off. Turning it off also ends every
    /// open subscription, as a dropped realtime connection would.
    pub fn set_realtime_available(&self, available: bool) {
        self.shared.realtime.send_replace(available);
        if !available {
            warn!("Local realtime feed disabled");
        }
    }

    async fn session_user(&self) -> Result<AuthUser> {
        self.session
            .read()
            .await
            .as_ref()
            .map(|s| s.user.clone())
            .ok_or(ChatError::NotSignedIn)
    }

    fn load_message(value: &[u8]) -> Option<Message> {
        serde_json::from_slice::<Message>(value).ok()
    }

    fn store_message(&self, id: MessageId, msg: &Message) -> Result<()> {
        let value = serde_json::to_vec(msg).map_err(ChatError::Serialization)?;
        self.shared
            .messages
            .insert(id.to_be_bytes(), value)
            .map_err(|e| ChatError::Storage(format!("Failed to save message: {}", e)))?;
        Ok(())
    }

    fn publish(&self, event: ChangeEvent) {
        // No subscribers is fine
        let _ = self.shared.feed.send(event);
    }
}

#[async_trait]
impl Backend for LocalBackend {
    async fn sign_up(&self, email: &str, password: &str) -> Result<AuthUser> {
        let email = normalize_email(email);
        if !email.contains('@') {
            return Err(ChatError::Auth("Invalid e-mail address".to_string()));
        }
        if password.len() < MIN_PASSWORD_LEN {
            return Err(ChatError::Auth(format!(
                "Password should be at least {} characters",
                MIN_PASSWORD_LEN
            )));
        }

        let record = UserRecord {
            id: Uuid::new_v4().to_string(),
            email: email.clone(),
            password_sha256: hash_password(&email, password),
        };
        let value = serde_json::to_vec(&record).map_err(ChatError::Serialization)?;
        let swapped = self
            .shared
            .users
            .compare_and_swap(email.as_bytes(), None as Option<&[u8]>, Some(value))?;
        if swapped.is_err() {
            return Err(ChatError::Auth("User already registered".to_string()));
        }

        self.shared.db.flush()?;
        debug!("Local sign-up for {}", email);
        Ok(AuthUser {
            id: record.id,
            email: record.email,
        })
    }

    async fn sign_in(&self, email: &str, password: &str) -> Result<AuthSession> {
        let email = normalize_email(email);
        let record = match self.shared.users.get(email.as_bytes())? {
            Some(value) => serde_json::from_slice::<UserRecord>(&value)?,
            None => return Err(ChatError::Auth("Invalid login credentials".to_string())),
        };
        if record.password_sha256 != hash_password(&email, password) {
            return Err(ChatError::Auth("Invalid login credentials".to_string()));
        }

        let session = AuthSession {
            access_token: Uuid::new_v4().to_string(),
            refresh_token: None,
            expires_at: None,
            user: AuthUser {
                id: record.id,
                email: record.email,
            },
        };
        *self.session.write().await = Some(session.clone());
        let _ = self.auth_tx.send(AuthEvent::SignedIn(session.clone()));
        Ok(session)
    }

    async fn sign_out(&self) -> Result<()> {
        let previous = self.session.write().await.take();
        if previous.is_some() {
            let _ = self.auth_tx.send(AuthEvent::SignedOut);
        }
        Ok(())
    }

    async fn get_session(&self) -> Result<Option<AuthSession>> {
        Ok(self.session.read().await.clone())
    }

    async fn get_user(&self) -> Result<Option<AuthUser>> {
        let Some(user) = self.session.read().await.as_ref().map(|s| s.user.clone()) else {
            return Ok(None);
        };
        // The account must still exist
        match self.shared.users.get(user.email.as_bytes())? {
            Some(value) => {
                let record: UserRecord = serde_json::from_slice(&value)?;
                Ok((record.id == user.id).then_some(user))
            }
            None => Ok(None),
        }
    }

    fn on_auth_state_change(&self) -> broadcast::Receiver<AuthEvent> {
        self.auth_tx.subscribe()
    }

    async fn upsert_profile(&self, profile: &Profile) -> Result<()> {
        let value = serde_json::to_vec(profile).map_err(ChatError::Serialization)?;
        self.shared
            .profiles
            .insert(profile.id.as_bytes(), value)
            .map_err(|e| ChatError::ProfileSync(format!("upsert_profile: {}", e)))?;
        self.shared.db.flush()?;
        Ok(())
    }

    async fn insert_profile(&self, profile: &Profile) -> Result<()> {
        let value = serde_json::to_vec(profile).map_err(ChatError::Serialization)?;
        let swapped = self
            .shared
            .profiles
            .compare_and_swap(profile.id.as_bytes(), None as Option<&[u8]>, Some(value))
            .map_err(|e| ChatError::ProfileSync(format!("insert_profile: {}", e)))?;
        swapped.map_err(|_| {
            ChatError::ProfileSync(format!("Profile {} already exists", profile.id))
        })
    }

    async fn list_profiles(&self, exclude_id: &str) -> Result<Vec<Profile>> {
        let mut out = Vec::new();
        for entry in self.shared.profiles.iter() {
            let (_, value) = entry.map_err(|e| ChatError::Query(format!("list_profiles: {}", e)))?;
            if let Ok(p) = serde_json::from_slice::<Profile>(&value) {
                if p.id != exclude_id {
                    out.push(p);
                }
            }
        }
        Ok(out)
    }

    async fn query_messages(&self, filter: &MessageFilter) -> Result<Vec<Message>> {
        let mut out = Vec::new();
        for entry in self.shared.messages.iter() {
            let (_, value) = entry.map_err(|e| ChatError::Query(format!("query_messages: {}", e)))?;
            if let Some(msg) = Self::load_message(&value) {
                if filter.matches(&msg) {
                    out.push(msg);
                }
            }
        }
        out.sort_by_key(|m| m.created_at);
        Ok(out)
    }

    async fn insert_message(&self, message: &NewMessage) -> Result<Message> {
        let user = self.session_user().await?;
        if user.id != message.sender_id {
            return Err(ChatError::Send(
                "new row violates row-level security policy (sender_id)".to_string(),
            ));
        }
        if message.sender_id == message.recipient_id {
            return Err(ChatError::Send("sender and recipient must differ".to_string()));
        }

        let id = self.shared.db.generate_id()? as MessageId + 1;
        let stored = Message {
            id: Some(id),
            content: message.content.clone(),
            sender_id: message.sender_id.clone(),
            recipient_id: message.recipient_id.clone(),
            created_at: message.created_at,
            read: message.read,
        };
        self.store_message(id, &stored)?;
        debug!("Stored message {} from {}", id, stored.sender_id);

        self.publish(ChangeEvent::insert(stored.clone()));
        Ok(stored)
    }

    async fn update_read(&self, filter: &MessageFilter) -> Result<Vec<Message>> {
        let user = self.session_user().await?;
        if filter.recipient_id.as_deref() != Some(user.id.as_str()) {
            return Err(ChatError::Query(
                "only the recipient may update the read flag".to_string(),
            ));
        }

        let _guard = self.shared.write_lock.lock().await;
        let mut updated = Vec::new();
        for entry in self.shared.messages.iter() {
            let (_, value) = entry.map_err(|e| ChatError::Query(format!("update_read: {}", e)))?;
            let Some(mut msg) = Self::load_message(&value) else {
                continue;
            };
            if msg.read || !filter.matches(&msg) {
                continue;
            }
            let Some(id) = msg.id else { continue };
            msg.read = true;
            self.store_message(id, &msg)?;
            updated.push(msg);
        }
        drop(_guard);

        for msg in &updated {
            self.publish(ChangeEvent::update(msg.clone()));
        }
        Ok(updated)
    }

    async fn subscribe(&self) -> Result<Subscription> {
        let mut realtime = self.shared.realtime.subscribe();
        if !*realtime.borrow_and_update() {
            return Err(ChatError::Subscription("realtime unavailable".to_string()));
        }

        let mut feed = self.shared.feed.subscribe();
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    changed = realtime.changed() => {
                        if changed.is_err() || !*realtime.borrow() {
                            debug!("Local feed closed");
                            break;
                        }
                    }
                    event = feed.recv() => match event {
                        Ok(event) => {
                            if tx.send(event).await.is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!("Local feed subscriber lagged {} events", n);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });

        Ok(Subscription::new(rx, stop_tx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messenger_types::now_millis;
    use tempfile::TempDir;

    fn new_message(from: &str, to: &str, content: &str) -> NewMessage {
        NewMessage {
            content: content.to_string(),
            sender_id: from.to_string(),
            recipient_id: to.to_string(),
            created_at: now_millis(),
            read: false,
        }
    }

    #[tokio::test]
    async fn test_sign_up_and_sign_in() {
        let backend = LocalBackend::temporary().unwrap();
        let user = backend.sign_up("Ana@Example.com", "secret1").await.unwrap();
        assert_eq!(user.email, "ana@example.com");

        let dup = backend.sign_up("ana@example.com", "secret1").await;
        assert!(matches!(dup, Err(ChatError::Auth(_))));

        let bad = backend.sign_in("ana@example.com", "wrong-pass").await;
        assert!(matches!(bad, Err(ChatError::Auth(_))));

        let session = backend.sign_in("ana@example.com", "secret1").await.unwrap();
        assert_eq!(session.user.id, user.id);
        assert_eq!(backend.get_user().await.unwrap(), Some(user));

        backend.sign_out().await.unwrap();
        assert!(backend.get_session().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_insert_requires_matching_sender() {
        let backend = LocalBackend::temporary().unwrap();
        let ana = backend.sign_up("ana@example.com", "secret1").await.unwrap();
        backend.sign_in("ana@example.com", "secret1").await.unwrap();

        let forged = backend.insert_message(&new_message("someone-else", &ana.id, "x")).await;
        assert!(matches!(forged, Err(ChatError::Send(_))));

        let ok = backend.insert_message(&new_message(&ana.id, "bob", "oi")).await.unwrap();
        assert!(ok.id.is_some());
    }

    #[tokio::test]
    async fn test_update_read_only_touches_unread_rows() {
        let backend = LocalBackend::temporary().unwrap();
        let ana = backend.sign_up("ana@example.com", "secret1").await.unwrap();
        let bob = backend.sign_up("bob@example.com", "secret1").await.unwrap();

        backend.sign_in("ana@example.com", "secret1").await.unwrap();
        backend.insert_message(&new_message(&ana.id, &bob.id, "1")).await.unwrap();
        backend.insert_message(&new_message(&ana.id, &bob.id, "2")).await.unwrap();

        let bob_tab = backend.connect();
        bob_tab.sign_in("bob@example.com", "secret1").await.unwrap();

        let first = bob_tab.update_read(&MessageFilter::unread(&ana.id, &bob.id)).await.unwrap();
        assert_eq!(first.len(), 2);
        let second = bob_tab.update_read(&MessageFilter::unread(&ana.id, &bob.id)).await.unwrap();
        assert!(second.is_empty());

        // Only the recipient may flip the flag
        let denied = backend.update_read(&MessageFilter::unread(&ana.id, &bob.id)).await;
        assert!(denied.is_err());
    }

    #[tokio::test]
    async fn test_subscription_sees_other_handles_writes() {
        let backend = LocalBackend::temporary().unwrap();
        let ana = backend.sign_up("ana@example.com", "secret1").await.unwrap();
        backend.sign_in("ana@example.com", "secret1").await.unwrap();

        let observer = backend.connect();
        let mut sub = observer.subscribe().await.unwrap();

        backend.insert_message(&new_message(&ana.id, "bob", "oi")).await.unwrap();
        let event = sub.recv().await.unwrap();
        assert_eq!(event.message.content, "oi");

        observer.set_realtime_available(false);
        assert!(sub.recv().await.is_none());
        assert!(observer.subscribe().await.is_err());
    }

    #[tokio::test]
    async fn test_persistence_across_reopen() {
        let temp_dir = TempDir::new().unwrap();
        {
            let backend = LocalBackend::open(temp_dir.path()).unwrap();
            let user = backend.sign_up("ana@example.com", "secret1").await.unwrap();
            backend.upsert_profile(&Profile::for_user(&user, None)).await.unwrap();
        }

        let backend = LocalBackend::open(temp_dir.path()).unwrap();
        let profiles = backend.list_profiles("nobody").await.unwrap();
        assert_eq!(profiles.len(), 1);
        assert_eq!(profiles[0].username, "ana");
        assert!(backend.sign_in("ana@example.com", "secret1").await.is_ok());
    }
}
