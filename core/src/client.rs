/// Chat client: owns the session and wires backend, store, listener and notifier
use crate::backend::Backend;
use crate::config::Config;
use crate::conversation_store::{AppendOutcome, TimelineEntry};
use crate::error::{ChatError, Result};
use crate::fetch::fetch_conversation;
use crate::listener::{self, route_event, ListenerHandle, Route, RoutingContext};
use crate::messenger_types::{AuthEvent, AuthUser, ChangeEvent, MessengerEvent, Profile};
use crate::notifications::{summarize_content, Notification, Notifier};
use crate::read_state::mark_conversation_read;
use crate::session::SessionContext;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

const EVENT_BUFFER: usize = 256;

/// Cloneable handle; every clone shares the same session
#[derive(Clone)]
pub struct ChatClient {
    backend: Arc<dyn Backend>,
    config: Arc<Config>,
    session: Arc<RwLock<Option<SessionContext>>>,
    events: broadcast::Sender<MessengerEvent>,
    notifier: Arc<dyn Notifier>,
    listener: Arc<Mutex<Option<ListenerHandle>>>,
}

impl ChatClient {
    pub fn new(backend: Arc<dyn Backend>, config: Config, notifier: Arc<dyn Notifier>) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            backend,
            config: Arc::new(config),
            session: Arc::new(RwLock::new(None)),
            events,
            notifier,
            listener: Arc::new(Mutex::new(None)),
        }
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<MessengerEvent> {
        self.events.subscribe()
    }

    pub(crate) fn emit(&self, event: MessengerEvent) {
        // No front end attached is fine
        let _ = self.events.send(event);
    }

    pub(crate) async fn with_session_mut<R>(&self, f: impl FnOnce(&mut SessionContext) -> R) -> Result<R> {
        let mut guard = self.session.write().await;
        let ctx = guard.as_mut().ok_or(ChatError::NotSignedIn)?;
        Ok(f(ctx))
    }

    pub(crate) async fn with_session<R>(&self, f: impl FnOnce(&SessionContext) -> R) -> Result<R> {
        let guard = self.session.read().await;
        let ctx = guard.as_ref().ok_or(ChatError::NotSignedIn)?;
        Ok(f(ctx))
    }

    // ---- auth -------------------------------------------------------------

    /// Resume a persisted session if the backend still accepts it
    pub async fn restore_session(&self) -> Result<Option<Profile>> {
        let Some(session) = self.backend.get_session().await? else {
            return Ok(None);
        };
        match self.backend.get_user().await {
            Ok(Some(user)) if user.id == session.user.id => self.handle_session(&user).await.map(Some),
            Ok(_) => {
                info!("Stored session is no longer valid");
                self.backend.sign_out().await?;
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Create an account and its profile row. Does not sign in.
    pub async fn sign_up(&self, email: &str, password: &str, username: Option<&str>) -> Result<AuthUser> {
        let user = self.backend.sign_up(email, password).await?;
        let profile = Profile::for_user(&user, username);
        if let Err(e) = self.backend.insert_profile(&profile).await {
            // Sign-in upserts the profile again
            warn!("Could not create profile for {}: {}", user.email, e);
        }
        info!("Account created for {}", user.email);
        Ok(user)
    }

    pub async fn sign_in(&self, email: &str, password: &str) -> Result<Profile> {
        let session = self.backend.sign_in(email, password).await?;
        self.handle_session(&session.user).await
    }

    /// Build the session context for a confirmed principal
    async fn handle_session(&self, user: &AuthUser) -> Result<Profile> {
        self.stop_listener().await;

        let me = Profile::for_user(user, None);
        if let Err(e) = self.backend.upsert_profile(&me).await {
            warn!("Profile sync failed for {}: {}", user.email, e);
        }
        *self.session.write().await = Some(SessionContext::new(me.clone()));
        info!("Signed in as {} ({})", me.username, me.id);

        if let Err(e) = self.refresh_contacts().await {
            warn!("Could not load contacts: {}", e);
        }

        let granted = self.notifier.request_permission().await;
        self.with_session_mut(|ctx| ctx.notifications_requested = true).await?;
        debug!("Notification permission granted: {}", granted);

        Ok(me)
    }

    /// Listener goes first, then the backend session, then local state
    pub async fn sign_out(&self) -> Result<()> {
        self.stop_listener().await;
        let result = self.backend.sign_out().await;
        self.clear_session().await;
        result
    }

    async fn clear_session(&self) {
        if self.session.write().await.take().is_some() {
            info!("Session cleared");
            self.emit(MessengerEvent::SignedOut);
        }
    }

    /// Follow auth changes made outside this client (expiry, sign-out elsewhere)
    pub fn watch_auth_state(&self) -> JoinHandle<()> {
        let client = self.clone();
        let mut rx = self.backend.on_auth_state_change();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(AuthEvent::SignedOut) => {
                        client.stop_listener().await;
                        client.clear_session().await;
                    }
                    Ok(AuthEvent::TokenRefreshed(_)) => debug!("Access token refreshed"),
                    Ok(AuthEvent::SignedIn(session)) => debug!("Auth state: signed in as {}", session.user.id),
                    Err(broadcast::error::RecvError::Lagged(n)) => warn!("Missed {} auth events", n),
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    pub async fn me(&self) -> Option<Profile> {
        self.with_session(|ctx| ctx.me.clone()).await.ok()
    }

    pub async fn is_signed_in(&self) -> bool {
        self.session.read().await.is_some()
    }

    // ---- contacts ---------------------------------------------------------

    /// Reload the contact list. The listener starts once contacts are known.
    pub async fn refresh_contacts(&self) -> Result<usize> {
        let me_id = self.with_session(|ctx| ctx.me.id.clone()).await?;
        let contacts = self.backend.list_profiles(&me_id).await?;
        let count = self
            .with_session_mut(|ctx| {
                ctx.contacts.replace(contacts);
                ctx.contacts.all().len()
            })
            .await?;
        self.emit(MessengerEvent::ContactsLoaded { count });

        if !self.listener_running().await {
            self.start_listener().await?;
        }
        Ok(count)
    }

    pub async fn contacts(&self) -> Vec<Profile> {
        self.with_session(|ctx| ctx.contacts.all().to_vec())
            .await
            .unwrap_or_default()
    }

    // ---- conversations ----------------------------------------------------

    /// Open the conversation with a contact (id or username).
    ///
    /// A fetch that finishes after the user moved on to another peer is dropped.
    pub async fn open_conversation(&self, contact: &str) -> Result<Profile> {
        let (peer, me_id, ticket) = self
            .with_session_mut(|ctx| {
                let peer = ctx.contacts.resolve(contact).cloned()?;
                let ticket = ctx.conversation.select(&peer.id);
                Some((peer, ctx.me.id.clone(), ticket))
            })
            .await?
            .ok_or_else(|| ChatError::Query(format!("Unknown contact: {}", contact)))?;

        let fetched = fetch_conversation(self.backend.as_ref(), &me_id, &peer.id).await;
        let messages = match fetched {
            Ok(messages) => messages,
            Err(e) => {
                let current = self
                    .with_session(|ctx| ctx.conversation.is_current(&ticket))
                    .await?;
                if current {
                    self.emit(MessengerEvent::SyncFailed {
                        peer_id: peer.id.clone(),
                        reason: e.to_string(),
                    });
                }
                return Err(e);
            }
        };

        let count = messages.len();
        let installed = self
            .with_session_mut(|ctx| ctx.conversation.replace_timeline(&ticket, messages))
            .await?;
        if !installed {
            debug!("Discarding stale fetch for {}", peer.id);
            return Ok(peer);
        }
        self.emit(MessengerEvent::TimelineLoaded {
            peer_id: peer.id.clone(),
            count,
        });

        if let Err(e) = self.mark_read(&me_id, &peer.id).await {
            warn!("Could not mark conversation with {} as read: {}", peer.id, e);
        }
        Ok(peer)
    }

    pub async fn close_conversation(&self) -> Result<()> {
        self.with_session_mut(|ctx| ctx.conversation.clear()).await
    }

    pub async fn open_peer(&self) -> Option<Profile> {
        self.with_session(|ctx| {
            ctx.open_peer()
                .map(|id| ctx.contacts.get(id).cloned().unwrap_or_else(|| Profile {
                    id: id.to_string(),
                    email: String::new(),
                    username: id.to_string(),
                    avatar_url: None,
                }))
        })
        .await
        .ok()
        .flatten()
    }

    pub async fn timeline(&self) -> Vec<TimelineEntry> {
        self.with_session(|ctx| ctx.conversation.entries().to_vec())
            .await
            .unwrap_or_default()
    }

    /// Most recent failed send in the open conversation
    pub async fn last_failed_send(&self) -> Option<Uuid> {
        self.with_session(|ctx| ctx.conversation.last_failed())
            .await
            .ok()
            .flatten()
    }

    /// Mark the open conversation read, remotely and locally
    pub async fn mark_open_conversation_read(&self) -> Result<usize> {
        let (me_id, peer_id) = self
            .with_session(|ctx| (ctx.me.id.clone(), ctx.open_peer().map(str::to_string)))
            .await?;
        match peer_id {
            Some(peer_id) => self.mark_read(&me_id, &peer_id).await,
            None => Ok(0),
        }
    }

    async fn mark_read(&self, me_id: &str, peer_id: &str) -> Result<usize> {
        let flipped_remote = mark_conversation_read(self.backend.as_ref(), me_id, peer_id).await?;
        let flipped_local = self
            .with_session_mut(|ctx| {
                if ctx.open_peer() == Some(peer_id) {
                    ctx.conversation.mark_incoming_read(me_id, peer_id)
                } else {
                    Vec::new()
                }
            })
            .await?;
        for message in flipped_local {
            self.emit(MessengerEvent::MessageUpdated { message });
        }
        Ok(flipped_remote)
    }

    // ---- live updates -----------------------------------------------------

    /// Apply one change-feed event to the session
    pub async fn handle_change_event(&self, event: ChangeEvent) -> Result<()> {
        let mut notification = None;
        let mut read_peer = None;

        self.with_session_mut(|ctx| {
            let route = route_event(&RoutingContext::new(ctx), &event);
            let message = event.message;
            match route {
                Route::AppendIncoming => {
                    if ctx.conversation.append_remote(message.clone()) != AppendOutcome::Duplicate {
                        read_peer = Some((ctx.me.id.clone(), message.sender_id.clone()));
                        self.emit(MessengerEvent::MessageAppended { message });
                    }
                }
                Route::AppendOwnEcho => match ctx.conversation.append_remote(message.clone()) {
                    AppendOutcome::Appended => self.emit(MessengerEvent::MessageAppended { message }),
                    AppendOutcome::Reconciled => self.emit(MessengerEvent::MessageUpdated { message }),
                    AppendOutcome::Duplicate => {}
                },
                Route::ReplaceInPlace => {
                    if ctx.conversation.apply_update(message.clone()) {
                        self.emit(MessengerEvent::MessageUpdated { message });
                    }
                }
                Route::Notify => {
                    let sender = ctx.contacts.get(&message.sender_id);
                    notification = Some(Notification {
                        title: ctx.contacts.display_name(&message.sender_id),
                        body: summarize_content(&message.content),
                        icon: sender.and_then(|s| s.avatar_url.clone()),
                    });
                }
                Route::Ignore => {}
            }
        })
        .await?;

        if let Some(notification) = notification {
            self.notifier.display(notification).await;
        }
        if let Some((me_id, peer_id)) = read_peer {
            self.mark_read(&me_id, &peer_id).await?;
        }
        Ok(())
    }

    /// Snapshot refresh of the open conversation, used while realtime is down.
    /// Rows go through the same de-duplication as live events.
    pub async fn poll_open_conversation(&self) -> Result<usize> {
        let Some((ticket, me_id)) = self
            .with_session(|ctx| ctx.conversation.current_ticket().map(|t| (t, ctx.me.id.clone())))
            .await?
        else {
            return Ok(0);
        };

        let snapshot = fetch_conversation(self.backend.as_ref(), &me_id, &ticket.peer_id).await?;

        let (appended, unread_incoming) = self
            .with_session_mut(|ctx| {
                let mut appended = 0;
                let mut unread_incoming = false;
                if !ctx.conversation.is_current(&ticket) {
                    return (appended, unread_incoming);
                }
                for message in snapshot {
                    let changed = match message.id.and_then(|id| ctx.conversation.message_by_id(id)) {
                        Some(known) => known != &message,
                        None => false,
                    };
                    if changed {
                        ctx.conversation.apply_update(message.clone());
                        self.emit(MessengerEvent::MessageUpdated { message });
                        continue;
                    }
                    let incoming_unread = message.sender_id == ticket.peer_id && !message.read;
                    match ctx.conversation.append_remote(message.clone()) {
                        AppendOutcome::Appended => {
                            appended += 1;
                            unread_incoming |= incoming_unread;
                            self.emit(MessengerEvent::MessageAppended { message });
                        }
                        AppendOutcome::Reconciled => self.emit(MessengerEvent::MessageUpdated { message }),
                        AppendOutcome::Duplicate => {}
                    }
                }
                (appended, unread_incoming)
            })
            .await?;

        if unread_incoming {
            self.mark_read(&me_id, &ticket.peer_id).await?;
        }
        Ok(appended)
    }

    /// Start the change-feed listener, replacing any running one.
    /// Refused until the contact list has loaded.
    pub async fn start_listener(&self) -> Result<()> {
        let loaded = self.with_session(|ctx| ctx.contacts.is_loaded()).await?;
        if !loaded {
            return Err(ChatError::Subscription(
                "contact list must load before subscribing".to_string(),
            ));
        }

        let mut slot = self.listener.lock().await;
        if let Some(previous) = slot.take() {
            previous.stop().await;
        }
        *slot = Some(listener::spawn(self.clone()));
        Ok(())
    }

    /// Stop the listener. No-op when none is running.
    pub async fn stop_listener(&self) {
        let handle = self.listener.lock().await.take();
        if let Some(handle) = handle {
            handle.stop().await;
        }
    }

    pub async fn listener_running(&self) -> bool {
        self.listener
            .lock()
            .await
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }
}
