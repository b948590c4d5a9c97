/// Change-feed listener
///
/// One task per session. It routes every insert/update on the messages table
/// into the session, and falls back to polling the open conversation while
/// the realtime feed is unavailable.
use crate::client::ChatClient;
use crate::conversation_store::ConversationStore;
use crate::messenger_types::{ChangeEvent, ChangeKind, MessengerEvent};
use crate::session::SessionContext;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, error, info, warn};

const STOP_TIMEOUT: Duration = Duration::from_secs(2);

/// What the session should do with one change event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Peer wrote to us while their conversation is open
    AppendIncoming,
    /// We wrote (possibly from another client) into the open conversation
    AppendOwnEcho,
    /// Someone wrote to us, conversation not open
    Notify,
    /// A loaded message changed
    ReplaceInPlace,
    Ignore,
}

pub struct RoutingContext<'a> {
    pub me_id: &'a str,
    pub open_peer: Option<&'a str>,
    pub conversation: &'a ConversationStore,
}

impl<'a> RoutingContext<'a> {
    pub fn new(session: &'a SessionContext) -> Self {
        Self {
            me_id: session.me_id(),
            open_peer: session.open_peer(),
            conversation: &session.conversation,
        }
    }
}

pub fn route_event(ctx: &RoutingContext<'_>, event: &ChangeEvent) -> Route {
    let message = &event.message;
    match event.kind {
        ChangeKind::Insert if message.recipient_id == ctx.me_id => {
            if ctx.open_peer == Some(message.sender_id.as_str()) {
                Route::AppendIncoming
            } else {
                Route::Notify
            }
        }
        ChangeKind::Insert if message.sender_id == ctx.me_id => {
            if ctx.open_peer == Some(message.recipient_id.as_str()) {
                Route::AppendOwnEcho
            } else {
                Route::Ignore
            }
        }
        ChangeKind::Insert => Route::Ignore,
        ChangeKind::Update => match message.id {
            Some(id) if ctx.conversation.contains_id(id) => Route::ReplaceInPlace,
            _ => Route::Ignore,
        },
    }
}

/// Resubscribe delay after `failures` consecutive failures
pub fn backoff_delay(base: Duration, failures: u32, max: Duration) -> Duration {
    let factor = 2u32.saturating_pow(failures.min(16));
    base.saturating_mul(factor).min(max)
}

/// A running listener task
pub struct ListenerHandle {
    task: JoinHandle<()>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl ListenerHandle {
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Signal the task and wait for it; abort if it does not wind down in time
    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if timeout(STOP_TIMEOUT, &mut self.task).await.is_err() {
            warn!("Listener did not stop in time, aborting");
            self.task.abort();
        }
        debug!("Listener stopped");
    }
}

pub(crate) fn spawn(client: ChatClient) -> ListenerHandle {
    let (tx, rx) = oneshot::channel();
    let task = tokio::spawn(run(client, rx));
    ListenerHandle {
        task,
        shutdown: Some(tx),
    }
}

async fn run(client: ChatClient, mut shutdown: oneshot::Receiver<()>) {
    let poll_interval = client.config().poll_interval;
    let max_backoff = client.config().max_backoff;
    let mut failures: u32 = 0;
    let mut live: Option<bool> = None;

    loop {
        let subscribed = tokio::select! {
            _ = &mut shutdown => return,
            result = client.backend().subscribe() => result,
        };

        match subscribed {
            Ok(mut subscription) => {
                failures = 0;
                set_live(&client, &mut live, true);
                // Rows written while we were polling or reconnecting
                if let Err(e) = client.poll_open_conversation().await {
                    warn!("Catch-up fetch failed: {}", e);
                }

                loop {
                    tokio::select! {
                        _ = &mut shutdown => {
                            subscription.close();
                            return;
                        }
                        event = subscription.recv() => match event {
                            Some(event) => {
                                if let Err(e) = client.handle_change_event(event).await {
                                    error!("Failed to handle change event: {}", e);
                                }
                            }
                            None => break,
                        },
                    }
                }
                warn!("Realtime feed closed");
                failures = 1;
            }
            Err(e) => {
                failures = failures.saturating_add(1);
                warn!("Realtime subscription failed ({} in a row): {}", failures, e);
            }
        }

        set_live(&client, &mut live, false);

        // Degraded mode: poll until it is time to try the feed again
        let deadline = Instant::now() + backoff_delay(poll_interval, failures, max_backoff);
        loop {
            if let Err(e) = client.poll_open_conversation().await {
                warn!("Polling failed: {}", e);
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let wait = poll_interval.min(deadline - now);
            tokio::select! {
                _ = &mut shutdown => return,
                _ = sleep(wait) => {}
            }
        }
    }
}

fn set_live(client: &ChatClient, live: &mut Option<bool>, now_live: bool) {
    if *live != Some(now_live) {
        *live = Some(now_live);
        if now_live {
            info!("Realtime feed connected");
        } else {
            info!("Realtime unavailable, polling every {:?}", client.config().poll_interval);
        }
        client.emit(MessengerEvent::ListenerStatus { live: now_live });
    }
}
