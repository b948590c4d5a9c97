/// Optimistic send: show first, write second, reconcile by correlation token
use crate::attachments::prepare_image_file;
use crate::client::ChatClient;
use crate::error::{ChatError, Result};
use crate::messenger_types::{Message, MessengerEvent};
use std::path::Path;
use tracing::{debug, info, warn};
use uuid::Uuid;

impl ChatClient {
    /// Send trimmed text to the open conversation.
    ///
    /// `Ok(None)` when there is nothing to send or no conversation is open.
    /// On a failed write the entry stays in the timeline marked failed and
    /// the error is returned, unless the row shows up anyway.
    pub async fn send_text(&self, text: &str) -> Result<Option<Uuid>> {
        let content = text.trim();
        if content.is_empty() {
            return Ok(None);
        }
        self.send_content(content.to_string()).await
    }

    /// Shrink and embed an image, then send it like text.
    /// Nothing is added to the timeline if the image cannot be prepared.
    pub async fn send_image(&self, path: &Path) -> Result<Option<Uuid>> {
        let has_peer = self
            .with_session(|ctx| ctx.open_peer().is_some())
            .await?;
        if !has_peer {
            return Ok(None);
        }
        let config = self.config();
        let image = prepare_image_file(path, config.max_image_width, config.image_quality).await?;
        debug!("Prepared image {}x{} ({} bytes)", image.width, image.height, image.data_url.len());
        self.send_content(image.data_url).await
    }

    async fn send_content(&self, content: String) -> Result<Option<Uuid>> {
        let correlation = Uuid::new_v4();
        let provisional = self
            .with_session_mut(|ctx| {
                let peer_id = ctx.open_peer()?.to_string();
                let message = Message::provisional(content, ctx.me.id.clone(), peer_id);
                ctx.conversation.append_local(message.clone(), correlation);
                Some(message)
            })
            .await?;
        let Some(provisional) = provisional else {
            return Ok(None);
        };
        self.emit(MessengerEvent::MessageAppended {
            message: provisional.clone(),
        });

        self.submit(correlation, provisional).await?;
        Ok(Some(correlation))
    }

    /// Re-submit a failed send under its original token
    pub async fn retry_send(&self, correlation: Uuid) -> Result<Message> {
        let message = self
            .with_session_mut(|ctx| ctx.conversation.mark_pending(correlation))
            .await?
            .ok_or_else(|| ChatError::Send("No failed message to retry".to_string()))?;
        self.submit(correlation, message).await
    }

    /// Drop a failed send from the timeline
    pub async fn discard_send(&self, correlation: Uuid) -> Result<bool> {
        let discarded = self
            .with_session_mut(|ctx| ctx.conversation.discard(correlation))
            .await?;
        Ok(discarded.is_some())
    }

    /// Write the provisional message and reconcile the timeline entry
    async fn submit(&self, correlation: Uuid, provisional: Message) -> Result<Message> {
        // The sender is whoever the backend says is signed in right now
        let user = match self.backend().get_user().await {
            Ok(Some(user)) => user,
            Ok(None) => return self.fail_send(correlation, "Not signed in".to_string()).await,
            Err(e) => return self.fail_send(correlation, e.to_string()).await,
        };
        if user.id != provisional.sender_id {
            return self
                .fail_send(correlation, "Signed-in account changed; message not sent".to_string())
                .await;
        }

        match self.backend().insert_message(&provisional.to_insert()).await {
            Ok(stored) => {
                let confirmed = self
                    .with_session_mut(|ctx| ctx.conversation.confirm(correlation, stored.clone()))
                    .await
                    .ok()
                    .flatten();
                if let Some(message) = confirmed {
                    self.emit(MessengerEvent::MessageUpdated { message });
                }
                Ok(stored)
            }
            Err(e) => self.fail_send(correlation, e.to_string()).await,
        }
    }

    async fn fail_send(&self, correlation: Uuid, reason: String) -> Result<Message> {
        // The row may already have come back through the listener
        let landed = self
            .with_session_mut(|ctx| {
                if ctx.conversation.mark_failed(correlation) {
                    return None;
                }
                ctx.conversation
                    .entry(correlation)
                    .filter(|e| e.message.id.is_some())
                    .map(|e| e.message.clone())
            })
            .await;
        match landed {
            Ok(Some(message)) => {
                info!("Send {} reported an error but its row arrived: {}", correlation, reason);
                return Ok(message);
            }
            Ok(None) => {}
            Err(e) => debug!("No session to mark failed send in: {}", e),
        }

        warn!("Send {} failed: {}", correlation, reason);
        self.emit(MessengerEvent::SendFailed {
            correlation,
            reason: reason.clone(),
        });
        Err(ChatError::Send(reason))
    }
}
