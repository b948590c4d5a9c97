/// Read receipts: flip `read` on everything the peer sent us
use crate::backend::{Backend, MessageFilter};
use crate::error::Result;
use tracing::debug;

/// Mark every unread message `peer_id` sent to `me_id` as read.
///
/// Only unread rows are touched, so calling this again with nothing new is a
/// no-op. Returns the number of rows flipped.
pub async fn mark_conversation_read(backend: &dyn Backend, me_id: &str, peer_id: &str) -> Result<usize> {
    let updated = backend
        .update_read(&MessageFilter::unread(peer_id, me_id))
        .await?;
    if !updated.is_empty() {
        debug!("Marked {} message(s) from {} as read", updated.len(), peer_id);
    }
    Ok(updated.len())
}
