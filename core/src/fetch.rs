/// Conversation fetch: two directional queries merged into one timeline
use crate::backend::{Backend, MessageFilter};
use crate::error::{ChatError, Result};
use crate::messenger_types::Message;
use tracing::debug;

/// Concatenate both directions and order by `created_at`.
/// The sort is stable, so equal timestamps keep outgoing-then-incoming fetch order.
pub fn merge_timeline(outgoing: Vec<Message>, incoming: Vec<Message>) -> Vec<Message> {
    let mut merged = outgoing;
    merged.extend(incoming);
    merged.sort_by_key(|m| m.created_at);
    merged
}

/// Fetch the full conversation between `me_id` and `peer_id`.
///
/// Both queries run concurrently; if either fails nothing is returned.
pub async fn fetch_conversation(backend: &dyn Backend, me_id: &str, peer_id: &str) -> Result<Vec<Message>> {
    let outgoing_filter = MessageFilter::direction(me_id, peer_id);
    let incoming_filter = MessageFilter::direction(peer_id, me_id);

    let (outgoing, incoming) = tokio::try_join!(
        backend.query_messages(&outgoing_filter),
        backend.query_messages(&incoming_filter),
    )
    .map_err(|e| match e {
        ChatError::Query(_) => e,
        other => ChatError::Query(other.to_string()),
    })?;

    debug!(
        "Fetched {} outgoing / {} incoming messages with {}",
        outgoing.len(),
        incoming.len(),
        peer_id
    );
    Ok(merge_timeline(outgoing, incoming))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn msg(id: i64, sender: &str, secs: i64) -> Message {
        Message {
            id: Some(id),
            content: format!("m{}", id),
            sender_id: sender.to_string(),
            recipient_id: if sender == "a" { "b" } else { "a" }.to_string(),
            created_at: Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap(),
            read: false,
        }
    }

    #[test]
    fn test_merge_interleaves_by_timestamp() {
        let outgoing = vec![msg(1, "a", 0), msg(3, "a", 20)];
        let incoming = vec![msg(2, "b", 10), msg(4, "b", 30)];
        let ids: Vec<_> = merge_timeline(outgoing, incoming)
            .iter()
            .filter_map(|m| m.id)
            .collect();
        assert_eq!(ids, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_merge_ties_keep_fetch_order() {
        let outgoing = vec![msg(1, "a", 5), msg(2, "a", 5)];
        let incoming = vec![msg(3, "b", 5)];
        let ids: Vec<_> = merge_timeline(outgoing, incoming)
            .iter()
            .filter_map(|m| m.id)
            .collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn test_merge_empty_sides() {
        assert!(merge_timeline(vec![], vec![]).is_empty());
        assert_eq!(merge_timeline(vec![], vec![msg(1, "b", 0)]).len(), 1);
    }
}
