/// Conversation store: the open peer and its live timeline
/// Single source of truth for rendering; everything else writes through here
use crate::messenger_types::{Message, MessageId};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Delivery state shown next to a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryStatus {
    /// Written locally, no backend id yet
    Pending,
    Sent,
    Read,
    /// Insert failed; waiting for retry or discard
    Failed,
}

impl DeliveryStatus {
    pub fn of(message: &Message) -> Self {
        match (message.id, message.read) {
            (None, _) => DeliveryStatus::Pending,
            (Some(_), true) => DeliveryStatus::Read,
            (Some(_), false) => DeliveryStatus::Sent,
        }
    }

    pub fn status_icon(&self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "…",
            DeliveryStatus::Sent => "✓",
            DeliveryStatus::Read => "✓✓",
            DeliveryStatus::Failed => "!",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimelineEntry {
    pub message: Message,
    /// Client-side token of an optimistic send, never written to the backend
    pub correlation: Option<Uuid>,
    pub status: DeliveryStatus,
}

impl TimelineEntry {
    fn remote(message: Message) -> Self {
        let status = DeliveryStatus::of(&message);
        Self {
            message,
            correlation: None,
            status,
        }
    }

    fn is_unconfirmed(&self) -> bool {
        self.message.id.is_none()
    }
}

fn unconfirmed_copy(message: &Message) -> Message {
    Message {
        id: None,
        read: false,
        ..message.clone()
    }
}

/// Identifies one conversation fetch; results for an outdated ticket are dropped
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchTicket {
    pub peer_id: String,
    generation: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// New entry at the end of the timeline
    Appended,
    /// Already shown under the same id
    Duplicate,
    /// Matched an unconfirmed local entry, which now carries the id
    Reconciled,
}

#[derive(Debug, Default)]
pub struct ConversationStore {
    peer_id: Option<String>,
    generation: u64,
    entries: Vec<TimelineEntry>,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Switch to `peer_id`. The old timeline is dropped and any fetch still
    /// in flight for an earlier selection becomes stale.
    pub fn select(&mut self, peer_id: &str) -> FetchTicket {
        if self.peer_id.as_deref() != Some(peer_id) {
            self.entries.clear();
            self.peer_id = Some(peer_id.to_string());
        }
        self.generation += 1;
        FetchTicket {
            peer_id: peer_id.to_string(),
            generation: self.generation,
        }
    }

    /// Ticket for the current selection without invalidating anything
    pub fn current_ticket(&self) -> Option<FetchTicket> {
        self.peer_id.as_ref().map(|peer_id| FetchTicket {
            peer_id: peer_id.clone(),
            generation: self.generation,
        })
    }

    pub fn is_current(&self, ticket: &FetchTicket) -> bool {
        self.generation == ticket.generation && self.peer_id.as_deref() == Some(ticket.peer_id.as_str())
    }

    /// Install a freshly fetched timeline.
    ///
    /// Returns `false` and leaves the store alone when the ticket is stale.
    /// Unconfirmed local entries survive: they either attach to their fetched
    /// row or are kept after the fetched rows.
    pub fn replace_timeline(&mut self, ticket: &FetchTicket, messages: Vec<Message>) -> bool {
        if !self.is_current(ticket) {
            return false;
        }

        let unconfirmed: Vec<TimelineEntry> = self
            .entries
            .drain(..)
            .filter(TimelineEntry::is_unconfirmed)
            .collect();
        self.entries = messages.into_iter().map(TimelineEntry::remote).collect();

        for local in unconfirmed {
            let landed = self
                .entries
                .iter_mut()
                .find(|e| e.correlation.is_none() && e.message.same_payload(&local.message));
            match landed {
                Some(entry) => entry.correlation = local.correlation,
                None => self.entries.push(local),
            }
        }
        true
    }

    /// Optimistic append of a message this client is about to write
    pub fn append_local(&mut self, message: Message, correlation: Uuid) -> &TimelineEntry {
        let status = DeliveryStatus::of(&message);
        self.entries.push(TimelineEntry {
            message,
            correlation: Some(correlation),
            status,
        });
        &self.entries[self.entries.len() - 1]
    }

    /// Append a backend row (listener echo, other tab, poll snapshot).
    /// Safe to call in any order relative to `append_local`/`confirm`.
    ///
    /// A row can also land on a failed send: the insert reported an error
    /// after the write went through. The entry then takes the row's status
    /// and can no longer be retried or discarded.
    pub fn append_remote(&mut self, message: Message) -> AppendOutcome {
        if let Some(id) = message.id {
            if self.contains_id(id) {
                return AppendOutcome::Duplicate;
            }
        }

        if let Some(idx) = self.landing_slot(&message) {
            let entry = &mut self.entries[idx];
            entry.status = DeliveryStatus::of(&message);
            entry.message = message;
            return AppendOutcome::Reconciled;
        }

        self.entries.push(TimelineEntry::remote(message));
        AppendOutcome::Appended
    }

    /// Unconfirmed local entry a row with this payload belongs to.
    /// Sends still in flight win over failed ones.
    fn landing_slot(&self, message: &Message) -> Option<usize> {
        let fits = |e: &TimelineEntry| e.is_unconfirmed() && e.message.same_payload(message);
        self.entries
            .iter()
            .position(|e| fits(e) && e.status != DeliveryStatus::Failed)
            .or_else(|| self.entries.iter().position(|e| fits(e)))
    }

    /// Attach the confirmed row to the optimistic entry carrying `correlation`.
    /// Returns the confirmed message when the entry is still in the timeline.
    ///
    /// Identical sends made in the same millisecond can pick up each other's
    /// echo; rows are handed back so each entry ends with its own id.
    pub fn confirm(&mut self, correlation: Uuid, confirmed: Message) -> Option<Message> {
        let idx = self
            .entries
            .iter()
            .position(|e| e.correlation == Some(correlation))?;

        if let Some(id) = confirmed.id {
            let holder = self
                .entries
                .iter()
                .enumerate()
                .position(|(i, e)| i != idx && e.message.id == Some(id));
            match holder {
                // Another send adopted our echo; it goes back to waiting for its own row
                Some(other) if self.entries[other].correlation.is_some() => {
                    let sibling = &mut self.entries[other];
                    sibling.message = unconfirmed_copy(&sibling.message);
                    sibling.status = DeliveryStatus::Pending;
                }
                // An echo landed as its own entry before we got here
                Some(dup) => {
                    let echo = self.entries.remove(dup);
                    let idx = if dup < idx { idx - 1 } else { idx };
                    let entry = &mut self.entries[idx];
                    // Keep whichever copy knows more about the read flag
                    entry.message = Message {
                        read: confirmed.read || echo.message.read,
                        ..confirmed
                    };
                    entry.status = DeliveryStatus::of(&entry.message);
                    return Some(entry.message.clone());
                }
                None => {}
            }
        }

        let entry = &mut self.entries[idx];
        match entry.message.id {
            // Already reconciled through the listener
            Some(existing) if Some(existing) == confirmed.id => Some(entry.message.clone()),
            Some(_) => {
                let adopted = std::mem::replace(&mut entry.message, confirmed);
                entry.status = DeliveryStatus::of(&entry.message);
                let result = entry.message.clone();
                match self.landing_slot(&adopted) {
                    Some(sibling) => {
                        let sibling = &mut self.entries[sibling];
                        sibling.status = DeliveryStatus::of(&adopted);
                        sibling.message = adopted;
                    }
                    None => self.entries.push(TimelineEntry::remote(adopted)),
                }
                Some(result)
            }
            None => {
                entry.status = DeliveryStatus::of(&confirmed);
                entry.message = confirmed;
                Some(entry.message.clone())
            }
        }
    }

    /// Mark a send failed. Returns `false` when the entry is gone or its row
    /// already arrived.
    pub fn mark_failed(&mut self, correlation: Uuid) -> bool {
        let Some(idx) = self.entries.iter().position(|e| e.correlation == Some(correlation)) else {
            return false;
        };
        if !self.entries[idx].is_unconfirmed() {
            // The adopted echo may be the row of an identical send still in flight
            let adopted = self.entries[idx].message.clone();
            let Some(sibling) = self.entries.iter().position(|e| {
                e.is_unconfirmed() && e.status == DeliveryStatus::Pending && e.message.same_payload(&adopted)
            }) else {
                return false;
            };
            self.entries[idx].message = unconfirmed_copy(&adopted);
            let sibling = &mut self.entries[sibling];
            sibling.status = DeliveryStatus::of(&adopted);
            sibling.message = adopted;
        }
        self.entries[idx].status = DeliveryStatus::Failed;
        true
    }

    /// Put a failed entry back into flight; returns the message to re-submit
    pub fn mark_pending(&mut self, correlation: Uuid) -> Option<Message> {
        let entry = self.entry_mut(correlation)?;
        if entry.status != DeliveryStatus::Failed {
            return None;
        }
        entry.status = DeliveryStatus::Pending;
        Some(entry.message.clone())
    }

    /// Drop a failed send. Confirmed entries are never removed.
    pub fn discard(&mut self, correlation: Uuid) -> Option<Message> {
        let idx = self
            .entries
            .iter()
            .position(|e| e.correlation == Some(correlation) && e.status == DeliveryStatus::Failed)?;
        Some(self.entries.remove(idx).message)
    }

    /// Replace a loaded message in place (read flag updates)
    pub fn apply_update(&mut self, message: Message) -> bool {
        let Some(id) = message.id else {
            return false;
        };
        match self.entries.iter_mut().find(|e| e.message.id == Some(id)) {
            Some(entry) => {
                entry.status = DeliveryStatus::of(&message);
                entry.message = message;
                true
            }
            None => false,
        }
    }

    /// Flip the local copies of messages `peer_id` sent to `me_id`
    pub fn mark_incoming_read(&mut self, me_id: &str, peer_id: &str) -> Vec<Message> {
        let mut flipped = Vec::new();
        for entry in self.entries.iter_mut() {
            let m = &mut entry.message;
            if m.sender_id == peer_id && m.recipient_id == me_id && !m.read {
                m.read = true;
                entry.status = DeliveryStatus::of(m);
                flipped.push(m.clone());
            }
        }
        flipped
    }

    pub fn clear(&mut self) {
        self.peer_id = None;
        self.entries.clear();
        self.generation += 1;
    }

    pub fn peer_id(&self) -> Option<&str> {
        self.peer_id.as_deref()
    }

    pub fn entries(&self) -> &[TimelineEntry] {
        &self.entries
    }

    pub fn messages(&self) -> Vec<Message> {
        self.entries.iter().map(|e| e.message.clone()).collect()
    }

    pub fn entry(&self, correlation: Uuid) -> Option<&TimelineEntry> {
        self.entries.iter().find(|e| e.correlation == Some(correlation))
    }

    fn entry_mut(&mut self, correlation: Uuid) -> Option<&mut TimelineEntry> {
        self.entries.iter_mut().find(|e| e.correlation == Some(correlation))
    }

    /// Most recent failed send, if any
    pub fn last_failed(&self) -> Option<Uuid> {
        self.entries
            .iter()
            .rev()
            .find(|e| e.status == DeliveryStatus::Failed)
            .and_then(|e| e.correlation)
    }

    pub fn contains_id(&self, id: MessageId) -> bool {
        self.message_by_id(id).is_some()
    }

    pub fn message_by_id(&self, id: MessageId) -> Option<&Message> {
        self.entries
            .iter()
            .map(|e| &e.message)
            .find(|m| m.id == Some(id))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn msg(id: Option<MessageId>, sender: &str, recipient: &str, content: &str, secs: i64) -> Message {
        Message {
            id,
            content: content.to_string(),
            sender_id: sender.to_string(),
            recipient_id: recipient.to_string(),
            created_at: Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap(),
            read: false,
        }
    }

    #[test]
    fn test_remote_append_dedups_by_id() {
        let mut store = ConversationStore::new();
        store.select("b");
        assert_eq!(store.append_remote(msg(Some(1), "b", "a", "oi", 0)), AppendOutcome::Appended);
        assert_eq!(store.append_remote(msg(Some(1), "b", "a", "oi", 0)), AppendOutcome::Duplicate);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_local_then_echo_then_confirm() {
        let mut store = ConversationStore::new();
        store.select("b");
        let token = Uuid::new_v4();
        let provisional = msg(None, "a", "b", "hello", 5);
        store.append_local(provisional.clone(), token);

        let echo = Message {
            id: Some(9),
            ..provisional.clone()
        };
        assert_eq!(store.append_remote(echo.clone()), AppendOutcome::Reconciled);
        assert_eq!(store.confirm(token, echo.clone()), Some(echo));
        assert_eq!(store.len(), 1);
        assert_eq!(store.entries()[0].status, DeliveryStatus::Sent);
    }

    #[test]
    fn test_confirm_then_echo() {
        let mut store = ConversationStore::new();
        store.select("b");
        let token = Uuid::new_v4();
        let provisional = msg(None, "a", "b", "hello", 5);
        store.append_local(provisional.clone(), token);

        let confirmed = Message {
            id: Some(9),
            ..provisional
        };
        store.confirm(token, confirmed.clone());
        assert_eq!(store.append_remote(confirmed), AppendOutcome::Duplicate);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_identical_rapid_sends_stay_distinct() {
        let mut store = ConversationStore::new();
        store.select("b");
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        let m = msg(None, "a", "b", "ok", 1);
        store.append_local(m.clone(), first);
        store.append_local(m.clone(), second);

        store.confirm(second, Message { id: Some(2), ..m.clone() });
        store.confirm(first, Message { id: Some(1), ..m });

        assert_eq!(store.entry(first).unwrap().message.id, Some(1));
        assert_eq!(store.entry(second).unwrap().message.id, Some(2));
    }

    #[test]
    fn test_stale_ticket_is_ignored() {
        let mut store = ConversationStore::new();
        let old = store.select("b");
        let new = store.select("c");

        assert!(!store.replace_timeline(&old, vec![msg(Some(1), "b", "a", "late", 0)]));
        assert!(store.is_empty());
        assert!(store.replace_timeline(&new, vec![msg(Some(2), "c", "a", "fresh", 0)]));
        assert_eq!(store.len(), 1);
        assert_eq!(store.peer_id(), Some("c"));
    }

    #[test]
    fn test_replace_keeps_unconfirmed_entries() {
        let mut store = ConversationStore::new();
        let ticket = store.select("b");
        let token = Uuid::new_v4();
        store.append_local(msg(None, "a", "b", "pending", 10), token);

        store.replace_timeline(&ticket, vec![msg(Some(1), "b", "a", "older", 0)]);
        assert_eq!(store.len(), 2);
        assert_eq!(store.entries()[1].correlation, Some(token));
    }

    #[test]
    fn test_failed_entry_retry_and_discard() {
        let mut store = ConversationStore::new();
        store.select("b");
        let token = Uuid::new_v4();
        store.append_local(msg(None, "a", "b", "x", 0), token);

        assert!(store.mark_failed(token));
        assert_eq!(store.last_failed(), Some(token));
        assert!(store.mark_pending(token).is_some());
        assert_eq!(store.entry(token).unwrap().status, DeliveryStatus::Pending);
        // Pending entries cannot be discarded
        assert!(store.discard(token).is_none());

        store.mark_failed(token);
        assert!(store.discard(token).is_some());
        assert!(store.is_empty());
    }

    #[test]
    fn test_update_and_mark_incoming_read() {
        let mut store = ConversationStore::new();
        store.select("b");
        store.append_remote(msg(Some(1), "a", "b", "mine", 0));
        store.append_remote(msg(Some(2), "b", "a", "theirs", 1));

        let flipped = store.mark_incoming_read("a", "b");
        assert_eq!(flipped.len(), 1);
        assert!(store.mark_incoming_read("a", "b").is_empty());

        let mut read = msg(Some(1), "a", "b", "mine", 0);
        read.read = true;
        assert!(store.apply_update(read));
        assert_eq!(store.entries()[0].status, DeliveryStatus::Read);
        assert!(!store.apply_update(msg(Some(99), "a", "b", "?", 0)));
    }

    #[test]
    fn test_echo_lands_on_failed_send() {
        let mut store = ConversationStore::new();
        store.select("b");
        let token = Uuid::new_v4();
        let provisional = msg(None, "a", "b", "timed out", 3);
        store.append_local(provisional.clone(), token);
        assert!(store.mark_failed(token));

        // The write went through after all
        let row = Message {
            id: Some(5),
            ..provisional
        };
        assert_eq!(store.append_remote(row), AppendOutcome::Reconciled);
        assert_eq!(store.len(), 1);
        assert_eq!(store.entries()[0].status, DeliveryStatus::Sent);
        assert!(store.last_failed().is_none());
        assert!(store.mark_pending(token).is_none());
        assert!(store.discard(token).is_none());
    }

    #[test]
    fn test_in_flight_send_wins_over_failed_one() {
        let mut store = ConversationStore::new();
        store.select("b");
        let failed = Uuid::new_v4();
        let sending = Uuid::new_v4();
        let m = msg(None, "a", "b", "same", 1);
        store.append_local(m.clone(), failed);
        store.mark_failed(failed);
        store.append_local(m.clone(), sending);

        store.append_remote(Message { id: Some(8), ..m });
        assert_eq!(store.entry(failed).unwrap().status, DeliveryStatus::Failed);
        assert_eq!(store.entry(sending).unwrap().message.id, Some(8));
    }

    #[test]
    fn test_swapped_echo_then_confirms_keep_order() {
        let mut store = ConversationStore::new();
        store.select("b");
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        let m = msg(None, "a", "b", "ok", 1);
        store.append_local(m.clone(), first);
        store.append_local(m.clone(), second);

        // The second row's echo lands on the first entry
        store.append_remote(Message { id: Some(2), ..m.clone() });
        store.confirm(first, Message { id: Some(1), ..m.clone() });
        store.confirm(second, Message { id: Some(2), ..m.clone() });
        assert_eq!(store.append_remote(Message { id: Some(1), ..m }), AppendOutcome::Duplicate);

        let ids: Vec<_> = store.entries().iter().map(|e| e.message.id).collect();
        assert_eq!(ids, vec![Some(1), Some(2)]);
        assert_eq!(store.entry(first).unwrap().message.id, Some(1));
        assert_eq!(store.entry(second).unwrap().message.id, Some(2));
    }

    #[test]
    fn test_swapped_echo_confirmed_by_its_owner_first() {
        let mut store = ConversationStore::new();
        store.select("b");
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        let m = msg(None, "a", "b", "ok", 1);
        store.append_local(m.clone(), first);
        store.append_local(m.clone(), second);

        store.append_remote(Message { id: Some(2), ..m.clone() });
        store.confirm(second, Message { id: Some(2), ..m.clone() });
        assert_eq!(store.entry(first).unwrap().status, DeliveryStatus::Pending);

        store.confirm(first, Message { id: Some(1), ..m.clone() });
        assert_eq!(store.append_remote(Message { id: Some(1), ..m }), AppendOutcome::Duplicate);

        let ids: Vec<_> = store.entries().iter().map(|e| e.message.id).collect();
        assert_eq!(ids, vec![Some(1), Some(2)]);
    }
}
