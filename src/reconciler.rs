//! Optimistic-send reconciliation.
//!
//! Each conversation keeps two ordered collections: confirmed messages and
//! provisional (locally sent, unacknowledged) ones. The visible sequence is
//! the pure [`merge`] of both. Ordering key is `(timestamp, arrival)`, where
//! `arrival` is a per-reconciler counter, so equal timestamps keep the order in
//! which the messages reached this client.
//!
//! Confirmed message ids are unique within a conversation: replaying a
//! message that is already known is a no-op.

use std::collections::{HashMap, HashSet};

use crate::models::{ChatId, ChatMessage, CorrelationToken, MessageId};

/// A message with its arrival rank
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub message: ChatMessage,
    pub arrival: u64,
}

impl Entry {
    fn sort_key(&self) -> (i64, u64) {
        (self.message.timestamp, self.arrival)
    }
}

/// Merge confirmed and provisional entries into the visible sequence.
///
/// Both inputs must already be ordered by `(timestamp, arrival)`.
pub fn merge(confirmed: &[Entry], provisional: &[Entry]) -> Vec<ChatMessage> {
    let mut merged = Vec::with_capacity(confirmed.len() + provisional.len());
    let (mut i, mut j) = (0, 0);

    while i < confirmed.len() && j < provisional.len() {
        if confirmed[i].sort_key() <= provisional[j].sort_key() {
            merged.push(confirmed[i].message.clone());
            i += 1;
        } else {
            merged.push(provisional[j].message.clone());
            j += 1;
        }
    }
    merged.extend(confirmed[i..].iter().map(|e| e.message.clone()));
    merged.extend(provisional[j..].iter().map(|e| e.message.clone()));
    merged
}

/// What happened to a confirmed message handed to the reconciler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciled {
    /// New message inserted in order.
    Inserted,
    /// A provisional entry took the confirmed identity.
    Promoted,
    /// The message id was already known; nothing changed.
    Duplicate,
    /// Already known, and the provisional copy it confirmed was removed.
    Settled,
}

#[derive(Debug, Default, Clone)]
struct ConversationLog {
    confirmed: Vec<Entry>,
    provisional: Vec<Entry>,
    known_ids: HashSet<MessageId>,
}

impl ConversationLog {
    fn insert_sorted(entries: &mut Vec<Entry>, entry: Entry) {
        let key = entry.sort_key();
        let pos = entries.partition_point(|e| e.sort_key() <= key);
        entries.insert(pos, entry);
    }

    fn take_provisional(&mut self, token: &CorrelationToken) -> Option<Entry> {
        let pos = self
            .provisional
            .iter()
            .position(|e| e.message.correlation_token() == Some(token))?;
        Some(self.provisional.remove(pos))
    }

    /// Oldest provisional entry carrying the same payload.
    fn take_provisional_matching(&mut self, message: &ChatMessage) -> Option<Entry> {
        let pos = self
            .provisional
            .iter()
            .position(|e| e.message.same_payload(message))?;
        Some(self.provisional.remove(pos))
    }
}

/// Per-user reconciler covering every conversation the user takes part in
#[derive(Debug, Clone)]
pub struct MessageReconciler {
    local_user: String,
    conversations: HashMap<ChatId, ConversationLog>,
    next_arrival: u64,
}

impl MessageReconciler {
    pub fn new(local_user: &str) -> Self {
        MessageReconciler {
            local_user: local_user.to_string(),
            conversations: HashMap::new(),
            next_arrival: 0,
        }
    }

    pub fn local_user(&self) -> &str {
        &self.local_user
    }

    fn arrival(&mut self) -> u64 {
        let arrival = self.next_arrival;
        self.next_arrival += 1;
        arrival
    }

    /// Optimistically insert a local send. Returns the provisional message,
    /// whose correlation token must travel with the outbound frame.
    pub fn stage(&mut self, receiver_id: &str, content: &str) -> ChatMessage {
        let message = ChatMessage::provisional(&self.local_user, receiver_id, content);
        self.stage_message(message.clone());
        message
    }

    /// Insert an already-built provisional message.
    pub fn stage_message(&mut self, message: ChatMessage) {
        debug_assert!(!message.is_confirmed());
        let arrival = self.arrival();
        let log = self.conversations.entry(message.chat_id()).or_default();
        ConversationLog::insert_sorted(&mut log.provisional, Entry { message, arrival });
    }

    /// Fold a backend-confirmed message into its conversation.
    ///
    /// `correlation` is the token echoed by the backend when the message is the
    /// confirmation of a local send.
    pub fn apply_confirmed(
        &mut self,
        message: ChatMessage,
        correlation: Option<&CorrelationToken>,
    ) -> Reconciled {
        debug_assert!(message.is_confirmed());
        let arrival = self.next_arrival;
        let is_own = message.sender_id == self.local_user;
        let log = self.conversations.entry(message.chat_id()).or_default();

        if log.known_ids.contains(message.message_id()) {
            let settled = correlation
                .and_then(|token| log.take_provisional(token))
                .is_some();
            if settled {
                return Reconciled::Settled;
            }
            log::debug!("Ignoring replay of message {}", message.message_id());
            return Reconciled::Duplicate;
        }

        let pending = match correlation {
            Some(token) => log.take_provisional(token),
            None if is_own => log.take_provisional_matching(&message),
            None => None,
        };

        log.known_ids.insert(message.message_id().clone());
        match pending {
            Some(entry) if entry.message.same_payload(&message) => {
                let promoted = Entry {
                    message,
                    arrival: entry.arrival,
                };
                ConversationLog::insert_sorted(&mut log.confirmed, promoted);
                Reconciled::Promoted
            }
            Some(entry) => {
                // token reused for a different payload: keep both, the
                // provisional copy is rolled back by its own timeout
                log::warn!(
                    "Confirmation {} does not match provisional {}",
                    message.message_id(),
                    entry.message.message_id()
                );
                ConversationLog::insert_sorted(&mut log.provisional, entry);
                ConversationLog::insert_sorted(&mut log.confirmed, Entry { message, arrival });
                self.next_arrival += 1;
                Reconciled::Inserted
            }
            None => {
                ConversationLog::insert_sorted(&mut log.confirmed, Entry { message, arrival });
                self.next_arrival += 1;
                Reconciled::Inserted
            }
        }
    }

    /// Remove the provisional entry of a failed send.
    pub fn rollback(&mut self, token: &CorrelationToken) -> Option<ChatMessage> {
        self.conversations
            .values_mut()
            .find_map(|log| log.take_provisional(token))
            .map(|entry| entry.message)
    }

    /// Whether a send is still waiting for confirmation.
    pub fn is_pending(&self, token: &CorrelationToken) -> bool {
        self.conversations.values().any(|log| {
            log.provisional
                .iter()
                .any(|e| e.message.correlation_token() == Some(token))
        })
    }

    /// Visible sequence of one conversation
    pub fn messages(&self, chat_id: &ChatId) -> Vec<ChatMessage> {
        self.conversations
            .get(chat_id)
            .map(|log| merge(&log.confirmed, &log.provisional))
            .unwrap_or_default()
    }

    pub fn pending_count(&self, chat_id: &ChatId) -> usize {
        self.conversations
            .get(chat_id)
            .map(|log| log.provisional.len())
            .unwrap_or(0)
    }

    /// Forget the local view of one conversation.
    pub fn clear(&mut self, chat_id: &ChatId) {
        self.conversations.remove(chat_id);
    }

    pub fn clear_all(&mut self) {
        self.conversations.clear();
    }
}
