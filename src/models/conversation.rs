//! Conversation and stored-message records as kept by the document store.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use super::{ChatId, ChatMessage};

/// One row of the conversation list.
///
/// Maintained by the store on every accepted message; the UI never edits it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: ChatId,
    pub participant_ids: BTreeSet<String>,
    pub last_message: Option<String>,
    pub last_message_time: Option<i64>,
    /// Unread messages addressed to the viewing user.
    pub unread_count: usize,
}

impl Conversation {
    pub fn new(a: &str, b: &str) -> Self {
        Conversation {
            id: ChatId::between(a, b),
            participant_ids: [a.to_string(), b.to_string()].into_iter().collect(),
            last_message: None,
            last_message_time: None,
            unread_count: 0,
        }
    }

    pub fn has_participant(&self, user_id: &str) -> bool {
        self.participant_ids.contains(user_id)
    }

    /// The participant that is not `user_id`.
    pub fn peer_of(&self, user_id: &str) -> Option<&str> {
        self.participant_ids
            .iter()
            .find(|p| p.as_str() != user_id)
            .map(String::as_str)
    }
}

/// A confirmed message as persisted, with its read flag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredMessage {
    pub message: ChatMessage,
    pub read: bool,
}

impl StoredMessage {
    pub fn unread(message: ChatMessage) -> Self {
        StoredMessage {
            message,
            read: false,
        }
    }
}
