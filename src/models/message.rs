//! Message model for the chat core.
//! A message is either provisional (sent locally, not yet acknowledged) or
//! confirmed by the backend.

use serde::{Deserialize, Serialize};

use super::{now_millis, ChatId, CorrelationToken, MessageId};

/// Identity of a message over its lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum MessageKey {
    /// Optimistic local copy waiting for the backend.
    #[serde(rename_all = "camelCase")]
    Provisional {
        local_id: MessageId,
        correlation_token: CorrelationToken,
    },
    /// Acknowledged by the backend.
    #[serde(rename_all = "camelCase")]
    Confirmed { message_id: MessageId },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub key: MessageKey,
    pub sender_id: String,
    pub receiver_id: String,
    pub content: String,
    /// Milliseconds since the epoch. Local clock while provisional,
    /// server-assigned once confirmed.
    pub timestamp: i64,
}

impl ChatMessage {
    /// Create a provisional message with a fresh local id and correlation token
    pub fn provisional(sender_id: &str, receiver_id: &str, content: &str) -> Self {
        ChatMessage {
            key: MessageKey::Provisional {
                local_id: MessageId::new(),
                correlation_token: CorrelationToken::new(),
            },
            sender_id: sender_id.to_string(),
            receiver_id: receiver_id.to_string(),
            content: content.to_string(),
            timestamp: now_millis(),
        }
    }

    /// Create a message as confirmed by the backend
    pub fn confirmed(
        message_id: impl Into<MessageId>,
        sender_id: &str,
        receiver_id: &str,
        content: &str,
        timestamp: i64,
    ) -> Self {
        ChatMessage {
            key: MessageKey::Confirmed {
                message_id: message_id.into(),
            },
            sender_id: sender_id.to_string(),
            receiver_id: receiver_id.to_string(),
            content: content.to_string(),
            timestamp,
        }
    }

    /// Local id while provisional, server id once confirmed.
    pub fn message_id(&self) -> &MessageId {
        match &self.key {
            MessageKey::Provisional { local_id, .. } => local_id,
            MessageKey::Confirmed { message_id } => message_id,
        }
    }

    pub fn correlation_token(&self) -> Option<&CorrelationToken> {
        match &self.key {
            MessageKey::Provisional {
                correlation_token, ..
            } => Some(correlation_token),
            MessageKey::Confirmed { .. } => None,
        }
    }

    pub fn is_confirmed(&self) -> bool {
        matches!(self.key, MessageKey::Confirmed { .. })
    }

    pub fn chat_id(&self) -> ChatId {
        ChatId::of(self)
    }

    /// True when both messages are the same logical send.
    pub fn same_payload(&self, other: &ChatMessage) -> bool {
        self.sender_id == other.sender_id
            && self.receiver_id == other.receiver_id
            && self.content == other.content
    }

    /// Adopt the backend's identity and timestamp.
    pub fn confirm(&mut self, message_id: MessageId, timestamp: i64) {
        self.key = MessageKey::Confirmed { message_id };
        self.timestamp = timestamp;
    }
}
