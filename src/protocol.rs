//! Wire frames exchanged with the chat backend.
//!
//! Frames are JSON objects discriminated by a `type` field. Clients only ever
//! send `send`; the backend answers with `ack`/`nack` for that correlation
//! token and pushes `message` frames for traffic addressed to the user.

use serde::{Deserialize, Serialize};

use crate::models::{ChatMessage, CorrelationToken, MessageId};

/// Client → backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientFrame {
    #[serde(rename = "send", rename_all = "camelCase")]
    Send {
        correlation_token: CorrelationToken,
        receiver_id: String,
        content: String,
    },
}

/// A confirmed message as carried on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireMessage {
    pub message_id: MessageId,
    pub sender_id: String,
    pub receiver_id: String,
    pub content: String,
    pub timestamp: i64,
}

impl WireMessage {
    pub fn into_message(self) -> ChatMessage {
        ChatMessage::confirmed(
            self.message_id,
            &self.sender_id,
            &self.receiver_id,
            &self.content,
            self.timestamp,
        )
    }
}

impl From<&ChatMessage> for WireMessage {
    fn from(message: &ChatMessage) -> Self {
        WireMessage {
            message_id: message.message_id().clone(),
            sender_id: message.sender_id.clone(),
            receiver_id: message.receiver_id.clone(),
            content: message.content.clone(),
            timestamp: message.timestamp,
        }
    }
}

/// Backend → client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerFrame {
    /// New message for this user. Echoes of the user's own sends carry the
    /// correlation token of the originating `send`.
    #[serde(rename = "message", rename_all = "camelCase")]
    Message {
        message: WireMessage,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        correlation_token: Option<CorrelationToken>,
    },
    /// The `send` with this token was persisted as `message`.
    #[serde(rename = "ack", rename_all = "camelCase")]
    Ack {
        correlation_token: CorrelationToken,
        message: WireMessage,
    },
    /// The `send` with this token was refused.
    #[serde(rename = "nack", rename_all = "camelCase")]
    Nack {
        correlation_token: CorrelationToken,
        reason: String,
    },
}
