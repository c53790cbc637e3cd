/// Error types for the chat core.
/// Every fallible operation in the crate reports through `ChatError`.

use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChatError {
    /// The transport could not establish or keep a session.
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// An operation needed a connected session and there was none.
    #[error("Not connected")]
    NotConnected,

    /// The backend rejected the message or never acknowledged it.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// A live query failed for a reason other than a transient outage.
    #[error("Subscription error: {0}")]
    SubscriptionError(String),

    /// `connect()` was interrupted by `disconnect()`.
    #[error("Connection attempt cancelled")]
    Cancelled,

    #[error("Missing identity: {0}")]
    MissingIdentity(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    /// The session worker is gone (facade shut down).
    #[error("Chat session closed")]
    SessionClosed,

    #[error("IO error: {0}")]
    IoError(#[from] io::Error),

    #[error("Database error: {0}")]
    DbError(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

impl From<tokio_tungstenite::tungstenite::Error> for ChatError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        ChatError::WebSocketError(err.to_string())
    }
}

impl From<url::ParseError> for ChatError {
    fn from(err: url::ParseError) -> Self {
        ChatError::ConfigError(format!("invalid server URL: {}", err))
    }
}

pub type Result<T> = std::result::Result<T, ChatError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ChatError::SendFailed("ack timeout".to_string());
        assert_eq!(err.to_string(), "Send failed: ack timeout");
        assert_eq!(ChatError::NotConnected.to_string(), "Not connected");
    }

    #[test]
    fn test_error_from_io() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let chat_err: ChatError = io_err.into();
        assert!(chat_err.to_string().contains("IO error"));
    }

    #[test]
    fn test_error_from_url() {
        let parse_err = url::Url::parse("not a url").unwrap_err();
        let chat_err: ChatError = parse_err.into();
        assert!(matches!(chat_err, ChatError::ConfigError(_)));
    }
}
