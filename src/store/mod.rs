//! Document store boundary.
//!
//! The store owns persisted messages and the conversation index. The relay
//! writes to it; live queries read from it through [`SnapshotSource`].

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use thiserror::Error;

use crate::error::{ChatError, Result};
use crate::models::{ChatId, ChatMessage};
use crate::query::SnapshotSource;

/// Failure of a single query evaluation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Temporary outage; the source keeps trying.
    #[error("store temporarily unavailable")]
    Unavailable,

    #[error("store failure: {0}")]
    Failed(String),
}

impl From<StoreError> for ChatError {
    fn from(err: StoreError) -> Self {
        ChatError::StorageError(err.to_string())
    }
}

pub trait DocumentStore: SnapshotSource {
    /// Persist a confirmed message and refresh its conversation entry.
    /// Recording the same message id twice is a no-op.
    fn record_message(&self, message: &ChatMessage) -> Result<()>;

    /// Mark every message addressed to `reader_id` in the conversation as
    /// read. Returns how many flipped.
    fn mark_conversation_read(&self, reader_id: &str, chat_id: &ChatId) -> Result<usize>;
}

/// Reject provisional messages at the store boundary.
pub(crate) fn ensure_confirmed(message: &ChatMessage) -> Result<()> {
    if message.is_confirmed() {
        Ok(())
    } else {
        Err(ChatError::InvalidMessage(
            "only confirmed messages can be stored".to_string(),
        ))
    }
}
