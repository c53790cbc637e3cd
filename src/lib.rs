/// Caregiver marketplace chat core
/// Connection-managed 1:1 messaging with optimistic sends, live queries over a
/// document store and derived conversation/unread views

pub mod cli;
pub mod config;
pub mod connection;
pub mod error;
pub mod facade;
pub mod identity;
pub mod models;
pub mod protocol;
pub mod query;
pub mod reconciler;
pub mod store;
pub mod transport;

pub use config::ChatConfig;
pub use connection::{ConnectionMachine, ConnectionState, RetryPolicy};
pub use error::{ChatError, Result};
pub use facade::{ChatFacade, ChatFacadeBuilder};
pub use identity::{Identity, IdentityProvider, SessionIdentity};
pub use models::{chat_id, ChatId, ChatMessage, Conversation, MessageKey, StoredMessage};
pub use query::{
    ConversationIndex, MessageFeed, RealtimeQuery, SnapshotSource, Subscription, UnreadTracker,
};
pub use reconciler::MessageReconciler;
pub use store::{DocumentStore, MemoryStore, SqliteStore, StoreError};
pub use transport::{ChatTransport, MemoryRelay, MemoryTransport, WebSocketTransport};
