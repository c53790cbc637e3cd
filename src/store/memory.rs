/// In-memory document store.
/// Every write bumps a revision counter; observers re-evaluate their filter on
/// each bump and emit the full result set.

use futures::stream::{self, StreamExt};
use std::collections::{BTreeSet, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;

use crate::error::Result;
use crate::models::{ChatId, ChatMessage, Conversation, MessageId, StoredMessage};
use crate::query::{QueryFilter, ResultSet, SnapshotSource, SnapshotStream};
use crate::store::{ensure_confirmed, DocumentStore, StoreError};

#[derive(Debug, Clone)]
struct ConversationRecord {
    id: ChatId,
    participant_ids: BTreeSet<String>,
    last_message: Option<String>,
    last_message_time: Option<i64>,
}

#[derive(Debug, Default)]
struct Tables {
    /// insertion order
    messages: Vec<StoredMessage>,
    message_ids: HashSet<MessageId>,
    conversations: Vec<ConversationRecord>,
}

#[derive(Debug, Clone, Default)]
enum Health {
    #[default]
    Available,
    Unavailable,
    Failing(String),
}

#[derive(Debug)]
struct Inner {
    tables: Mutex<Tables>,
    health: Mutex<Health>,
    revision: watch::Sender<u64>,
}

impl Inner {
    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn health(&self) -> MutexGuard<'_, Health> {
        self.health.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn bump(&self) {
        self.revision.send_modify(|revision| *revision += 1);
    }

    fn evaluate(&self, filter: &QueryFilter) -> std::result::Result<ResultSet, StoreError> {
        match &*self.health() {
            Health::Available => {}
            Health::Unavailable => return Err(StoreError::Unavailable),
            Health::Failing(reason) => return Err(StoreError::Failed(reason.clone())),
        }

        let tables = self.tables();
        let result = match filter {
            QueryFilter::Conversation(chat_id) => ResultSet::Messages(
                tables
                    .messages
                    .iter()
                    .filter(|row| &row.message.chat_id() == chat_id)
                    .cloned()
                    .collect(),
            ),
            QueryFilter::Unread(user_id) => ResultSet::Messages(
                tables
                    .messages
                    .iter()
                    .filter(|row| !row.read && &row.message.receiver_id == user_id)
                    .cloned()
                    .collect(),
            ),
            QueryFilter::Participant(user_id) => ResultSet::Conversations(
                tables
                    .conversations
                    .iter()
                    .filter(|record| record.participant_ids.contains(user_id))
                    .map(|record| Conversation {
                        id: record.id.clone(),
                        participant_ids: record.participant_ids.clone(),
                        last_message: record.last_message.clone(),
                        last_message_time: record.last_message_time,
                        unread_count: tables
                            .messages
                            .iter()
                            .filter(|row| {
                                !row.read
                                    && &row.message.receiver_id == user_id
                                    && row.message.chat_id() == record.id
                            })
                            .count(),
                    })
                    .collect(),
            ),
        };
        Ok(result)
    }
}

/// Shared in-memory store; clones see the same data.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (revision, _) = watch::channel(0);
        MemoryStore {
            inner: Arc::new(Inner {
                tables: Mutex::new(Tables::default()),
                health: Mutex::new(Health::default()),
                revision,
            }),
        }
    }

    /// Simulate a transient outage; observers stay silent until it clears.
    pub fn set_unavailable(&self, unavailable: bool) {
        *self.inner.health() = if unavailable {
            Health::Unavailable
        } else {
            Health::Available
        };
        self.inner.bump();
    }

    /// Make every evaluation fail with `reason` until cleared with `None`.
    pub fn fail_with(&self, reason: Option<&str>) {
        *self.inner.health() = match reason {
            Some(reason) => Health::Failing(reason.to_string()),
            None => Health::Available,
        };
        self.inner.bump();
    }

    pub fn message_count(&self) -> usize {
        self.inner.tables().messages.len()
    }

    /// All stored messages of one conversation, insertion order.
    pub fn messages_in(&self, chat_id: &ChatId) -> Vec<StoredMessage> {
        self.inner
            .tables()
            .messages
            .iter()
            .filter(|row| &row.message.chat_id() == chat_id)
            .cloned()
            .collect()
    }
}

impl SnapshotSource for MemoryStore {
    fn observe(&self, filter: QueryFilter) -> SnapshotStream {
        let inner = self.inner.clone();
        let changes = inner.revision.subscribe();

        stream::unfold(
            (inner, changes, filter, true),
            |(inner, mut changes, filter, first)| async move {
                if first {
                    changes.borrow_and_update();
                } else if changes.changed().await.is_err() {
                    return None;
                }
                let item = inner.evaluate(&filter);
                Some((item, (inner, changes, filter, false)))
            },
        )
        .boxed()
    }
}

impl DocumentStore for MemoryStore {
    fn record_message(&self, message: &ChatMessage) -> Result<()> {
        ensure_confirmed(message)?;
        {
            let mut tables = self.inner.tables();
            if !tables.message_ids.insert(message.message_id().clone()) {
                log::debug!("Message {} already stored", message.message_id());
                return Ok(());
            }
            tables.messages.push(StoredMessage::unread(message.clone()));

            let chat_id = message.chat_id();
            let index = match tables.conversations.iter().position(|c| c.id == chat_id) {
                Some(index) => index,
                None => {
                    tables.conversations.push(ConversationRecord {
                        id: chat_id,
                        participant_ids: [message.sender_id.clone(), message.receiver_id.clone()]
                            .into_iter()
                            .collect(),
                        last_message: None,
                        last_message_time: None,
                    });
                    tables.conversations.len() - 1
                }
            };
            let record = &mut tables.conversations[index];
            if record
                .last_message_time
                .map_or(true, |last| message.timestamp >= last)
            {
                record.last_message = Some(message.content.clone());
                record.last_message_time = Some(message.timestamp);
            }
        }
        self.inner.bump();
        Ok(())
    }

    fn mark_conversation_read(&self, reader_id: &str, chat_id: &ChatId) -> Result<usize> {
        let flipped = {
            let mut tables = self.inner.tables();
            let mut flipped = 0;
            for row in tables.messages.iter_mut() {
                if !row.read && row.message.receiver_id == reader_id && &row.message.chat_id() == chat_id
                {
                    row.read = true;
                    flipped += 1;
                }
            }
            flipped
        };
        if flipped > 0 {
            self.inner.bump();
        }
        Ok(flipped)
    }
}
