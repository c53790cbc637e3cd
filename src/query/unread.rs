use std::collections::HashMap;

use crate::error::{ChatError, Result};
use crate::models::{ChatId, StoredMessage};
use crate::query::{LiveView, Query, QueryFilter, ResultSet, SnapshotSource};

/// An unread message addressed to the tracked user
pub type UnreadMessage = StoredMessage;

#[derive(Debug, Clone)]
pub struct UnreadQuery {
    pub user_id: String,
}

impl UnreadQuery {
    pub fn new(user_id: &str) -> Self {
        UnreadQuery {
            user_id: user_id.to_string(),
        }
    }
}

impl Query for UnreadQuery {
    type Row = UnreadMessage;

    fn filter(&self) -> QueryFilter {
        QueryFilter::Unread(self.user_id.clone())
    }

    fn shape(&self, result: ResultSet) -> Result<Vec<UnreadMessage>> {
        match result {
            ResultSet::Messages(mut rows) => {
                rows.retain(|row| !row.read && row.message.receiver_id == self.user_id);
                Ok(rows)
            }
            ResultSet::Conversations(_) => Err(ChatError::SubscriptionError(
                "expected messages, got conversations".to_string(),
            )),
        }
    }
}

/// Live unread counter for one user
#[derive(Debug)]
pub struct UnreadTracker {
    user_id: String,
    view: LiveView<UnreadMessage>,
}

impl UnreadTracker {
    pub fn start(source: &(impl SnapshotSource + ?Sized), user_id: &str) -> Self {
        UnreadTracker {
            user_id: user_id.to_string(),
            view: LiveView::start(source, UnreadQuery::new(user_id)),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn unread_count(&self) -> usize {
        self.view.current().len()
    }

    pub fn unread_messages(&self) -> Vec<UnreadMessage> {
        self.view.current()
    }

    pub fn unread_by_conversation(&self) -> HashMap<ChatId, usize> {
        count_by_conversation(&self.view.current())
    }

    pub fn changes(&self) -> tokio::sync::watch::Receiver<Vec<UnreadMessage>> {
        self.view.changes()
    }

    pub fn last_error(&self) -> Option<String> {
        self.view.last_error()
    }

    pub fn stop(&self) {
        self.view.stop();
    }
}

pub fn count_by_conversation(rows: &[UnreadMessage]) -> HashMap<ChatId, usize> {
    let mut counts = HashMap::new();
    for row in rows {
        *counts.entry(row.message.chat_id()).or_insert(0) += 1;
    }
    counts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChatMessage;

    fn row(id: &str, sender: &str, receiver: &str, read: bool) -> StoredMessage {
        StoredMessage {
            message: ChatMessage::confirmed(id, sender, receiver, "hi", 1),
            read,
        }
    }

    #[test]
    fn test_unread_only_counts_own_unread() {
        let query = UnreadQuery::new("u1");
        let rows = vec![
            row("a", "u2", "u1", false),
            row("b", "u2", "u1", true),
            row("c", "u1", "u2", false),
        ];
        let shaped = query.shape(ResultSet::Messages(rows)).unwrap();
        assert_eq!(shaped.len(), 1);
        assert_eq!(shaped[0].message.message_id().as_str(), "a");
    }

    #[test]
    fn test_count_by_conversation() {
        let rows = vec![
            row("a", "u2", "u1", false),
            row("b", "u2", "u1", false),
            row("c", "u3", "u1", false),
        ];
        let counts = count_by_conversation(&rows);
        assert_eq!(counts.get(&ChatId::between("u1", "u2")), Some(&2));
        assert_eq!(counts.get(&ChatId::between("u1", "u3")), Some(&1));
    }
}
