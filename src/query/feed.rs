use crate::error::{ChatError, Result};
use crate::models::{ChatId, ChatMessage};
use crate::query::{LiveView, Query, QueryFilter, ResultSet, SnapshotSource};

/// Messages kept per conversation page
pub const DEFAULT_PAGE_SIZE: usize = 50;

/// The most recent `page_size` messages of one conversation, oldest first.
///
/// Rows arrive in store insertion order; sorting happens here. Equal
/// timestamps keep their insertion order.
#[derive(Debug, Clone)]
pub struct MessageFeedQuery {
    pub chat_id: ChatId,
    pub page_size: usize,
}

impl MessageFeedQuery {
    pub fn new(chat_id: ChatId) -> Self {
        MessageFeedQuery {
            chat_id,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }
}

impl Query for MessageFeedQuery {
    type Row = ChatMessage;

    fn filter(&self) -> QueryFilter {
        QueryFilter::Conversation(self.chat_id.clone())
    }

    fn shape(&self, result: ResultSet) -> Result<Vec<ChatMessage>> {
        let rows = match result {
            ResultSet::Messages(rows) => rows,
            ResultSet::Conversations(_) => {
                return Err(ChatError::SubscriptionError(
                    "expected messages, got conversations".to_string(),
                ))
            }
        };

        let mut messages: Vec<ChatMessage> = rows
            .into_iter()
            .map(|stored| stored.message)
            .filter(|message| message.chat_id() == self.chat_id)
            .collect();

        // stable sort: equal timestamps keep insertion order
        messages.sort_by_key(|message| message.timestamp);
        let overflow = messages.len().saturating_sub(self.page_size);
        messages.drain(..overflow);
        Ok(messages)
    }
}

/// Live message page for one conversation
#[derive(Debug)]
pub struct MessageFeed {
    chat_id: ChatId,
    view: LiveView<ChatMessage>,
}

impl MessageFeed {
    pub fn start(source: &(impl SnapshotSource + ?Sized), query: MessageFeedQuery) -> Self {
        let chat_id = query.chat_id.clone();
        MessageFeed {
            chat_id,
            view: LiveView::start(source, query),
        }
    }

    pub fn chat_id(&self) -> &ChatId {
        &self.chat_id
    }

    pub fn messages(&self) -> Vec<ChatMessage> {
        self.view.current()
    }

    pub fn changes(&self) -> tokio::sync::watch::Receiver<Vec<ChatMessage>> {
        self.view.changes()
    }

    pub fn last_error(&self) -> Option<String> {
        self.view.last_error()
    }

    pub fn stop(&self) {
        self.view.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::StoredMessage;

    fn stored(id: &str, sender: &str, receiver: &str, ts: i64) -> StoredMessage {
        StoredMessage::unread(ChatMessage::confirmed(id, sender, receiver, id, ts))
    }

    fn ids(messages: &[ChatMessage]) -> Vec<String> {
        messages.iter().map(|m| m.message_id().to_string()).collect()
    }

    #[test]
    fn test_feed_sorts_ascending() {
        let query = MessageFeedQuery::new(ChatId::between("u1", "u2"));
        let rows = vec![
            stored("c", "u1", "u2", 30),
            stored("a", "u2", "u1", 10),
            stored("b", "u1", "u2", 20),
        ];
        let shaped = query.shape(ResultSet::Messages(rows)).unwrap();
        assert_eq!(ids(&shaped), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_feed_keeps_most_recent_page() {
        let query = MessageFeedQuery::new(ChatId::between("u1", "u2")).with_page_size(2);
        let rows = vec![
            stored("a", "u1", "u2", 10),
            stored("b", "u1", "u2", 20),
            stored("c", "u1", "u2", 30),
        ];
        let shaped = query.shape(ResultSet::Messages(rows)).unwrap();
        assert_eq!(ids(&shaped), vec!["b", "c"]);
    }

    #[test]
    fn test_feed_ties_keep_insertion_order() {
        let query = MessageFeedQuery::new(ChatId::between("u1", "u2"));
        let rows = vec![
            stored("first", "u1", "u2", 10),
            stored("second", "u2", "u1", 10),
            stored("third", "u1", "u2", 10),
        ];
        let shaped = query.shape(ResultSet::Messages(rows)).unwrap();
        assert_eq!(ids(&shaped), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_feed_ignores_other_conversations() {
        let query = MessageFeedQuery::new(ChatId::between("u1", "u2"));
        let rows = vec![stored("a", "u1", "u2", 10), stored("x", "u1", "u3", 11)];
        let shaped = query.shape(ResultSet::Messages(rows)).unwrap();
        assert_eq!(ids(&shaped), vec!["a"]);
    }

    #[test]
    fn test_feed_rejects_wrong_result_kind() {
        let query = MessageFeedQuery::new(ChatId::between("u1", "u2"));
        let result = query.shape(ResultSet::Conversations(vec![]));
        assert!(matches!(result, Err(ChatError::SubscriptionError(_))));
    }
}
