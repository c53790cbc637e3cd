use std::cmp::Reverse;

use crate::error::{ChatError, Result};
use crate::models::Conversation;
use crate::query::{LiveView, Query, QueryFilter, ResultSet, SnapshotSource};

/// Conversations of one user, most recent activity first.
#[derive(Debug, Clone)]
pub struct ConversationQuery {
    pub user_id: String,
}

impl ConversationQuery {
    pub fn new(user_id: &str) -> Self {
        ConversationQuery {
            user_id: user_id.to_string(),
        }
    }
}

impl Query for ConversationQuery {
    type Row = Conversation;

    fn filter(&self) -> QueryFilter {
        QueryFilter::Participant(self.user_id.clone())
    }

    fn shape(&self, result: ResultSet) -> Result<Vec<Conversation>> {
        let mut conversations = match result {
            ResultSet::Conversations(rows) => rows,
            ResultSet::Messages(_) => {
                return Err(ChatError::SubscriptionError(
                    "expected conversations, got messages".to_string(),
                ))
            }
        };
        conversations.retain(|c| c.has_participant(&self.user_id));
        // conversations without any message go last
        conversations.sort_by_key(|c| Reverse(c.last_message_time));
        Ok(conversations)
    }
}

/// Live conversation list
#[derive(Debug)]
pub struct ConversationIndex {
    user_id: String,
    view: LiveView<Conversation>,
}

impl ConversationIndex {
    pub fn start(source: &(impl SnapshotSource + ?Sized), user_id: &str) -> Self {
        ConversationIndex {
            user_id: user_id.to_string(),
            view: LiveView::start(source, ConversationQuery::new(user_id)),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn conversations(&self) -> Vec<Conversation> {
        self.view.current()
    }

    pub fn changes(&self) -> tokio::sync::watch::Receiver<Vec<Conversation>> {
        self.view.changes()
    }

    /// Sum of the per-conversation unread counters.
    pub fn total_unread(&self) -> usize {
        self.view.current().iter().map(|c| c.unread_count).sum()
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

    fn conversation(a: &str, b: &str, last: Option<i64>) -> Conversation {
        let mut conv = Conversation::new(a, b);
        conv.last_message_time = last;
        conv.last_message = last.map(|t| format!("at {}", t));
        conv
    }

    #[test]
    fn test_conversations_sorted_by_recent_activity() {
        let query = ConversationQuery::new("u1");
        let rows = vec![
            conversation("u1", "u2", Some(10)),
            conversation("u1", "u3", None),
            conversation("u1", "u4", Some(30)),
        ];
        let shaped = query.shape(ResultSet::Conversations(rows)).unwrap();
        let order: Vec<&str> = shaped.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(order, vec!["u1_u4", "u1_u2", "u1_u3"]);
    }

    #[test]
    fn test_conversations_exclude_non_participants() {
        let query = ConversationQuery::new("u1");
        let rows = vec![conversation("u2", "u3", Some(5))];
        let shaped = query.shape(ResultSet::Conversations(rows)).unwrap();
        assert!(shaped.is_empty());
    }
}
