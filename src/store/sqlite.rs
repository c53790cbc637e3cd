/// SQLite-backed document store.
/// Used as the CLI's local message cache. Live queries poll the database and
/// emit only when the result set changed, so writes made by another process
/// on the same file are picked up as well.

use futures::stream::{self, StreamExt};
use rusqlite::{params, Connection, ErrorCode};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::{Interval, MissedTickBehavior};

use crate::error::{ChatError, Result};
use crate::models::{ChatId, ChatMessage, Conversation, StoredMessage};
use crate::query::{QueryFilter, ResultSet, SnapshotSource, SnapshotStream};
use crate::store::{ensure_confirmed, DocumentStore, StoreError};

/// Default delay between two evaluations of a live query
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

const MESSAGE_COLUMNS: &str = "message_id, sender_id, receiver_id, content, timestamp, read";

pub struct SqliteStore {
    db: Arc<Mutex<Connection>>,
    db_path: PathBuf,
    poll_interval: Duration,
}

impl SqliteStore {
    /// Open (or create) the database at `db_path`
    pub fn new(db_path: PathBuf) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let db = Connection::open(&db_path)
            .map_err(|e| ChatError::StorageError(format!("Failed to open database: {}", e)))?;
        db.busy_timeout(Duration::from_millis(250))?;

        let store = SqliteStore {
            db: Arc::new(Mutex::new(db)),
            db_path,
            poll_interval: DEFAULT_POLL_INTERVAL,
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Create an in-memory database (for testing)
    pub fn in_memory() -> Result<Self> {
        let db = Connection::open_in_memory().map_err(|e| {
            ChatError::StorageError(format!("Failed to create in-memory DB: {}", e))
        })?;

        let store = SqliteStore {
            db: Arc::new(Mutex::new(db)),
            db_path: PathBuf::from(":memory:"),
            poll_interval: DEFAULT_POLL_INTERVAL,
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Set the delay between two evaluations. Clamped to at least 1 ms.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval.max(MIN_POLL_INTERVAL);
        self
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.db
            .lock()
            .map_err(|_| ChatError::StorageError("Failed to lock database".to_string()))
    }

    fn init_schema(&self) -> Result<()> {
        let db = self.lock()?;
        db.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                message_id TEXT NOT NULL UNIQUE,
                chat_id TEXT NOT NULL,
                sender_id TEXT NOT NULL,
                receiver_id TEXT NOT NULL,
                content TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                read INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS conversations (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                chat_id TEXT NOT NULL UNIQUE,
                participant_a TEXT NOT NULL,
                participant_b TEXT NOT NULL,
                last_message TEXT,
                last_message_time INTEGER
            );

            CREATE INDEX IF NOT EXISTS idx_messages_chat ON messages(chat_id);
            CREATE INDEX IF NOT EXISTS idx_messages_receiver ON messages(receiver_id, read);
            "#,
        )
        .map_err(|e| ChatError::StorageError(format!("Failed to create schema: {}", e)))?;
        Ok(())
    }

    /// Messages of one conversation in insertion order.
    pub fn conversation_messages(&self, chat_id: &ChatId) -> Result<Vec<StoredMessage>> {
        let db = self.lock()?;
        Ok(select_messages(&db, &QueryFilter::Conversation(chat_id.clone()))?)
    }
}

fn store_error(err: rusqlite::Error) -> StoreError {
    match err.sqlite_error_code() {
        Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => StoreError::Unavailable,
        _ => StoreError::Failed(err.to_string()),
    }
}

fn message_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredMessage> {
    let message_id: String = row.get(0)?;
    let sender_id: String = row.get(1)?;
    let receiver_id: String = row.get(2)?;
    let content: String = row.get(3)?;
    Ok(StoredMessage {
        message: ChatMessage::confirmed(message_id, &sender_id, &receiver_id, &content, row.get(4)?),
        read: row.get::<_, i64>(5)? != 0,
    })
}

fn select_messages(
    db: &Connection,
    filter: &QueryFilter,
) -> std::result::Result<Vec<StoredMessage>, StoreError> {
    let (sql, key) = match filter {
        QueryFilter::Conversation(chat_id) => (
            format!("SELECT {} FROM messages WHERE chat_id = ?1 ORDER BY seq", MESSAGE_COLUMNS),
            chat_id.as_str().to_string(),
        ),
        QueryFilter::Unread(user_id) => (
            format!(
                "SELECT {} FROM messages WHERE receiver_id = ?1 AND read = 0 ORDER BY seq",
                MESSAGE_COLUMNS
            ),
            user_id.clone(),
        ),
        QueryFilter::Participant(_) => {
            return Err(StoreError::Failed("not a message filter".to_string()))
        }
    };

    let mut stmt = db.prepare_cached(&sql).map_err(store_error)?;
    let rows = stmt
        .query_map(params![key], message_from_row)
        .map_err(store_error)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(store_error)?;
    Ok(rows)
}

fn select_conversations(
    db: &Connection,
    user_id: &str,
) -> std::result::Result<Vec<Conversation>, StoreError> {
    let mut stmt = db
        .prepare_cached(
            "SELECT c.chat_id, c.participant_a, c.participant_b, c.last_message, c.last_message_time,
                    (SELECT COUNT(*) FROM messages m
                      WHERE m.chat_id = c.chat_id AND m.receiver_id = ?1 AND m.read = 0)
             FROM conversations c
             WHERE c.participant_a = ?1 OR c.participant_b = ?1
             ORDER BY c.seq",
        )
        .map_err(store_error)?;

    let rows = stmt
        .query_map(params![user_id], |row| {
            let participants: BTreeSet<String> =
                [row.get::<_, String>(1)?, row.get::<_, String>(2)?]
                    .into_iter()
                    .collect();
            Ok(Conversation {
                id: ChatId::from(row.get::<_, String>(0)?),
                participant_ids: participants,
                last_message: row.get(3)?,
                last_message_time: row.get(4)?,
                unread_count: row.get::<_, i64>(5)? as usize,
            })
        })
        .map_err(store_error)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(store_error)?;
    Ok(rows)
}

fn evaluate(
    db: &Mutex<Connection>,
    filter: &QueryFilter,
) -> std::result::Result<ResultSet, StoreError> {
    let db = db
        .lock()
        .map_err(|_| StoreError::Failed("database lock poisoned".to_string()))?;
    match filter {
        QueryFilter::Participant(user_id) => {
            select_conversations(&db, user_id).map(ResultSet::Conversations)
        }
        other => select_messages(&db, other).map(ResultSet::Messages),
    }
}

struct Poll {
    db: Arc<Mutex<Connection>>,
    filter: QueryFilter,
    period: Duration,
    ticker: Option<Interval>,
    last: Option<ResultSet>,
    last_error: Option<StoreError>,
}

impl Poll {
    /// Decide whether `err` is worth emitting. A repeat of the error already
    /// reported is dropped so an outage is reported once, not once per tick.
    fn report(&mut self, err: StoreError) -> Option<StoreError> {
        if self.last_error.as_ref() == Some(&err) {
            return None;
        }
        if matches!(err, StoreError::Failed(_)) {
            // recovery re-emits the rows so views can clear their error
            self.last = None;
        }
        self.last_error = Some(err.clone());
        Some(err)
    }
}

impl SnapshotSource for SqliteStore {
    fn observe(&self, filter: QueryFilter) -> SnapshotStream {
        let poll = Poll {
            db: self.db.clone(),
            filter,
            period: self.poll_interval,
            ticker: None,
            last: None,
            last_error: None,
        };

        stream::unfold(poll, |mut poll| async move {
            loop {
                let period = poll.period;
                let ticker = poll.ticker.get_or_insert_with(|| {
                    let mut ticker = tokio::time::interval(period);
                    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    ticker
                });
                ticker.tick().await;

                match evaluate(&poll.db, &poll.filter) {
                    Ok(result) => {
                        poll.last_error = None;
                        if poll.last.as_ref() == Some(&result) {
                            continue;
                        }
                        poll.last = Some(result.clone());
                        return Some((Ok(result), poll));
                    }
                    Err(err) => match poll.report(err) {
                        Some(err) => return Some((Err(err), poll)),
                        None => continue,
                    },
                }
            }
        })
        .boxed()
    }
}

impl DocumentStore for SqliteStore {
    fn record_message(&self, message: &ChatMessage) -> Result<()> {
        ensure_confirmed(message)?;
        let mut db = self.lock()?;
        let tx = db.transaction()?;

        let chat_id = message.chat_id();
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO messages (message_id, chat_id, sender_id, receiver_id, content, timestamp, read)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0)",
            params![
                message.message_id().as_str(),
                chat_id.as_str(),
                &message.sender_id,
                &message.receiver_id,
                &message.content,
                message.timestamp,
            ],
        )?;

        if inserted == 0 {
            log::debug!("Message {} already cached", message.message_id());
            return Ok(());
        }

        let (a, b) = if message.sender_id <= message.receiver_id {
            (&message.sender_id, &message.receiver_id)
        } else {
            (&message.receiver_id, &message.sender_id)
        };
        tx.execute(
            "INSERT INTO conversations (chat_id, participant_a, participant_b, last_message, last_message_time)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(chat_id) DO UPDATE SET
                 last_message = excluded.last_message,
                 last_message_time = excluded.last_message_time
             WHERE conversations.last_message_time IS NULL
                OR excluded.last_message_time >= conversations.last_message_time",
            params![chat_id.as_str(), a, b, &message.content, message.timestamp],
        )?;

        tx.commit()?;
        Ok(())
    }

    fn mark_conversation_read(&self, reader_id: &str, chat_id: &ChatId) -> Result<usize> {
        let db = self.lock()?;
        let flipped = db.execute(
            "UPDATE messages SET read = 1 WHERE chat_id = ?1 AND receiver_id = ?2 AND read = 0",
            params![chat_id.as_str(), reader_id],
        )?;
        Ok(flipped)
    }
}
