//! Snapshot-style live queries.
//!
//! A [`SnapshotSource`] turns a [`QueryFilter`] into a stream of full result
//! sets, one per change in the underlying store. [`RealtimeQuery::subscribe`]
//! drives such a stream on a background task, shapes every result set with a
//! [`Query`] (client-side filter + sort) and hands the rows to the caller.
//!
//! Delivery is gated: once [`Subscription::unsubscribe`] returns, neither
//! callback runs again for that subscription.

pub mod conversations;
pub mod feed;
pub mod unread;

pub use conversations::{ConversationIndex, ConversationQuery};
pub use feed::{MessageFeed, MessageFeedQuery, DEFAULT_PAGE_SIZE};
pub use unread::{UnreadMessage, UnreadQuery, UnreadTracker};

use futures::stream::BoxStream;
use futures::StreamExt;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::{ChatError, Result};
use crate::models::{ChatId, Conversation, StoredMessage};
use crate::store::StoreError;

/// What a live query selects
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum QueryFilter {
    /// Messages where chat id = X.
    Conversation(ChatId),
    /// Conversations whose participants contain the user.
    Participant(String),
    /// Messages where receiver = user and read = false.
    Unread(String),
}

/// Full result set of one evaluation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResultSet {
    Messages(Vec<StoredMessage>),
    Conversations(Vec<Conversation>),
}

pub type SnapshotStream = BoxStream<'static, std::result::Result<ResultSet, StoreError>>;

/// Anything that can serve live queries (document store, local cache, …)
pub trait SnapshotSource: Send + Sync {
    /// Stream that yields the current result set immediately and again after
    /// every change that may affect it.
    fn observe(&self, filter: QueryFilter) -> SnapshotStream;
}

/// Client-side shaping of a result set
pub trait Query: Send + 'static {
    type Row: Clone + Send + 'static;

    fn filter(&self) -> QueryFilter;

    fn shape(&self, result: ResultSet) -> Result<Vec<Self::Row>>;
}

#[derive(Debug)]
struct Gate {
    open: Mutex<bool>,
}

impl Gate {
    fn lock(&self) -> MutexGuard<'_, bool> {
        self.open.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Handle of a live query. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    gate: Arc<Gate>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Subscription {
    /// Stop delivery. Idempotent. Waits for a callback that is running on
    /// another thread, so it must not be called from inside this
    /// subscription's own callbacks.
    pub fn unsubscribe(&self) {
        *self.gate.lock() = false;
        let task = self
            .task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(task) = task {
            task.abort();
        }
    }

    pub fn is_active(&self) -> bool {
        *self.gate.lock()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

enum Delivery<R> {
    Rows(Vec<R>),
    Failure(ChatError),
}

/// Run one callback under the gate. `false` once the subscription is closed.
fn deliver<R, S, E>(gate: &Gate, delivery: Delivery<R>, on_snapshot: &mut S, on_error: &mut E) -> bool
where
    S: FnMut(Vec<R>),
    E: FnMut(ChatError),
{
    let open = gate.lock();
    if !*open {
        return false;
    }
    match delivery {
        Delivery::Rows(rows) => on_snapshot(rows),
        Delivery::Failure(err) => on_error(err),
    }
    true
}

pub struct RealtimeQuery;

impl RealtimeQuery {
    /// Subscribe to `query` on `source`. Must be called inside a Tokio runtime.
    ///
    /// Transient unavailability of the source is logged and waited out; any
    /// other failure goes to `on_error` and the subscription stays open.
    pub fn subscribe<Q, S, E>(
        source: &(impl SnapshotSource + ?Sized),
        query: Q,
        mut on_snapshot: S,
        mut on_error: E,
    ) -> Subscription
    where
        Q: Query,
        S: FnMut(Vec<Q::Row>) + Send + 'static,
        E: FnMut(ChatError) + Send + 'static,
    {
        let filter = query.filter();
        let mut stream = source.observe(filter.clone());
        let gate = Arc::new(Gate {
            open: Mutex::new(true),
        });
        let task_gate = gate.clone();

        let task = tokio::spawn(async move {
            while let Some(item) = stream.next().await {
                let delivery = match item {
                    Ok(result) => match query.shape(result) {
                        Ok(rows) => Delivery::Rows(rows),
                        Err(err) => Delivery::Failure(err),
                    },
                    Err(StoreError::Unavailable) => {
                        log::debug!("Query {:?}: source unavailable, waiting", filter);
                        continue;
                    }
                    Err(StoreError::Failed(reason)) => {
                        log::warn!("Query {:?} failed: {}", filter, reason);
                        Delivery::Failure(ChatError::SubscriptionError(reason))
                    }
                };
                if !deliver(&task_gate, delivery, &mut on_snapshot, &mut on_error) {
                    break;
                }
            }
        });

        Subscription {
            gate,
            task: Mutex::new(Some(task)),
        }
    }
}

/// Latest rows of a live query, kept across failures.
#[derive(Debug)]
pub struct LiveView<R> {
    subscription: Subscription,
    rows: watch::Receiver<Vec<R>>,
    error: watch::Receiver<Option<String>>,
}

impl<R> LiveView<R>
where
    R: Clone + Send + Sync + 'static,
{
    pub fn start<Q>(source: &(impl SnapshotSource + ?Sized), query: Q) -> Self
    where
        Q: Query<Row = R>,
    {
        let (rows_tx, rows) = watch::channel(Vec::new());
        let (error_tx, error) = watch::channel(None);
        let error_tx = Arc::new(error_tx);
        let clear_error = error_tx.clone();

        let subscription = RealtimeQuery::subscribe(
            source,
            query,
            move |snapshot| {
                rows_tx.send_replace(snapshot);
                clear_error.send_replace(None);
            },
            move |err| {
                // stale rows stay visible
                error_tx.send_replace(Some(err.to_string()));
            },
        );

        LiveView {
            subscription,
            rows,
            error,
        }
    }

    pub fn current(&self) -> Vec<R> {
        self.rows.borrow().clone()
    }

    /// Receiver that is notified on every delivered snapshot.
    pub fn changes(&self) -> watch::Receiver<Vec<R>> {
        self.rows.clone()
    }

    /// Last failure since the most recent good snapshot.
    pub fn last_error(&self) -> Option<String> {
        self.error.borrow().clone()
    }

    pub fn stop(&self) {
        self.subscription.unsubscribe();
    }

    pub fn is_active(&self) -> bool {
        self.subscription.is_active()
    }
}
