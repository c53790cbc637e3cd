/// Integration tests for live queries over the document stores
mod common;

use carechat_core::query::{
    ConversationIndex, MessageFeed, MessageFeedQuery, RealtimeQuery, UnreadTracker,
};
use carechat_core::{ChatError, ChatId, ChatMessage, DocumentStore, MemoryStore, SqliteStore};
use common::{contents, eventually, init_logging};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn confirmed(id: &str, sender: &str, receiver: &str, content: &str, ts: i64) -> ChatMessage {
    ChatMessage::confirmed(id, sender, receiver, content, ts)
}

#[tokio::test]
async fn test_snapshot_on_subscribe_and_on_change() {
    init_logging();
    let store = MemoryStore::new();
    store.record_message(&confirmed("m1", "u1", "u2", "hello", 10)).unwrap();

    let snapshots = Arc::new(Mutex::new(Vec::new()));
    let sink = snapshots.clone();
    let _subscription = RealtimeQuery::subscribe(
        &store,
        MessageFeedQuery::new(ChatId::between("u1", "u2")),
        move |rows| sink.lock().unwrap().push(rows),
        |err| panic!("unexpected error: {}", err),
    );

    eventually(|| snapshots.lock().unwrap().len() == 1).await;
    store.record_message(&confirmed("m2", "u2", "u1", "hi", 20)).unwrap();
    eventually(|| snapshots.lock().unwrap().len() == 2).await;

    let latest = snapshots.lock().unwrap().last().cloned().unwrap();
    assert_eq!(contents(&latest), vec!["hello", "hi"]);
}

#[tokio::test]
async fn test_no_callback_after_unsubscribe() {
    init_logging();
    let store = MemoryStore::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();

    let subscription = RealtimeQuery::subscribe(
        &store,
        MessageFeedQuery::new(ChatId::between("u1", "u2")),
        move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        },
        |_| {},
    );
    eventually(|| calls.load(Ordering::SeqCst) == 1).await;

    subscription.unsubscribe();
    subscription.unsubscribe();
    assert!(!subscription.is_active());

    for i in 0..5 {
        store
            .record_message(&confirmed(&format!("m{}", i), "u1", "u2", "x", i))
            .unwrap();
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_drop_unsubscribes() {
    init_logging();
    let store = MemoryStore::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();

    let subscription = RealtimeQuery::subscribe(
        &store,
        MessageFeedQuery::new(ChatId::between("u1", "u2")),
        move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        },
        |_| {},
    );
    eventually(|| calls.load(Ordering::SeqCst) == 1).await;
    drop(subscription);

    store.record_message(&confirmed("m1", "u1", "u2", "x", 1)).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_transient_unavailability_is_swallowed() {
    init_logging();
    let store = MemoryStore::new();
    let errors = Arc::new(AtomicUsize::new(0));
    let error_counter = errors.clone();
    let snapshots = Arc::new(AtomicUsize::new(0));
    let snapshot_counter = snapshots.clone();

    let _subscription = RealtimeQuery::subscribe(
        &store,
        MessageFeedQuery::new(ChatId::between("u1", "u2")),
        move |_| {
            snapshot_counter.fetch_add(1, Ordering::SeqCst);
        },
        move |_| {
            error_counter.fetch_add(1, Ordering::SeqCst);
        },
    );
    eventually(|| snapshots.load(Ordering::SeqCst) == 1).await;

    store.set_unavailable(true);
    store.record_message(&confirmed("m1", "u1", "u2", "x", 1)).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(snapshots.load(Ordering::SeqCst), 1);

    store.set_unavailable(false);
    eventually(|| snapshots.load(Ordering::SeqCst) == 2).await;
    assert_eq!(errors.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_hard_failure_reports_and_keeps_stale_rows() {
    init_logging();
    let store = MemoryStore::new();
    store.record_message(&confirmed("m1", "u1", "u2", "kept", 1)).unwrap();

    let feed = MessageFeed::start(&store, MessageFeedQuery::new(ChatId::between("u1", "u2")));
    eventually(|| feed.messages().len() == 1).await;

    store.fail_with(Some("permission denied"));
    eventually(|| feed.last_error().is_some()).await;

    assert!(feed.last_error().unwrap().contains("permission denied"));
    assert_eq!(contents(&feed.messages()), vec!["kept"]);

    store.fail_with(None);
    eventually(|| feed.last_error().is_none()).await;
    assert_eq!(contents(&feed.messages()), vec!["kept"]);
}

#[tokio::test]
async fn test_failure_maps_to_subscription_error() {
    init_logging();
    let store = MemoryStore::new();
    store.fail_with(Some("quota exceeded"));

    let seen = Arc::new(Mutex::new(None));
    let sink = seen.clone();
    let _subscription = RealtimeQuery::subscribe(
        &store,
        MessageFeedQuery::new(ChatId::between("u1", "u2")),
        |_| {},
        move |err| {
            *sink.lock().unwrap() = Some(err);
        },
    );

    eventually(|| seen.lock().unwrap().is_some()).await;
    let err = seen.lock().unwrap().take().unwrap();
    assert!(matches!(err, ChatError::SubscriptionError(reason) if reason == "quota exceeded"));
}

#[tokio::test]
async fn test_feed_sorts_and_pages_client_side() {
    init_logging();
    let store = MemoryStore::new();
    // inserted out of timestamp order
    for (id, ts) in [("c", 30), ("a", 10), ("d", 40), ("b", 20)] {
        store.record_message(&confirmed(id, "u1", "u2", id, ts)).unwrap();
    }

    let feed = MessageFeed::start(
        &store,
        MessageFeedQuery::new(ChatId::between("u1", "u2")).with_page_size(3),
    );
    eventually(|| !feed.messages().is_empty()).await;
    assert_eq!(contents(&feed.messages()), vec!["b", "c", "d"]);
}

#[tokio::test]
async fn test_conversation_index_orders_by_recent_activity() {
    init_logging();
    let store = MemoryStore::new();
    store.record_message(&confirmed("m1", "u2", "u1", "older", 10)).unwrap();
    store.record_message(&confirmed("m2", "u3", "u1", "newer", 20)).unwrap();
    store.record_message(&confirmed("m3", "u2", "u3", "not mine", 30)).unwrap();

    let index = ConversationIndex::start(&store, "u1");
    eventually(|| index.conversations().len() == 2).await;

    let ids: Vec<String> = index
        .conversations()
        .iter()
        .map(|c| c.id.to_string())
        .collect();
    assert_eq!(ids, vec!["u1_u3", "u1_u2"]);
    assert_eq!(index.total_unread(), 2);

    store.record_message(&confirmed("m4", "u1", "u2", "reply", 40)).unwrap();
    eventually(|| index.conversations()[0].id == ChatId::between("u1", "u2")).await;
    assert_eq!(index.conversations()[0].last_message.as_deref(), Some("reply"));
}

#[tokio::test]
async fn test_unread_tracker_is_observational() {
    init_logging();
    let store = MemoryStore::new();
    store.record_message(&confirmed("m1", "u2", "u1", "a", 1)).unwrap();
    store.record_message(&confirmed("m2", "u3", "u1", "b", 2)).unwrap();
    store.record_message(&confirmed("m3", "u1", "u2", "c", 3)).unwrap();

    let tracker = UnreadTracker::start(&store, "u1");
    eventually(|| tracker.unread_count() == 2).await;

    let breakdown = tracker.unread_by_conversation();
    assert_eq!(breakdown.get(&ChatId::between("u1", "u2")), Some(&1));
    assert_eq!(breakdown.get(&ChatId::between("u1", "u3")), Some(&1));

    store
        .mark_conversation_read("u1", &ChatId::between("u1", "u3"))
        .unwrap();
    eventually(|| tracker.unread_count() == 1).await;
}

#[tokio::test]
async fn test_sqlite_store_drives_views() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteStore::new(dir.path().join("cache.db"))
        .unwrap()
        .with_poll_interval(Duration::from_millis(10));

    let tracker = UnreadTracker::start(&store, "u1");
    let feed = MessageFeed::start(&store, MessageFeedQuery::new(ChatId::between("u1", "u2")));

    store.record_message(&confirmed("m2", "u2", "u1", "second", 20)).unwrap();
    store.record_message(&confirmed("m1", "u2", "u1", "first", 10)).unwrap();

    eventually(|| tracker.unread_count() == 2).await;
    eventually(|| feed.messages().len() == 2).await;
    assert_eq!(contents(&feed.messages()), vec!["first", "second"]);

    store
        .mark_conversation_read("u1", &ChatId::between("u1", "u2"))
        .unwrap();
    eventually(|| tracker.unread_count() == 0).await;
}
