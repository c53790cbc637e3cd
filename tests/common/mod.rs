//! Common test utilities and helpers for integration tests
//! Provides an in-process backend rig and waiting helpers for the chat core

#![allow(dead_code)]

use carechat_core::{
    ChatConfig, ChatFacade, ChatMessage, ConnectionState, DocumentStore, Identity, MemoryRelay,
    MemoryStore, SessionIdentity,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

/// Initialize logging once per test binary
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Backend shared by every facade of a test
pub struct TestRig {
    pub store: MemoryStore,
    pub relay: MemoryRelay,
}

impl TestRig {
    pub fn new() -> Self {
        init_logging();
        let store = MemoryStore::new();
        let relay = MemoryRelay::new(Arc::new(store.clone()));
        TestRig { store, relay }
    }

    pub fn document_store(&self) -> Arc<dyn DocumentStore> {
        Arc::new(self.store.clone())
    }

    /// Facade for `user_id` without a store attached
    pub fn facade(&self, user_id: &str, config: ChatConfig) -> ChatFacade {
        ChatFacade::builder(
            SessionIdentity::signed_in(Identity::new(user_id, "test-token")),
            Arc::new(self.relay.transport()),
        )
        .config(config)
        .build()
        .expect("facade should build")
    }

    /// Facade for `user_id` with the rig's store attached
    pub fn facade_with_store(&self, user_id: &str, config: ChatConfig) -> ChatFacade {
        ChatFacade::builder(
            SessionIdentity::signed_in(Identity::new(user_id, "test-token")),
            Arc::new(self.relay.transport()),
        )
        .config(config)
        .store(self.document_store())
        .build()
        .expect("facade should build")
    }
}

/// Fast retries so exhaustion tests stay short
pub fn quick_config() -> ChatConfig {
    ChatConfig::default().with_retry(
        3,
        Duration::from_millis(100),
        Duration::from_millis(400),
    )
}

/// Records every state passed to the facade's state callback
pub fn record_states(facade: &ChatFacade) -> Arc<Mutex<Vec<ConnectionState>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    facade.on_state_change(move |state| sink.lock().unwrap().push(state));
    seen
}

/// Wait until the watched value satisfies `predicate`
pub async fn wait_for<T, F>(rx: &mut watch::Receiver<T>, predicate: F) -> T
where
    T: Clone,
    F: FnMut(&T) -> bool,
{
    tokio::time::timeout(Duration::from_secs(60), rx.wait_for(predicate))
        .await
        .expect("condition not reached in time")
        .expect("sender dropped")
        .clone()
}

/// Poll `probe` until it returns true, yielding to the runtime in between
pub async fn eventually<F>(mut probe: F)
where
    F: FnMut() -> bool,
{
    for _ in 0..200 {
        if probe() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

pub fn contents(messages: &[ChatMessage]) -> Vec<String> {
    messages.iter().map(|m| m.content.clone()).collect()
}
