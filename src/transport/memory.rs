/// In-process chat backend.
/// Routes frames between connected users, stamps and persists every accepted
/// message in a `DocumentStore`, and exposes fault switches for exercising
/// reconnects, lost acknowledgements and rejected sends.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

use crate::error::{ChatError, Result};
use crate::identity::Identity;
use crate::models::{now_millis, ChatMessage, CorrelationToken, MessageId};
use crate::protocol::{ClientFrame, ServerFrame, WireMessage};
use crate::store::DocumentStore;
use crate::transport::{ChatTransport, TransportLink};

#[derive(Debug)]
struct ClientSlot {
    connection: u64,
    tx: mpsc::UnboundedSender<ServerFrame>,
}

#[derive(Debug, Default)]
struct Faults {
    refuse_next: u32,
    refuse_all: bool,
    swallow_sends: bool,
    reject_reason: Option<String>,
}

#[derive(Debug, Default)]
struct RelayState {
    clients: HashMap<String, ClientSlot>,
    next_connection: u64,
    last_timestamp: i64,
    faults: Faults,
}

struct RelayInner {
    store: Arc<dyn DocumentStore>,
    state: Mutex<RelayState>,
}

/// Shared relay; clones route through the same state.
#[derive(Clone)]
pub struct MemoryRelay {
    inner: Arc<RelayInner>,
}

impl MemoryRelay {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        MemoryRelay {
            inner: Arc::new(RelayInner {
                store,
                state: Mutex::new(RelayState::default()),
            }),
        }
    }

    /// Transport that opens links into this relay
    pub fn transport(&self) -> MemoryTransport {
        MemoryTransport {
            relay: self.clone(),
        }
    }

    pub fn store(&self) -> Arc<dyn DocumentStore> {
        self.inner.store.clone()
    }

    fn state(&self) -> MutexGuard<'_, RelayState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // Fault switches

    /// Refuse the next `count` connection attempts.
    pub fn refuse_next_connections(&self, count: u32) {
        self.state().faults.refuse_next = count;
    }

    /// Refuse every connection attempt until switched off.
    pub fn refuse_connections(&self, refuse: bool) {
        self.state().faults.refuse_all = refuse;
    }

    /// Accept sends without persisting or acknowledging them.
    pub fn swallow_sends(&self, swallow: bool) {
        self.state().faults.swallow_sends = swallow;
    }

    /// Answer every send with a nack carrying `reason`.
    pub fn reject_sends(&self, reason: Option<&str>) {
        self.state().faults.reject_reason = reason.map(str::to_string);
    }

    /// Drop the user's live connection from the backend side.
    pub fn sever(&self, user_id: &str) -> bool {
        let removed = self.state().clients.remove(user_id).is_some();
        if removed {
            log::info!("Relay severed connection of {}", user_id);
        }
        removed
    }

    pub fn is_connected(&self, user_id: &str) -> bool {
        self.state().clients.contains_key(user_id)
    }

    pub fn connected_users(&self) -> Vec<String> {
        let mut users: Vec<String> = self.state().clients.keys().cloned().collect();
        users.sort();
        users
    }

    /// Accept a message that did not come through a link (another device,
    /// a server-side job). It is stamped, stored and pushed to both sides.
    pub fn inject(&self, sender_id: &str, receiver_id: &str, content: &str) -> Result<ChatMessage> {
        let message = self.stamp(sender_id, receiver_id, content);
        self.inner.store.record_message(&message)?;
        let wire = WireMessage::from(&message);
        for user in [sender_id, receiver_id] {
            self.push(
                user,
                ServerFrame::Message {
                    message: wire.clone(),
                    correlation_token: None,
                },
            );
            if sender_id == receiver_id {
                break;
            }
        }
        Ok(message)
    }

    /// Push a raw frame to a connected user.
    pub fn deliver(&self, user_id: &str, frame: ServerFrame) -> bool {
        self.push(user_id, frame)
    }

    /// Server clock: strictly increasing across accepted messages.
    fn stamp(&self, sender_id: &str, receiver_id: &str, content: &str) -> ChatMessage {
        let timestamp = {
            let mut state = self.state();
            let timestamp = now_millis().max(state.last_timestamp + 1);
            state.last_timestamp = timestamp;
            timestamp
        };
        ChatMessage::confirmed(MessageId::new(), sender_id, receiver_id, content, timestamp)
    }

    fn push(&self, user_id: &str, frame: ServerFrame) -> bool {
        let state = self.state();
        match state.clients.get(user_id) {
            Some(slot) => slot.tx.send(frame).is_ok(),
            None => false,
        }
    }

    fn accept(&self, identity: &Identity) -> Result<TransportLink> {
        let mut state = self.state();
        if state.faults.refuse_all {
            return Err(ChatError::ConnectionError("connection refused".to_string()));
        }
        if state.faults.refuse_next > 0 {
            state.faults.refuse_next -= 1;
            return Err(ChatError::ConnectionError("connection refused".to_string()));
        }

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<ClientFrame>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<ServerFrame>();

        state.next_connection += 1;
        let connection = state.next_connection;
        let user_id = identity.user_id.clone();
        // a second login replaces the first, which sees its link drop
        state.clients.insert(
            user_id.clone(),
            ClientSlot {
                connection,
                tx: inbound_tx,
            },
        );
        drop(state);
        log::info!("Relay accepted {} (connection {})", user_id, connection);

        let relay = self.clone();
        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                relay.handle_frame(&user_id, frame);
            }
            relay.unregister(&user_id, connection);
        });

        Ok(TransportLink {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }

    fn unregister(&self, user_id: &str, connection: u64) {
        let mut state = self.state();
        if state
            .clients
            .get(user_id)
            .map_or(false, |slot| slot.connection == connection)
        {
            state.clients.remove(user_id);
            log::info!("Relay released {} (connection {})", user_id, connection);
        }
    }

    fn handle_frame(&self, sender_id: &str, frame: ClientFrame) {
        match frame {
            ClientFrame::Send {
                correlation_token,
                receiver_id,
                content,
            } => self.handle_send(sender_id, correlation_token, &receiver_id, &content),
        }
    }

    fn handle_send(
        &self,
        sender_id: &str,
        correlation_token: CorrelationToken,
        receiver_id: &str,
        content: &str,
    ) {
        let (swallow, reject) = {
            let state = self.state();
            (state.faults.swallow_sends, state.faults.reject_reason.clone())
        };

        if swallow {
            log::debug!("Relay swallowed send {} from {}", correlation_token, sender_id);
            return;
        }
        if let Some(reason) = reject {
            self.push(
                sender_id,
                ServerFrame::Nack {
                    correlation_token,
                    reason,
                },
            );
            return;
        }

        let message = self.stamp(sender_id, receiver_id, content);
        if let Err(e) = self.inner.store.record_message(&message) {
            log::error!("Failed to persist message: {}", e);
            self.push(
                sender_id,
                ServerFrame::Nack {
                    correlation_token,
                    reason: e.to_string(),
                },
            );
            return;
        }

        let wire = WireMessage::from(&message);
        self.push(
            sender_id,
            ServerFrame::Ack {
                correlation_token,
                message: wire.clone(),
            },
        );
        if receiver_id != sender_id {
            self.push(
                receiver_id,
                ServerFrame::Message {
                    message: wire,
                    correlation_token: None,
                },
            );
        }
    }
}

/// [`ChatTransport`] backed by a [`MemoryRelay`]
#[derive(Clone)]
pub struct MemoryTransport {
    relay: MemoryRelay,
}

impl MemoryTransport {
    pub fn relay(&self) -> &MemoryRelay {
        &self.relay
    }
}

#[async_trait]
impl ChatTransport for MemoryTransport {
    async fn open(&self, identity: &Identity) -> Result<TransportLink> {
        identity.validate()?;
        self.relay.accept(identity)
    }
}
