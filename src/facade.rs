//! Chat facade: the single entry point a screen talks to.
//!
//! A facade owns one session worker, a Tokio task that holds the connection
//! machine, the reconciler and the live transport link. Public methods only
//! post [`Event`]s to it and wait for replies, so every transition and every
//! state callback runs on that one task. Results of background work (transport
//! opens, retry timers, inbound frames) come back as events tagged with the
//! generation they were started in; anything from an older generation is
//! discarded.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::config::ChatConfig;
use crate::connection::{ConnectionAction, ConnectionEvent, ConnectionMachine, ConnectionState};
use crate::error::{ChatError, Result};
use crate::identity::{require_identity, Identity, IdentityProvider};
use crate::models::{ChatId, ChatMessage, Conversation, CorrelationToken};
use crate::protocol::{ClientFrame, ServerFrame};
use crate::query::{
    ConversationIndex, MessageFeedQuery, RealtimeQuery, Subscription, UnreadTracker,
};
use crate::reconciler::MessageReconciler;
use crate::store::DocumentStore;
use crate::transport::{ChatTransport, TransportLink};

/// Listener for connection state changes
pub type StateCallback = Box<dyn FnMut(ConnectionState) + Send>;

type ConnectReply = oneshot::Sender<Result<ConnectionState>>;
type SendReply = oneshot::Sender<Result<ChatMessage>>;

enum Event {
    Connect(Option<ConnectReply>),
    Disconnect(Option<oneshot::Sender<()>>),
    Send {
        receiver_id: String,
        content: String,
        reply: SendReply,
    },
    Bind {
        user_id: String,
        chat_id: ChatId,
    },
    History {
        chat_id: ChatId,
        messages: Vec<ChatMessage>,
    },
    ClearMessages,
    OnStateChange(StateCallback),
    Opened {
        generation: u64,
        result: Result<TransportLink>,
    },
    Frame {
        generation: u64,
        frame: ServerFrame,
    },
    Dropped {
        generation: u64,
        reason: String,
    },
    RetryElapsed {
        generation: u64,
    },
    AckTimeout(CorrelationToken),
    Shutdown(Option<oneshot::Sender<()>>),
}

struct InFlight {
    reply: SendReply,
    timer: JoinHandle<()>,
}

struct Worker {
    identity: Arc<dyn IdentityProvider>,
    transport: Arc<dyn ChatTransport>,
    config: ChatConfig,
    events: mpsc::UnboundedSender<Event>,

    machine: ConnectionMachine,
    generation: u64,
    session: Option<Identity>,
    incoming: Option<TransportLink>,
    link: Option<mpsc::UnboundedSender<ClientFrame>>,
    pump: Option<JoinHandle<()>>,
    opening: Option<JoinHandle<()>>,
    retry: Option<JoinHandle<()>>,
    waiters: Vec<ConnectReply>,
    on_state_change: Option<StateCallback>,

    reconciler: Option<MessageReconciler>,
    bound: Option<ChatId>,
    inflight: HashMap<CorrelationToken, InFlight>,

    state_tx: watch::Sender<ConnectionState>,
    messages_tx: watch::Sender<Vec<ChatMessage>>,
}

impl Worker {
    async fn run(mut self, mut events: mpsc::UnboundedReceiver<Event>) {
        while let Some(event) = events.recv().await {
            if let Event::Shutdown(reply) = event {
                self.teardown();
                if let Some(reply) = reply {
                    let _ = reply.send(());
                }
                break;
            }
            self.handle(event);
        }
        log::debug!("Chat session worker stopped");
    }

    fn handle(&mut self, event: Event) {
        match event {
            Event::Connect(reply) => self.on_connect(reply),
            Event::Disconnect(reply) => {
                self.apply(ConnectionEvent::Disconnect);
                if let Some(reply) = reply {
                    let _ = reply.send(());
                }
            }
            Event::Send {
                receiver_id,
                content,
                reply,
            } => self.on_send(&receiver_id, &content, reply),
            Event::Bind { user_id, chat_id } => {
                self.ensure_reconciler(&user_id);
                self.bound = Some(chat_id);
                self.publish_messages();
            }
            Event::History { chat_id, messages } => {
                if let Some(reconciler) = self.reconciler.as_mut() {
                    for message in messages {
                        if message.chat_id() == chat_id {
                            reconciler.apply_confirmed(message, None);
                        }
                    }
                    self.publish_messages();
                }
            }
            Event::ClearMessages => {
                if let (Some(reconciler), Some(chat_id)) = (self.reconciler.as_mut(), &self.bound) {
                    reconciler.clear(chat_id);
                }
                self.publish_messages();
            }
            Event::OnStateChange(callback) => self.on_state_change = Some(callback),
            Event::Opened { generation, result } => {
                if generation != self.generation {
                    log::debug!("Discarding stale open result (generation {})", generation);
                    return;
                }
                self.opening = None;
                match result {
                    Ok(link) => {
                        self.incoming = Some(link);
                        self.apply(ConnectionEvent::TransportOpened);
                        // not adopted: dropping closes it
                        self.incoming = None;
                    }
                    Err(e) => self.apply(ConnectionEvent::TransportFailed(e.to_string())),
                }
            }
            Event::Frame { generation, frame } => {
                if generation == self.generation {
                    self.on_frame(frame);
                }
            }
            Event::Dropped { generation, reason } => {
                if generation == self.generation {
                    self.apply(ConnectionEvent::TransportDropped(reason));
                }
            }
            Event::RetryElapsed { generation } => {
                if generation == self.generation {
                    self.retry = None;
                    self.apply(ConnectionEvent::RetryElapsed);
                }
            }
            Event::AckTimeout(token) => {
                if let Some(inflight) = self.inflight.remove(&token) {
                    log::warn!("Send {} was not acknowledged in time", token);
                    self.rollback(&token);
                    let _ = inflight.reply.send(Err(ChatError::SendFailed(
                        "acknowledgement timed out".to_string(),
                    )));
                }
            }
            Event::Shutdown(_) => {}
        }
    }

    fn on_connect(&mut self, reply: Option<ConnectReply>) {
        match self.machine.state() {
            ConnectionState::Connected => {
                if let Some(reply) = reply {
                    let _ = reply.send(Ok(ConnectionState::Connected));
                }
            }
            ConnectionState::Connecting | ConnectionState::Reconnecting => {
                if let Some(reply) = reply {
                    self.waiters.push(reply);
                }
            }
            ConnectionState::Disconnected | ConnectionState::Error => {
                let identity = match require_identity(self.identity.as_ref()) {
                    Ok(identity) => identity,
                    Err(e) => {
                        log::warn!("Cannot connect: {}", e);
                        if let Some(reply) = reply {
                            let _ = reply.send(Err(e));
                        }
                        return;
                    }
                };
                self.ensure_reconciler(&identity.user_id);
                self.session = Some(identity);
                if let Some(reply) = reply {
                    self.waiters.push(reply);
                }
                self.apply(ConnectionEvent::Connect);
            }
        }
    }

    fn on_send(&mut self, receiver_id: &str, content: &str, reply: SendReply) {
        if receiver_id.trim().is_empty() {
            let _ = reply.send(Err(ChatError::InvalidMessage("receiver is empty".to_string())));
            return;
        }
        if content.trim().is_empty() {
            let _ = reply.send(Err(ChatError::InvalidMessage("content is blank".to_string())));
            return;
        }
        let (link, reconciler) = match (&self.link, self.reconciler.as_mut()) {
            (Some(link), Some(reconciler)) if self.machine.state() == ConnectionState::Connected => {
                (link, reconciler)
            }
            _ => {
                let _ = reply.send(Err(ChatError::NotConnected));
                return;
            }
        };

        let provisional = reconciler.stage(receiver_id, content);
        let token = match provisional.correlation_token() {
            Some(token) => token.clone(),
            None => {
                let _ = reply.send(Err(ChatError::SendFailed("message has no correlation token".to_string())));
                return;
            }
        };

        let frame = ClientFrame::Send {
            correlation_token: token.clone(),
            receiver_id: receiver_id.to_string(),
            content: content.to_string(),
        };
        if link.send(frame).is_err() {
            reconciler.rollback(&token);
            let _ = reply.send(Err(ChatError::SendFailed("link closed".to_string())));
            return;
        }
        log::debug!("Sent {} to {}", token, receiver_id);

        let events = self.events.clone();
        let timeout = self.config.ack_timeout();
        let timer_token = token.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = events.send(Event::AckTimeout(timer_token));
        });
        self.inflight.insert(token, InFlight { reply, timer });

        if self.bound.is_none() {
            self.bound = Some(provisional.chat_id());
        }
        self.publish_messages();
    }

    fn on_frame(&mut self, frame: ServerFrame) {
        let Some(reconciler) = self.reconciler.as_mut() else {
            return;
        };
        let settlement = match frame {
            ServerFrame::Message {
                message,
                correlation_token,
            } => {
                let message = message.into_message();
                reconciler.apply_confirmed(message.clone(), correlation_token.as_ref());
                correlation_token.map(|token| (token, Ok(message)))
            }
            ServerFrame::Ack {
                correlation_token,
                message,
            } => {
                let message = message.into_message();
                reconciler.apply_confirmed(message.clone(), Some(&correlation_token));
                Some((correlation_token, Ok(message)))
            }
            ServerFrame::Nack {
                correlation_token,
                reason,
            } => {
                log::warn!("Send {} rejected: {}", correlation_token, reason);
                reconciler.rollback(&correlation_token);
                Some((correlation_token, Err(ChatError::SendFailed(reason))))
            }
        };
        // callers see the updated sequence once their send resolves
        self.publish_messages();
        if let Some((token, outcome)) = settlement {
            self.settle(&token, outcome);
        }
    }

    fn settle(&mut self, token: &CorrelationToken, outcome: Result<ChatMessage>) {
        if let Some(inflight) = self.inflight.remove(token) {
            inflight.timer.abort();
            let _ = inflight.reply.send(outcome);
        }
    }

    fn rollback(&mut self, token: &CorrelationToken) {
        if let Some(reconciler) = self.reconciler.as_mut() {
            reconciler.rollback(token);
        }
        self.publish_messages();
    }

    /// Fail every send still waiting for its acknowledgement.
    fn fail_inflight(&mut self, reason: &str) {
        if self.inflight.is_empty() {
            return;
        }
        let failed: Vec<(CorrelationToken, InFlight)> = self.inflight.drain().collect();
        if let Some(reconciler) = self.reconciler.as_mut() {
            for (token, _) in &failed {
                reconciler.rollback(token);
            }
        }
        self.publish_messages();
        for (_, inflight) in failed {
            inflight.timer.abort();
            let _ = inflight
                .reply
                .send(Err(ChatError::SendFailed(reason.to_string())));
        }
    }

    fn ensure_reconciler(&mut self, user_id: &str) {
        let current = self.reconciler.as_ref().map(|r| r.local_user());
        if current != Some(user_id) {
            self.reconciler = Some(MessageReconciler::new(user_id));
            self.bound = None;
        }
    }

    fn apply(&mut self, event: ConnectionEvent) {
        let transition = self.machine.handle(event);
        for action in transition.actions.iter().cloned() {
            self.perform(action);
        }
        if transition.changed() {
            if transition.from == ConnectionState::Connected {
                self.fail_inflight("connection lost");
            }
            self.publish_state(transition.to);
        }
    }

    fn perform(&mut self, action: ConnectionAction) {
        match action {
            ConnectionAction::OpenTransport { attempt } => {
                self.generation += 1;
                let generation = self.generation;
                let transport = self.transport.clone();
                let events = self.events.clone();
                let identity = self.session.clone();
                log::debug!("Opening transport (attempt {})", attempt);

                let task = tokio::spawn(async move {
                    let result = match identity {
                        Some(identity) => transport.open(&identity).await,
                        None => Err(ChatError::MissingIdentity("no session identity".to_string())),
                    };
                    let _ = events.send(Event::Opened { generation, result });
                });
                if let Some(previous) = self.opening.replace(task) {
                    previous.abort();
                }
            }
            ConnectionAction::ScheduleRetry { delay } => {
                let generation = self.generation;
                let events = self.events.clone();
                let task = tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = events.send(Event::RetryElapsed { generation });
                });
                if let Some(previous) = self.retry.replace(task) {
                    previous.abort();
                }
            }
            ConnectionAction::CancelRetry => {
                self.generation += 1;
                if let Some(retry) = self.retry.take() {
                    retry.abort();
                }
                if let Some(opening) = self.opening.take() {
                    opening.abort();
                }
            }
            ConnectionAction::AdoptLink => {
                let Some(link) = self.incoming.take() else {
                    return;
                };
                let (outbound, mut inbound) = link.into_parts();
                let generation = self.generation;
                let events = self.events.clone();
                let pump = tokio::spawn(async move {
                    while let Some(frame) = inbound.recv().await {
                        if events.send(Event::Frame { generation, frame }).is_err() {
                            return;
                        }
                    }
                    let _ = events.send(Event::Dropped {
                        generation,
                        reason: "link closed by backend".to_string(),
                    });
                });
                self.link = Some(outbound);
                if let Some(previous) = self.pump.replace(pump) {
                    previous.abort();
                }
            }
            ConnectionAction::DiscardLink => {
                if self.incoming.take().is_some() {
                    log::debug!("Closing stray transport link");
                }
            }
            ConnectionAction::CloseTransport => {
                self.generation += 1;
                self.link = None;
                if let Some(pump) = self.pump.take() {
                    pump.abort();
                }
            }
        }
    }

    fn publish_state(&mut self, state: ConnectionState) {
        self.state_tx.send_replace(state);
        if let Some(callback) = self.on_state_change.as_mut() {
            callback(state);
        }

        let outcome = match state {
            ConnectionState::Connected => Some(Ok(ConnectionState::Connected)),
            ConnectionState::Error => Some(Ok(ConnectionState::Error)),
            ConnectionState::Disconnected => Some(Err(ChatError::Cancelled)),
            ConnectionState::Connecting | ConnectionState::Reconnecting => None,
        };
        if let Some(outcome) = outcome {
            for waiter in self.waiters.drain(..) {
                let reply = match &outcome {
                    Ok(state) => Ok(*state),
                    Err(_) => Err(ChatError::Cancelled),
                };
                let _ = waiter.send(reply);
            }
        }
    }

    fn publish_messages(&self) {
        let messages = match (&self.reconciler, &self.bound) {
            (Some(reconciler), Some(chat_id)) => reconciler.messages(chat_id),
            _ => Vec::new(),
        };
        self.messages_tx.send_if_modified(|current| {
            if *current == messages {
                false
            } else {
                *current = messages;
                true
            }
        });
    }

    fn teardown(&mut self) {
        self.apply(ConnectionEvent::Disconnect);
        self.fail_inflight("session closed");
        for task in [self.pump.take(), self.opening.take(), self.retry.take()]
            .into_iter()
            .flatten()
        {
            task.abort();
        }
        self.link = None;
    }
}

struct Views {
    user_id: String,
    conversations: ConversationIndex,
    unread: UnreadTracker,
}

/// Builder for [`ChatFacade`]
pub struct ChatFacadeBuilder {
    identity: Arc<dyn IdentityProvider>,
    transport: Arc<dyn ChatTransport>,
    config: ChatConfig,
    store: Option<Arc<dyn DocumentStore>>,
    peer: Option<String>,
}

impl ChatFacadeBuilder {
    pub fn config(mut self, config: ChatConfig) -> Self {
        self.config = config;
        self
    }

    /// Attach the store that backs message history, the conversation list
    /// and unread counters.
    pub fn store(mut self, store: Arc<dyn DocumentStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Bind this conversation as soon as the facade starts.
    pub fn peer(mut self, peer_id: &str) -> Self {
        self.peer = Some(peer_id.to_string());
        self
    }

    /// Start the session worker. Must be called inside a Tokio runtime.
    pub fn build(self) -> Result<ChatFacade> {
        self.config.validate()?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (messages_tx, messages_rx) = watch::channel(Vec::new());

        let worker = Worker {
            identity: self.identity.clone(),
            transport: self.transport,
            config: self.config.clone(),
            events: events_tx.clone(),
            machine: ConnectionMachine::new(self.config.retry_policy()),
            generation: 0,
            session: None,
            incoming: None,
            link: None,
            pump: None,
            opening: None,
            retry: None,
            waiters: Vec::new(),
            on_state_change: None,
            reconciler: None,
            bound: None,
            inflight: HashMap::new(),
            state_tx,
            messages_tx,
        };
        let handle = tokio::spawn(worker.run(events_rx));

        let facade = ChatFacade {
            identity: self.identity,
            config: self.config,
            store: self.store,
            events: events_tx,
            state_rx,
            messages_rx,
            feed: Mutex::new(None),
            views: Mutex::new(None),
            worker: Some(handle),
        };

        drop(facade.sync_views());
        if let Some(peer) = self.peer {
            facade.open_conversation(&peer)?;
        }
        if facade.config.auto_connect {
            facade.post(Event::Connect(None))?;
        }
        Ok(facade)
    }
}

/// Per-screen chat session
pub struct ChatFacade {
    identity: Arc<dyn IdentityProvider>,
    config: ChatConfig,
    store: Option<Arc<dyn DocumentStore>>,
    events: mpsc::UnboundedSender<Event>,
    state_rx: watch::Receiver<ConnectionState>,
    messages_rx: watch::Receiver<Vec<ChatMessage>>,
    feed: Mutex<Option<Subscription>>,
    views: Mutex<Option<Views>>,
    worker: Option<JoinHandle<()>>,
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ChatFacade {
    pub fn builder(
        identity: Arc<dyn IdentityProvider>,
        transport: Arc<dyn ChatTransport>,
    ) -> ChatFacadeBuilder {
        ChatFacadeBuilder {
            identity,
            transport,
            config: ChatConfig::default(),
            store: None,
            peer: None,
        }
    }

    fn post(&self, event: Event) -> Result<()> {
        self.events.send(event).map_err(|_| ChatError::SessionClosed)
    }

    // Connection

    /// Connect and wait for a stable state.
    ///
    /// Resolves with `Connected`, or with `Error` once the retry budget is
    /// spent. Fails with `Cancelled` when `disconnect()` interrupts the attempt
    /// and with `MissingIdentity` when nobody is signed in.
    pub async fn connect(&self) -> Result<ConnectionState> {
        let (tx, rx) = oneshot::channel();
        self.post(Event::Connect(Some(tx)))?;
        let state = rx.await.map_err(|_| ChatError::SessionClosed)??;
        drop(self.sync_views());
        Ok(state)
    }

    /// Release the transport and cancel pending attempts. Never fails.
    pub async fn disconnect(&self) {
        let (tx, rx) = oneshot::channel();
        if self.post(Event::Disconnect(Some(tx))).is_ok() {
            let _ = rx.await;
        }
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
    }

    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Register the state-change listener, replacing any previous one. It is
    /// invoked on the session task after each transition has completed.
    pub fn on_state_change<F>(&self, callback: F)
    where
        F: FnMut(ConnectionState) + Send + 'static,
    {
        if self.post(Event::OnStateChange(Box::new(callback))).is_err() {
            log::warn!("State listener registered on a closed session");
        }
    }

    // Messaging

    /// Send a message and wait for the backend's acknowledgement. The
    /// provisional copy is visible in `messages()` until then.
    pub async fn send_message(&self, receiver_id: &str, content: &str) -> Result<ChatMessage> {
        let (tx, rx) = oneshot::channel();
        self.post(Event::Send {
            receiver_id: receiver_id.to_string(),
            content: content.to_string(),
            reply: tx,
        })?;
        rx.await.map_err(|_| ChatError::SessionClosed)?
    }

    /// Bind the visible message sequence to the conversation with `peer_id`.
    /// With a store attached, the conversation's history is followed live.
    pub fn open_conversation(&self, peer_id: &str) -> Result<ChatId> {
        let identity = require_identity(self.identity.as_ref())?;
        let chat_id = ChatId::between(&identity.user_id, peer_id);
        self.post(Event::Bind {
            user_id: identity.user_id.clone(),
            chat_id: chat_id.clone(),
        })?;

        if let Some(store) = &self.store {
            drop(self.sync_views());
            let events = self.events.clone();
            let history_chat = chat_id.clone();
            let query = MessageFeedQuery::new(chat_id.clone()).with_page_size(self.config.page_size);
            let subscription = RealtimeQuery::subscribe(
                store.as_ref(),
                query,
                move |messages| {
                    let _ = events.send(Event::History {
                        chat_id: history_chat.clone(),
                        messages,
                    });
                },
                |err| log::warn!("Message history unavailable: {}", err),
            );
            // replacing drops, and so unsubscribes, the previous feed
            *locked(&self.feed) = Some(subscription);
        }
        Ok(chat_id)
    }

    /// Reconciled sequence of the bound conversation, oldest first.
    pub fn messages(&self) -> Vec<ChatMessage> {
        self.messages_rx.borrow().clone()
    }

    pub fn message_changes(&self) -> watch::Receiver<Vec<ChatMessage>> {
        self.messages_rx.clone()
    }

    /// Forget the locally held messages of the bound conversation.
    /// Nothing is deleted at the backend.
    pub fn clear_messages(&self) -> Result<()> {
        self.post(Event::ClearMessages)
    }

    // Derived views

    /// Align the store-backed queries with the provider's current user.
    /// They are started once a user is available and released as soon as
    /// the provider stops returning the user they were built for.
    fn sync_views(&self) -> MutexGuard<'_, Option<Views>> {
        let user_id = self.identity.identity().map(|identity| identity.user_id);
        let mut views = locked(&self.views);
        let built_for = views.as_ref().map(|v| v.user_id.clone());
        if built_for == user_id {
            return views;
        }

        if let Some(stale) = views.take() {
            log::info!("Releasing live queries of {}", stale.user_id);
            stale.conversations.stop();
            stale.unread.stop();
            if let Some(feed) = locked(&self.feed).take() {
                feed.unsubscribe();
            }
        }
        if let (Some(store), Some(user_id)) = (&self.store, user_id) {
            *views = Some(Views {
                conversations: ConversationIndex::start(store.as_ref(), &user_id),
                unread: UnreadTracker::start(store.as_ref(), &user_id),
                user_id,
            });
        }
        views
    }

    pub fn conversations(&self) -> Vec<Conversation> {
        self.sync_views()
            .as_ref()
            .map(|views| views.conversations.conversations())
            .unwrap_or_default()
    }

    pub fn unread_count(&self) -> usize {
        self.sync_views()
            .as_ref()
            .map(|views| views.unread.unread_count())
            .unwrap_or(0)
    }

    pub fn unread_by_conversation(&self) -> HashMap<ChatId, usize> {
        self.sync_views()
            .as_ref()
            .map(|views| views.unread.unread_by_conversation())
            .unwrap_or_default()
    }

    // Lifecycle

    fn release_queries(&self) {
        if let Some(feed) = locked(&self.feed).take() {
            feed.unsubscribe();
        }
        if let Some(views) = locked(&self.views).take() {
            views.conversations.stop();
            views.unread.stop();
        }
    }

    /// Disconnect, stop every live query and wait for the worker to finish.
    pub async fn shutdown(mut self) {
        self.release_queries();
        let (tx, rx) = oneshot::channel();
        if self.post(Event::Shutdown(Some(tx))).is_ok() {
            let _ = rx.await;
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.await;
        }
    }
}

impl Drop for ChatFacade {
    fn drop(&mut self) {
        self.release_queries();
        if self.worker.take().is_some() {
            let _ = self.events.send(Event::Shutdown(None));
        }
    }
}
