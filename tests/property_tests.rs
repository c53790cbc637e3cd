/// Property tests for the pure parts of the chat core: chat ids, the
/// reconciler and the connection machine
use carechat_core::connection::{ConnectionEvent, ConnectionMachine, ConnectionState, RetryPolicy};
use carechat_core::models::CorrelationToken;
use carechat_core::{chat_id, ChatId, ChatMessage, MessageReconciler};
use proptest::prelude::*;
use std::collections::{HashMap, HashSet};
use std::time::Duration;

fn user_id() -> impl Strategy<Value = String> {
    "[a-z0-9]{1,8}"
}

/// Confirmed message from `peer` or the local user, drawn from a small id
/// space so replays are common.
fn remote_message() -> impl Strategy<Value = (u8, i64, bool)> {
    (0u8..12, 0i64..50, any::<bool>())
}

fn build(id: u8, ts: i64, own: bool) -> ChatMessage {
    let (sender, receiver) = if own { ("me", "peer") } else { ("peer", "me") };
    ChatMessage::confirmed(format!("m{}", id), sender, receiver, &format!("body {}", id), ts)
}

/// One step of traffic seen by the reconciler
#[derive(Debug, Clone)]
enum Op {
    /// Untokened confirmed message, possibly a replay of an earlier id.
    Remote(u8, i64, bool),
    /// Local optimistic send.
    Stage,
    /// Backend ack for the n-th staged send, carrying its token.
    Ack(usize, i64),
    /// The same ack delivered again.
    ReplayAck(usize),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        remote_message().prop_map(|(id, ts, own)| Op::Remote(id, ts, own)),
        Just(Op::Stage),
        (0usize..8, 0i64..50).prop_map(|(pick, ts)| Op::Ack(pick, ts)),
        (0usize..8).prop_map(Op::ReplayAck),
    ]
}

struct Run {
    reconciler: MessageReconciler,
    confirmed_ids: HashSet<String>,
    pending: usize,
}

fn drive(ops: &[Op]) -> Run {
    let mut reconciler = MessageReconciler::new("me");
    let mut staged: Vec<(CorrelationToken, String)> = Vec::new();
    let mut acks: HashMap<usize, ChatMessage> = HashMap::new();
    let mut confirmed_ids = HashSet::new();

    for op in ops {
        match op {
            Op::Remote(id, ts, own) => {
                let message = build(*id, *ts, *own);
                confirmed_ids.insert(message.message_id().to_string());
                reconciler.apply_confirmed(message, None);
            }
            Op::Stage => {
                let content = format!("send {}", staged.len());
                let provisional = reconciler.stage("peer", &content);
                if let Some(token) = provisional.correlation_token() {
                    staged.push((token.clone(), content));
                }
            }
            Op::Ack(pick, ts) => {
                if staged.is_empty() {
                    continue;
                }
                let index = pick % staged.len();
                let (token, content) = &staged[index];
                let ack = acks.entry(index).or_insert_with(|| {
                    ChatMessage::confirmed(format!("s{}", index), "me", "peer", content, *ts)
                });
                confirmed_ids.insert(ack.message_id().to_string());
                reconciler.apply_confirmed(ack.clone(), Some(token));
            }
            Op::ReplayAck(pick) => {
                if staged.is_empty() {
                    continue;
                }
                let index = pick % staged.len();
                if let Some(ack) = acks.get(&index) {
                    reconciler.apply_confirmed(ack.clone(), Some(&staged[index].0));
                }
            }
        }
    }

    let pending = staged.len() - acks.len();
    Run {
        reconciler,
        confirmed_ids,
        pending,
    }
}

fn event() -> impl Strategy<Value = ConnectionEvent> {
    prop_oneof![
        Just(ConnectionEvent::Connect),
        Just(ConnectionEvent::TransportOpened),
        Just(ConnectionEvent::TransportFailed("refused".to_string())),
        Just(ConnectionEvent::TransportDropped("reset".to_string())),
        Just(ConnectionEvent::RetryElapsed),
        Just(ConnectionEvent::Disconnect),
    ]
}

fn state() -> impl Strategy<Value = ConnectionState> {
    prop_oneof![
        Just(ConnectionState::Disconnected),
        Just(ConnectionState::Connecting),
        Just(ConnectionState::Connected),
        Just(ConnectionState::Reconnecting),
        Just(ConnectionState::Error),
    ]
}

fn policy() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 4,
        initial_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(40),
    }
}

proptest! {
    #[test]
    fn test_chat_id_is_symmetric(a in user_id(), b in user_id()) {
        prop_assert_eq!(chat_id(&a, &b), chat_id(&b, &a));
        let id = ChatId::between(&a, &b);
        let (low, high) = if a <= b { (&a, &b) } else { (&b, &a) };
        prop_assert_eq!(id.as_str(), format!("{}_{}", low, high));
    }

    #[test]
    fn test_replays_never_duplicate(ops in prop::collection::vec(op(), 0..80)) {
        let run = drive(&ops);
        let messages = run.reconciler.messages(&ChatId::between("me", "peer"));

        let confirmed: Vec<String> = messages
            .iter()
            .filter(|m| m.is_confirmed())
            .map(|m| m.message_id().to_string())
            .collect();
        let unique: HashSet<&String> = confirmed.iter().collect();
        prop_assert_eq!(unique.len(), confirmed.len());
        prop_assert_eq!(unique.len(), run.confirmed_ids.len());
        prop_assert_eq!(messages.len() - confirmed.len(), run.pending);
    }

    #[test]
    fn test_visible_order_is_monotonic(ops in prop::collection::vec(op(), 0..80)) {
        let run = drive(&ops);
        let chat = ChatId::between("me", "peer");
        let messages = run.reconciler.messages(&chat);

        prop_assert!(messages.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
        prop_assert_eq!(
            run.reconciler.pending_count(&chat),
            messages.iter().filter(|m| !m.is_confirmed()).count()
        );
    }

    #[test]
    fn test_rollback_removes_only_that_send(count in 1usize..8, pick in 0usize..8) {
        let mut reconciler = MessageReconciler::new("me");
        let staged: Vec<CorrelationToken> = (0..count)
            .filter_map(|i| reconciler.stage("peer", &format!("msg {}", i)).correlation_token().cloned())
            .collect();
        let victim = &staged[pick % count];

        prop_assert!(reconciler.rollback(victim).is_some());
        prop_assert!(!reconciler.is_pending(victim));
        prop_assert_eq!(reconciler.messages(&ChatId::between("me", "peer")).len(), count - 1);
        prop_assert!(reconciler.rollback(victim).is_none());
    }

    #[test]
    fn test_machine_is_total(
        start in state(),
        failed in 0u32..4,
        events in prop::collection::vec(event(), 1..40),
    ) {
        let mut machine = ConnectionMachine::resume(start, failed, policy());
        for event in events {
            let before = machine.state();
            let transition = machine.handle(event.clone());

            prop_assert_eq!(transition.from, before);
            prop_assert_eq!(transition.to, machine.state());
            prop_assert!(machine.failed_attempts() < policy().max_attempts
                || machine.state() == ConnectionState::Error);

            if transition.to == ConnectionState::Connected && before != ConnectionState::Connected {
                prop_assert!(matches!(before, ConnectionState::Connecting | ConnectionState::Reconnecting));
                prop_assert_eq!(&event, &ConnectionEvent::TransportOpened);
            }
            if event == ConnectionEvent::Disconnect {
                prop_assert_eq!(machine.state(), ConnectionState::Disconnected);
            }
        }
    }
}
