//! Connection lifecycle state machine.
//!
//! The machine owns the single source of truth for channel availability and
//! the retry policy. It performs no I/O: each event returns a [`Transition`]
//! listing the actions the session worker must carry out (open a transport,
//! arm a retry timer, release the link).
//!
//! ```text
//!                connect                 opened
//! Disconnected ─────────> Connecting ──────────────> Connected
//!      ^                      │ failed (retries left)     │ dropped
//!      │ disconnect           v                           v
//!      └──────────────── Reconnecting <───────────────────┘
//!      (from any state)       │ failed (exhausted)   ^
//!                             v                      │ opened
//!                           Error ──connect──> Connecting
//! ```
//!
//! Every (state, event) pair has exactly one outcome. Events that do not
//! apply to the current state are explicit self-transitions, usually stale
//! results of an attempt that was already superseded.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Default number of open attempts per connection run.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 12;

/// Delay before the first retry.
pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_millis(1000);

/// Upper bound for the exponential backoff.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_millis(32000);

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Error,
}

impl ConnectionState {
    pub const ALL: [ConnectionState; 5] = [
        ConnectionState::Disconnected,
        ConnectionState::Connecting,
        ConnectionState::Connected,
        ConnectionState::Reconnecting,
        ConnectionState::Error,
    ];

    /// States in which a pending `connect()` can be resolved.
    pub fn is_stable(self) -> bool {
        matches!(
            self,
            ConnectionState::Connected | ConnectionState::Error | ConnectionState::Disconnected
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Error => "error",
        };
        f.write_str(label)
    }
}

/// Bounded retry with capped exponential backoff
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Open attempts per run, the first one included.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_delay: DEFAULT_INITIAL_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after the `failed_attempts`-th consecutive failure.
    pub fn delay_for(&self, failed_attempts: u32) -> Duration {
        let exponent = failed_attempts.saturating_sub(1).min(16);
        let delay = self.initial_delay.saturating_mul(1u32 << exponent);
        delay.min(self.max_delay)
    }
}

/// Inputs to the machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Caller asked for a connection.
    Connect,
    /// The transport finished opening a link.
    TransportOpened,
    /// An open attempt failed.
    TransportFailed(String),
    /// An established link went away.
    TransportDropped(String),
    /// The retry timer fired.
    RetryElapsed,
    /// Caller released the connection.
    Disconnect,
}

impl ConnectionEvent {
    /// One instance of every event kind.
    pub fn all() -> Vec<ConnectionEvent> {
        vec![
            ConnectionEvent::Connect,
            ConnectionEvent::TransportOpened,
            ConnectionEvent::TransportFailed("refused".to_string()),
            ConnectionEvent::TransportDropped("reset".to_string()),
            ConnectionEvent::RetryElapsed,
            ConnectionEvent::Disconnect,
        ]
    }
}

/// Side effects requested by the machine, executed by the session worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionAction {
    /// Start an open attempt (1-based within the current run).
    OpenTransport { attempt: u32 },
    /// Fire `RetryElapsed` after `delay`.
    ScheduleRetry { delay: Duration },
    /// Disarm the retry timer.
    CancelRetry,
    /// Keep the link that was just reported open.
    AdoptLink,
    /// Drop the link that was just reported open; it is not wanted.
    DiscardLink,
    /// Drop the active link and cancel any in-flight open attempt.
    CloseTransport,
}

/// Result of feeding one event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub from: ConnectionState,
    pub to: ConnectionState,
    pub actions: Vec<ConnectionAction>,
}

impl Transition {
    pub fn changed(&self) -> bool {
        self.from != self.to
    }
}

/// Connection state machine
#[derive(Debug, Clone)]
pub struct ConnectionMachine {
    state: ConnectionState,
    policy: RetryPolicy,
    /// Consecutive failed open attempts in the current run.
    failed_attempts: u32,
    last_error: Option<String>,
}

impl ConnectionMachine {
    /// Create a machine in [`ConnectionState::Disconnected`]
    pub fn new(policy: RetryPolicy) -> Self {
        Self::resume(ConnectionState::Disconnected, 0, policy)
    }

    /// Create a machine positioned in an arbitrary state.
    pub fn resume(state: ConnectionState, failed_attempts: u32, policy: RetryPolicy) -> Self {
        ConnectionMachine {
            state,
            policy,
            failed_attempts,
            last_error: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn failed_attempts(&self) -> u32 {
        self.failed_attempts
    }

    /// Reason of the most recent transport failure.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Apply one event
    pub fn handle(&mut self, event: ConnectionEvent) -> Transition {
        use ConnectionAction::*;
        use ConnectionState::*;

        let from = self.state;
        let (to, actions) = match (from, event) {
            (Disconnected | Error, ConnectionEvent::Connect) => {
                self.failed_attempts = 0;
                self.last_error = None;
                (Connecting, vec![OpenTransport { attempt: 1 }])
            }
            (Connecting | Connected | Reconnecting, ConnectionEvent::Connect) => (from, vec![]),

            (Connecting | Reconnecting, ConnectionEvent::TransportOpened) => {
                self.failed_attempts = 0;
                self.last_error = None;
                (Connected, vec![AdoptLink])
            }
            (Disconnected | Connected | Error, ConnectionEvent::TransportOpened) => {
                (from, vec![DiscardLink])
            }

            (
                Connecting | Reconnecting,
                ConnectionEvent::TransportFailed(reason) | ConnectionEvent::TransportDropped(reason),
            ) => self.fail_attempt(reason),
            (Connected, ConnectionEvent::TransportDropped(reason)) => {
                log::warn!("Chat transport dropped: {}", reason);
                self.failed_attempts = 0;
                self.last_error = Some(reason);
                (
                    Reconnecting,
                    vec![CloseTransport, OpenTransport { attempt: 1 }],
                )
            }
            (
                Disconnected | Error,
                ConnectionEvent::TransportFailed(_) | ConnectionEvent::TransportDropped(_),
            )
            | (Connected, ConnectionEvent::TransportFailed(_)) => (from, vec![]),

            (Reconnecting, ConnectionEvent::RetryElapsed) => (
                Reconnecting,
                vec![OpenTransport {
                    attempt: self.failed_attempts + 1,
                }],
            ),
            (Disconnected | Connecting | Connected | Error, ConnectionEvent::RetryElapsed) => {
                (from, vec![])
            }

            (Connecting | Connected | Reconnecting, ConnectionEvent::Disconnect) => {
                self.failed_attempts = 0;
                (Disconnected, vec![CancelRetry, CloseTransport])
            }
            (Error, ConnectionEvent::Disconnect) => {
                self.failed_attempts = 0;
                (Disconnected, vec![])
            }
            (Disconnected, ConnectionEvent::Disconnect) => (Disconnected, vec![]),
        };

        self.state = to;
        if from != to {
            log::info!("Chat connection {} -> {}", from, to);
        }
        Transition { from, to, actions }
    }

    fn fail_attempt(&mut self, reason: String) -> (ConnectionState, Vec<ConnectionAction>) {
        self.failed_attempts += 1;
        if self.failed_attempts >= self.policy.max_attempts {
            log::warn!(
                "Chat connection failed after {} attempts: {}",
                self.failed_attempts,
                reason
            );
            self.last_error = Some(reason);
            return (ConnectionState::Error, vec![]);
        }

        let delay = self.policy.delay_for(self.failed_attempts);
        log::warn!(
            "Chat connection attempt {} failed: {} (retrying in {:?})",
            self.failed_attempts,
            reason,
            delay
        );
        self.last_error = Some(reason);
        (
            ConnectionState::Reconnecting,
            vec![ConnectionAction::ScheduleRetry { delay }],
        )
    }
}
