//! Transport boundary.
//!
//! A transport opens a [`TransportLink`]: a pair of channels carrying typed
//! frames to and from the backend. The link is live until either side drops
//! its half. When the backend side goes away the inbound receiver yields
//! `None`, which the session worker reports as a dropped connection.

pub mod memory;
pub mod websocket;

pub use memory::{MemoryRelay, MemoryTransport};
pub use websocket::WebSocketTransport;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::identity::Identity;
use crate::protocol::{ClientFrame, ServerFrame};

/// One open session with the backend
#[derive(Debug)]
pub struct TransportLink {
    pub outbound: mpsc::UnboundedSender<ClientFrame>,
    pub inbound: mpsc::UnboundedReceiver<ServerFrame>,
}

impl TransportLink {
    /// Split into the two halves.
    pub fn into_parts(
        self,
    ) -> (
        mpsc::UnboundedSender<ClientFrame>,
        mpsc::UnboundedReceiver<ServerFrame>,
    ) {
        (self.outbound, self.inbound)
    }
}

/// Bidirectional channel to a chat backend
#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Open a link authenticated as `identity`. One attempt; retry timing is
    /// the caller's concern.
    async fn open(&self, identity: &Identity) -> Result<TransportLink>;
}
