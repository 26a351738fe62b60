//! Transports carrying hub messages.
//!
//! The connection core only needs an ordered, reliable duplex message channel
//! that reports disconnection. A [`Transport`] produces one such channel per
//! connect attempt.

mod memory;
mod websocket;

use std::pin::Pin;

use futures_util::future::BoxFuture;
use futures_util::{Sink, Stream};

use crate::error::HubError;
use crate::protocol::TransferFormat;

pub use memory::{MemoryListener, MemoryPeer, MemoryTransport};
pub use websocket::WebSocketTransport;

/// Outbound half of a connected transport.
pub type MessageSink = Pin<Box<dyn Sink<Vec<u8>, Error = HubError> + Send>>;

/// Inbound half of a connected transport. The stream ends when the peer
/// disconnects.
pub type MessageStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>, HubError>> + Send>>;

/// A connected duplex channel.
pub struct TransportConnection {
    /// Identifier handed out during negotiation, if negotiation happened.
    pub connection_id: Option<String>,
    pub sender: MessageSink,
    pub receiver: MessageStream,
}

impl std::fmt::Debug for TransportConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportConnection")
            .field("connection_id", &self.connection_id)
            .finish_non_exhaustive()
    }
}

/// Factory for transport connections. Called on start and on each reconnect.
pub trait Transport: Send + Sync + 'static {
    fn connect(&self, format: TransferFormat) -> BoxFuture<'_, Result<TransportConnection, HubError>>;
}
