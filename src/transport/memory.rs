//! In-process transport.
//!
//! Every `connect` creates a fresh pair of bounded channels and hands the
//! server half to the [`MemoryListener`]. Dropping either half looks like an
//! abrupt disconnect to the other side.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_channel::mpsc;
use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};

use super::{Transport, TransportConnection};
use crate::error::HubError;
use crate::protocol::TransferFormat;

const CHANNEL_CAPACITY: usize = 64;

/// Client side of the in-process transport.
#[derive(Clone, Debug)]
pub struct MemoryTransport {
    inner: Arc<MemoryInner>,
}

#[derive(Debug)]
struct MemoryInner {
    accept_tx: mpsc::UnboundedSender<MemoryPeer>,
    next_id: AtomicU64,
    skip_negotiation: bool,
}

/// Server side: yields one [`MemoryPeer`] per client connect.
#[derive(Debug)]
pub struct MemoryListener {
    accept_rx: mpsc::UnboundedReceiver<MemoryPeer>,
}

/// Server end of one connection.
#[derive(Debug)]
pub struct MemoryPeer {
    connection_id: Option<String>,
    format: TransferFormat,
    sender: mpsc::Sender<Vec<u8>>,
    receiver: mpsc::Receiver<Vec<u8>>,
}

impl MemoryTransport {
    pub fn new() -> (Self, MemoryListener) {
        Self::with_negotiation(true)
    }

    /// Connections made without negotiation carry no connection id.
    pub fn without_negotiation() -> (Self, MemoryListener) {
        Self::with_negotiation(false)
    }

    fn with_negotiation(negotiate: bool) -> (Self, MemoryListener) {
        let (accept_tx, accept_rx) = mpsc::unbounded();
        let transport = Self {
            inner: Arc::new(MemoryInner {
                accept_tx,
                next_id: AtomicU64::new(1),
                skip_negotiation: !negotiate,
            }),
        };
        (transport, MemoryListener { accept_rx })
    }
}

impl Transport for MemoryTransport {
    fn connect(&self, format: TransferFormat) -> BoxFuture<'_, Result<TransportConnection, HubError>> {
        Box::pin(async move {
            let (client_tx, server_rx) = mpsc::channel(CHANNEL_CAPACITY);
            let (server_tx, client_rx) = mpsc::channel(CHANNEL_CAPACITY);

            let connection_id = if self.inner.skip_negotiation {
                None
            } else {
                let n = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
                Some(format!("memory-{n}"))
            };

            let peer = MemoryPeer {
                connection_id: connection_id.clone(),
                format,
                sender: server_tx,
                receiver: server_rx,
            };
            self.inner.accept_tx.unbounded_send(peer).map_err(|_| {
                HubError::Transport("No listener is accepting connections.".to_string())
            })?;

            Ok(TransportConnection {
                connection_id,
                sender: Box::pin(
                    client_tx.sink_map_err(|e| HubError::Transport(e.to_string())),
                ),
                receiver: Box::pin(client_rx.map(Ok)),
            })
        })
    }
}

impl MemoryListener {
    /// Waits for the next client connection. `None` once every
    /// [`MemoryTransport`] clone is gone.
    pub async fn accept(&mut self) -> Option<MemoryPeer> {
        self.accept_rx.next().await
    }
}

impl MemoryPeer {
    pub fn connection_id(&self) -> Option<&str> {
        self.connection_id.as_deref()
    }

    pub fn transfer_format(&self) -> TransferFormat {
        self.format
    }

    pub async fn send(&mut self, bytes: Vec<u8>) -> Result<(), HubError> {
        self.sender
            .send(bytes)
            .await
            .map_err(|e| HubError::Transport(e.to_string()))
    }

    /// Next message from the client, `None` once the client hung up.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.receiver.next().await
    }

    /// Splits into independently usable halves.
    pub fn into_parts(self) -> (mpsc::Sender<Vec<u8>>, mpsc::Receiver<Vec<u8>>) {
        (self.sender, self.receiver)
    }

    /// Drops the connection without a closing message.
    pub fn abort(self) {
        drop(self);
    }
}
