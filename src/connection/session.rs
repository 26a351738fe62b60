//! One connected session: the span between a successful handshake and the
//! transport going away.
//!
//! Each session runs three tasks:
//! - the writer, the single consumer of the outbound queue, which also sends
//!   keep-alive pings,
//! - the receive loop, which parses frames in arrival order and routes them,
//! - the dispatcher, which runs server-invoked handlers one at a time so a
//!   slow handler never stalls the receive loop.

use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::Inner;
use crate::error::HubError;
use crate::protocol::{Frame, HubProtocol};
use crate::transport::{MessageSink, MessageStream, TransportConnection};

const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Why a session ended.
#[derive(Debug, Default)]
pub(crate) struct CloseReason {
    pub(crate) error: Option<HubError>,
    pub(crate) allow_reconnect: bool,
}

pub(crate) struct Session {
    pub(crate) connection_id: Option<String>,
    outbound: mpsc::Sender<Frame>,
    shutdown: CancellationToken,
    finished: CancellationToken,
    close_reason: Mutex<Option<CloseReason>>,
}

struct ServerInvocation {
    invocation_id: Option<String>,
    target: String,
    arguments: Vec<Value>,
}

impl Session {
    /// Queues a frame for the writer. Suspends while the queue is full.
    pub(crate) async fn send(&self, frame: Frame) -> Result<(), HubError> {
        if self.shutdown.is_cancelled() {
            return Err(HubError::ConnectionClosed(None));
        }
        tokio::select! {
            sent = self.outbound.send(frame) => sent.map_err(|_| HubError::ConnectionClosed(None)),
            _ = self.shutdown.cancelled() => Err(HubError::ConnectionClosed(None)),
        }
    }

    /// Queues a frame without waiting. Usable from `Drop`.
    pub(crate) fn send_detached(self: &Arc<Self>, frame: Frame) {
        match self.outbound.try_send(frame) {
            Ok(()) => {}
            Err(TrySendError::Full(frame)) => {
                if let Ok(handle) = tokio::runtime::Handle::try_current() {
                    let session = self.clone();
                    handle.spawn(async move {
                        let _ = session.send(frame).await;
                    });
                }
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }

    /// Ends the session. Only the first reason is kept.
    pub(crate) fn close(&self, error: Option<HubError>, allow_reconnect: bool) {
        {
            let mut reason = self.close_reason.lock();
            if reason.is_none() {
                *reason = Some(CloseReason {
                    error,
                    allow_reconnect,
                });
            }
        }
        self.shutdown.cancel();
    }

    /// Ends the session with an error that permits reconnecting.
    pub(crate) fn fail(&self, error: HubError) {
        self.close(Some(error), true);
    }

    pub(crate) fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Resolves once the session is torn down and its pending calls settled.
    pub(crate) async fn finished(&self) {
        self.finished.cancelled().await
    }

    pub(crate) fn finished_token(&self) -> CancellationToken {
        self.finished.clone()
    }

    fn take_close_reason(&self) -> CloseReason {
        self.close_reason.lock().take().unwrap_or_default()
    }
}

/// Starts the tasks of a freshly handshaken connection.
///
/// `buffer` holds whatever arrived after the handshake response.
pub(crate) fn spawn(inner: &Arc<Inner>, connection: TransportConnection, buffer: BytesMut) -> Arc<Session> {
    let TransportConnection {
        connection_id,
        sender,
        receiver,
    } = connection;

    let (outbound_tx, outbound_rx) = mpsc::channel(inner.options.channel_capacity.max(1));
    let session = Arc::new(Session {
        connection_id,
        outbound: outbound_tx,
        shutdown: CancellationToken::new(),
        finished: CancellationToken::new(),
        close_reason: Mutex::new(None),
    });
    let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();

    tokio::spawn(write_loop(
        session.clone(),
        sender,
        outbound_rx,
        inner.protocol.clone(),
        inner.options.keep_alive_interval,
    ));
    tokio::spawn(dispatch_loop(inner.clone(), session.clone(), dispatch_rx));
    tokio::spawn(receive_loop(
        inner.clone(),
        session.clone(),
        receiver,
        buffer,
        dispatch_tx,
    ));
    session
}

async fn write_loop(
    session: Arc<Session>,
    mut sink: MessageSink,
    mut outbound: mpsc::Receiver<Frame>,
    protocol: Arc<dyn HubProtocol>,
    keep_alive: Duration,
) {
    let mut buffer = BytesMut::new();
    loop {
        let frame = tokio::select! {
            _ = session.shutdown.cancelled() => break,
            next = tokio::time::timeout(keep_alive, outbound.recv()) => match next {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(_) => {
                    trace!("Sending keep-alive ping");
                    Frame::Ping
                }
            }
        };

        if let Err(e) = protocol.write_message(&frame, &mut buffer) {
            error!("Failed to serialize {} message: {}", frame.kind_name(), e);
            session.fail(HubError::Serialization(e));
            break;
        }
        let bytes = buffer.split().to_vec();
        let sent = tokio::select! {
            sent = sink.send(bytes) => sent,
            _ = session.shutdown.cancelled() => break,
        };
        if let Err(e) = sent {
            warn!("Failed to send {} message: {}", frame.kind_name(), e);
            session.fail(e);
            break;
        }
    }
    let _ = tokio::time::timeout(CLOSE_TIMEOUT, sink.close()).await;
    trace!("Writer stopped");
}

async fn dispatch_loop(
    inner: Arc<Inner>,
    session: Arc<Session>,
    mut invocations: mpsc::UnboundedReceiver<ServerInvocation>,
) {
    while let Some(invocation) = invocations.recv().await {
        let reply = inner
            .handlers
            .dispatch(invocation.invocation_id, &invocation.target, invocation.arguments)
            .await;
        if let Some(reply) = reply {
            if let Err(e) = session.send(reply).await {
                debug!("Could not send client result for '{}': {}", invocation.target, e);
            }
        }
    }
}

async fn receive_loop(
    inner: Arc<Inner>,
    session: Arc<Session>,
    mut receiver: MessageStream,
    mut buffer: BytesMut,
    dispatch: mpsc::UnboundedSender<ServerInvocation>,
) {
    let server_timeout = inner.options.server_timeout;

    'receive: loop {
        loop {
            match inner.protocol.parse_message(&mut buffer) {
                Ok(Some(frame)) => {
                    if !route(&inner, &session, &dispatch, frame) {
                        break 'receive;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    error!("Failed to parse hub message: {}", e);
                    session.fail(HubError::Serialization(e));
                    break 'receive;
                }
            }
        }

        tokio::select! {
            _ = session.shutdown.cancelled() => break,
            next = tokio::time::timeout(server_timeout, receiver.next()) => match next {
                Ok(Some(Ok(data))) => buffer.extend_from_slice(&data),
                Ok(Some(Err(e))) => {
                    warn!("Transport receive failed: {}", e);
                    session.fail(e);
                    break;
                }
                Ok(None) => {
                    session.fail(HubError::Transport(
                        "The server connection was closed unexpectedly.".to_string(),
                    ));
                    break;
                }
                Err(_) => {
                    warn!("No message received from the server within {:?}", server_timeout);
                    session.fail(HubError::ServerTimeout(server_timeout));
                    break;
                }
            }
        }
    }

    drop(dispatch);
    drop(receiver);
    session.shutdown.cancel();
    let reason = session.take_close_reason();
    inner.handle_close(&session, reason).await;
    session.finished.cancel();
}

/// Routes one inbound frame. Returns `false` when the session must end.
fn route(
    inner: &Inner,
    session: &Session,
    dispatch: &mpsc::UnboundedSender<ServerInvocation>,
    frame: Frame,
) -> bool {
    match frame {
        Frame::Completion {
            invocation_id,
            result,
        } => {
            inner.registry.complete(&invocation_id, result);
        }
        Frame::StreamItem {
            invocation_id,
            item,
        } => {
            inner.registry.stream_item(&invocation_id, item);
        }
        Frame::Invocation {
            invocation_id,
            target,
            arguments,
            ..
        } => {
            trace!("Received Invocation message for '{}'", target);
            let _ = dispatch.send(ServerInvocation {
                invocation_id,
                target,
                arguments,
            });
        }
        Frame::StreamInvocation { target, .. } => {
            warn!("Ignored server streaming invocation of '{}'", target);
        }
        Frame::CancelInvocation { invocation_id } => {
            debug!(invocation_id = %invocation_id, "Ignored CancelInvocation from the server");
        }
        Frame::Ping => trace!("Received Ping message"),
        Frame::Close {
            error,
            allow_reconnect,
        } => {
            match &error {
                Some(e) => info!("Server closed the connection with error: {}", e),
                None => info!("Server closed the connection"),
            }
            session.close(error.map(HubError::ServerClosed), allow_reconnect);
            return false;
        }
    }
    true
}
