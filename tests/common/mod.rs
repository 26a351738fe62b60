//! In-process hub server for integration tests.
//!
//! Speaks the real handshake and hub protocols over [`MemoryTransport`] and
//! hosts a small set of hub methods with the same error texts an ASP.NET
//! Core hub produces.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use futures_channel::mpsc;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use signalr_hub::transport::{MemoryListener, MemoryPeer};
use signalr_hub::{
    CompletionResult, Frame, HubConnection, HubConnectionBuilder, HubError, HubProtocol,
    JsonCodec, MemoryTransport, MessagePackCodec,
};
use tokio::sync::{mpsc as tokio_mpsc, oneshot};
use tokio_util::sync::CancellationToken;

pub const VERSION_REJECTED: &str =
    "The client requested version '1', but the server does not support this version.";

/// Upper bound for anything a test waits on.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Awaits `future`, failing the test if it takes longer than [`TEST_TIMEOUT`].
pub async fn timeout<F: std::future::Future>(future: F) -> F::Output {
    tokio::time::timeout(TEST_TIMEOUT, future)
        .await
        .expect("timed out")
}

/// A connection event as seen by a subscriber.
#[derive(Debug, Clone)]
pub enum Event {
    Closed(Option<Arc<HubError>>),
    Reconnecting(Arc<HubError>),
    Reconnected(Option<String>),
}

/// Subscribes to every connection event, in delivery order.
pub fn record_events(connection: &HubConnection) -> tokio_mpsc::UnboundedReceiver<Event> {
    let (tx, rx) = tokio_mpsc::unbounded_channel();
    let closed = tx.clone();
    connection.on_closed(move |error| {
        let _ = closed.send(Event::Closed(error));
        async {}
    });
    let reconnecting = tx.clone();
    connection.on_reconnecting(move |error| {
        let _ = reconnecting.send(Event::Reconnecting(error));
        async {}
    });
    connection.on_reconnected(move |connection_id| {
        let _ = tx.send(Event::Reconnected(connection_id));
        async {}
    });
    rx
}

/// Next recorded event, failing the test if none arrives in time.
pub async fn next_event(events: &mut tokio_mpsc::UnboundedReceiver<Event>) -> Event {
    timeout(events.recv()).await.expect("event channel closed")
}

/// How the server answers the next handshakes.
#[derive(Debug, Clone, Default)]
pub enum HandshakeMode {
    #[default]
    Accept,
    Reject(String),
    /// Reads the request and never answers.
    Hang,
    /// Drops the connection as soon as it arrives.
    Drop,
}

#[derive(Default)]
pub struct ServerState {
    handshake: Mutex<HandshakeMode>,
    connections: Mutex<Vec<Arc<PeerConnection>>>,
    connects: AtomicUsize,
    pub invocations: Mutex<Vec<String>>,
    pub canceled: Mutex<Vec<String>>,
    pub upload_items: AtomicUsize,
    pub upload_completions: Mutex<Vec<(String, CompletionResult)>>,
    pub pings: AtomicUsize,
}

enum Upload {
    Item(Value),
    Done(CompletionResult),
}

/// Server side of one accepted connection.
pub struct PeerConnection {
    pub connection_id: Option<String>,
    protocol: Arc<dyn HubProtocol>,
    outbox: tokio::sync::Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    closed: CancellationToken,
    uploads: Mutex<HashMap<String, tokio_mpsc::UnboundedSender<Upload>>>,
    client_results: Mutex<HashMap<String, oneshot::Sender<CompletionResult>>>,
    streams: Mutex<HashMap<String, CancellationToken>>,
    next_id: AtomicU64,
    state: Arc<ServerState>,
}

pub struct TestServer {
    pub state: Arc<ServerState>,
    transport: MemoryTransport,
}

impl TestServer {
    pub fn start() -> Self {
        Self::spawn(MemoryTransport::new())
    }

    /// Connections carry no connection id, as when negotiation is skipped.
    pub fn without_negotiation() -> Self {
        Self::spawn(MemoryTransport::without_negotiation())
    }

    fn spawn((transport, listener): (MemoryTransport, MemoryListener)) -> Self {
        init_tracing();
        let state = Arc::new(ServerState::default());
        tokio::spawn(accept_loop(listener, state.clone()));
        Self { state, transport }
    }

    pub fn builder(&self) -> HubConnectionBuilder {
        HubConnection::builder().with_transport(self.transport.clone())
    }

    /// A started connection with default settings.
    pub async fn connect(&self) -> HubConnection {
        let connection = self.builder().build().unwrap();
        timeout(connection.start()).await.unwrap();
        connection
    }

    pub fn set_handshake(&self, mode: HandshakeMode) {
        *self.state.handshake.lock() = mode;
    }

    /// Transport connections seen so far, accepted or not.
    pub fn connect_count(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    /// The most recently handshaken connection.
    pub fn latest(&self) -> Arc<PeerConnection> {
        self.state
            .connections
            .lock()
            .last()
            .cloned()
            .expect("no connection was accepted")
    }

    /// Drops every live connection without a Close message.
    pub async fn abort_all(&self) {
        let connections: Vec<_> = self.state.connections.lock().clone();
        for connection in connections {
            connection.abort().await;
        }
    }

    pub fn invocations(&self) -> Vec<String> {
        self.state.invocations.lock().clone()
    }

    pub fn canceled(&self) -> Vec<String> {
        self.state.canceled.lock().clone()
    }

    pub fn upload_items(&self) -> usize {
        self.state.upload_items.load(Ordering::SeqCst)
    }

    pub fn upload_completions(&self) -> Vec<(String, CompletionResult)> {
        self.state.upload_completions.lock().clone()
    }

    pub fn pings(&self) -> usize {
        self.state.pings.load(Ordering::SeqCst)
    }
}

/// Polls `condition` until it holds or the test timeout elapses.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    timeout(async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
}

impl PeerConnection {
    pub async fn send(&self, frame: Frame) -> bool {
        let Ok(bytes) = self.protocol.encode(&frame) else {
            return false;
        };
        match self.outbox.lock().await.as_mut() {
            Some(tx) => tx.send(bytes).await.is_ok(),
            None => false,
        }
    }

    /// Sends raw bytes, bypassing the protocol.
    pub async fn send_raw(&self, bytes: Vec<u8>) -> bool {
        match self.outbox.lock().await.as_mut() {
            Some(tx) => tx.send(bytes).await.is_ok(),
            None => false,
        }
    }

    pub async fn abort(&self) {
        self.closed.cancel();
        self.outbox.lock().await.take();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    fn open_uploads(&self, stream_ids: &[String]) -> Vec<tokio_mpsc::UnboundedReceiver<Upload>> {
        let mut uploads = self.uploads.lock();
        stream_ids
            .iter()
            .map(|id| {
                let (tx, rx) = tokio_mpsc::unbounded_channel();
                uploads.insert(id.clone(), tx);
                rx
            })
            .collect()
    }

    fn handle(self: &Arc<Self>, frame: Frame) {
        match frame {
            Frame::Invocation {
                invocation_id,
                target,
                arguments,
                stream_ids,
            } => {
                self.state.invocations.lock().push(target.clone());
                let uploads = self.open_uploads(&stream_ids);
                tokio::spawn(self.clone().invoke(invocation_id, target, arguments, uploads));
            }
            Frame::StreamInvocation {
                invocation_id,
                target,
                arguments,
                stream_ids,
            } => {
                self.state.invocations.lock().push(target.clone());
                let uploads = self.open_uploads(&stream_ids);
                let token = CancellationToken::new();
                self.streams.lock().insert(invocation_id.clone(), token.clone());
                tokio::spawn(self.clone().stream(invocation_id, target, arguments, uploads, token));
            }
            Frame::StreamItem {
                invocation_id,
                item,
            } => {
                self.state.upload_items.fetch_add(1, Ordering::SeqCst);
                if let Some(tx) = self.uploads.lock().get(&invocation_id) {
                    let _ = tx.send(Upload::Item(item));
                }
            }
            Frame::Completion {
                invocation_id,
                result,
            } => {
                let client_result = self.client_results.lock().remove(&invocation_id);
                if let Some(tx) = client_result {
                    let _ = tx.send(result);
                    return;
                }
                self.state
                    .upload_completions
                    .lock()
                    .push((invocation_id.clone(), result.clone()));
                if let Some(tx) = self.uploads.lock().remove(&invocation_id) {
                    let _ = tx.send(Upload::Done(result));
                }
            }
            Frame::CancelInvocation { invocation_id } => {
                self.state.canceled.lock().push(invocation_id.clone());
                if let Some(token) = self.streams.lock().remove(&invocation_id) {
                    token.cancel();
                }
            }
            Frame::Ping => {
                self.state.pings.fetch_add(1, Ordering::SeqCst);
            }
            Frame::Close { .. } => {}
        }
    }

    /// Invokes `target` on the client and waits for its result.
    async fn invoke_client(&self, target: &str, arguments: Vec<Value>) -> CompletionResult {
        let id = format!("s{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let (tx, rx) = oneshot::channel();
        self.client_results.lock().insert(id.clone(), tx);
        self.send(Frame::Invocation {
            invocation_id: Some(id),
            target: target.to_string(),
            arguments,
            stream_ids: Vec::new(),
        })
        .await;
        rx.await
            .unwrap_or_else(|_| CompletionResult::Error("The client disconnected.".to_string()))
    }

    async fn invoke(
        self: Arc<Self>,
        invocation_id: Option<String>,
        target: String,
        arguments: Vec<Value>,
        mut uploads: Vec<tokio_mpsc::UnboundedReceiver<Upload>>,
    ) {
        match (target.as_str(), invocation_id.as_deref()) {
            // Raw MessagePack the crate's encoder never produces.
            ("GetBytes", Some(id)) => {
                self.send_raw(binary_completion(id, &[1, 2, 3])).await;
                return;
            }
            ("FutureMessage", Some(id)) => {
                // [42]: a message type newer than the client knows.
                self.send_raw(vec![0x02, 0x91, 0x2a]).await;
                self.send(Frame::completion(id, CompletionResult::Value(json!("still here"))))
                    .await;
                return;
            }
            _ => {}
        }
        let Some(result) = self.run_method(&target, arguments, &mut uploads).await else {
            return;
        };
        if let Some(id) = invocation_id {
            self.send(Frame::completion(id, result)).await;
        }
    }

    /// `None` when the method answers nothing.
    async fn run_method(
        &self,
        target: &str,
        args: Vec<Value>,
        uploads: &mut [tokio_mpsc::UnboundedReceiver<Upload>],
    ) -> Option<CompletionResult> {
        let result = match target {
            "Echo" => {
                if let Some(error) = arity_error(target, &args, 1) {
                    return Some(error);
                }
                CompletionResult::Value(args[0].clone())
            }
            "HelloWorld" => CompletionResult::Value(json!("Hello World!")),
            "GetCallerConnectionId" => CompletionResult::Value(json!(self.connection_id)),
            "Add" => {
                if let Some(error) = arity_error(target, &args, 2) {
                    return Some(error);
                }
                let sum = args[0].as_i64().unwrap_or(0) + args[1].as_i64().unwrap_or(0);
                CompletionResult::Value(json!(sum))
            }
            "Nothing" => CompletionResult::Void,
            "Delay" => {
                let millis = args.first().and_then(Value::as_u64).unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(millis)).await;
                CompletionResult::Value(json!(millis))
            }
            "Block" => std::future::pending().await,
            "CallEcho" => self.invoke_client("Echo", args).await,
            "CallHandlerThatDoesntExist" => self.invoke_client("NoClientHandler", args).await,
            "Broadcast" => {
                self.send(Frame::Invocation {
                    invocation_id: None,
                    target: "Send".to_string(),
                    arguments: args,
                    stream_ids: Vec::new(),
                })
                .await;
                CompletionResult::Void
            }
            "Sum" => {
                let Some(upload) = uploads.first_mut() else {
                    return Some(CompletionResult::Value(json!(0)));
                };
                let mut sum = 0;
                loop {
                    match upload.recv().await {
                        Some(Upload::Item(item)) => sum += item.as_i64().unwrap_or(0),
                        Some(Upload::Done(CompletionResult::Error(e))) => {
                            break CompletionResult::Error(e)
                        }
                        Some(Upload::Done(_)) | None => break CompletionResult::Value(json!(sum)),
                    }
                }
            }
            "CloseWithError" => {
                let error = args.first().and_then(Value::as_str).map(str::to_string);
                let allow_reconnect = args.get(1).and_then(Value::as_bool).unwrap_or(false);
                self.send(Frame::Close {
                    error,
                    allow_reconnect,
                })
                .await;
                return None;
            }
            "Abort" => {
                self.abort().await;
                return None;
            }
            "StreamEcho" => {
                if let Some(error) = arity_error(target, &args, 0) {
                    return Some(error);
                }
                return Some(non_streaming_call(target));
            }
            "Stream" | "Counter" | "StreamException" | "StreamBroken" => {
                return Some(non_streaming_call(target))
            }
            _ => method_missing(target),
        };
        Some(result)
    }

    async fn stream(
        self: Arc<Self>,
        invocation_id: String,
        target: String,
        arguments: Vec<Value>,
        mut uploads: Vec<tokio_mpsc::UnboundedReceiver<Upload>>,
        token: CancellationToken,
    ) {
        let result = tokio::select! {
            _ = token.cancelled() => None,
            result = self.produce(&invocation_id, &target, arguments, &mut uploads) => Some(result),
        };
        self.streams.lock().remove(&invocation_id);
        if let Some(result) = result {
            self.send(Frame::completion(invocation_id, result)).await;
        }
    }

    async fn produce(
        &self,
        invocation_id: &str,
        target: &str,
        args: Vec<Value>,
        uploads: &mut [tokio_mpsc::UnboundedReceiver<Upload>],
    ) -> CompletionResult {
        let item = |value: Value| Frame::StreamItem {
            invocation_id: invocation_id.to_string(),
            item: value,
        };
        match target {
            "Stream" | "Counter" => {
                let count = args.first().and_then(Value::as_u64).unwrap_or(0);
                let delay = Duration::from_millis(args.get(1).and_then(Value::as_u64).unwrap_or(1));
                for i in 0..count {
                    if !self.send(item(json!(i))).await {
                        break;
                    }
                    tokio::time::sleep(delay).await;
                }
                CompletionResult::Void
            }
            "StreamException" => CompletionResult::Error(
                "An unexpected error occurred invoking 'StreamException' on the server. InvalidOperationException: Error occurred while streaming."
                    .to_string(),
            ),
            "StreamBroken" => CompletionResult::Error(
                "The value returned by the streaming method 'StreamBroken' is not a ChannelReader<> or IAsyncEnumerable<>."
                    .to_string(),
            ),
            "StreamEcho" => {
                if let Some(error) = arity_error(target, &args, 0) {
                    return error;
                }
                let Some(upload) = uploads.first_mut() else {
                    return CompletionResult::Void;
                };
                loop {
                    match upload.recv().await {
                        Some(Upload::Item(value)) => {
                            self.send(item(value)).await;
                        }
                        Some(Upload::Done(CompletionResult::Error(e))) => {
                            return CompletionResult::Error(e)
                        }
                        Some(Upload::Done(_)) | None => return CompletionResult::Void,
                    }
                }
            }
            "Echo" | "HelloWorld" | "Add" | "Sum" | "Delay" => CompletionResult::Error(format!(
                "The client attempted to invoke the non-streaming '{target}' method with a streaming invocation."
            )),
            _ => method_missing(target),
        }
    }
}

fn arity_error(target: &str, args: &[Value], expected: usize) -> Option<CompletionResult> {
    (args.len() != expected).then(|| {
        CompletionResult::Error(format!(
            "Failed to invoke '{target}' due to an error on the server. InvalidDataException: Invocation provides {} argument(s) but target expects {expected}.",
            args.len()
        ))
    })
}

fn non_streaming_call(target: &str) -> CompletionResult {
    CompletionResult::Error(format!(
        "The client attempted to invoke the streaming '{target}' method with a non-streaming invocation."
    ))
}

fn method_missing(target: &str) -> CompletionResult {
    CompletionResult::Error(format!(
        "Failed to invoke '{target}' due to an error on the server. HubException: Method does not exist."
    ))
}

/// Length-prefixed `[3, {}, id, 3, bin(bytes)]`.
fn binary_completion(id: &str, bytes: &[u8]) -> Vec<u8> {
    let mut payload = vec![0x95, 0x03, 0x80, 0xa0 | id.len() as u8];
    payload.extend_from_slice(id.as_bytes());
    payload.extend_from_slice(&[0x03, 0xc4, bytes.len() as u8]);
    payload.extend_from_slice(bytes);
    let mut message = vec![payload.len() as u8];
    message.extend_from_slice(&payload);
    message
}

fn protocol_named(name: &str) -> Arc<dyn HubProtocol> {
    if name == "json" {
        Arc::new(JsonCodec)
    } else {
        Arc::new(MessagePackCodec)
    }
}

async fn accept_loop(mut listener: MemoryListener, state: Arc<ServerState>) {
    while let Some(peer) = listener.accept().await {
        state.connects.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(serve(peer, state.clone()));
    }
}

async fn serve(peer: MemoryPeer, state: Arc<ServerState>) {
    let connection_id = peer.connection_id().map(str::to_string);
    let mode = state.handshake.lock().clone();
    let (mut tx, mut rx) = peer.into_parts();
    if matches!(mode, HandshakeMode::Drop) {
        return;
    }

    let mut buffer = BytesMut::new();
    let protocol = loop {
        let Some(data) = rx.next().await else {
            return;
        };
        buffer.extend_from_slice(&data);
        if let Some(end) = buffer.iter().position(|b| *b == 0x1e) {
            let record = buffer.split_to(end + 1);
            let request: Value = serde_json::from_slice(&record[..end]).unwrap_or(Value::Null);
            break protocol_named(request["protocol"].as_str().unwrap_or_default());
        }
    };

    match mode {
        HandshakeMode::Hang => {
            while rx.next().await.is_some() {}
            return;
        }
        HandshakeMode::Reject(reason) => {
            let mut record = serde_json::to_vec(&json!({ "error": reason })).unwrap_or_default();
            record.push(0x1e);
            let _ = tx.send(record).await;
            return;
        }
        HandshakeMode::Accept | HandshakeMode::Drop => {}
    }
    if tx.send(b"{}\x1e".to_vec()).await.is_err() {
        return;
    }

    let peer = Arc::new(PeerConnection {
        connection_id,
        protocol,
        outbox: tokio::sync::Mutex::new(Some(tx)),
        closed: CancellationToken::new(),
        uploads: Mutex::new(HashMap::new()),
        client_results: Mutex::new(HashMap::new()),
        streams: Mutex::new(HashMap::new()),
        next_id: AtomicU64::new(1),
        state: state.clone(),
    });
    state.connections.lock().push(peer.clone());

    'read: loop {
        loop {
            match peer.protocol.parse_message(&mut buffer) {
                Ok(Some(frame)) => peer.handle(frame),
                Ok(None) => break,
                Err(_) => break 'read,
            }
        }
        let next = tokio::select! {
            _ = peer.closed.cancelled() => None,
            next = rx.next() => next,
        };
        match next {
            Some(data) => buffer.extend_from_slice(&data),
            None => break,
        }
    }

    peer.abort().await;
    let streams: Vec<_> = peer.streams.lock().drain().map(|(_, token)| token).collect();
    for token in streams {
        token.cancel();
    }
}
