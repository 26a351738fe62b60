//! SignalR hub connection.
//!
//! [`HubConnection`] multiplexes calls, server-to-client streams, uploads and
//! server-invoked handlers over one transport, and optionally reconnects when
//! that transport is lost.
//!
//! ```no_run
//! use signalr_hub::HubConnection;
//!
//! # async fn example() -> Result<(), signalr_hub::HubError> {
//! let connection = HubConnection::builder()
//!     .with_url("http://localhost:5000/chathub")
//!     .with_automatic_reconnect()
//!     .build()?;
//! connection.start().await?;
//!
//! let reply: String = connection.invoke("Echo", ("hello",)).await?;
//! connection.stop().await?;
//! # Ok(())
//! # }
//! ```

mod builder;
mod events;
mod handlers;
mod lifecycle;
mod registry;
mod retry;
mod session;
mod streaming;

use std::future::Future;
use std::sync::Arc;

use futures_channel::oneshot;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::error::HubError;
use crate::protocol::{Frame, HubProtocol, ProtocolError};
use crate::transport::Transport;

use events::EventDispatcher;
use handlers::HandlerTable;
use lifecycle::Lifecycle;
use registry::InvocationRegistry;
use session::Session;

pub use builder::{HubConnectionBuilder, HubConnectionOptions};
pub use events::EventSubscription;
pub use handlers::Subscription;
pub use retry::{DelayRetryPolicy, RetryContext, RetryPolicy};
pub use streaming::{ClientStream, ClientStreamWriter, HubStream};

/// Lifecycle state of a [`HubConnection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HubConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Terminal.
    Disposed,
}

/// Per-call options: a cancellation token and upload streams.
#[derive(Debug, Default)]
pub struct CallOptions {
    cancel: Option<CancellationToken>,
    uploads: Vec<ClientStream>,
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stops waiting for the call when `token` is canceled.
    pub fn cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Attaches a client-to-server stream. Streams are sent in the order they
    /// are attached, after the regular arguments.
    pub fn upload(mut self, stream: ClientStream) -> Self {
        self.uploads.push(stream);
        self
    }
}

/// Client side of a SignalR hub connection.
///
/// Cheap to clone; clones share the same connection.
#[derive(Clone)]
pub struct HubConnection {
    inner: Arc<Inner>,
}

pub(crate) struct Inner {
    transport: Arc<dyn Transport>,
    protocol: Arc<dyn HubProtocol>,
    options: HubConnectionOptions,
    retry_policy: Option<Arc<dyn RetryPolicy>>,
    /// Serializes start, stop, close handling and reconnect attempts.
    connection_lock: tokio::sync::Mutex<()>,
    lifecycle: Mutex<Lifecycle>,
    registry: InvocationRegistry,
    handlers: HandlerTable,
    events: EventDispatcher,
}

impl HubConnection {
    pub fn builder() -> HubConnectionBuilder {
        HubConnectionBuilder::new()
    }

    pub(crate) fn new(
        transport: Arc<dyn Transport>,
        protocol: Arc<dyn HubProtocol>,
        options: HubConnectionOptions,
        retry_policy: Option<Arc<dyn RetryPolicy>>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                protocol,
                options,
                retry_policy,
                connection_lock: tokio::sync::Mutex::new(()),
                lifecycle: Mutex::new(Lifecycle::new()),
                registry: InvocationRegistry::new(),
                handlers: HandlerTable::new(),
                events: EventDispatcher::new(),
            }),
        }
    }

    /// Connects and performs the handshake. Only valid while
    /// [`HubConnectionState::Disconnected`].
    pub async fn start(&self) -> Result<(), HubError> {
        self.inner.start().await
    }

    /// Closes the connection, settling every outstanding call. Also ends an
    /// ongoing reconnect. Does nothing when already disconnected.
    pub async fn stop(&self) -> Result<(), HubError> {
        self.inner.stop().await
    }

    /// Stops the connection for good. Further `start` calls fail.
    pub async fn dispose(&self) -> Result<(), HubError> {
        self.inner.dispose().await
    }

    pub fn state(&self) -> HubConnectionState {
        self.inner.lifecycle.lock().state
    }

    /// Identifier assigned by the server during negotiation. `None` while not
    /// connected, and always `None` when negotiation is skipped.
    pub fn connection_id(&self) -> Option<String> {
        self.inner.connection_id()
    }

    /// Calls a hub method and waits for its result.
    ///
    /// `args` is usually a tuple; each element becomes one argument. `()`
    /// sends no arguments and any other non-sequence value is sent as the
    /// single argument.
    pub async fn invoke<R: DeserializeOwned>(
        &self,
        method: &str,
        args: impl Serialize,
    ) -> Result<R, HubError> {
        self.invoke_with(method, args, CallOptions::default()).await
    }

    pub async fn invoke_with<R: DeserializeOwned>(
        &self,
        method: &str,
        args: impl Serialize,
        options: CallOptions,
    ) -> Result<R, HubError> {
        let CallOptions { cancel, uploads } = options;
        if cancel.as_ref().is_some_and(CancellationToken::is_cancelled) {
            return Err(HubError::OperationCanceled);
        }
        let session = self.inner.active_session("invoke")?;
        let registry = &self.inner.registry;
        let id = registry.next_id();
        let mut rx = registry.register_single(id);

        let arguments = match bind_arguments(&args) {
            Ok(arguments) => arguments,
            Err(e) => {
                error!("Failed to serialize arguments for '{}': {}", method, e);
                session.fail(HubError::Serialization(e));
                // Teardown settles the entry with the close cause.
                let value = wait_for_settlement(&mut rx, &session, registry, id).await?;
                return serde_json::from_value(value).map_err(HubError::ResultBinding);
            }
        };
        let (stream_ids, uploads) = self.inner.assign_stream_ids(uploads);
        let frame = Frame::Invocation {
            invocation_id: Some(id.to_string()),
            target: method.to_string(),
            arguments,
            stream_ids,
        };

        let upload_token = session.shutdown_token().child_token();
        let _uploads = upload_token.clone().drop_guard();
        let exchange = async {
            if let Err(e) = session.send(frame).await {
                registry.remove(id);
                return Err(e);
            }
            streaming::spawn_uploads(&session, uploads, upload_token.clone(), cancel.clone());
            wait_for_settlement(&mut rx, &session, registry, id).await
        };

        let value = tokio::select! {
            biased;
            _ = cancelled(cancel.as_ref()) => {
                registry.remove(id);
                debug!(invocation_id = id, "Invocation of '{}' canceled", method);
                return Err(HubError::OperationCanceled);
            }
            result = exchange => result?,
        };
        serde_json::from_value(value).map_err(HubError::ResultBinding)
    }

    /// Calls a hub method without waiting for, or expecting, a result.
    pub async fn send(&self, method: &str, args: impl Serialize) -> Result<(), HubError> {
        self.send_with(method, args, CallOptions::default()).await
    }

    pub async fn send_with(
        &self,
        method: &str,
        args: impl Serialize,
        options: CallOptions,
    ) -> Result<(), HubError> {
        let CallOptions { cancel, uploads } = options;
        if cancel.as_ref().is_some_and(CancellationToken::is_cancelled) {
            return Err(HubError::OperationCanceled);
        }
        let session = self.inner.active_session("send")?;

        let arguments = match bind_arguments(&args) {
            Ok(arguments) => arguments,
            Err(e) => {
                error!("Failed to serialize arguments for '{}': {}", method, e);
                session.fail(HubError::Serialization(ProtocolError::invalid(e.to_string())));
                return Err(HubError::Serialization(e));
            }
        };
        let (stream_ids, uploads) = self.inner.assign_stream_ids(uploads);
        let frame = Frame::Invocation {
            invocation_id: None,
            target: method.to_string(),
            arguments,
            stream_ids,
        };

        tokio::select! {
            biased;
            _ = cancelled(cancel.as_ref()) => return Err(HubError::OperationCanceled),
            sent = session.send(frame) => sent?,
        }
        let upload_token = session.shutdown_token().child_token();
        streaming::spawn_uploads(&session, uploads, upload_token, cancel);
        Ok(())
    }

    /// Calls a streaming hub method. Items arrive through the returned
    /// [`HubStream`].
    pub async fn stream<T: DeserializeOwned>(
        &self,
        method: &str,
        args: impl Serialize,
    ) -> Result<HubStream<T>, HubError> {
        self.stream_with(method, args, CallOptions::default()).await
    }

    pub async fn stream_with<T: DeserializeOwned>(
        &self,
        method: &str,
        args: impl Serialize,
        options: CallOptions,
    ) -> Result<HubStream<T>, HubError> {
        let CallOptions { cancel, uploads } = options;
        if cancel.as_ref().is_some_and(CancellationToken::is_cancelled) {
            return Err(HubError::OperationCanceled);
        }
        let session = self.inner.active_session("stream")?;
        let registry = &self.inner.registry;
        let id = registry.next_id();
        let items = registry.register_stream(id);
        let upload_token = session.shutdown_token().child_token();

        match bind_arguments(&args) {
            Ok(arguments) => {
                let (stream_ids, uploads) = self.inner.assign_stream_ids(uploads);
                let frame = Frame::StreamInvocation {
                    invocation_id: id.to_string(),
                    target: method.to_string(),
                    arguments,
                    stream_ids,
                };
                if let Err(e) = session.send(frame).await {
                    registry.remove(id);
                    return Err(e);
                }
                streaming::spawn_uploads(&session, uploads, upload_token.clone(), cancel.clone());
            }
            Err(e) => {
                // The stream yields the close cause once teardown settles it.
                error!("Failed to serialize arguments for '{}': {}", method, e);
                session.fail(HubError::Serialization(e));
            }
        }

        Ok(HubStream::new(
            id,
            self.inner.clone(),
            session,
            items,
            cancel,
            upload_token.drop_guard(),
        ))
    }

    /// Registers a handler for a method the server invokes on this client.
    /// Arguments are decoded into `A`, typically a tuple.
    ///
    /// Method names match case-insensitively. Several handlers may share a
    /// name; they run in registration order.
    pub fn on<A, F, Fut>(&self, method: &str, handler: F) -> Subscription
    where
        A: DeserializeOwned + Send + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.inner.handlers.on(method, handler)
    }

    /// Registers a handler whose return value is sent back when the server
    /// asks for a result.
    pub fn on_invoke<A, R, F, Fut>(&self, method: &str, handler: F) -> Subscription
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, String>> + Send + 'static,
    {
        self.inner.handlers.on_invoke(method, handler)
    }

    pub fn remove_handler(&self, subscription: &Subscription) -> bool {
        self.inner.handlers.remove(subscription)
    }

    /// Removes every handler registered for `method`.
    pub fn remove(&self, method: &str) {
        self.inner.handlers.remove_all(method);
    }

    /// Called once the connection is closed for good, with the error that
    /// closed it. `None` after a requested stop.
    pub fn on_closed<F, Fut>(&self, handler: F) -> EventSubscription
    where
        F: Fn(Option<Arc<HubError>>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.inner.events.on_closed(handler)
    }

    /// Called when the connection was lost and reconnecting begins.
    pub fn on_reconnecting<F, Fut>(&self, handler: F) -> EventSubscription
    where
        F: Fn(Arc<HubError>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.inner.events.on_reconnecting(handler)
    }

    /// Called after a successful reconnect with the new connection id.
    pub fn on_reconnected<F, Fut>(&self, handler: F) -> EventSubscription
    where
        F: Fn(Option<String>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.inner.events.on_reconnected(handler)
    }

    pub fn remove_event_handler(&self, subscription: &EventSubscription) -> bool {
        self.inner.events.remove(subscription)
    }
}

impl std::fmt::Debug for HubConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubConnection")
            .field("state", &self.state())
            .field("connection_id", &self.connection_id())
            .field("protocol", &self.inner.protocol.name())
            .finish()
    }
}

impl Inner {
    fn assign_stream_ids(&self, uploads: Vec<ClientStream>) -> (Vec<String>, Vec<(String, ClientStream)>) {
        let uploads: Vec<_> = uploads
            .into_iter()
            .map(|stream| (self.registry.next_id().to_string(), stream))
            .collect();
        let ids = uploads.iter().map(|(id, _)| id.clone()).collect();
        (ids, uploads)
    }
}

/// Turns the caller's arguments into the wire argument list.
fn bind_arguments(args: &impl Serialize) -> Result<Vec<Value>, ProtocolError> {
    Ok(match serde_json::to_value(args)? {
        Value::Array(items) => items,
        Value::Null => Vec::new(),
        other => vec![other],
    })
}

/// Waits until the entry for `id` is settled, or until the session is torn
/// down without having settled it.
async fn wait_for_settlement(
    rx: &mut oneshot::Receiver<Result<Value, HubError>>,
    session: &Session,
    registry: &InvocationRegistry,
    id: u64,
) -> Result<Value, HubError> {
    tokio::select! {
        biased;
        settled = &mut *rx => settled.unwrap_or(Err(HubError::ConnectionClosed(None))),
        _ = session.finished() => {
            registry.remove(id);
            match rx.try_recv() {
                Ok(Some(settled)) => settled,
                _ => Err(HubError::ConnectionClosed(None)),
            }
        }
    }
}

/// Resolves when `token` is canceled; never without one.
async fn cancelled(token: Option<&CancellationToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}
