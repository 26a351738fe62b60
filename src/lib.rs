//! Client for ASP.NET Core SignalR hubs.
//!
//! A [`HubConnection`] carries many concurrent calls over one transport:
//! request/response invocations, fire-and-forget sends, server-to-client
//! streams, client-to-server uploads and methods the server invokes on the
//! client. It can reconnect on its own when the transport is lost.
//!
//! # Quick start
//!
//! ```no_run
//! use futures_util::StreamExt;
//! use signalr_hub::HubConnection;
//!
//! # async fn example() -> Result<(), signalr_hub::HubError> {
//! let connection = HubConnection::builder()
//!     .with_url("http://localhost:5000/chathub")
//!     .with_automatic_reconnect()
//!     .build()?;
//!
//! connection.on("ReceiveMessage", |(user, text): (String, String)| async move {
//!     println!("{user}: {text}");
//! });
//! connection.start().await?;
//!
//! connection.send("SendMessage", ("me", "hello")).await?;
//! let mut counter = connection.stream::<u32>("Counter", (5, 100)).await?;
//! while let Some(item) = counter.next().await {
//!     println!("{}", item?);
//! }
//! connection.stop().await?;
//! # Ok(())
//! # }
//! ```
//!
//! The wire format is chosen with
//! [`HubConnectionBuilder::with_protocol`]: [`MessagePackCodec`] (default) or
//! [`JsonCodec`].

pub mod connection;
pub mod error;
pub mod handshake;
pub mod negotiate;
pub mod protocol;
pub mod transport;

pub use connection::{
    CallOptions, ClientStream, ClientStreamWriter, DelayRetryPolicy, EventSubscription,
    HubConnection, HubConnectionBuilder, HubConnectionOptions, HubConnectionState, HubStream,
    RetryContext, RetryPolicy, Subscription,
};
pub use error::HubError;
pub use protocol::{CompletionResult, Frame, HubProtocol, JsonCodec, MessagePackCodec, ProtocolError, TransferFormat};
pub use transport::{MemoryTransport, Transport, WebSocketTransport};
