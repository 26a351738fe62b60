//! Hub protocol envelopes.
//!
//! This module defines the [`Frame`] enum that represents every message kind
//! exchanged with the hub after the handshake. Frames are protocol-agnostic:
//! the codecs in [`crate::protocol`] map them to MessagePack or JSON.
//!
//! For details, see the [hub protocol description](https://github.com/dotnet/aspnetcore/blob/main/src/SignalR/docs/specs/HubProtocol.md).

use serde_json::Value;

/// Message type tags shared by the binary and text protocols.
pub(crate) mod kind {
    pub const INVOCATION: u64 = 1;
    pub const STREAM_ITEM: u64 = 2;
    pub const COMPLETION: u64 = 3;
    pub const STREAM_INVOCATION: u64 = 4;
    pub const CANCEL_INVOCATION: u64 = 5;
    pub const PING: u64 = 6;
    pub const CLOSE: u64 = 7;
}

/// Outcome carried by a [`Frame::Completion`].
#[derive(Debug, Clone, PartialEq)]
pub enum CompletionResult {
    /// The method returned nothing.
    Void,
    /// The method returned a value (which may itself be `null`).
    Value(Value),
    /// The method failed on the remote side.
    Error(String),
}

impl CompletionResult {
    /// Mirrors the `hasResult` flag of the wire format.
    pub fn has_result(&self) -> bool {
        matches!(self, CompletionResult::Value(_))
    }
}

/// A hub protocol message.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// A method call. Without an id the caller expects no answer.
    ///
    /// Example (MessagePack): `[1, {}, "7", "Echo", ["hello"], []]`
    Invocation {
        invocation_id: Option<String>,
        target: String,
        arguments: Vec<Value>,
        /// Ids of client-to-server streams bound to this call.
        stream_ids: Vec<String>,
    },

    /// A call whose result is a stream of items.
    ///
    /// Example (MessagePack): `[4, {}, "8", "Counter", [5], []]`
    StreamInvocation {
        invocation_id: String,
        target: String,
        arguments: Vec<Value>,
        stream_ids: Vec<String>,
    },

    /// One element of a stream, in either direction.
    ///
    /// Example (MessagePack): `[2, {}, "8", 42]`
    StreamItem { invocation_id: String, item: Value },

    /// Terminates a call or a stream.
    ///
    /// Example (MessagePack): `[3, {}, "7", 3, "hello"]`
    Completion {
        invocation_id: String,
        result: CompletionResult,
    },

    /// Asks the peer to stop producing a stream.
    CancelInvocation { invocation_id: String },

    /// Keep-alive. No response is required.
    ///
    /// Example (MessagePack): `[6]`
    Ping,

    /// Ends the connection, optionally with an error.
    ///
    /// Example (MessagePack): `[7, "Bye", false]`
    Close {
        error: Option<String>,
        allow_reconnect: bool,
    },
}

impl Frame {
    pub fn completion(invocation_id: impl Into<String>, result: CompletionResult) -> Self {
        Frame::Completion {
            invocation_id: invocation_id.into(),
            result,
        }
    }

    /// Short name used in logs.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Frame::Invocation { .. } => "Invocation",
            Frame::StreamInvocation { .. } => "StreamInvocation",
            Frame::StreamItem { .. } => "StreamItem",
            Frame::Completion { .. } => "Completion",
            Frame::CancelInvocation { .. } => "CancelInvocation",
            Frame::Ping => "Ping",
            Frame::Close { .. } => "Close",
        }
    }
}
