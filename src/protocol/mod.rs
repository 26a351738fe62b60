//! Hub protocol implementation.
//!
//! This module provides the [`Frame`] envelope model and the [`HubProtocol`]
//! adapter the connection core talks to, with MessagePack (binary) and JSON
//! (text) implementations.

mod codec;
mod frame;
mod json;

use bytes::BytesMut;

pub use codec::MessagePackCodec;
pub use frame::{CompletionResult, Frame};
pub use json::JsonCodec;

/// Errors that can occur during protocol encoding or decoding.
#[derive(thiserror::Error, Debug)]
pub enum ProtocolError {
    /// Failed to encode a frame to MessagePack.
    #[error("MessagePack encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// Failed to decode MessagePack data into a frame.
    #[error("MessagePack decode error: {0}")]
    Decode(#[from] rmpv::decode::Error),

    /// JSON (de)serialization failed, either for a frame or for an argument.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Received a message that does not conform to the hub protocol.
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Received a message type not recognized by this implementation.
    #[error("Unexpected message type: {0}")]
    UnexpectedMessageType(u64),

    /// A length prefix announced more bytes than a message may carry.
    #[error("Message length {0} exceeds the maximum supported size")]
    MessageTooLarge(u64),
}

impl ProtocolError {
    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        ProtocolError::InvalidMessage(reason.into())
    }
}

/// How a protocol's messages travel over the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferFormat {
    Text,
    Binary,
}

/// Encodes and decodes [`Frame`]s for one wire format.
///
/// Implementations frame their own messages: `write_message` appends one
/// complete message to `out`, and `parse_message` removes exactly one complete
/// message from the front of `input`, returning `Ok(None)` while the buffer
/// holds only a partial message.
pub trait HubProtocol: Send + Sync + 'static {
    /// Name announced in the handshake, e.g. `"messagepack"`.
    fn name(&self) -> &'static str;

    /// Protocol version announced in the handshake.
    fn version(&self) -> u32;

    fn transfer_format(&self) -> TransferFormat;

    fn write_message(&self, frame: &Frame, out: &mut BytesMut) -> Result<(), ProtocolError>;

    fn parse_message(&self, input: &mut BytesMut) -> Result<Option<Frame>, ProtocolError>;

    /// Convenience wrapper returning the encoded bytes of one frame.
    fn encode(&self, frame: &Frame) -> Result<Vec<u8>, ProtocolError> {
        let mut out = BytesMut::new();
        self.write_message(frame, &mut out)?;
        Ok(out.to_vec())
    }
}
